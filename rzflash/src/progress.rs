//! Progress reporting.
//!
//! The engine pushes [`ProgressEvent`]s into a [`ProgressSink`] and never
//! waits on it. Closures work as sinks directly; [`ChannelSink`] hands events
//! to another thread (for example a UI drawing progress bars) through a
//! bounded channel and drops them when the receiver falls behind.

use std::sync::mpsc::{self, Receiver, SyncSender};

use crate::stage::Stage;

/// Transfer progress of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Stage being transferred.
    pub stage: Stage,
    /// Payload bytes acknowledged so far.
    pub bytes_sent: u64,
    /// Payload bytes in the stage image.
    pub bytes_total: u64,
}

impl ProgressEvent {
    /// Completion in percent.
    pub fn percent(&self) -> u64 {
        if self.bytes_total == 0 {
            100
        } else {
            self.bytes_sent * 100 / self.bytes_total
        }
    }
}

/// Receives progress events. Must not block.
pub trait ProgressSink {
    /// Record one event.
    fn emit(&mut self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(ProgressEvent),
{
    fn emit(&mut self, event: ProgressEvent) {
        self(event);
    }
}

/// Sink backed by a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink(SyncSender<ProgressEvent>);

impl ChannelSink {
    /// Wrap an existing sender.
    pub fn new(sender: SyncSender<ProgressEvent>) -> Self {
        Self(sender)
    }

    /// Create a sink and its receiver with room for `capacity` events.
    pub fn bounded(capacity: usize) -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (Self(tx), rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&mut self, event: ProgressEvent) {
        // A full or closed channel only costs the UI an update.
        let _ = self.0.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sent: u64) -> ProgressEvent {
        ProgressEvent {
            stage: Stage::Rootfs,
            bytes_sent: sent,
            bytes_total: 200,
        }
    }

    #[test]
    fn test_percent() {
        assert_eq!(event(50).percent(), 25);
        assert_eq!(event(200).percent(), 100);
        let empty = ProgressEvent {
            bytes_total: 0,
            ..event(0)
        };
        assert_eq!(empty.percent(), 100);
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (mut sink, rx) = ChannelSink::bounded(2);
        for sent in [10, 20, 30, 40] {
            sink.emit(event(sent));
        }

        let received: Vec<u64> = rx.try_iter().map(|e| e.bytes_sent).collect();
        assert_eq!(received, vec![10, 20]);
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (mut sink, rx) = ChannelSink::bounded(1);
        drop(rx);
        sink.emit(event(1));
    }

    #[test]
    fn test_closure_sink() {
        let mut total = 0;
        {
            let mut sink = |e: ProgressEvent| total += e.bytes_sent;
            let sink: &mut dyn ProgressSink = &mut sink;
            sink.emit(event(5));
            sink.emit(event(7));
        }
        assert_eq!(total, 12);
    }
}
