//! Record-by-record image upload.
//!
//! Each record goes out as one write. In acknowledged mode the engine then
//! waits for the ack or nak token, whichever shows up first; a nak or a
//! silent device causes the same record to be resent. Records are never
//! skipped or reordered. Without acknowledgment records are streamed back to
//! back, which is what the boot ROM and Flash Writer expect.
//!
//! ```text
//! host                          device
//!  |--- record n (wire bytes) --->|
//!  |<-------- ACK / NAK ----------|
//!  |--- record n or n+1 --------->|
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::image::Image;
use crate::port::Port;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::protocol::{ProtocolConfig, read_until};
use crate::stage::Stage;

/// Acknowledgment state of the record in flight.
#[derive(Debug, Clone, Copy)]
pub struct AckWindow {
    /// Payload bytes acknowledged before this record.
    pub bytes_sent: u64,
    /// Attempts made on this record so far.
    pub attempt_count: u32,
    /// When the current attempt stops waiting.
    pub deadline: Instant,
}

impl AckWindow {
    fn new(bytes_sent: u64) -> Self {
        Self {
            bytes_sent,
            attempt_count: 0,
            deadline: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Ack,
    Nak,
    Silent,
}

/// Uploads a decoded image over a borrowed port.
pub struct TransferEngine<'a, P: Port> {
    port: &'a mut P,
    config: &'a ProtocolConfig,
    cancel: Option<&'a AtomicBool>,
    acknowledged: bool,
    bytes_sent: u64,
}

impl<'a, P: Port> TransferEngine<'a, P> {
    /// Create a transfer engine that waits for the configured ack per record.
    pub fn new(port: &'a mut P, config: &'a ProtocolConfig) -> Self {
        Self {
            port,
            config,
            cancel: None,
            acknowledged: true,
            bytes_sent: 0,
        }
    }

    /// Wait for an ack after every record (`true`) or stream (`false`).
    #[must_use]
    pub fn with_acknowledgment(mut self, acknowledged: bool) -> Self {
        self.acknowledged = acknowledged;
        self
    }

    /// Stop at the next record boundary once `flag` is set.
    #[must_use]
    pub fn with_cancel(mut self, flag: Option<&'a AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Payload bytes delivered so far, including by a send that failed.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Send every record of `image`, returning the payload bytes delivered.
    ///
    /// On failure [`bytes_sent`](Self::bytes_sent) still holds the count
    /// reached before the failing record.
    pub fn send(
        &mut self,
        stage: Stage,
        image: &Image,
        progress: &mut dyn ProgressSink,
    ) -> Result<u64> {
        let total = image.payload_len();
        self.bytes_sent = 0;

        info!(
            "{stage}: sending {} ({} records, {total} bytes{})",
            image.path.display(),
            image.records.len(),
            if self.acknowledged { "" } else { ", streamed" }
        );
        progress.emit(ProgressEvent {
            stage,
            bytes_sent: 0,
            bytes_total: total,
        });

        for record in &image.records {
            if self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(Error::Cancelled {
                    stage,
                    bytes_sent: self.bytes_sent,
                });
            }

            let wire = image.wire_bytes(record);
            let mut window = AckWindow::new(self.bytes_sent);

            loop {
                window.attempt_count += 1;
                self.port.write_all_bytes(&wire)?;
                trace!(
                    "{stage}: record 0x{:08X} ({} bytes), attempt {}",
                    record.address,
                    wire.len(),
                    window.attempt_count
                );

                let reason = match self.await_reply(&mut window)? {
                    Reply::Ack => break,
                    Reply::Nak => "rejected by device".to_string(),
                    Reply::Silent => format!(
                        "no acknowledgment within {} ms",
                        self.config.ack_timeout.as_millis()
                    ),
                };

                if window.attempt_count >= self.config.chunk_retries {
                    return Err(Error::TransferAborted {
                        stage,
                        offset: record.address,
                        bytes_sent: window.bytes_sent,
                        attempts: window.attempt_count,
                        reason,
                    });
                }
                debug!(
                    "{stage}: record 0x{:08X} {reason}, retrying ({}/{})",
                    record.address, window.attempt_count, self.config.chunk_retries
                );
            }

            self.bytes_sent += record.payload().len() as u64;
            progress.emit(ProgressEvent {
                stage,
                bytes_sent: self.bytes_sent,
                bytes_total: total,
            });
        }

        info!("{stage}: {} bytes sent", self.bytes_sent);
        Ok(self.bytes_sent)
    }

    fn await_reply(&mut self, window: &mut AckWindow) -> Result<Reply> {
        if !self.acknowledged || self.config.ack.is_empty() {
            return Ok(Reply::Ack);
        }

        window.deadline = Instant::now() + self.config.ack_timeout;
        let tokens = [self.config.ack.as_slice(), self.config.nak.as_slice()];
        let mut seen = Vec::new();

        Ok(
            match read_until(self.port, &tokens, window.deadline, &mut seen)? {
                Some(0) => Reply::Ack,
                Some(_) => Reply::Nak,
                None => Reply::Silent,
            },
        )
    }
}
