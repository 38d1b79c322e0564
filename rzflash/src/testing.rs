//! In-memory serial device for unit tests.
//!
//! [`SimPort`] answers every write through a responder closure and queues the
//! reply for subsequent reads. Reading an empty queue times out immediately,
//! so bounded waits in the protocol code finish without real delays. Output
//! queued with [`SimPort::with_bursts`] arrives one burst per timed-out read,
//! like a device that pauses between lines.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct Wire {
    rx: VecDeque<u8>,
    bursts: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    write_budget: Option<usize>,
    closed: bool,
}

pub(crate) struct SimPort {
    wire: Arc<Mutex<Wire>>,
    responder: Responder,
    timeout: Duration,
}

/// Inspection handle that outlives the port.
#[derive(Clone)]
pub(crate) struct SimHandle(Arc<Mutex<Wire>>);

impl SimPort {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self {
            wire: Arc::new(Mutex::new(Wire::default())),
            responder: Box::new(responder),
            timeout: Duration::from_millis(1000),
        }
    }

    pub(crate) fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Device that replays `script` in order: a write equal to the next
    /// entry's command gets that entry's reply, any other write is answered
    /// with `ack`.
    pub(crate) fn scripted(script: Vec<(Vec<u8>, Vec<u8>)>, ack: Vec<u8>) -> Self {
        let mut script: VecDeque<_> = script.into();
        Self::new(move |written: &[u8]| {
            let next = script
                .front()
                .is_some_and(|(command, _)| command.as_slice() == written);
            if next {
                script.pop_front().map(|(_, reply)| reply).unwrap_or_default()
            } else {
                ack.clone()
            }
        })
    }

    /// Bytes already waiting when the port is opened.
    pub(crate) fn with_pending(self, bytes: &[u8]) -> Self {
        self.wire.lock().unwrap().rx.extend(bytes);
        self
    }

    /// Output released after each read that finds nothing to deliver.
    pub(crate) fn with_bursts(self, bursts: &[&[u8]]) -> Self {
        self.wire
            .lock()
            .unwrap()
            .bursts
            .extend(bursts.iter().map(|b| b.to_vec()));
        self
    }

    /// Accept `count` writes, then fail every further one like an unplugged cable.
    pub(crate) fn fail_writes_after(self, count: usize) -> Self {
        self.wire.lock().unwrap().write_budget = Some(count);
        self
    }

    pub(crate) fn handle(&self) -> SimHandle {
        SimHandle(Arc::clone(&self.wire))
    }
}

impl SimHandle {
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().writes.clone()
    }

    pub(crate) fn count_writes(&self, bytes: &[u8]) -> usize {
        self.0
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|w| w.as_slice() == bytes)
            .count()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.wire.lock().unwrap();
        if wire.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        if wire.rx.is_empty() {
            if let Some(burst) = wire.bursts.pop_front() {
                wire.rx.extend(burst);
            }
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(wire.rx.len());
        for (slot, byte) in buf.iter_mut().zip(wire.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut wire = self.wire.lock().unwrap();
            if wire.closed {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
            }
            if let Some(left) = wire.write_budget.as_mut() {
                if *left == 0 {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
                }
                *left -= 1;
            }
        }
        let reply = (self.responder)(buf);
        let mut wire = self.wire.lock().unwrap();
        wire.writes.push(buf.to_vec());
        wire.rx.extend(reply);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.wire.lock().unwrap().rx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }

    fn close(&mut self) -> Result<()> {
        self.wire.lock().unwrap().closed = true;
        Ok(())
    }
}
