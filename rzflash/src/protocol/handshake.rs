//! Stage entry handshake and Flash Writer dialog.
//!
//! ```text
//!   Idle --enter_stage--> AwaitingToken --token seen--> Ready
//!                            |    ^
//!                            +----+  timeout / stray bytes (retry)
//! ```
//!
//! Each attempt writes the stage trigger (unless it is empty) and then reads
//! until the token appears in the bytes accumulated during that attempt.
//! Banners and other noise cause a retry rather than an immediate failure.
//! A listen-only stage hears its banner once, so the end of one attempt's
//! bytes is carried into the next in case the token straddles the deadline.
//! Dialog steps are commands, so they are never retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::{ProtocolConfig, after_match, printable, read_until};
use crate::stage::Stage;
use crate::target::{PromptStep, StageProfile};

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet.
    Idle,
    /// Waiting for the token on the given attempt (1-based).
    AwaitingToken {
        /// Current attempt.
        attempt: u32,
    },
    /// Token received; the device is ready for the stage.
    Ready,
}

/// Stage entry negotiation over a borrowed port.
pub struct Handshake<'a, P: Port> {
    port: &'a mut P,
    config: &'a ProtocolConfig,
    cancel: Option<&'a AtomicBool>,
    state: HandshakeState,
    tail: Vec<u8>,
}

impl<'a, P: Port> Handshake<'a, P> {
    /// Create a handshake handler.
    pub fn new(port: &'a mut P, config: &'a ProtocolConfig) -> Self {
        Self {
            port,
            config,
            cancel: None,
            state: HandshakeState::Idle,
            tail: Vec::new(),
        }
    }

    /// Stop between attempts once `flag` is set.
    #[must_use]
    pub fn with_cancel(mut self, flag: Option<&'a AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Bring the device to the point where it accepts `stage`.
    pub fn enter_stage(&mut self, stage: Stage, profile: &StageProfile) -> Result<()> {
        let attempts = self.config.handshake_retries;
        let mut last_seen = Vec::new();

        if profile.trigger.is_empty() {
            info!("{stage}: waiting for {:?}", printable(&profile.token));
        } else {
            debug!("{stage}: sending {:?}", printable(&profile.trigger));
        }

        let keep = profile.token.len().saturating_sub(1);
        let mut carried = Vec::new();

        for attempt in 1..=attempts {
            if self.cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                self.state = HandshakeState::Idle;
                return Err(Error::Cancelled {
                    stage,
                    bytes_sent: 0,
                });
            }
            self.state = HandshakeState::AwaitingToken { attempt };

            if !profile.trigger.is_empty() {
                self.port.write_all_bytes(&profile.trigger)?;
            }

            let mut seen = std::mem::take(&mut carried);
            let fresh = seen.len();
            let deadline = Instant::now() + self.config.handshake_timeout;
            if read_until(self.port, &[profile.token.as_slice()], deadline, &mut seen)?.is_some() {
                self.state = HandshakeState::Ready;
                debug!("{stage}: handshake complete on attempt {attempt}");
                return Ok(());
            }

            let received = &seen[fresh..];
            if received.is_empty() {
                debug!("{stage}: no response (attempt {attempt}/{attempts})");
            } else {
                debug!(
                    "{stage}: unexpected response {:?} (attempt {attempt}/{attempts})",
                    printable(received)
                );
            }
            last_seen = received.to_vec();

            if profile.trigger.is_empty() {
                carried = seen[seen.len().saturating_sub(keep)..].to_vec();
            }
        }

        self.state = HandshakeState::Idle;
        if last_seen.is_empty() {
            Err(Error::HandshakeTimeout { stage, attempts })
        } else {
            Err(Error::UnexpectedToken {
                stage,
                received: printable(&last_seen),
            })
        }
    }

    /// Run dialog steps in order, one attempt each.
    ///
    /// Whatever arrived after the last step's prompt is kept for
    /// [`read_line`](Self::read_line).
    pub fn run_steps(&mut self, stage: Stage, steps: &[PromptStep]) -> Result<()> {
        for step in steps {
            self.tail.clear();
            self.port.clear_buffers()?;
            trace!("{stage}: > {:?}", printable(&step.send));
            self.port.write_all_bytes(&step.send)?;

            let mut seen = Vec::new();
            let deadline = Instant::now() + self.config.prompt_timeout;
            if read_until(self.port, &[step.expect.as_slice()], deadline, &mut seen)?.is_none() {
                debug!(
                    "{stage}: got {:?} while waiting for {:?}",
                    printable(&seen),
                    printable(&step.expect)
                );
                return Err(Error::PromptTimeout {
                    stage,
                    expected: String::from_utf8_lossy(&step.expect).into_owned(),
                });
            }
            if let Some(rest) = after_match(&seen, &step.expect) {
                self.tail = rest.to_vec();
            }
        }
        Ok(())
    }

    /// Rest of the line the device is printing after the last prompt, trimmed.
    pub fn read_line(&mut self, stage: Stage) -> Result<String> {
        let mut seen = std::mem::take(&mut self.tail);
        let deadline = Instant::now() + self.config.prompt_timeout;
        if read_until(self.port, &[b"\n".as_slice()], deadline, &mut seen)?.is_none() {
            return Err(Error::PromptTimeout {
                stage,
                expected: "end of line".into(),
            });
        }
        let end = seen.iter().position(|&b| b == b'\n').unwrap_or(seen.len());
        let line = String::from_utf8_lossy(&seen[..end]).trim().to_string();
        trace!("{stage}: < {line:?}");
        Ok(line)
    }
}
