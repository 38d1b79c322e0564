//! Flash targets and per-stage device dialogs.
//!
//! Every stage starts with a handshake (send a trigger, wait for a token),
//! optionally followed by a short command dialog with the resident Flash
//! Writer or U-Boot. The bytes involved and the way the image is delivered
//! are described by a [`StageProfile`]; built-in defaults for the RZBoard
//! live in [`flash_writer`].

pub mod flash_writer;

use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::stage::Stage;

/// Storage the Flash Writer programs the boot images into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    /// On-board eMMC.
    #[default]
    Emmc,
    /// QSPI NOR flash.
    Qspi,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emmc => write!(f, "emmc"),
            Self::Qspi => write!(f, "qspi"),
        }
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "emmc" => Ok(Self::Emmc),
            "qspi" => Ok(Self::Qspi),
            other => Err(Error::Config(format!(
                "unknown target '{other}' (expected emmc or qspi)"
            ))),
        }
    }
}

/// How a stage's image reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transfer {
    /// Records written back to back over serial with no per-record reply.
    #[default]
    Stream,
    /// One record at a time over serial, each answered by the ack or nak token.
    Acknowledged,
    /// The dialog leaves U-Boot in `fastboot udp` mode and the image is
    /// flashed over the network with fastboot.
    Fastboot,
}

impl Transfer {
    /// Whether the image goes over the serial line.
    pub fn is_serial(self) -> bool {
        !matches!(self, Self::Fastboot)
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Acknowledged => write!(f, "ack"),
            Self::Fastboot => write!(f, "fastboot"),
        }
    }
}

impl FromStr for Transfer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" => Ok(Self::Stream),
            "ack" | "acknowledged" => Ok(Self::Acknowledged),
            "fastboot" => Ok(Self::Fastboot),
            other => Err(Error::Config(format!(
                "unknown transfer mode '{other}' (expected stream, ack or fastboot)"
            ))),
        }
    }
}

/// One command/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptStep {
    /// Bytes written to the device.
    pub send: Vec<u8>,
    /// Bytes that must appear in the reply.
    pub expect: Vec<u8>,
}

impl PromptStep {
    /// Create a step.
    pub fn new(send: impl Into<Vec<u8>>, expect: impl Into<Vec<u8>>) -> Self {
        Self {
            send: send.into(),
            expect: expect.into(),
        }
    }
}

/// How to enter a stage and what to say around its transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageProfile {
    /// Written at the start of every handshake attempt. Empty means listen only.
    pub trigger: Vec<u8>,
    /// Bytes that prove the device is ready for the stage.
    pub token: Vec<u8>,
    /// Dialog run after the handshake, before the transfer.
    pub steps: Vec<PromptStep>,
    /// Dialog run after a successful transfer.
    pub finish: Vec<PromptStep>,
    /// How the image is delivered once `steps` are done.
    pub transfer: Transfer,
}

impl StageProfile {
    /// Profile with a handshake only, streaming its image.
    pub fn new(trigger: impl Into<Vec<u8>>, token: impl Into<Vec<u8>>) -> Self {
        Self {
            trigger: trigger.into(),
            token: token.into(),
            steps: Vec::new(),
            finish: Vec::new(),
            transfer: Transfer::Stream,
        }
    }

    /// Deliver the image with `transfer`.
    #[must_use]
    pub fn with_transfer(mut self, transfer: Transfer) -> Self {
        self.transfer = transfer;
        self
    }

    /// Append a pre-transfer step.
    #[must_use]
    pub fn step(mut self, send: impl Into<Vec<u8>>, expect: impl Into<Vec<u8>>) -> Self {
        self.steps.push(PromptStep::new(send, expect));
        self
    }

    /// Append a post-transfer step.
    #[must_use]
    pub fn then(mut self, send: impl Into<Vec<u8>>, expect: impl Into<Vec<u8>>) -> Self {
        self.finish.push(PromptStep::new(send, expect));
        self
    }

    /// Built-in profile for a stage on the given target.
    pub fn default_for(stage: Stage, target: Target) -> Self {
        flash_writer::profile(stage, target)
    }
}
