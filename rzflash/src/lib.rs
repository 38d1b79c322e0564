//! # rzflash
//!
//! A library for flashing Renesas RZ/V2L boards (Avnet RZBoard V2L) over a
//! serial console.
//!
//! Provisioning a board happens in up to four stages:
//!
//! 1. **Flash Writer**: loaded into RAM by the boot ROM in SCIF download mode
//! 2. **BL2**: second-stage bootloader, written to eMMC or QSPI
//! 3. **FIP**: trusted firmware and U-Boot, written to eMMC or QSPI
//! 4. **rootfs**: system image, handed to U-Boot's fastboot over the network
//!
//! This crate provides:
//!
//! - S-record and raw disk image decoding ([`image`])
//! - A half-duplex serial port abstraction ([`port`])
//! - Stage handshakes, Flash Writer and U-Boot dialogs, streamed or
//!   acknowledged record transfer ([`protocol`], [`target`])
//! - System image hand-off to the host fastboot tool ([`fastboot`])
//! - Stage sequencing with per-stage reports ([`Session`])
//!
//! ## Features
//!
//! - `native` (default): native serial port support via the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use rzflash::{ImagePaths, Operation, ProgressEvent, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = SessionConfig::new(ImagePaths::in_dir("./images"));
//!     config.serial.port_name = "/dev/ttyUSB0".into();
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let session = rzflash::Session::open(config)?;
//!         let report = session.run(Operation::Bootloader, &mut |e: ProgressEvent| {
//!             println!("{}: {}/{}", e.stage, e.bytes_sent, e.bytes_total);
//!         })?;
//!
//!         if let Some((stage, err)) = report.failure() {
//!             eprintln!("{stage} failed: {err}");
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fastboot;
pub mod image;
pub mod port;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod stage;
pub mod target;

#[cfg(test)]
mod testing;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    error::{DecodeError, Error, ErrorKind, Result},
    fastboot::{Fastboot, FastbootCommand},
    image::{AddressWidth, Image, ImageFormat, Record, RecordKind},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    progress::{ChannelSink, ProgressEvent, ProgressSink},
    protocol::{Handshake, HandshakeState, ProtocolConfig, TransferEngine},
    session::{ImagePaths, Report, Session, SessionConfig, StageOutcome, StageReport},
    stage::{Operation, Stage},
    target::{PromptStep, StageProfile, Target, Transfer},
};
