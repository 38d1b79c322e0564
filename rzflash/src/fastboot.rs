//! System image hand-off to fastboot.
//!
//! U-Boot's `fastboot udp` takes the disk image over the network, so the
//! serial session only prepares the board and then runs the host `fastboot`
//! tool against the address the board reported.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::stage::Stage;

/// Partition name U-Boot uses for the whole eMMC user area.
pub const RAW_PARTITION: &str = "rawimg";

/// Flashes a disk image onto a board waiting in fastboot mode.
pub trait Fastboot {
    /// Write `image` to the board at `address` (`udp:<ip>`).
    fn flash(&mut self, address: &str, image: &Path) -> Result<()>;
}

/// Runs the host `fastboot` binary.
#[derive(Debug, Clone)]
pub struct FastbootCommand {
    program: PathBuf,
    partition: String,
}

impl Default for FastbootCommand {
    fn default() -> Self {
        Self::new("fastboot")
    }
}

impl FastbootCommand {
    /// Use `program` as the fastboot binary.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            partition: RAW_PARTITION.to_string(),
        }
    }

    /// Fastboot binary.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Fastboot for FastbootCommand {
    fn flash(&mut self, address: &str, image: &Path) -> Result<()> {
        debug!(
            "Running {} -s {address} flash {} {}",
            self.program.display(),
            self.partition,
            image.display()
        );

        let mut child = Command::new(&self.program)
            .args(["-s", address, "-v", "flash", &self.partition])
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Fastboot {
                stage: Stage::Rootfs,
                reason: format!("cannot run {}: {e}", self.program.display()),
            })?;

        // fastboot reports progress on stderr.
        let mut last = String::new();
        if let Some(stderr) = child.stderr.take() {
            for line in BufReader::new(stderr).lines().map_while(std::io::Result::ok) {
                if !line.trim().is_empty() {
                    info!("fastboot: {}", line.trim_end());
                    last = line;
                }
            }
        }

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Fastboot {
                stage: Stage::Rootfs,
                reason: if last.is_empty() {
                    format!("fastboot exited with {status}")
                } else {
                    format!("fastboot exited with {status}: {}", last.trim())
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_program() {
        let fastboot = FastbootCommand::default();
        assert_eq!(fastboot.program(), Path::new("fastboot"));
        assert_eq!(fastboot.partition, "rawimg");
    }

    #[test]
    fn test_missing_program_is_fastboot_error() {
        let mut fastboot = FastbootCommand::new("/nonexistent/rzflash-fastboot");
        let err = fastboot
            .flash("udp:192.168.1.50", Path::new("core.wic"))
            .unwrap_err();

        match err {
            Error::Fastboot { stage, reason } => {
                assert_eq!(stage, Stage::Rootfs);
                assert!(reason.contains("cannot run"), "{reason}");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_decides_outcome() {
        assert!(FastbootCommand::new("true")
            .flash("udp:10.0.0.7", Path::new("core.wic"))
            .is_ok());

        let err = FastbootCommand::new("false")
            .flash("udp:10.0.0.7", Path::new("core.wic"))
            .unwrap_err();
        assert!(matches!(err, Error::Fastboot { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Device);
    }
}
