//! Flashing stages and operations.
//!
//! A full provisioning run walks through four fixed stages:
//!
//! ```text
//! WriterBootstrap -> BL2 -> FIP -> Rootfs
//! ```
//!
//! The first three load the Flash Writer into RAM through the boot ROM and
//! then use it to program the boot partitions. Rootfs writes the system
//! image through the installed bootloader and can run on its own.

use std::fmt;

use crate::error::{Error, Result};
use crate::image::ImageFormat;

/// One discrete step of a flashing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    /// Flash Writer application loaded into RAM by the boot ROM.
    WriterBootstrap,
    /// Second-stage bootloader.
    Bl2,
    /// Firmware image package (trusted firmware + U-Boot).
    Fip,
    /// System image.
    Rootfs,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Self; 4] = [Self::WriterBootstrap, Self::Bl2, Self::Fip, Self::Rootfs];

    /// Format of the image this stage transfers.
    pub fn format(self) -> ImageFormat {
        match self {
            Self::WriterBootstrap | Self::Bl2 | Self::Fip => ImageFormat::SRecord,
            Self::Rootfs => ImageFormat::RawBinary,
        }
    }

    /// Whether the stage cannot start without its image.
    pub fn requires_image(self) -> bool {
        true
    }

    /// Stage that must have completed earlier in the same run, if any.
    pub fn predecessor(self) -> Option<Self> {
        match self {
            Self::WriterBootstrap | Self::Rootfs => None,
            Self::Bl2 => Some(Self::WriterBootstrap),
            Self::Fip => Some(Self::Bl2),
        }
    }

    /// Default file name of the stage image.
    pub fn default_file_name(self) -> &'static str {
        match self {
            Self::WriterBootstrap => "Flash_Writer_SCIF_rzboard.mot",
            Self::Bl2 => "bl2_bp-rzboard.srec",
            Self::Fip => "fip-rzboard.srec",
            Self::Rootfs => "avnet-core-image-rzboard.wic",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriterBootstrap => write!(f, "Flash Writer"),
            Self::Bl2 => write!(f, "BL2"),
            Self::Fip => write!(f, "FIP"),
            Self::Rootfs => write!(f, "rootfs"),
        }
    }
}

/// What the user asked to flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Flash Writer, BL2 and FIP.
    Bootloader,
    /// System image only.
    Rootfs,
    /// Bootloader followed by the system image.
    Full,
}

impl Operation {
    /// Stages run by this operation, in order.
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Self::Bootloader => &Stage::ALL[..3],
            Self::Rootfs => &Stage::ALL[3..],
            Self::Full => &Stage::ALL,
        }
    }

    /// Build an operation from mutually exclusive selection flags.
    pub fn from_flags(bootloader: bool, rootfs: bool, full: bool) -> Result<Self> {
        match (bootloader, rootfs, full) {
            (true, false, false) => Ok(Self::Bootloader),
            (false, true, false) => Ok(Self::Rootfs),
            (false, false, true) => Ok(Self::Full),
            (false, false, false) => Err(Error::InvalidOperation(
                "specify one of bootloader, rootfs or full".into(),
            )),
            _ => Err(Error::InvalidOperation(
                "bootloader, rootfs and full are mutually exclusive".into(),
            )),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootloader => write!(f, "bootloader"),
            Self::Rootfs => write!(f, "rootfs"),
            Self::Full => write!(f, "full"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_stages() {
        assert_eq!(
            Operation::Bootloader.stages(),
            &[Stage::WriterBootstrap, Stage::Bl2, Stage::Fip]
        );
        assert_eq!(Operation::Rootfs.stages(), &[Stage::Rootfs]);
        assert_eq!(Operation::Full.stages(), &Stage::ALL);
    }

    #[test]
    fn test_operation_from_flags() {
        assert_eq!(
            Operation::from_flags(true, false, false).ok(),
            Some(Operation::Bootloader)
        );
        assert_eq!(
            Operation::from_flags(false, false, true).ok(),
            Some(Operation::Full)
        );
        assert!(matches!(
            Operation::from_flags(false, false, false),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            Operation::from_flags(true, true, false),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_predecessors_follow_order() {
        for stage in Stage::ALL {
            if let Some(prev) = stage.predecessor() {
                assert!(prev < stage);
            }
        }
        assert_eq!(Stage::Rootfs.predecessor(), None);
    }
}
