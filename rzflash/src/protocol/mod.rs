//! Serial flashing protocol.
//!
//! - [`handshake`]: stage entry and the Flash Writer command dialog.
//! - [`transfer`]: record-by-record upload, streamed or acknowledged.
//!
//! Both share [`ProtocolConfig`], which holds every timing and token the
//! device conversation depends on.

pub mod handshake;
pub mod transfer;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use log::trace;

use crate::error::{Error, Result};
use crate::image::ImageFormat;
use crate::port::Port;
use crate::stage::Stage;
use crate::target::{StageProfile, Target, Transfer, flash_writer};

pub use handshake::{Handshake, HandshakeState};
pub use transfer::{AckWindow, TransferEngine};

/// Positive acknowledgment of a record.
pub const ACK: u8 = 0x06;
/// Negative acknowledgment of a record.
pub const NAK: u8 = 0x15;

/// Default raw image chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Protocol timing, retry and token settings.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Storage the boot images go to.
    pub target: Target,
    /// Time to wait for the handshake token on each attempt.
    pub handshake_timeout: Duration,
    /// Handshake attempts before the stage fails.
    pub handshake_retries: u32,
    /// Time to wait for each dialog prompt.
    pub prompt_timeout: Duration,
    /// Time to wait for a record's acknowledgment.
    pub ack_timeout: Duration,
    /// Attempts per record before the transfer aborts.
    pub chunk_retries: u32,
    /// Acknowledgment token for profiles using [`Transfer::Acknowledged`].
    /// Empty streams records without waiting.
    pub ack: Vec<u8>,
    /// Negative acknowledgment token.
    pub nak: Vec<u8>,
    /// Record size for raw images.
    pub chunk_size: usize,
    /// Fixed board address for the system image stage; DHCP when unset.
    pub static_ip: Option<Ipv4Addr>,
    /// Per-stage replacements for the built-in profiles.
    pub profiles: BTreeMap<Stage, StageProfile>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            target: Target::Emmc,
            handshake_timeout: Duration::from_secs(3),
            handshake_retries: 10,
            prompt_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(1),
            chunk_retries: 10,
            ack: vec![ACK],
            nak: vec![NAK],
            chunk_size: DEFAULT_CHUNK_SIZE,
            static_ip: None,
            profiles: BTreeMap::new(),
        }
    }
}

impl ProtocolConfig {
    /// Set the flash target.
    #[must_use]
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// Give the board a fixed address instead of asking DHCP.
    #[must_use]
    pub fn with_static_ip(mut self, ip: Ipv4Addr) -> Self {
        self.static_ip = Some(ip);
        self
    }

    /// Replace the profile of one stage.
    #[must_use]
    pub fn with_profile(mut self, stage: Stage, profile: StageProfile) -> Self {
        self.profiles.insert(stage, profile);
        self
    }

    /// Effective profile of a stage.
    pub fn profile(&self, stage: Stage) -> StageProfile {
        match self.profiles.get(&stage) {
            Some(profile) => profile.clone(),
            None if stage == Stage::Rootfs => flash_writer::rootfs(self.static_ip),
            None => StageProfile::default_for(stage, self.target),
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.handshake_retries == 0 {
            return Err(Error::Config("handshake retries must be at least 1".into()));
        }
        if self.chunk_retries == 0 {
            return Err(Error::Config("chunk retries must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be non-zero".into()));
        }
        if !self.ack.is_empty() && self.ack == self.nak {
            return Err(Error::Config("ack and nak tokens must differ".into()));
        }
        for (stage, profile) in &self.profiles {
            if profile.token.is_empty() {
                return Err(Error::Config(format!("{stage}: handshake token is empty")));
            }
            if let Some(step) = profile
                .steps
                .iter()
                .chain(&profile.finish)
                .find(|s| s.expect.is_empty())
            {
                return Err(Error::Config(format!(
                    "{stage}: step {:?} has no expected reply",
                    printable(&step.send)
                )));
            }
            let raw = stage.format() == ImageFormat::RawBinary;
            if profile.transfer == Transfer::Fastboot && !raw {
                return Err(Error::Config(format!(
                    "{stage}: fastboot only takes raw disk images"
                )));
            }
            // Raw bytes typed into a bare U-Boot shell run as commands.
            if raw && profile.transfer.is_serial() && profile.steps.is_empty() {
                return Err(Error::Config(format!(
                    "{stage}: serial transfer needs a receive command in the profile steps"
                )));
            }
        }
        Ok(())
    }
}

/// Read into `seen` until one of `needles` appears or `deadline` passes.
///
/// Returns the index of the needle that occurs first in the stream, or
/// `None` on timeout. Empty needles never match.
pub(crate) fn read_until<P: Port>(
    port: &mut P,
    needles: &[&[u8]],
    deadline: Instant,
    seen: &mut Vec<u8>,
) -> Result<Option<usize>> {
    let mut buf = [0u8; 256];
    loop {
        if let Some(index) = earliest_match(seen, needles) {
            return Ok(Some(index));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match port.read_with_timeout(&mut buf, remaining) {
            Ok(n) => {
                trace!("rx {:?}", printable(&buf[..n]));
                seen.extend_from_slice(&buf[..n]);
            },
            Err(Error::Timeout(_)) => {
                return Ok(earliest_match(seen, needles));
            },
            Err(e) => return Err(e),
        }
    }
}

/// Bytes of `haystack` following the first occurrence of `needle`.
pub(crate) fn after_match<'a>(haystack: &'a [u8], needle: &[u8]) -> Option<&'a [u8]> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| &haystack[pos + needle.len()..])
}

fn earliest_match(haystack: &[u8], needles: &[&[u8]]) -> Option<usize> {
    needles
        .iter()
        .enumerate()
        .filter(|(_, needle)| !needle.is_empty())
        .filter_map(|(index, needle)| {
            haystack
                .windows(needle.len())
                .position(|w| w == *needle)
                .map(|pos| (pos, index))
        })
        .min()
        .map(|(_, index)| index)
}

/// Lossy, escaped rendering of device output for logs and errors.
pub(crate) fn printable(bytes: &[u8]) -> String {
    const PREVIEW: usize = 64;
    let tail = &bytes[bytes.len().saturating_sub(PREVIEW)..];
    tail.escape_ascii().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimPort;

    #[test]
    fn test_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.handshake_retries, 10);
        assert_eq!(config.chunk_retries, 10);
        assert_eq!(config.ack, vec![ACK]);
        assert_eq!(config.nak, vec![NAK]);
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.target, Target::Emmc);
        assert_eq!(config.static_ip, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rootfs_profile_follows_static_ip() {
        let dhcp = ProtocolConfig::default().profile(Stage::Rootfs);
        assert_eq!(dhcp.steps[1].send, b"setenv autoload no; dhcp\r");

        let config = ProtocolConfig::default().with_static_ip(Ipv4Addr::new(10, 0, 0, 7));
        let fixed = config.profile(Stage::Rootfs);
        assert_eq!(fixed.steps[1].send, b"setenv ipaddr 10.0.0.7\r");
        assert_eq!(fixed.transfer, Transfer::Fastboot);
    }

    #[test]
    fn test_validate_rejects_rootfs_without_receive_step() {
        let bare = StageProfile::new("\r", "=>");
        let config = ProtocolConfig::default().with_profile(Stage::Rootfs, bare.clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("receive command"), "{err}");

        let fastboot = ProtocolConfig::default()
            .with_profile(Stage::Rootfs, bare.clone().with_transfer(Transfer::Fastboot));
        assert!(fastboot.validate().is_ok());

        let receiving = ProtocolConfig::default().with_profile(
            Stage::Rootfs,
            bare.step("rx\r", "ready").with_transfer(Transfer::Acknowledged),
        );
        assert!(receiving.validate().is_ok());

        let srec_fastboot = ProtocolConfig::default().with_profile(
            Stage::Bl2,
            StageProfile::new("\r", ">").with_transfer(Transfer::Fastboot),
        );
        assert!(matches!(srec_fastboot.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_profile_override_wins() {
        let custom = StageProfile::new("\r", "=>").step("rx 0x48000000\r", "Ready");
        let config = ProtocolConfig::default().with_profile(Stage::Rootfs, custom.clone());

        assert_eq!(config.profile(Stage::Rootfs), custom);
        assert_eq!(
            config.profile(Stage::Bl2),
            StageProfile::default_for(Stage::Bl2, Target::Emmc)
        );
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let config = ProtocolConfig {
            chunk_retries: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ProtocolConfig {
            nak: vec![ACK],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ProtocolConfig::default()
            .with_profile(Stage::Rootfs, StageProfile::new("\r", "=>").step("go\r", ""));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_earliest_match_wins() {
        let tokens: [&[u8]; 2] = [&[ACK], &[NAK]];
        assert_eq!(earliest_match(b"xx\x15yy\x06", &tokens), Some(1));
        assert_eq!(earliest_match(b"\x06\x15", &tokens), Some(0));
        assert_eq!(earliest_match(b"abc", &[b"".as_slice(), b"z".as_slice()]), None);
    }

    #[test]
    fn test_after_match() {
        assert_eq!(after_match(b"on 10.0.0.7\r\n", b"on "), Some(&b"10.0.0.7\r\n"[..]));
        assert_eq!(after_match(b"abc", b"c"), Some(&b""[..]));
        assert_eq!(after_match(b"abc", b"x"), None);
    }

    #[test]
    fn test_read_until_across_reads() {
        let mut port = SimPort::silent().with_pending(b"banner\r\nplease se");
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(
            read_until(&mut port, &[b"please send !".as_slice()], deadline, &mut seen).unwrap(),
            None
        );
        assert_eq!(seen, b"banner\r\nplease se");
    }

    #[test]
    fn test_printable_escapes_and_truncates() {
        assert_eq!(printable(b"ok\r\n"), "ok\\r\\n");
        assert_eq!(printable(&[b'a'; 100]).len(), 64);
    }
}
