//! Configuration file support for rzflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (RZFLASH_*)
//! 3. Local config file (./rzflash.toml)
//! 4. Global config file (~/.config/rzflash/config.toml)
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [flash]
//! target = "qspi"
//! image_path = "/opt/rzboard/images"
//! static_ip = "192.168.1.50"   # skip DHCP before fastboot
//! fastboot = "/opt/platform-tools/fastboot"
//!
//! [protocol]
//! ack_timeout_ms = 2000
//!
//! # Send the system image over serial to a receiver that acks each chunk.
//! [profiles.rootfs]
//! trigger = "\r"
//! token = "=>"
//! steps = [{ send = "rx 0x48000000\r", expect = "ready" }]
//! transfer = "ack"
//! ```

use directories::ProjectDirs;
use log::{debug, warn};
use rzflash::{ProtocolConfig, Stage, StageProfile, Target, Transfer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "rzflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Storage target ("emmc" or "qspi").
    pub target: Option<String>,
    /// Directory holding the images.
    pub image_path: Option<PathBuf>,
    /// Board address during the system image stage instead of DHCP.
    pub static_ip: Option<Ipv4Addr>,
    /// Host fastboot binary.
    pub fastboot: Option<PathBuf>,
}

/// Protocol tuning. Unset fields keep the library defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolSection {
    /// Wait for a stage's handshake token, per attempt.
    pub handshake_timeout_ms: Option<u64>,
    /// Handshake attempts per stage.
    pub handshake_retries: Option<u32>,
    /// Wait for a Flash Writer prompt.
    pub prompt_timeout_ms: Option<u64>,
    /// Wait for a record acknowledgment.
    pub ack_timeout_ms: Option<u64>,
    /// Attempts per record.
    pub chunk_retries: Option<u32>,
    /// Acknowledgment token. Empty streams records without waiting.
    pub ack: Option<Vec<u8>>,
    /// Negative acknowledgment token.
    pub nak: Option<Vec<u8>>,
    /// Record size of raw images.
    pub chunk_size: Option<usize>,
}

/// One command/response exchange of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Bytes to send.
    pub send: String,
    /// Reply to wait for.
    pub expect: String,
}

/// Replacement dialog for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Bytes written on each handshake attempt.
    #[serde(default)]
    pub trigger: String,
    /// Token that completes the handshake.
    pub token: String,
    /// Exchanges before the transfer.
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    /// Exchanges after the transfer.
    #[serde(default)]
    pub finish: Vec<StepConfig>,
    /// "stream" (default), "ack" or "fastboot".
    pub transfer: Option<String>,
}

impl ProfileConfig {
    fn to_profile(&self) -> rzflash::Result<StageProfile> {
        let transfer = self
            .transfer
            .as_deref()
            .map(str::parse::<Transfer>)
            .transpose()?
            .unwrap_or_default();
        let mut profile = StageProfile::new(self.trigger.as_bytes(), self.token.as_bytes())
            .with_transfer(transfer);
        for step in &self.steps {
            profile = profile.step(step.send.as_bytes(), step.expect.as_bytes());
        }
        for step in &self.finish {
            profile = profile.then(step.send.as_bytes(), step.expect.as_bytes());
        }
        Ok(profile)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Serial connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash settings.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Protocol tuning.
    #[serde(default)]
    pub protocol: ProtocolSection,
    /// Stage dialog overrides, keyed by `writer`, `bl2`, `fip` or `rootfs`.
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "rzflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Connection
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }

        // Flash
        if other.flash.target.is_some() {
            self.flash.target = other.flash.target;
        }
        if other.flash.image_path.is_some() {
            self.flash.image_path = other.flash.image_path;
        }
        if other.flash.static_ip.is_some() {
            self.flash.static_ip = other.flash.static_ip;
        }
        if other.flash.fastboot.is_some() {
            self.flash.fastboot = other.flash.fastboot;
        }

        // Protocol
        let (p, o) = (&mut self.protocol, other.protocol);
        p.handshake_timeout_ms = o.handshake_timeout_ms.or(p.handshake_timeout_ms);
        p.handshake_retries = o.handshake_retries.or(p.handshake_retries);
        p.prompt_timeout_ms = o.prompt_timeout_ms.or(p.prompt_timeout_ms);
        p.ack_timeout_ms = o.ack_timeout_ms.or(p.ack_timeout_ms);
        p.chunk_retries = o.chunk_retries.or(p.chunk_retries);
        p.ack = o.ack.or(p.ack.take());
        p.nak = o.nak.or(p.nak.take());
        p.chunk_size = o.chunk_size.or(p.chunk_size);

        // Whole profiles replace each other
        self.profiles.extend(other.profiles);
    }

    /// Configured flash target, if any.
    pub fn target(&self) -> rzflash::Result<Option<Target>> {
        self.flash.target.as_deref().map(str::parse::<Target>).transpose()
    }

    /// Apply the `[protocol]` and `[profiles.*]` sections on top of `base`.
    pub fn apply_protocol(&self, mut base: ProtocolConfig) -> rzflash::Result<ProtocolConfig> {
        let p = &self.protocol;
        if let Some(ms) = p.handshake_timeout_ms {
            base.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = p.handshake_retries {
            base.handshake_retries = n;
        }
        if let Some(ms) = p.prompt_timeout_ms {
            base.prompt_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = p.ack_timeout_ms {
            base.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = p.chunk_retries {
            base.chunk_retries = n;
        }
        if let Some(ref ack) = p.ack {
            base.ack.clone_from(ack);
        }
        if let Some(ref nak) = p.nak {
            base.nak.clone_from(nak);
        }
        if let Some(size) = p.chunk_size {
            base.chunk_size = size;
        }

        for (name, profile) in &self.profiles {
            let stage = stage_from_key(name).ok_or_else(|| {
                rzflash::Error::Config(format!(
                    "unknown profile '{name}' (expected writer, bl2, fip or rootfs)"
                ))
            })?;
            base = base.with_profile(stage, profile.to_profile()?);
        }

        base.validate()?;
        Ok(base)
    }
}

fn stage_from_key(key: &str) -> Option<Stage> {
    match key.to_ascii_lowercase().as_str() {
        "writer" | "flash_writer" => Some(Stage::WriterBootstrap),
        "bl2" => Some(Stage::Bl2),
        "fip" => Some(Stage::Fip),
        "rootfs" => Some(Stage::Rootfs),
        _ => None,
    }
}
