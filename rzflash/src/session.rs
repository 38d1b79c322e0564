//! Flash session: runs the stages of an operation in order.
//!
//! A [`Session`] owns the port for its whole lifetime and closes it on every
//! exit path. All images of the selected stages are checked before the first
//! byte goes out; after that, the first failing stage halts the run and the
//! remaining stages are reported as not attempted.

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::error::{Error, Result};
use crate::fastboot::{Fastboot, FastbootCommand};
use crate::image;
use crate::port::{Port, SerialConfig};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::protocol::{Handshake, ProtocolConfig, TransferEngine};
use crate::stage::{Operation, Stage};
use crate::target::Transfer;

#[cfg(feature = "native")]
use crate::port::NativePort;

/// Image file of every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePaths {
    /// Flash Writer (`.mot`).
    pub writer: PathBuf,
    /// BL2 (`.srec`).
    pub bl2: PathBuf,
    /// FIP (`.srec`).
    pub fip: PathBuf,
    /// System image (`.wic`).
    pub rootfs: PathBuf,
}

impl ImagePaths {
    /// Default file names inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            writer: dir.join(Stage::WriterBootstrap.default_file_name()),
            bl2: dir.join(Stage::Bl2.default_file_name()),
            fip: dir.join(Stage::Fip.default_file_name()),
            rootfs: dir.join(Stage::Rootfs.default_file_name()),
        }
    }

    /// Image path of a stage.
    pub fn get(&self, stage: Stage) -> &Path {
        match stage {
            Stage::WriterBootstrap => &self.writer,
            Stage::Bl2 => &self.bl2,
            Stage::Fip => &self.fip,
            Stage::Rootfs => &self.rootfs,
        }
    }

    /// Replace the image path of a stage.
    pub fn set(&mut self, stage: Stage, path: impl Into<PathBuf>) {
        let path = path.into();
        match stage {
            Stage::WriterBootstrap => self.writer = path,
            Stage::Bl2 => self.bl2 = path,
            Stage::Fip => self.fip = path,
            Stage::Rootfs => self.rootfs = path,
        }
    }

    /// Ensure every stage in `stages` that needs an image has a readable file.
    pub fn check(&self, stages: &[Stage]) -> Result<()> {
        for &stage in stages.iter().filter(|s| s.requires_image()) {
            let path = self.get(stage);
            let readable = path.is_file() && File::open(path).is_ok();
            if !readable {
                return Err(Error::MissingImage {
                    stage,
                    path: path.to_path_buf(),
                });
            }
        }
        Ok(())
    }
}

/// Everything a session needs besides the port itself.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Serial line settings, used by [`Session::open`].
    pub serial: SerialConfig,
    /// Stage images.
    pub images: ImagePaths,
    /// Protocol timing and tokens.
    pub protocol: ProtocolConfig,
    /// Host fastboot binary used for the system image.
    pub fastboot: PathBuf,
}

impl SessionConfig {
    /// Default serial and protocol settings for the given images.
    pub fn new(images: ImagePaths) -> Self {
        Self {
            serial: SerialConfig::default(),
            images,
            protocol: ProtocolConfig::default(),
            fastboot: PathBuf::from("fastboot"),
        }
    }
}

/// Result of one stage.
#[derive(Debug)]
pub enum StageOutcome {
    /// Not reached yet.
    Pending,
    /// Image transferred and dialog completed.
    Success,
    /// Stage failed; the run stopped here.
    Failed(Error),
    /// Skipped because an earlier stage failed.
    NotAttempted,
}

impl StageOutcome {
    /// Whether the stage completed.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "ok"),
            Self::Failed(e) => write!(f, "failed: {e}"),
            Self::NotAttempted => write!(f, "not attempted"),
        }
    }
}

/// Per-stage entry of a [`Report`].
#[derive(Debug)]
pub struct StageReport {
    /// Stage.
    pub stage: Stage,
    /// How it ended.
    pub outcome: StageOutcome,
    /// Payload bytes delivered to the device, up to the failure if any.
    pub bytes_sent: u64,
    /// Payload bytes in the stage image (0 if it was never decoded).
    pub bytes_total: u64,
    /// Wall time spent in the stage.
    pub duration: Duration,
}

impl StageReport {
    fn pending(stage: Stage) -> Self {
        Self {
            stage,
            outcome: StageOutcome::Pending,
            bytes_sent: 0,
            bytes_total: 0,
            duration: Duration::ZERO,
        }
    }
}

/// Outcome of [`Session::run`].
#[derive(Debug)]
pub struct Report {
    /// Requested operation.
    pub operation: Operation,
    /// One entry per selected stage, in execution order.
    pub stages: Vec<StageReport>,
    /// Total wall time.
    pub elapsed: Duration,
}

impl Report {
    /// True only if every selected stage succeeded.
    pub fn is_success(&self) -> bool {
        self.stages.iter().all(|s| s.outcome.is_success())
    }

    /// Payload bytes sent across all stages.
    pub fn bytes_sent(&self) -> u64 {
        self.stages.iter().map(|s| s.bytes_sent).sum()
    }

    /// Report entry of a stage, if it was selected.
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// The failing stage and its error.
    pub fn failure(&self) -> Option<(Stage, &Error)> {
        self.stages.iter().find_map(|s| match &s.outcome {
            StageOutcome::Failed(e) => Some((s.stage, e)),
            _ => None,
        })
    }

    /// Consume the report, returning the failing stage and its error.
    pub fn into_failure(self) -> Option<(Stage, Error)> {
        self.stages
            .into_iter()
            .find_map(|s| match s.outcome {
                StageOutcome::Failed(e) => Some((s.stage, e)),
                _ => None,
            })
    }
}

/// One flashing run over an exclusively owned port.
pub struct Session<P: Port> {
    port: P,
    config: SessionConfig,
    cancel: Option<Arc<AtomicBool>>,
    fastboot: Box<dyn Fastboot>,
}

#[cfg(feature = "native")]
impl Session<NativePort> {
    /// Open the configured serial port and create a session on it.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let port = NativePort::open(&config.serial)?;
        Ok(Self::new(port, config))
    }
}

impl<P: Port> Session<P> {
    /// Create a session on an already open port.
    pub fn new(port: P, config: SessionConfig) -> Self {
        let fastboot: Box<dyn Fastboot> =
            Box::new(FastbootCommand::new(config.fastboot.clone()));
        Self {
            port,
            config,
            cancel: None,
            fastboot,
        }
    }

    /// Abort at the next stage, attempt or record boundary once `flag` is set.
    #[must_use]
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Flash the system image with `fastboot` instead of the host binary.
    #[must_use]
    pub fn with_fastboot(mut self, fastboot: impl Fastboot + 'static) -> Self {
        self.fastboot = Box::new(fastboot);
        self
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run every stage of `operation`.
    ///
    /// Returns `Err` only for problems found before talking to the device
    /// (missing images, invalid protocol settings). Stage failures are
    /// recorded in the returned [`Report`].
    pub fn run(mut self, operation: Operation, progress: &mut dyn ProgressSink) -> Result<Report> {
        let stages = operation.stages();
        self.config.protocol.validate()?;
        self.config.images.check(stages)?;

        info!(
            "Flashing {operation} ({} target) via {}",
            self.config.protocol.target,
            self.port.name()
        );

        let started = Instant::now();
        let mut reports: Vec<StageReport> = stages.iter().map(|&s| StageReport::pending(s)).collect();
        let mut halted = false;

        for index in 0..reports.len() {
            let stage = reports[index].stage;
            let blocked = stage.predecessor().is_some_and(|prev| {
                reports[..index]
                    .iter()
                    .any(|r| r.stage == prev && !r.outcome.is_success())
            });
            if halted || blocked {
                reports[index].outcome = StageOutcome::NotAttempted;
                continue;
            }

            let stage_started = Instant::now();
            let report = &mut reports[index];
            match self.run_stage(stage, report, progress) {
                Ok(()) => {
                    report.outcome = StageOutcome::Success;
                    info!("{stage}: done in {:.1}s", stage_started.elapsed().as_secs_f64());
                },
                Err(e) => {
                    warn!(
                        "{stage}: {e} ({} of {} bytes sent)",
                        report.bytes_sent, report.bytes_total
                    );
                    report.outcome = StageOutcome::Failed(e);
                    halted = true;
                },
            }
            report.duration = stage_started.elapsed();
        }

        self.release();

        Ok(Report {
            operation,
            stages: reports,
            elapsed: started.elapsed(),
        })
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn run_stage(
        &mut self,
        stage: Stage,
        report: &mut StageReport,
        progress: &mut dyn ProgressSink,
    ) -> Result<()> {
        if self.cancelled() {
            return Err(Error::Cancelled {
                stage,
                bytes_sent: 0,
            });
        }

        let protocol = &self.config.protocol;
        let profile = protocol.profile(stage);
        let path = self.config.images.get(stage);
        let image = if profile.transfer.is_serial() {
            let image = image::decode(path, stage.format(), protocol.chunk_size)?;
            report.bytes_total = image.payload_len();
            Some(image)
        } else {
            report.bytes_total = fs::metadata(path)?.len();
            None
        };

        let cancel = self.cancel.as_deref();
        let mut handshake = Handshake::new(&mut self.port, protocol).with_cancel(cancel);
        handshake.enter_stage(stage, &profile)?;
        handshake.run_steps(stage, &profile.steps)?;

        if let Some(image) = image {
            let mut engine = TransferEngine::new(&mut self.port, protocol)
                .with_cancel(cancel)
                .with_acknowledgment(profile.transfer == Transfer::Acknowledged);
            let sent = engine.send(stage, &image, progress);
            report.bytes_sent = engine.bytes_sent();
            sent?;
        } else {
            let address = match protocol.static_ip {
                Some(ip) => ip.to_string(),
                None => handshake.read_line(stage)?,
            };
            if address.is_empty() {
                return Err(Error::Fastboot {
                    stage,
                    reason: "board did not report its network address".into(),
                });
            }
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(Error::Cancelled {
                    stage,
                    bytes_sent: 0,
                });
            }

            let total = report.bytes_total;
            info!("{stage}: flashing {} over fastboot at {address}", path.display());
            progress.emit(ProgressEvent {
                stage,
                bytes_sent: 0,
                bytes_total: total,
            });
            self.fastboot.flash(&format!("udp:{address}"), path)?;
            report.bytes_sent = total;
            progress.emit(ProgressEvent {
                stage,
                bytes_sent: total,
                bytes_total: total,
            });
        }

        Handshake::new(&mut self.port, protocol).run_steps(stage, &profile.finish)
    }

    fn release(&mut self) {
        if let Err(e) = self.port.close() {
            warn!("Failed to close {}: {e}", self.port.name());
        }
    }
}

impl<P: Port> Drop for Session<P> {
    fn drop(&mut self) {
        self.release();
    }
}
