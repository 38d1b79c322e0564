//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use rzflash::port::DEFAULT_BAUD;
use rzflash::{
    ChannelSink, ImagePaths, Operation, ProgressEvent, ProtocolConfig, Report, SerialConfig,
    Session, SessionConfig, Stage, StageOutcome, Target,
};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::thread;

use crate::config::Config;
use crate::{Cli, CliError, FlashArgs, interrupt_flag, use_fancy_output, was_interrupted};

/// Serial port used when neither the command line nor a config file names one.
const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Progress events buffered between the engine and the UI thread.
const PROGRESS_QUEUE: usize = 256;

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".into()).into())
    } else {
        Ok(())
    }
}

/// Pick the operation from the selection flags, or infer it from which
/// image overrides were given.
fn resolve_operation(args: &FlashArgs) -> Result<Operation> {
    if args.bootloader || args.rootfs || args.full {
        return Ok(Operation::from_flags(
            args.bootloader,
            args.rootfs,
            args.full,
        )?);
    }

    let loader_given = [&args.image_writer, &args.image_bl2, &args.image_fip]
        .iter()
        .filter(|p| p.is_some())
        .count();
    if loader_given != 0 && loader_given != 3 {
        return Err(CliError::Usage(
            "--image-writer, --image-bl2 and --image-fip must be given together \
             unless --bootloader or --full is set"
                .into(),
        )
        .into());
    }

    let bootloader = loader_given == 3;
    let rootfs = args.image_rootfs.is_some();
    let operation = match (bootloader, rootfs) {
        (true, true) => Operation::Full,
        (true, false) => Operation::Bootloader,
        (false, true) => Operation::Rootfs,
        (false, false) => Operation::from_flags(false, false, false)?,
    };
    debug!("Inferred operation '{operation}' from image options");
    Ok(operation)
}

fn default_image_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Image directory first, then per-file overrides.
fn resolve_images(args: &FlashArgs, config: &Config) -> ImagePaths {
    let dir = args
        .image_path
        .clone()
        .or_else(|| config.flash.image_path.clone())
        .unwrap_or_else(default_image_dir);
    debug!("Image directory: {}", dir.display());

    let mut images = ImagePaths::in_dir(&dir);
    let overrides = [
        (Stage::WriterBootstrap, &args.image_writer),
        (Stage::Bl2, &args.image_bl2),
        (Stage::Fip, &args.image_fip),
        (Stage::Rootfs, &args.image_rootfs),
    ];
    for (stage, path) in overrides {
        if let Some(path) = path {
            images.set(stage, path.clone());
        }
    }
    images
}

fn resolve_target(args: &FlashArgs, config: &Config) -> Result<Target> {
    if args.qspi {
        return Ok(Target::Qspi);
    }
    Ok(config.target()?.unwrap_or_default())
}

fn resolve_serial(cli: &Cli, config: &Config) -> SerialConfig {
    let port = cli
        .port
        .clone()
        .or_else(|| config.connection.port.clone())
        .unwrap_or_else(|| DEFAULT_PORT.to_string());
    let baud = cli.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD);
    SerialConfig::new(port, baud)
}

/// Build the session settings without touching the device.
fn build_session_config(
    cli: &Cli,
    config: &Config,
    args: &FlashArgs,
    operation: Operation,
) -> Result<SessionConfig> {
    let images = resolve_images(args, config);
    let target = resolve_target(args, config)?;
    let mut base = ProtocolConfig::default().with_target(target);
    if let Some(ip) = args.static_ip.or(config.flash.static_ip) {
        base = base.with_static_ip(ip);
    }
    let protocol = config
        .apply_protocol(base)
        .context("Invalid protocol configuration")?;

    // Missing images fail here, before the port is opened.
    images.check(operation.stages())?;

    let mut session_config = SessionConfig::new(images);
    session_config.serial = resolve_serial(cli, config);
    session_config.protocol = protocol;
    if let Some(fastboot) = args.fastboot.clone().or_else(|| config.flash.fastboot.clone()) {
        session_config.fastboot = fastboot;
    }
    Ok(session_config)
}

fn new_progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Drain progress events into one bar per stage until the engine hangs up.
fn drive_progress(events: &Receiver<ProgressEvent>, quiet: bool) {
    let mut current: Option<(Stage, ProgressBar)> = None;

    for event in events {
        if current.as_ref().is_none_or(|(stage, _)| *stage != event.stage) {
            if let Some((_, pb)) = current.take() {
                pb.abandon();
            }
            let pb = new_progress_bar(quiet);
            pb.set_message(format!("Flashing {}", event.stage));
            current = Some((event.stage, pb));
        }
        if let Some((_, pb)) = &current {
            pb.set_position(event.percent());
            if event.bytes_sent == event.bytes_total {
                pb.finish_with_message(format!("{} complete", event.stage));
            }
        }
    }

    if let Some((_, pb)) = current {
        if !pb.is_finished() {
            pb.abandon();
        }
    }
}

fn print_report(report: &Report) {
    eprintln!("\n{}", style("Summary").bold().underlined());
    for stage in &report.stages {
        let mark = match stage.outcome {
            StageOutcome::Success => style("✓").green(),
            StageOutcome::Failed(_) => style("✗").red(),
            StageOutcome::Pending | StageOutcome::NotAttempted => style("-").dim(),
        };
        eprintln!(
            "  {mark} {:<13} {} ({}/{} bytes, {:.1}s)",
            stage.stage.to_string(),
            stage.outcome,
            stage.bytes_sent,
            stage.bytes_total,
            stage.duration.as_secs_f64()
        );
    }
    eprintln!(
        "  {} bytes in {:.1}s",
        report.bytes_sent(),
        report.elapsed.as_secs_f64()
    );
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, args: &FlashArgs) -> Result<()> {
    let operation = resolve_operation(args)?;
    let session_config = build_session_config(cli, config, args, operation)?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!(
            "{} Flashing {} to {}",
            style("📦").cyan(),
            style(operation).bold(),
            session_config.protocol.target
        );
        for &stage in operation.stages() {
            eprintln!(
                "    {} {:<13} {}",
                style("•").dim(),
                stage.to_string(),
                session_config.images.get(stage).display()
            );
        }
        eprintln!(
            "{} Using {} @ {} baud",
            style("🔌").cyan(),
            session_config.serial.port_name,
            session_config.serial.baud_rate
        );
        if operation.stages().contains(&Stage::WriterBootstrap) {
            eprintln!(
                "{} Set the board to SCIF download mode and power it on",
                style("⏳").yellow()
            );
        } else if operation.stages().contains(&Stage::Rootfs) {
            eprintln!(
                "{} Power on the board with the boot strap set to eMMC, not SCIF download",
                style("⏳").yellow()
            );
        }
    }

    let port_name = session_config.serial.port_name.clone();
    let session = Session::open(session_config)
        .with_context(|| format!("Cannot open serial port {port_name}"))?
        .with_cancel(interrupt_flag());

    let (mut sink, events) = ChannelSink::bounded(PROGRESS_QUEUE);
    let quiet = cli.quiet;
    let ui = thread::spawn(move || drive_progress(&events, quiet));

    let result = session.run(operation, &mut sink);
    drop(sink);
    if ui.join().is_err() {
        warn!("Progress display thread panicked");
    }

    let report = result?;
    if !cli.quiet {
        print_report(&report);
    }

    if let Some((stage, err)) = report.into_failure() {
        return Err(anyhow::Error::new(err).context(format!("{stage} stage failed")));
    }

    if !cli.quiet {
        eprintln!("\n{} Flashing completed", style("🎉").green().bold());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs;
    use tempfile::TempDir;

    fn args(extra: &[&str]) -> (Cli, FlashArgs) {
        let mut argv = vec!["rzflash", "flash"];
        argv.extend_from_slice(extra);
        let mut cli = Cli::try_parse_from(argv).unwrap();
        let flash = match std::mem::replace(
            &mut cli.command,
            crate::Commands::ListPorts { json: false },
        ) {
            crate::Commands::Flash(flash) => flash,
            _ => panic!("Expected Flash command"),
        };
        (cli, flash)
    }

    fn is_usage(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_)))
            || matches!(
                err.downcast_ref::<rzflash::Error>(),
                Some(rzflash::Error::InvalidOperation(_))
            )
    }

    #[test]
    fn test_explicit_operation_flags() {
        assert_eq!(
            resolve_operation(&args(&["--bootloader"]).1).unwrap(),
            Operation::Bootloader
        );
        assert_eq!(
            resolve_operation(&args(&["--rootfs"]).1).unwrap(),
            Operation::Rootfs
        );
        assert_eq!(
            resolve_operation(&args(&["--full"]).1).unwrap(),
            Operation::Full
        );
    }

    #[test]
    fn test_explicit_flag_wins_over_overrides() {
        let (_, a) = args(&["--rootfs", "--image-bl2", "bl2.srec"]);
        assert_eq!(resolve_operation(&a).unwrap(), Operation::Rootfs);
    }

    #[test]
    fn test_operation_inferred_from_overrides() {
        let (_, a) = args(&["--image-rootfs", "x.wic"]);
        assert_eq!(resolve_operation(&a).unwrap(), Operation::Rootfs);

        let loader = [
            "--image-writer",
            "w.mot",
            "--image-bl2",
            "b.srec",
            "--image-fip",
            "f.srec",
        ];
        let (_, a) = args(&loader);
        assert_eq!(resolve_operation(&a).unwrap(), Operation::Bootloader);

        let mut both = loader.to_vec();
        both.extend(["--image-rootfs", "x.wic"]);
        let (_, a) = args(&both);
        assert_eq!(resolve_operation(&a).unwrap(), Operation::Full);
    }

    #[test]
    fn test_partial_bootloader_overrides_rejected() {
        let (_, a) = args(&["--image-bl2", "b.srec", "--image-fip", "f.srec"]);
        assert!(is_usage(&resolve_operation(&a).unwrap_err()));
    }

    #[test]
    fn test_no_operation_rejected() {
        let (_, a) = args(&[]);
        assert!(is_usage(&resolve_operation(&a).unwrap_err()));
    }

    #[test]
    fn test_resolve_images_dir_and_overrides() {
        let (_, a) = args(&[
            "--rootfs",
            "--image-path",
            "/opt/images",
            "--image-rootfs",
            "/tmp/custom.wic",
        ]);
        let images = resolve_images(&a, &Config::default());

        assert_eq!(
            images.writer,
            Path::new("/opt/images/Flash_Writer_SCIF_rzboard.mot")
        );
        assert_eq!(images.fip, Path::new("/opt/images/fip-rzboard.srec"));
        assert_eq!(images.rootfs, Path::new("/tmp/custom.wic"));
    }

    #[test]
    fn test_resolve_images_from_config() {
        let (_, a) = args(&["--bootloader"]);
        let mut config = Config::default();
        config.flash.image_path = Some(PathBuf::from("/srv/rzboard"));

        let images = resolve_images(&a, &config);
        assert_eq!(images.bl2, Path::new("/srv/rzboard/bl2_bp-rzboard.srec"));

        let (_, a) = args(&["--bootloader", "--image-path", "/cli"]);
        let images = resolve_images(&a, &config);
        assert_eq!(images.bl2, Path::new("/cli/bl2_bp-rzboard.srec"));
    }

    #[test]
    fn test_resolve_target() {
        let mut config = Config::default();
        config.flash.target = Some("qspi".into());
        assert_eq!(
            resolve_target(&args(&["--full"]).1, &config).unwrap(),
            Target::Qspi
        );
        assert_eq!(
            resolve_target(&args(&["--full"]).1, &Config::default()).unwrap(),
            Target::Emmc
        );

        config.flash.target = Some("emmc".into());
        assert_eq!(
            resolve_target(&args(&["--full", "--qspi"]).1, &config).unwrap(),
            Target::Qspi
        );
    }

    #[test]
    fn test_resolve_serial_precedence() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyACM0".into());
        config.connection.baud = Some(57600);

        let (cli, _) = args(&["--rootfs"]);
        let serial = resolve_serial(&cli, &Config::default());
        assert_eq!(serial.port_name, DEFAULT_PORT);
        assert_eq!(serial.baud_rate, DEFAULT_BAUD);

        let serial = resolve_serial(&cli, &config);
        assert_eq!(serial.port_name, "/dev/ttyACM0");
        assert_eq!(serial.baud_rate, 57600);

        let (cli, _) = args(&["--rootfs", "-p", "/dev/ttyUSB7", "-b", "9600"]);
        let serial = resolve_serial(&cli, &config);
        assert_eq!(serial.port_name, "/dev/ttyUSB7");
        assert_eq!(serial.baud_rate, 9600);
    }

    #[test]
    fn test_missing_image_fails_before_port() {
        let dir = TempDir::new().unwrap();
        let dir_arg = dir.path().to_string_lossy().to_string();
        let (cli, a) = args(&["--rootfs", "--image-path", &dir_arg, "-p", "/dev/does-not-exist"]);

        let err = build_session_config(&cli, &Config::default(), &a, Operation::Rootfs).unwrap_err();
        let lib = err.downcast_ref::<rzflash::Error>().unwrap();
        assert!(matches!(
            lib,
            rzflash::Error::MissingImage {
                stage: Stage::Rootfs,
                ..
            }
        ));
    }

    #[test]
    fn test_build_session_config() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(Stage::Rootfs.default_file_name()), [0u8; 16]).unwrap();
        let dir_arg = dir.path().to_string_lossy().to_string();
        let (cli, a) = args(&["--rootfs", "--qspi", "--image-path", &dir_arg]);

        let mut config = Config::default();
        config.protocol.chunk_size = Some(4096);

        let session = build_session_config(&cli, &config, &a, Operation::Rootfs).unwrap();
        assert_eq!(session.protocol.target, Target::Qspi);
        assert_eq!(session.protocol.chunk_size, 4096);
        assert_eq!(session.images.rootfs, dir.path().join("avnet-core-image-rzboard.wic"));
    }

    #[test]
    fn test_rootfs_network_settings_precedence() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(Stage::Rootfs.default_file_name()), [0u8; 16]).unwrap();
        let dir_arg = dir.path().to_string_lossy().to_string();

        let (cli, a) = args(&["--rootfs", "--image-path", &dir_arg]);
        let session = build_session_config(&cli, &Config::default(), &a, Operation::Rootfs).unwrap();
        assert_eq!(session.protocol.static_ip, None);
        assert_eq!(session.fastboot, Path::new("fastboot"));

        let mut config = Config::default();
        config.flash.static_ip = Some("10.0.0.9".parse().unwrap());
        config.flash.fastboot = Some(PathBuf::from("/usr/lib/android-sdk/fastboot"));
        let session = build_session_config(&cli, &config, &a, Operation::Rootfs).unwrap();
        assert_eq!(session.protocol.static_ip, Some("10.0.0.9".parse().unwrap()));
        assert_eq!(session.fastboot, Path::new("/usr/lib/android-sdk/fastboot"));

        let (cli, a) = args(&[
            "--rootfs",
            "--image-path",
            &dir_arg,
            "--static-ip",
            "192.168.1.50",
            "--fastboot",
            "/opt/fastboot",
        ]);
        let session = build_session_config(&cli, &config, &a, Operation::Rootfs).unwrap();
        assert_eq!(session.protocol.static_ip, Some("192.168.1.50".parse().unwrap()));
        assert_eq!(session.fastboot, Path::new("/opt/fastboot"));
    }

    #[test]
    fn test_drive_progress_ends_when_sender_dropped() {
        let (mut sink, events) = ChannelSink::bounded(8);
        for sent in [0, 50, 100] {
            rzflash::ProgressSink::emit(
                &mut sink,
                ProgressEvent {
                    stage: Stage::Rootfs,
                    bytes_sent: sent,
                    bytes_total: 100,
                },
            );
        }
        drop(sink);
        drive_progress(&events, true);
    }
}
