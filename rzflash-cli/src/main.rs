//! rzflash CLI - Command-line tool for flashing RZBoard V2L boards.
//!
//! ## Features
//!
//! - Flash the bootloader (Flash Writer, BL2, FIP) to eMMC or QSPI
//! - Flash the system image through U-Boot's fastboot
//! - Inspect S-record and raw images
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{ArgGroup, Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler; polled by the flashing engine.
static INTERRUPTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Shared interruption flag.
pub(crate) fn interrupt_flag() -> Arc<AtomicBool> {
    Arc::clone(INTERRUPTED.get_or_init(|| Arc::new(AtomicBool::new(false))))
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    interrupt_flag().load(Ordering::Relaxed)
}

/// Errors raised by the CLI itself rather than the flashing library.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid combination of arguments.
    #[error("{0}")]
    Usage(String),
    /// Bad input file or configuration.
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// rzflash - Flash bootloader and system images to RZBoard V2L over serial.
///
/// Environment variables:
///   RZFLASH_PORT  - Default serial port (default: /dev/ttyUSB0)
///   RZFLASH_BAUD  - Default baud rate (default: 115200)
///   RZFLASH_FASTBOOT - Host fastboot binary (default: fastboot)
#[derive(Parser)]
#[command(name = "rzflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    rzflash flash --bootloader\n  \
    rzflash flash --bootloader --qspi\n  \
    rzflash flash --full --image-path ./images\n  \
    rzflash -p /dev/ttyUSB1 flash --rootfs --image-rootfs core-image.wic\n  \
    rzflash flash --rootfs --static-ip 192.168.1.50\n  \
    rzflash info fip-rzboard.srec --json")]
pub(crate) struct Cli {
    /// Serial port connected to the board's debug UART.
    #[arg(short, long, global = true, env = "RZFLASH_PORT")]
    pub port: Option<String>,

    /// Baud rate of the serial console.
    #[arg(short, long, global = true, env = "RZFLASH_BAUD")]
    pub baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Flash the bootloader, the system image, or both.
    Flash(FlashArgs),

    /// Show information about an image file.
    Info {
        /// Path to an S-record (.srec/.mot) or raw (.wic) image.
        file: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Options of the `flash` command.
#[derive(Args, Debug, Default)]
#[command(group(ArgGroup::new("operation").multiple(false)))]
#[command(after_help = "Without an operation flag the operation follows the image overrides:\n  \
    --image-writer, --image-bl2 and --image-fip together flash the bootloader,\n  \
    --image-rootfs alone flashes the system image,\n  \
    all four overrides flash the full set (bootloader, then system image).")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct FlashArgs {
    /// Flash the Flash Writer, BL2 and FIP.
    #[arg(long, group = "operation")]
    pub bootloader: bool,

    /// Flash the system image.
    #[arg(long, group = "operation")]
    pub rootfs: bool,

    /// Flash the bootloader, then the system image.
    #[arg(long, group = "operation")]
    pub full: bool,

    /// Write BL2 and FIP to QSPI flash instead of eMMC.
    #[arg(long)]
    pub qspi: bool,

    /// Directory holding the images (default: the rzflash executable's directory).
    #[arg(long, value_name = "DIR")]
    pub image_path: Option<PathBuf>,

    /// Flash Writer image.
    #[arg(long, value_name = "FILE")]
    pub image_writer: Option<PathBuf>,

    /// BL2 image.
    #[arg(long, value_name = "FILE")]
    pub image_bl2: Option<PathBuf>,

    /// FIP image.
    #[arg(long, value_name = "FILE")]
    pub image_fip: Option<PathBuf>,

    /// System image.
    #[arg(long, value_name = "FILE")]
    pub image_rootfs: Option<PathBuf>,

    /// Board address for the fastboot transfer (default: DHCP).
    #[arg(long, value_name = "IP")]
    pub static_ip: Option<Ipv4Addr>,

    /// Host fastboot binary used to write the system image.
    #[arg(long, value_name = "PATH", env = "RZFLASH_FASTBOOT")]
    pub fastboot: Option<PathBuf>,
}

/// Map an error to the process exit status.
///
/// 1 unexpected, 2 usage, 3 configuration or input, 4 device or protocol,
/// 130 cancelled.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }

    if let Some(lib_err) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<rzflash::Error>())
    {
        return match lib_err.kind() {
            rzflash::ErrorKind::Configuration => {
                if matches!(lib_err, rzflash::Error::InvalidOperation(_)) {
                    2
                } else {
                    3
                }
            },
            rzflash::ErrorKind::Decode => 3,
            rzflash::ErrorKind::Device => 4,
            rzflash::ErrorKind::Cancelled => 130,
        };
    }

    1
}

/// Stage a library error in the chain is attributed to.
fn failed_stage(err: &anyhow::Error) -> Option<rzflash::Stage> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<rzflash::Error>())
        .and_then(rzflash::Error::stage)
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash(args) => commands::flash::cmd_flash(cli, &config, args),
        Commands::Info { file, json } => commands::info::cmd_info(file, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // Prints help/version to stdout (exit 0) or the usage error to stderr (exit 2).
        Err(e) => e.exit(),
    };

    init_logging(&cli);
    debug!(
        "rzflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let flag = interrupt_flag();
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            if let Some(stage) = failed_stage(&err) {
                eprintln!(
                    "{} Stopped at the {stage} stage; re-run with -v to see the board's output",
                    style("hint:").yellow()
                );
            }
            ExitCode::from(exit_code_for(&err))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash_bootloader() {
        let cli = Cli::try_parse_from(["rzflash", "flash", "--bootloader"]).unwrap();
        match cli.command {
            Commands::Flash(args) => {
                assert!(args.bootloader);
                assert!(!args.rootfs);
                assert!(!args.qspi);
                assert!(args.image_path.is_none());
            },
            _ => panic!("Expected Flash command"),
        }
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "rzflash",
            "-p",
            "/dev/ttyUSB3",
            "-b",
            "115200",
            "flash",
            "--full",
            "--qspi",
            "--image-path",
            "/opt/images",
            "--image-writer",
            "writer.mot",
            "--image-bl2",
            "bl2.srec",
            "--image-fip",
            "fip.srec",
            "--image-rootfs",
            "rootfs.wic",
        ])
        .unwrap();

        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB3"));
        assert_eq!(cli.baud, Some(115200));
        match cli.command {
            Commands::Flash(args) => {
                assert!(args.full);
                assert!(args.qspi);
                assert_eq!(args.image_path, Some(PathBuf::from("/opt/images")));
                assert_eq!(args.image_writer, Some(PathBuf::from("writer.mot")));
                assert_eq!(args.image_rootfs, Some(PathBuf::from("rootfs.wic")));
            },
            _ => panic!("Expected Flash command"),
        }
    }

    #[test]
    fn test_cli_operations_are_exclusive() {
        let result = Cli::try_parse_from(["rzflash", "flash", "--bootloader", "--rootfs"]);
        let err = result.err().unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_parse_info_json() {
        let cli = Cli::try_parse_from(["rzflash", "info", "bl2.srec", "--json"]).unwrap();
        match cli.command {
            Commands::Info { file, json } => {
                assert_eq!(file, PathBuf::from("bl2.srec"));
                assert!(json);
            },
            _ => panic!("Expected Info command"),
        }
    }

    #[test]
    fn test_cli_parse_list_ports() {
        let cli = Cli::try_parse_from(["rzflash", "list-ports"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: false }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["rzflash", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Zsh }
        ));
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["rzflash", "list-ports", "-vv", "--config", "x.toml"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config_path, Some(PathBuf::from("x.toml")));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["rzflash"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let usage = anyhow::Error::new(CliError::Usage("bad".into()));
        assert_eq!(exit_code_for(&usage), 2);

        let cancelled = anyhow::Error::new(CliError::Cancelled("stop".into()));
        assert_eq!(exit_code_for(&cancelled), 130);

        let missing = anyhow::Error::new(rzflash::Error::MissingImage {
            stage: rzflash::Stage::Fip,
            path: PathBuf::from("fip.srec"),
        })
        .context("Cannot flash");
        assert_eq!(exit_code_for(&missing), 3);

        let device = anyhow::Error::new(rzflash::Error::HandshakeTimeout {
            stage: rzflash::Stage::Bl2,
            attempts: 10,
        });
        assert_eq!(exit_code_for(&device), 4);

        let selection = anyhow::Error::new(rzflash::Error::InvalidOperation("none".into()));
        assert_eq!(exit_code_for(&selection), 2);

        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_failed_stage_found_through_context() {
        let err = anyhow::Error::new(rzflash::Error::HandshakeTimeout {
            stage: rzflash::Stage::Bl2,
            attempts: 10,
        })
        .context("Bl2 stage failed");
        assert_eq!(failed_stage(&err), Some(rzflash::Stage::Bl2));

        let config = anyhow::Error::new(rzflash::Error::Config("bad".into()));
        assert_eq!(failed_stage(&config), None);
        assert_eq!(failed_stage(&anyhow::anyhow!("boom")), None);
    }

    #[test]
    fn test_cli_parse_rootfs_network_options() {
        let cli = Cli::try_parse_from([
            "rzflash",
            "flash",
            "--rootfs",
            "--static-ip",
            "192.168.1.50",
            "--fastboot",
            "/opt/platform-tools/fastboot",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash(args) => {
                assert_eq!(args.static_ip, Some(Ipv4Addr::new(192, 168, 1, 50)));
                assert_eq!(
                    args.fastboot,
                    Some(PathBuf::from("/opt/platform-tools/fastboot"))
                );
            },
            _ => panic!("Expected Flash command"),
        }

        let bad = Cli::try_parse_from(["rzflash", "flash", "--rootfs", "--static-ip", "10.0.0"]);
        assert_eq!(bad.err().unwrap().kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_flash_help_explains_inferred_operation() {
        let mut cmd = Cli::command();
        let flash = cmd.find_subcommand_mut("flash").unwrap();
        let help = flash.render_help().to_string();
        assert!(help.contains("all four overrides flash the full set"), "{help}");
    }
}
