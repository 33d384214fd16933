//! stmboot CLI - Command-line tool for flashing STM32 targets through the
//! UART ROM bootloader.
//!
//! ## Features
//!
//! - Probe the bootloader with a raw command
//! - Mass erase and program a binary image
//! - Drive the board's power-hold, BOOT0 and NRST lines
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand, ValueEnum},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    },
    stmboot::{DEFAULT_BASE_ADDRESS, FailureReason, port::BOOTLOADER_BAUD},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C has been pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

mod commands;
mod config;
mod serial;

use {
    commands::{completions, flash, gpio, probe},
    config::Config,
    serial::{SerialOptions, select_serial_port},
};

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or missing input (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Configuration file problem (exit 3).
    #[error("{0}")]
    Config(String),
    /// Serial device or GPIO chip unavailable (exit 4).
    #[error("{0}")]
    Device(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// stmboot - Flash STM32 targets through the UART ROM bootloader.
///
/// Environment variables:
///   STMBOOT_PORT              - Default serial port
///   STMBOOT_BAUD              - Baud rate (default: 115200)
///   STMBOOT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "stmboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(
    after_help = "Examples:\n  stmboot probe\n  stmboot flash firmware.bin --enter-bootloader\n  stmboot gpio status --watch"
)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "STMBOOT_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, global = true, env = "STMBOOT_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "STMBOOT_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Effective baud rate: CLI/env, then config, then the bootloader default.
    pub(crate) fn baud(&self, config: &Config) -> u32 {
        self.baud
            .or(config.connection.baud)
            .unwrap_or(BOOTLOADER_BAUD)
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Send a raw command and show the bootloader's reply.
    Probe {
        /// Command bytes in hex (e.g. 7F, 0x00FF).
        #[arg(long, value_parser = parse_hex_bytes, default_value = "7F")]
        command: ::std::vec::Vec<u8>,

        /// Number of reply bytes expected.
        #[arg(long, default_value_t = 1)]
        expected_len: usize,

        /// Per-attempt timeout in seconds.
        #[arg(long, value_parser = parse_secs, default_value = "1.5")]
        timeout: Duration,
    },

    /// Mass erase the target and program a binary image.
    Flash {
        /// Raw binary image.
        firmware: PathBuf,

        /// Load address (hex) [default: 0x08000000].
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Mass erase ACK timeout in seconds [default: 20].
        #[arg(long, value_parser = parse_secs)]
        erase_timeout: Option<Duration>,

        /// Re-sync window in seconds [default: 5].
        #[arg(long, value_parser = parse_secs)]
        sync_window: Option<Duration>,

        /// Drive BOOT0 high and pulse NRST before flashing.
        #[arg(long)]
        enter_bootloader: bool,
    },

    /// Control the board's power-hold, BOOT0 and NRST lines.
    Gpio {
        #[command(subcommand)]
        action: GpioAction,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// GPIO subcommands.
#[derive(Subcommand)]
pub(crate) enum GpioAction {
    /// Show the level of every control line.
    Status {
        /// Refresh every 500 ms until interrupted.
        #[arg(long)]
        watch: bool,
    },
    /// Read or drive the power-hold line.
    PowerHold {
        /// New level; omit to read.
        #[arg(value_enum)]
        state: Option<Switch>,
    },
    /// Read or drive BOOT0.
    Boot0 {
        /// New level; omit to read.
        #[arg(value_enum)]
        state: Option<Switch>,
    },
    /// Pulse NRST.
    Reset {
        /// Pulse width in milliseconds [default: 200].
        #[arg(long)]
        pulse_ms: Option<u64>,
    },
}

/// Requested line level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Switch {
    /// Drive high.
    On,
    /// Drive low.
    Off,
}

impl Switch {
    pub(crate) fn level(self) -> bool {
        matches!(self, Self::On)
    }
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x08_00_00_00
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

/// Parse a hex byte string such as `7F`, `0x00FF` or `31 CE`.
fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let digits: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect();
    if digits.is_empty() {
        return Err("Empty command".to_string());
    }
    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(format!("Invalid hex digit '{bad}' in '{digits}'"));
    }
    if digits.len() % 2 != 0 {
        return Err(format!("Odd number of hex digits in '{digits}'"));
    }
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            u8::from_str_radix(pair, 16).map_err(|e| format!("Invalid hex byte '{pair}': {e}"))
        })
        .collect()
}

/// Parse a duration in (possibly fractional) seconds.
fn parse_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|e| format!("Invalid number of seconds: {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("Invalid duration: {e}"))
}

/// Exit code for an error, per the CLI contract.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
                CliError::Config(_) => 3,
                CliError::Device(_) => 4,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(lib_err) = cause.downcast_ref::<stmboot::Error>() {
            return match lib_err {
                stmboot::Error::Config(_) => 3,
                stmboot::Error::LinkOpen(_)
                | stmboot::Error::Resource { .. }
                | stmboot::Error::Serial(_) => 4,
                stmboot::Error::Cancelled => 130,
                _ => 1,
            };
        }
    }
    1
}

/// Map a failed flash onto the CLI error classes.
pub(crate) fn failure_error(reason: FailureReason) -> anyhow::Error {
    match reason {
        FailureReason::Cancelled => CliError::Cancelled("Flash cancelled".to_string()).into(),
        FailureReason::LinkUnavailable => {
            CliError::Device("Serial link unavailable".to_string()).into()
        },
        other => anyhow::anyhow!("Flash failed: {other}"),
    }
}

/// Resolve the serial port from CLI args, config, detection or a prompt.
pub(crate) fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    select_serial_port(&options, config)
}

fn main() {
    // --- NO_COLOR and TTY detection (clig.dev best practice) ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code(&err)
        },
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    // Setup logging based on verbosity
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

    debug!(
        "stmboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Ctrl-C handler not installed: {e}");
    }

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)?
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Probe {
            command,
            expected_len,
            timeout,
        } => probe::cmd_probe(cli, &config, command, *expected_len, *timeout),
        Commands::Flash {
            firmware,
            address,
            erase_timeout,
            sync_window,
            enter_bootloader,
        } => {
            let options = flash::FlashOptions {
                firmware: firmware.clone(),
                base_address: address
                    .or(config.flash.base_address)
                    .unwrap_or(DEFAULT_BASE_ADDRESS),
                erase_timeout: erase_timeout
                    .or(config.flash.erase_timeout_secs.map(Duration::from_secs))
                    .unwrap_or(stmboot::session::DEFAULT_ERASE_TIMEOUT),
                sync_window: sync_window
                    .or(config.flash.sync_window_secs.map(Duration::from_secs)),
                enter_bootloader: *enter_bootloader,
            };
            flash::cmd_flash(cli, &config, &options)
        },
        Commands::Gpio { action } => gpio::cmd_gpio(cli, &config, action),
        Commands::ListPorts { json } => {
            cmd_list_ports(*json);
            Ok(())
        },
        Commands::Completions { shell } => {
            completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) {
    let detected = stmboot::detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    if let Some(best) = stmboot::select_port(&detected) {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&best.name).cyan().bold()
        );
    }
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    // ---- parse_hex_u32 ----

    #[test]
    fn test_parse_hex_u32_with_prefix() {
        assert_eq!(parse_hex_u32("0x08000000").unwrap(), 0x0800_0000);
        assert_eq!(parse_hex_u32("0X08004000").unwrap(), 0x0800_4000);
    }

    #[test]
    fn test_parse_hex_u32_with_underscores_and_whitespace() {
        assert_eq!(parse_hex_u32("0x0800_0000").unwrap(), 0x0800_0000);
        assert_eq!(parse_hex_u32("  ff  ").unwrap(), 0xFF);
    }

    #[test]
    fn test_parse_hex_u32_invalid() {
        assert!(parse_hex_u32("not_hex").is_err());
        assert!(parse_hex_u32("0x1FFFFFFFF").is_err());
    }

    // ---- parse_hex_bytes ----

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("7F").unwrap(), vec![0x7F]);
        assert_eq!(parse_hex_bytes("0x00FF").unwrap(), vec![0x00, 0xFF]);
        assert_eq!(parse_hex_bytes("31 ce").unwrap(), vec![0x31, 0xCE]);
    }

    #[test]
    fn test_parse_hex_bytes_invalid() {
        assert!(parse_hex_bytes("").is_err());
        assert!(parse_hex_bytes("7").is_err());
        assert!(parse_hex_bytes("ZZ").is_err());
        // Multi-byte characters must not split inside a code point
        assert!(parse_hex_bytes("a\u{e9}1").is_err());
        assert!(parse_hex_bytes("\u{e9}").is_err());
    }

    // ---- parse_secs ----

    #[test]
    fn test_parse_secs() {
        assert_eq!(parse_secs("1.5").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_secs("20").unwrap(), Duration::from_secs(20));
        assert!(parse_secs("-1").is_err());
        assert!(parse_secs("soon").is_err());
    }

    // ---- exit codes ----

    #[test]
    fn test_exit_code_classes() {
        assert_eq!(exit_code(&CliError::Usage("x".into()).into()), 2);
        assert_eq!(exit_code(&CliError::Config("x".into()).into()), 3);
        assert_eq!(exit_code(&CliError::Device("x".into()).into()), 4);
        assert_eq!(exit_code(&CliError::Cancelled("x".into()).into()), 130);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_exit_code_library_errors() {
        assert_eq!(exit_code(&stmboot::Error::LinkOpen("x".into()).into()), 4);
        assert_eq!(
            exit_code(&stmboot::Error::resource("gpiochip1", Some(14), "busy").into()),
            4
        );
        assert_eq!(exit_code(&stmboot::Error::Config("x".into()).into()), 3);
        assert_eq!(exit_code(&stmboot::Error::Cancelled.into()), 130);
        assert_eq!(exit_code(&stmboot::Error::EraseRejected.into()), 1);
    }

    #[test]
    fn test_exit_code_through_context() {
        let err = anyhow::Error::from(CliError::Device("gone".into())).context("flashing");
        assert_eq!(exit_code(&err), 4);
    }

    #[test]
    fn test_failure_error_mapping() {
        assert_eq!(exit_code(&failure_error(FailureReason::Cancelled)), 130);
        assert_eq!(exit_code(&failure_error(FailureReason::LinkUnavailable)), 4);
        let err = failure_error(FailureReason::BlockWriteRejected(0x0800_0100));
        assert_eq!(exit_code(&err), 1);
        assert!(err.to_string().contains("0x08000100"));
    }

    #[test]
    fn test_baud_resolution() {
        let mut config = Config::default();
        let cli = Cli::parse_from(["stmboot", "list-ports"]);
        assert_eq!(cli.baud(&config), 115_200);

        config.connection.baud = Some(57600);
        assert_eq!(cli.baud(&config), 57600);

        let cli = Cli::parse_from(["stmboot", "-b", "9600", "list-ports"]);
        assert_eq!(cli.baud(&config), 9600);
    }

    #[test]
    fn test_probe_defaults() {
        let cli = Cli::parse_from(["stmboot", "probe"]);
        match cli.command {
            Commands::Probe {
                command,
                expected_len,
                timeout,
            } => {
                assert_eq!(command, vec![0x7F]);
                assert_eq!(expected_len, 1);
                assert_eq!(timeout, Duration::from_millis(1500));
            },
            _ => panic!("expected probe"),
        }
    }

    #[test]
    fn test_gpio_subcommands_parse() {
        let cli = Cli::parse_from(["stmboot", "gpio", "boot0", "on"]);
        assert!(matches!(
            cli.command,
            Commands::Gpio {
                action: GpioAction::Boot0 {
                    state: Some(Switch::On)
                }
            }
        ));

        let cli = Cli::parse_from(["stmboot", "gpio", "reset", "--pulse-ms", "50"]);
        assert!(matches!(
            cli.command,
            Commands::Gpio {
                action: GpioAction::Reset { pulse_ms: Some(50) }
            }
        ));
    }
}
