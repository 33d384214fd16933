//! Flash command implementation.

use {
    super::{connect, gpio::board_pins},
    crate::{Cli, CliError, config::Config, failure_error, use_fancy_output, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    log::{info, warn},
    std::{path::PathBuf, time::Duration},
    stmboot::{
        BoardPins, Event, FlashImage, SessionTimings,
        protocol::{ACK, SYNC},
        session::DEFAULT_PROBE_TIMEOUT,
    },
};

/// Resolved flash parameters.
#[derive(Debug, Clone)]
pub(crate) struct FlashOptions {
    pub(crate) firmware: PathBuf,
    pub(crate) base_address: u32,
    pub(crate) erase_timeout: Duration,
    pub(crate) sync_window: Option<Duration>,
    pub(crate) enter_bootloader: bool,
}

impl FlashOptions {
    fn timings(&self) -> SessionTimings {
        let timings = SessionTimings::default();
        match self.sync_window {
            Some(window) => timings.with_sync_window(window),
            None => timings,
        }
    }
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
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

/// Erase the target and write the image.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, options: &FlashOptions) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading {}",
            style("📦").cyan(),
            options.firmware.display()
        );
    }

    // Validate up front; the worker reads the file again when it runs
    let image = FlashImage::from_file(&options.firmware, options.base_address)
        .with_context(|| format!("Failed to load firmware {}", options.firmware.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} {} bytes @ 0x{:08X} ({} blocks)",
            style("ℹ").blue(),
            image.len(),
            image.base_address(),
            image.block_count()
        );
    }

    let pins = if options.enter_bootloader {
        let pins = board_pins(config)?;
        pins.enter_bootloader(config.gpio.pulse())
            .context("Failed to reset the target into the bootloader")?;
        Some(pins)
    } else {
        None
    };
    ensure_not_interrupted()?;

    let connection = connect(cli, config, options.timings())?;

    if !cli.quiet {
        eprintln!("{} Waiting for bootloader...", style("⏳").yellow());
    }
    connection
        .dispatcher
        .probe([SYNC], 1, DEFAULT_PROBE_TIMEOUT)?;
    match connection.next_event()? {
        Event::ProbeDone { ok: true, response } if response.first() == Some(&ACK) => {
            if !cli.quiet {
                eprintln!("{} Bootloader synced", style("✓").green());
            }
        },
        // Erase re-syncs on its own if the target is still silent
        other => warn!("No sync ACK ({other:?}); continuing"),
    }
    ensure_not_interrupted()?;

    connection.dispatcher.flash(
        options.firmware.clone(),
        options.base_address,
        options.erase_timeout,
    )?;

    let pb = progress_bar(cli);
    pb.set_message("Erasing");
    let outcome = loop {
        match connection.next_event()? {
            Event::Progress(p) => {
                pb.set_position(u64::from(p.percent));
                pb.set_message(format!("{}/{} bytes", p.written, p.total));
            },
            Event::FlashDone => break Ok(()),
            Event::FlashFailed(reason) => break Err(reason),
            other => warn!("Unexpected event {other:?}"),
        }
    };

    match outcome {
        Ok(()) => pb.finish_with_message("Complete"),
        Err(reason) => {
            pb.abandon();
            return Err(failure_error(reason));
        },
    }
    drop(connection);

    if let Some(pins) = pins {
        boot_application(cli, &pins, config)?;
    }

    info!("Flashed {}", options.firmware.display());
    if !cli.quiet {
        eprintln!("\n{} Flashing completed", style("🎉").green().bold());
    }
    Ok(())
}

fn boot_application(cli: &Cli, pins: &BoardPins, config: &Config) -> Result<()> {
    if !cli.quiet {
        eprintln!("{} Resetting into the application", style("🔄").cyan());
    }
    pins.boot_application(config.gpio.pulse())
        .context("Failed to reset the target into the application")
}
