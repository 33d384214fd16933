//! GPIO command implementations.
//!
//! Leases are released before each command returns. Most drivers keep the
//! last driven level after release.

use {
    crate::{Cli, CliError, GpioAction, config::Config, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    log::warn,
    std::{thread, time::Duration},
    stmboot::{BoardPins, PinLevel, PinSnapshot},
};

/// Refresh period of `gpio status --watch`.
const WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Board pins over the platform GPIO backend.
#[cfg(target_os = "linux")]
pub(crate) fn board_pins(config: &Config) -> Result<BoardPins> {
    use {std::sync::Arc, stmboot::GpioRegistry};

    let map = config.gpio.pin_map();
    map.validate()?;
    Ok(BoardPins::new(Arc::new(GpioRegistry::cdev()), map))
}

/// Board pins over the platform GPIO backend.
#[cfg(not(target_os = "linux"))]
pub(crate) fn board_pins(_config: &Config) -> Result<BoardPins> {
    Err(CliError::Device("GPIO control is only supported on Linux".to_string()).into())
}

fn all_unknown(snap: &PinSnapshot) -> bool {
    [snap.power_hold, snap.boot0, snap.nrst]
        .iter()
        .all(|level| *level == PinLevel::Unknown)
}

fn on_off(level: bool) -> &'static str {
    if level { "on" } else { "off" }
}

/// Dispatch a `gpio` subcommand.
pub(crate) fn cmd_gpio(cli: &Cli, config: &Config, action: &GpioAction) -> Result<()> {
    let pins = board_pins(config)?;
    let chip = pins.map().chip.clone();

    let result = match action {
        GpioAction::Status { watch } => cmd_status(&pins, *watch),
        GpioAction::PowerHold { state } => match state {
            Some(state) => pins
                .power_hold_set(state.level())
                .with_context(|| format!("Failed to drive power-hold on {chip}"))
                .map(|()| report(cli, "POWER_HOLD", on_off(state.level()))),
            None => {
                println!("POWER_HOLD={}", pins.sample().power_hold);
                Ok(())
            },
        },
        GpioAction::Boot0 { state } => match state {
            Some(state) => pins
                .boot0_set(state.level())
                .with_context(|| format!("Failed to drive BOOT0 on {chip}"))
                .map(|()| report(cli, "BOOT0", on_off(state.level()))),
            None => {
                println!("BOOT0={}", pins.sample().boot0);
                Ok(())
            },
        },
        GpioAction::Reset { pulse_ms } => {
            let width = pulse_ms.map_or_else(|| config.gpio.pulse(), Duration::from_millis);
            pins.nrst_pulse(width)
                .with_context(|| format!("Failed to pulse NRST on {chip}"))
                .map(|()| report(cli, "NRST", &format!("pulsed {}ms", width.as_millis())))
        },
    };

    let released = pins.registry().release_all();
    if !released.is_clean() {
        warn!("{} GPIO release error(s)", released.errors.len());
    }
    result
}

fn report(cli: &Cli, pin: &str, what: &str) {
    if !cli.quiet {
        eprintln!("{} {pin} {what}", style("✓").green());
    }
}

fn cmd_status(pins: &BoardPins, watch: bool) -> Result<()> {
    let snap = pins.sample();
    if !watch {
        println!("{snap}");
        if all_unknown(&snap) {
            return Err(CliError::Device(format!(
                "Cannot read any control line on {}",
                pins.map().chip
            ))
            .into());
        }
        return Ok(());
    }

    println!("{snap}");
    while !was_interrupted() {
        thread::sleep(WATCH_INTERVAL);
        // Input leases are reused between polls
        println!("{}", pins.sample());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_unknown() {
        let snap = PinSnapshot {
            power_hold: PinLevel::Unknown,
            boot0: PinLevel::Unknown,
            nrst: PinLevel::Unknown,
        };
        assert!(all_unknown(&snap));

        let snap = PinSnapshot {
            boot0: PinLevel::Low,
            ..snap
        };
        assert!(!all_unknown(&snap));
    }

    #[test]
    fn test_on_off() {
        assert_eq!(on_off(true), "on");
        assert_eq!(on_off(false), "off");
    }
}
