//! Named board pins: power-hold, BOOT0 and NRST.

use {
    super::GpioRegistry,
    crate::error::{Error, Result},
    log::{debug, info},
    std::{
        fmt,
        sync::Arc,
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Default GPIO chip carrying the control lines.
pub const DEFAULT_CHIP: &str = "gpiochip1";

/// Default power-hold line.
pub const POWER_HOLD_LINE: u32 = 13;

/// Default BOOT0 line.
pub const BOOT0_LINE: u32 = 14;

/// Default NRST line.
pub const NRST_LINE: u32 = 15;

/// Default reset pulse width.
pub const DEFAULT_PULSE: Duration = Duration::from_millis(200);

/// Level the reset line is driven to while the target is held in reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ResetPolarity {
    /// Drive high to assert reset (board with an inverting driver on NRST).
    #[default]
    ActiveHigh,
    /// Drive low to assert reset (NRST wired straight to the GPIO).
    ActiveLow,
}

impl ResetPolarity {
    /// Line level that asserts reset.
    pub fn asserted(self) -> bool {
        matches!(self, Self::ActiveHigh)
    }
}

/// Where the control lines are wired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinMap {
    /// Chip carrying all three lines.
    pub chip: String,
    /// Power-hold line offset.
    pub power_hold: u32,
    /// BOOT0 line offset.
    pub boot0: u32,
    /// NRST line offset.
    pub nrst: u32,
    /// Reset polarity.
    pub reset_polarity: ResetPolarity,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            chip: DEFAULT_CHIP.to_string(),
            power_hold: POWER_HOLD_LINE,
            boot0: BOOT0_LINE,
            nrst: NRST_LINE,
            reset_polarity: ResetPolarity::default(),
        }
    }
}

impl PinMap {
    /// Use another chip.
    #[must_use]
    pub fn with_chip(mut self, chip: impl Into<String>) -> Self {
        self.chip = chip.into();
        self
    }

    /// Use another reset polarity.
    #[must_use]
    pub fn with_reset_polarity(mut self, polarity: ResetPolarity) -> Self {
        self.reset_polarity = polarity;
        self
    }

    /// Reject a map with no chip or with two roles on the same line.
    pub fn validate(&self) -> Result<()> {
        if self.chip.trim().is_empty() {
            return Err(Error::Config("GPIO chip name is empty".to_string()));
        }
        let roles = [
            ("power-hold", self.power_hold),
            ("BOOT0", self.boot0),
            ("NRST", self.nrst),
        ];
        for (i, (name, line)) in roles.iter().enumerate() {
            if let Some((other, _)) = roles[i + 1..].iter().find(|(_, l)| l == line) {
                return Err(Error::Config(format!(
                    "{name} and {other} share line {line} on {}",
                    self.chip
                )));
            }
        }
        Ok(())
    }
}

/// Result of reading one pin for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    /// Reads 1.
    High,
    /// Reads 0.
    Low,
    /// Read failed.
    Unknown,
}

impl From<Result<bool>> for PinLevel {
    fn from(value: Result<bool>) -> Self {
        match value {
            Ok(true) => Self::High,
            Ok(false) => Self::Low,
            Err(_) => Self::Unknown,
        }
    }
}

impl fmt::Display for PinLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "1"),
            Self::Low => write!(f, "0"),
            Self::Unknown => write!(f, "ERR"),
        }
    }
}

/// Levels of all control pins at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinSnapshot {
    /// Power-hold.
    pub power_hold: PinLevel,
    /// BOOT0.
    pub boot0: PinLevel,
    /// NRST.
    pub nrst: PinLevel,
}

impl fmt::Display for PinSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "POWER_HOLD={} BOOT0={} NRST={}",
            self.power_hold, self.boot0, self.nrst
        )
    }
}

/// Control-pin operations on top of a shared registry.
#[derive(Clone)]
pub struct BoardPins {
    registry: Arc<GpioRegistry>,
    map: PinMap,
}

impl BoardPins {
    /// Facade over `registry` using `map`.
    pub fn new(registry: Arc<GpioRegistry>, map: PinMap) -> Self {
        Self { registry, map }
    }

    /// Pin assignment in use.
    pub fn map(&self) -> &PinMap {
        &self.map
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<GpioRegistry> {
        &self.registry
    }

    /// Drive power-hold.
    pub fn power_hold_set(&self, on: bool) -> Result<()> {
        self.registry.set(&self.map.chip, self.map.power_hold, on)
    }

    /// Read power-hold.
    pub fn power_hold_get(&self) -> Result<bool> {
        self.registry.get(&self.map.chip, self.map.power_hold, false)
    }

    /// Drive BOOT0.
    pub fn boot0_set(&self, high: bool) -> Result<()> {
        self.registry.set(&self.map.chip, self.map.boot0, high)
    }

    /// Read BOOT0.
    pub fn boot0_get(&self) -> Result<bool> {
        self.registry.get(&self.map.chip, self.map.boot0, false)
    }

    /// Hold the target in reset for `width`, then let it run. Blocks.
    ///
    /// With the default [`ResetPolarity::ActiveHigh`] the line is driven 1,
    /// then 0, which matches boards with an inverting driver on NRST.
    pub fn nrst_pulse(&self, width: Duration) -> Result<()> {
        let asserted = self.map.reset_polarity.asserted();
        debug!("NRST pulse {}ms", width.as_millis());
        self.registry.set(&self.map.chip, self.map.nrst, asserted)?;
        thread::sleep(width);
        self.registry.set(&self.map.chip, self.map.nrst, !asserted)
    }

    /// Run [`BoardPins::nrst_pulse`] on a background thread.
    pub fn spawn_nrst_pulse(&self, width: Duration) -> JoinHandle<Result<()>> {
        let pins = self.clone();
        thread::spawn(move || pins.nrst_pulse(width))
    }

    /// Read every pin; failed reads show as [`PinLevel::Unknown`].
    pub fn snapshot(&self) -> PinSnapshot {
        PinSnapshot {
            power_hold: self.power_hold_get().into(),
            boot0: self.boot0_get().into(),
            nrst: self
                .registry
                .get(&self.map.chip, self.map.nrst, false)
                .into(),
        }
    }

    /// Read every pin as an input, so nothing is driven.
    ///
    /// For callers holding no leases yet, where [`BoardPins::snapshot`] would
    /// request the lines as low outputs.
    pub fn sample(&self) -> PinSnapshot {
        let read = |line| PinLevel::from(self.registry.get(&self.map.chip, line, true));
        PinSnapshot {
            power_hold: read(self.map.power_hold),
            boot0: read(self.map.boot0),
            nrst: read(self.map.nrst),
        }
    }

    /// BOOT0 high, then reset: the target restarts into the ROM bootloader.
    pub fn enter_bootloader(&self, width: Duration) -> Result<()> {
        info!("Resetting target into the ROM bootloader");
        self.boot0_set(true)?;
        self.nrst_pulse(width)
    }

    /// BOOT0 low, then reset: the target restarts from flash.
    pub fn boot_application(&self, width: Duration) -> Result<()> {
        info!("Resetting target into the application");
        self.boot0_set(false)?;
        self.nrst_pulse(width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryGpio;
    use std::time::Instant;

    fn pins(gpio: &MemoryGpio, map: PinMap) -> BoardPins {
        BoardPins::new(Arc::new(GpioRegistry::new(gpio.clone())), map)
    }

    #[test]
    fn test_default_map() {
        let map = PinMap::default();
        assert_eq!(map.chip, "gpiochip1");
        assert_eq!((map.power_hold, map.boot0, map.nrst), (13, 14, 15));
        assert_eq!(map.reset_polarity, ResetPolarity::ActiveHigh);
    }

    #[test]
    fn test_validate_pin_map() {
        assert!(PinMap::default().validate().is_ok());

        let shared = PinMap {
            boot0: POWER_HOLD_LINE,
            ..PinMap::default()
        };
        let err = shared.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("share line 13"));

        let unnamed = PinMap::default().with_chip(" ");
        assert!(matches!(unnamed.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_power_hold_and_boot0() {
        let gpio = MemoryGpio::new();
        let pins = pins(&gpio, PinMap::default());

        pins.power_hold_set(true).unwrap();
        pins.boot0_set(false).unwrap();
        assert!(pins.power_hold_get().unwrap());
        assert!(!pins.boot0_get().unwrap());
        assert_eq!(gpio.level("gpiochip1", 13), Some(true));
        assert_eq!(gpio.level("gpiochip1", 14), Some(false));
    }

    #[test]
    fn test_nrst_pulse_levels_and_duration() {
        let gpio = MemoryGpio::new();
        let pins = pins(&gpio, PinMap::default());

        let start = Instant::now();
        pins.nrst_pulse(Duration::from_millis(30)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        // Active-high: asserted at 1, released at 0
        assert_eq!(gpio.level("gpiochip1", 15), Some(false));
    }

    #[test]
    fn test_nrst_pulse_active_low_ends_high() {
        let gpio = MemoryGpio::new();
        let pins = pins(
            &gpio,
            PinMap::default().with_reset_polarity(ResetPolarity::ActiveLow),
        );

        let handle = pins.spawn_nrst_pulse(Duration::from_millis(40));
        thread::sleep(Duration::from_millis(15));
        assert_eq!(gpio.level("gpiochip1", 15), Some(false));
        handle.join().unwrap().unwrap();
        assert_eq!(gpio.level("gpiochip1", 15), Some(true));
    }

    #[test]
    fn test_snapshot_marks_failed_reads() {
        let gpio = MemoryGpio::new();
        gpio.fail_read("gpiochip1", 15);
        let pins = pins(&gpio, PinMap::default());
        pins.power_hold_set(true).unwrap();

        let snap = pins.snapshot();
        assert_eq!(snap.power_hold, PinLevel::High);
        assert_eq!(snap.boot0, PinLevel::Low);
        assert_eq!(snap.nrst, PinLevel::Unknown);
        assert_eq!(snap.to_string(), "POWER_HOLD=1 BOOT0=0 NRST=ERR");
    }

    #[test]
    fn test_snapshot_with_missing_chip() {
        let gpio = MemoryGpio::new();
        gpio.fail_chip("gpiochip7");
        let pins = pins(&gpio, PinMap::default().with_chip("gpiochip7"));

        let snap = pins.snapshot();
        assert_eq!(snap.power_hold, PinLevel::Unknown);
        assert_eq!(snap.boot0, PinLevel::Unknown);
        assert_eq!(snap.nrst, PinLevel::Unknown);
    }

    #[test]
    fn test_sample_reads_inputs_without_driving() {
        let gpio = MemoryGpio::new();
        gpio.drive_input("gpiochip1", 13, true);
        let pins = pins(&gpio, PinMap::default());

        let snap = pins.sample();
        assert_eq!(snap.to_string(), "POWER_HOLD=1 BOOT0=0 NRST=0");
        // Inputs never record a driven level
        assert_eq!(gpio.level("gpiochip1", 14), None);
        assert_eq!(
            pins.registry().direction("gpiochip1", 15),
            Some(crate::gpio::Direction::Input)
        );
    }

    #[test]
    fn test_enter_bootloader_sets_boot0_then_resets() {
        let gpio = MemoryGpio::new();
        let pins = pins(&gpio, PinMap::default());

        pins.enter_bootloader(Duration::from_millis(1)).unwrap();
        assert_eq!(gpio.level("gpiochip1", 14), Some(true));
        assert_eq!(gpio.level("gpiochip1", 15), Some(false));

        pins.boot_application(Duration::from_millis(1)).unwrap();
        assert_eq!(gpio.level("gpiochip1", 14), Some(false));
    }
}
