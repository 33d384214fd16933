//! Configuration file support for stmboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (STMBOOT_*)
//! 3. Local config file (./stmboot.toml)
//! 4. Global config file (~/.config/stmboot/config.toml)

use {
    crate::CliError,
    directories::ProjectDirs,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
    stmboot::{PinMap, ResetPolarity, gpio::pins::DEFAULT_PULSE},
};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "stmboot.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Load address of the image.
    pub base_address: Option<u32>,
    /// Mass erase ACK timeout.
    pub erase_timeout_secs: Option<u64>,
    /// Sync window used when the bootloader has to be re-synced.
    pub sync_window_secs: Option<u64>,
}

/// Control pin wiring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpioConfig {
    /// GPIO chip name or path.
    pub chip: Option<String>,
    /// Power-hold line offset.
    pub power_hold_line: Option<u32>,
    /// BOOT0 line offset.
    pub boot0_line: Option<u32>,
    /// NRST line offset.
    pub nrst_line: Option<u32>,
    /// Level that asserts reset.
    pub reset_polarity: Option<ResetPolarity>,
    /// Reset pulse width.
    pub pulse_ms: Option<u64>,
}

impl GpioConfig {
    /// Pin assignment with defaults for unset fields.
    pub fn pin_map(&self) -> PinMap {
        let defaults = PinMap::default();
        PinMap {
            chip: self.chip.clone().unwrap_or(defaults.chip),
            power_hold: self.power_hold_line.unwrap_or(defaults.power_hold),
            boot0: self.boot0_line.unwrap_or(defaults.boot0),
            nrst: self.nrst_line.unwrap_or(defaults.nrst),
            reset_polarity: self.reset_polarity.unwrap_or(defaults.reset_polarity),
        }
    }

    /// Reset pulse width.
    pub fn pulse(&self) -> Duration {
        self.pulse_ms.map_or(DEFAULT_PULSE, Duration::from_millis)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// GPIO configuration.
    #[serde(default)]
    pub gpio: GpioConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    ///
    /// Unreadable or malformed files are reported and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_lenient(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_lenient(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// An explicitly requested file must exist and parse.
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        let content = fs::read_to_string(path).map_err(|e| {
            CliError::Config(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content).map_err(|e| {
            CliError::Config(format!("Invalid TOML in config file {}: {e}", path.display()))
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn load_lenient(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Ignoring invalid TOML in {}: {}", path.display(), e);
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
        ProjectDirs::from("", "", "stmboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set fields in `other` win.
    fn merge(&mut self, other: Self) {
        let Self {
            connection,
            flash,
            gpio,
        } = other;

        if connection.serial.is_some() {
            self.connection.serial = connection.serial;
        }
        if connection.baud.is_some() {
            self.connection.baud = connection.baud;
        }

        if flash.base_address.is_some() {
            self.flash.base_address = flash.base_address;
        }
        if flash.erase_timeout_secs.is_some() {
            self.flash.erase_timeout_secs = flash.erase_timeout_secs;
        }
        if flash.sync_window_secs.is_some() {
            self.flash.sync_window_secs = flash.sync_window_secs;
        }

        if gpio.chip.is_some() {
            self.gpio.chip = gpio.chip;
        }
        if gpio.power_hold_line.is_some() {
            self.gpio.power_hold_line = gpio.power_hold_line;
        }
        if gpio.boot0_line.is_some() {
            self.gpio.boot0_line = gpio.boot0_line;
        }
        if gpio.nrst_line.is_some() {
            self.gpio.nrst_line = gpio.nrst_line;
        }
        if gpio.reset_polarity.is_some() {
            self.gpio.reset_polarity = gpio.reset_polarity;
        }
        if gpio.pulse_ms.is_some() {
            self.gpio.pulse_ms = gpio.pulse_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.flash.base_address.is_none());
        assert!(config.gpio.chip.is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
serial = "/dev/ttyAMA0"
baud = 57600

[flash]
base_address = 0x08004000
erase_timeout_secs = 30

[gpio]
chip = "gpiochip0"
boot0_line = 22
reset_polarity = "active-low"
pulse_ms = 50
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyAMA0"));
        assert_eq!(config.connection.baud, Some(57600));
        assert_eq!(config.flash.base_address, Some(0x0800_4000));
        assert_eq!(config.flash.erase_timeout_secs, Some(30));
        assert!(config.flash.sync_window_secs.is_none());

        let map = config.gpio.pin_map();
        assert_eq!(map.chip, "gpiochip0");
        assert_eq!((map.power_hold, map.boot0, map.nrst), (13, 22, 15));
        assert_eq!(map.reset_polarity, ResetPolarity::ActiveLow);
        assert_eq!(config.gpio.pulse(), Duration::from_millis(50));
    }

    #[test]
    fn test_gpio_defaults() {
        let gpio = GpioConfig::default();
        assert_eq!(gpio.pin_map(), PinMap::default());
        assert_eq!(gpio.pulse(), DEFAULT_PULSE);
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.serial.is_none());
        assert!(config.gpio.reset_polarity.is_none());
    }

    #[test]
    fn test_config_merge_overrides_set_fields() {
        let mut base = Config::default();
        base.connection.serial = Some("/dev/ttyUSB0".to_string());
        base.connection.baud = Some(115_200);
        base.gpio.chip = Some("gpiochip1".to_string());

        let mut other = Config::default();
        other.connection.baud = Some(57600);
        other.gpio.nrst_line = Some(4);

        base.merge(other);

        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.baud, Some(57600));
        assert_eq!(base.gpio.chip.as_deref(), Some("gpiochip1"));
        assert_eq!(base.gpio.nrst_line, Some(4));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.flash.erase_timeout_secs = Some(40);
        base.gpio.reset_polarity = Some(ResetPolarity::ActiveLow);

        base.merge(Config::default());

        assert_eq!(base.flash.erase_timeout_secs, Some(40));
        assert_eq!(base.gpio.reset_polarity, Some(ResetPolarity::ActiveLow));
    }

    #[test]
    fn test_load_from_path_valid() {
        let file = NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            "[connection]\nserial = \"/dev/ttyUSB1\"\n[flash]\nsync_window_secs = 2\n",
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.flash.sync_window_secs, Some(2));
    }

    #[test]
    fn test_load_from_path_invalid_is_config_error() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "invalid toml [[[").unwrap();

        let err = Config::load_from_path(file.path()).unwrap_err();
        assert!(matches!(err, CliError::Config(ref msg) if msg.contains("TOML")));
    }

    #[test]
    fn test_load_from_path_missing_is_config_error() {
        let err = Config::load_from_path(Path::new("/nonexistent/stmboot/config.toml")).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn test_load_lenient_skips_invalid_file() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "[gpio]\nchip = ").unwrap();
        assert!(Config::load_lenient(file.path()).is_none());
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("stmboot"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
