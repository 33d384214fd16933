//! Serial port selection.
//!
//! Resolution order:
//! - an explicit `--port` (or `STMBOOT_PORT`)
//! - the port named in the configuration file
//! - a single recognised USB bridge, chosen automatically
//! - an interactive prompt when several candidates remain
//!
//! Non-interactive mode never prompts.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
    stmboot::{DetectedPort, detect_ports, format_port_list, select_port},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if ambiguous).
    pub non_interactive: bool,
}

/// Resolve the serial port to use.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port_name) = &options.port {
        return Ok(port_name.clone());
    }

    if let Some(port_name) = &config.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(port_name.clone());
    }

    choose_port(detect_ports(), options.non_interactive)
}

/// Pick among detected ports.
fn choose_port(ports: Vec<DetectedPort>, non_interactive: bool) -> Result<String> {
    if ports.is_empty() {
        return Err(CliError::Device("No serial ports found".to_string()).into());
    }

    let known: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| p.device.is_known())
        .cloned()
        .collect();
    let candidates = if known.is_empty() { ports } else { known };

    match candidates.len().cmp(&1) {
        Ordering::Equal => {
            let port = &candidates[0];
            if port.device.is_known() {
                info!("Auto-selected port: {} [{}]", port.name, port.device.name());
                Ok(port.name.clone())
            } else if non_interactive {
                debug!("Using the only serial port: {}", port.name);
                Ok(port.name.clone())
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Greater if non_interactive => Err(CliError::Usage(
            "Found multiple serial ports; specify one with --port".to_string(),
        )
        .into()),
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(&candidates)
        },
        Ordering::Less => Err(CliError::Device("No serial ports found".to_string()).into()),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(CliError::Usage(
            "Port selection needs a terminal; pass --port or --non-interactive".to_string(),
        )
        .into())
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                CliError::Usage(format!("Port prompt failed: {io_err}")).into()
            }
        },
    }
}

/// Index of the port the prompt should preselect.
fn default_index(ports: &[DetectedPort]) -> usize {
    select_port(ports)
        .and_then(|best| ports.iter().position(|p| p.name == best.name))
        .unwrap_or(0)
}

fn select_port_interactive(ports: &[DetectedPort]) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the port connected to the target")
        .items(&format_port_list(ports))
        .default(default_index(ports))
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .get(index)
            .map(|p| p.name.clone())
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

fn confirm_single_port(port: &DetectedPort) -> Result<String> {
    let label = format_port_list(std::slice::from_ref(port)).join("");
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {label}?"))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(port.name.clone())
    } else {
        Err(CliError::Cancelled("Port selection cancelled".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, stmboot::PortInfo};

    fn port(name: &str, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        DetectedPort::from(PortInfo {
            name: name.to_string(),
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial_number: None,
        })
    }

    #[test]
    fn test_explicit_port_wins() {
        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyS1".to_string());
        let options = SerialOptions {
            port: Some("/dev/ttyUSB3".to_string()),
            non_interactive: true,
        };
        assert_eq!(select_serial_port(&options, &config).unwrap(), "/dev/ttyUSB3");
    }

    #[test]
    fn test_config_port_used_without_explicit() {
        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyS1".to_string());
        let options = SerialOptions {
            port: None,
            non_interactive: true,
        };
        assert_eq!(select_serial_port(&options, &config).unwrap(), "/dev/ttyS1");
    }

    #[test]
    fn test_no_ports_is_device_error() {
        let err = choose_port(Vec::new(), true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Device(_))
        ));
    }

    #[test]
    fn test_single_known_port_is_auto_selected() {
        let ports = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyACM0", Some(0x0483), Some(0x374B)),
        ];
        assert_eq!(choose_port(ports, false).unwrap(), "/dev/ttyACM0");
    }

    #[test]
    fn test_single_unknown_port_non_interactive() {
        let ports = vec![port("/dev/ttyAMA0", None, None)];
        assert_eq!(choose_port(ports, true).unwrap(), "/dev/ttyAMA0");
    }

    #[test]
    fn test_multiple_candidates_non_interactive_is_usage_error() {
        let ports = vec![
            port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)),
            port("/dev/ttyUSB1", Some(0x10C4), Some(0xEA60)),
        ];
        let err = choose_port(ports, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(msg)) if msg.contains("multiple")
        ));
    }

    #[test]
    fn test_default_index_prefers_stlink() {
        let ports = vec![
            port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)),
            port("/dev/ttyACM0", Some(0x0483), Some(0x374B)),
        ];
        assert_eq!(default_index(&ports), 1);
        assert_eq!(default_index(&ports[..1]), 0);
    }
}
