//! Serial port discovery and USB bridge classification.
//!
//! The STM32 ROM bootloader is reached through a plain UART, usually via a
//! USB-to-UART bridge or the virtual COM port of an ST-LINK probe.

use crate::port::PortInfo;

#[cfg(feature = "native")]
use {
    crate::{
        error::{Error, Result},
        port::{NativePortEnumerator, PortEnumerator},
    },
    log::{debug, info, trace},
};

/// Known USB bridge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// ST-LINK virtual COM port.
    StLink,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x0483,
        &[0x374B, 0x374E, 0x374F, 0x3752, 0x3753, 0x3754],
        DeviceKind::StLink,
    ),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (0x0403, &[], DeviceKind::Ftdi),
    (0x067B, &[0x2303, 0x23A3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| {
                vid == *known_vid && (pids.is_empty() || pids.contains(&pid))
            })
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StLink => "ST-LINK VCP",
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is a recognised bridge.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A serial port with its classification.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Port name/path.
    pub name: String,
    /// Classified bridge kind.
    pub device: DeviceKind,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// List serial ports with their classification.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let detected = DetectedPort::from(info);
                trace!("Found port {} ({:?})", detected.name, detected.device);
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Pick the most likely port: ST-LINK first, then any known bridge, then
/// the first port found.
pub fn select_port(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports
        .iter()
        .find(|p| p.device == DeviceKind::StLink)
        .or_else(|| ports.iter().find(|p| p.device.is_known()))
        .or_else(|| ports.first())
}

/// Auto-detect a single port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();
    let port = select_port(&ports)
        .cloned()
        .ok_or_else(|| Error::LinkOpen("no serial ports found".into()))?;
    info!("Auto-detected {} ({})", port.name, port.device.name());
    Ok(port)
}

/// Format detected ports for display, one line each.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{device_info}{product_info}", port.name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0x374B), DeviceKind::StLink);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x1234), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x067B, 0x2303), DeviceKind::Prolific);
        // ST DFU mode is not a serial port
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0xDF11), DeviceKind::Unknown);
    }

    #[test]
    fn test_select_port_prefers_stlink() {
        let ports = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)),
            port("/dev/ttyACM0", Some(0x0483), Some(0x374B)),
        ];
        assert_eq!(select_port(&ports).map(|p| p.name.as_str()), Some("/dev/ttyACM0"));

        let ports = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)),
        ];
        assert_eq!(select_port(&ports).map(|p| p.name.as_str()), Some("/dev/ttyUSB0"));

        let ports = vec![port("/dev/ttyAMA0", None, None)];
        assert_eq!(select_port(&ports).map(|p| p.name.as_str()), Some("/dev/ttyAMA0"));

        assert!(select_port(&[]).is_none());
    }

    #[test]
    fn test_format_port_list() {
        let mut known = port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523));
        known.product = Some("USB-Serial".to_string());
        let ports = vec![
            known,
            port("/dev/ttyUSB1", Some(0x1234), Some(0x5678)),
            port("/dev/ttyS0", None, None),
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted[0], "/dev/ttyUSB0 [CH340/CH341] - USB-Serial");
        assert_eq!(formatted[1], "/dev/ttyUSB1 [VID:1234 PID:5678]");
        assert_eq!(formatted[2], "/dev/ttyS0");
    }
}
