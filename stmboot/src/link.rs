//! Serial link to the target's ROM bootloader.
//!
//! A [`SerialLink`] owns at most one open port at a time and keeps it open
//! across a probe and the flash that follows; it only closes on explicit
//! request or when dropped.

use {
    crate::{
        error::Result,
        port::{Port, SerialConfig},
    },
    log::{debug, trace, warn},
    std::{io::ErrorKind, thread, time::Duration},
};

#[cfg(feature = "native")]
use crate::port::NativePort;

/// Delay after opening the device before the first byte is sent.
pub const SETTLE_DELAY: Duration = Duration::from_millis(30);

/// Factory used by [`SerialLink::open`] to produce a port.
pub type PortOpener<P> = Box<dyn FnMut(&SerialConfig) -> Result<P> + Send>;

/// Byte-level access to one serial device.
pub struct SerialLink<P: Port> {
    config: SerialConfig,
    opener: PortOpener<P>,
    port: Option<P>,
    settle: Duration,
}

#[cfg(feature = "native")]
impl SerialLink<NativePort> {
    /// Link over a native serial device at the bootloader's 8E1 framing.
    pub fn native(path: impl Into<String>, baud_rate: u32) -> Self {
        Self::with_opener(
            SerialConfig::new(path, baud_rate),
            Box::new(|config: &SerialConfig| NativePort::open(config)),
        )
    }
}

impl<P: Port> SerialLink<P> {
    /// Link whose port is produced by `opener`.
    pub fn with_opener(config: SerialConfig, opener: PortOpener<P>) -> Self {
        Self {
            config,
            opener,
            port: None,
            settle: SETTLE_DELAY,
        }
    }

    /// Override the post-open settle delay.
    #[must_use]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Device path.
    pub fn path(&self) -> &str {
        &self.config.port_name
    }

    /// Serial configuration used on open.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Whether a port is currently held.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Open the device if needed. Returns `false` when it cannot be opened.
    pub fn open(&mut self) -> bool {
        if self.port.is_some() {
            return true;
        }

        let mut port = match (self.opener)(&self.config) {
            Ok(port) => port,
            Err(e) => {
                warn!("Failed to open {}: {e}", self.config.port_name);
                return false;
            },
        };

        // Line state and stale bytes are best effort
        if let Err(e) = port
            .set_dtr(false)
            .and_then(|()| port.set_rts(false))
            .and_then(|()| port.clear_buffers())
        {
            debug!("Ignoring line setup error on {}: {e}", self.config.port_name);
        }
        thread::sleep(self.settle);

        debug!(
            "Opened {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );
        self.port = Some(port);
        true
    }

    /// Close the device. Safe to call when already closed.
    pub fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.close() {
                warn!("Error closing {}: {e}", self.config.port_name);
            }
            debug!("Closed {}", self.config.port_name);
        }
    }

    /// Read one byte, waiting at most `timeout`.
    ///
    /// `None` on timeout, on a closed link, or on a read error. A read error
    /// other than a timeout closes the link, so callers polling
    /// [`SerialLink::is_open`] stop instead of spinning on a dead device.
    pub fn read_byte(&mut self, timeout: Duration) -> Option<u8> {
        let port = self.port.as_mut()?;
        if let Err(e) = port.set_timeout(timeout) {
            trace!("set_timeout failed: {e}");
        }

        let mut buf = [0u8; 1];
        match port.read(&mut buf) {
            Ok(1) => {
                trace!("RX 0x{:02X}", buf[0]);
                Some(buf[0])
            },
            Ok(_) => None,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                None
            },
            Err(e) => {
                warn!("Read error on {}, closing: {e}", self.config.port_name);
                self.close();
                None
            },
        }
    }

    /// Write all bytes and flush. `false` when the link is closed or fails.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        let Some(port) = self.port.as_mut() else {
            return false;
        };
        trace!("TX {bytes:02X?}");
        match port.write_all_bytes(bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!("Write to {} failed: {e}", self.config.port_name);
                false
            },
        }
    }

    /// Flush pending output.
    pub fn flush(&mut self) -> bool {
        self.port
            .as_mut()
            .is_some_and(|port| std::io::Write::flush(port).is_ok())
    }

    /// Discard unread input.
    pub fn clear_input(&mut self) {
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.clear_input() {
                trace!("clear_input failed: {e}");
            }
        }
    }
}

impl<P: Port> Drop for SerialLink<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedPort;
    use std::time::Instant;

    fn scripted_link() -> (SerialLink<ScriptedPort>, ScriptedPort) {
        let port = ScriptedPort::new();
        let link = SerialLink::with_opener(SerialConfig::new("/dev/ttySIM0", 115200), port.opener())
            .with_settle(Duration::ZERO);
        (link, port)
    }

    #[test]
    fn test_open_is_idempotent() {
        let (mut link, port) = scripted_link();
        assert!(link.open());
        assert!(link.open());
        assert!(link.is_open());
        assert_eq!(port.open_count(), 1);
    }

    #[test]
    fn test_open_clears_lines_and_buffers() {
        let (mut link, port) = scripted_link();
        port.queue(&[0xAA, 0xBB]);
        assert!(link.open());
        assert_eq!(port.dtr(), Some(false));
        assert_eq!(port.rts(), Some(false));
        assert_eq!(port.clear_count(), 1);
        assert_eq!(link.read_byte(Duration::from_millis(5)), None);
    }

    #[test]
    fn test_close_is_idempotent_and_safe_unopened() {
        let (mut link, port) = scripted_link();
        link.close();
        assert!(link.open());
        link.close();
        link.close();
        assert!(!link.is_open());
        assert!(!port.is_open());
    }

    #[test]
    fn test_open_failure_returns_false() {
        let (mut link, port) = scripted_link();
        port.set_fail_open(true);
        assert!(!link.open());
        assert!(!link.is_open());
    }

    #[test]
    fn test_read_byte_timeout_returns_none() {
        let (mut link, _port) = scripted_link();
        assert!(link.open());
        let start = Instant::now();
        assert_eq!(link.read_byte(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_read_error_closes_link() {
        let (mut link, port) = scripted_link();
        assert!(link.open());
        port.set_fail_reads(true);

        let start = Instant::now();
        assert_eq!(link.read_byte(Duration::from_secs(5)), None);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!link.is_open());
        assert!(!port.is_open());

        // A later open gets a fresh port
        port.set_fail_reads(false);
        assert!(link.open());
        assert_eq!(port.open_count(), 2);
    }

    #[test]
    fn test_io_on_closed_link() {
        let (mut link, _port) = scripted_link();
        assert!(!link.write(&[0x7F]));
        assert!(!link.flush());
        assert_eq!(link.read_byte(Duration::from_millis(1)), None);
        link.clear_input();
    }

    #[test]
    fn test_write_and_read() {
        let (mut link, port) = scripted_link();
        assert!(link.open());
        assert!(link.write(&[0x7F]));
        assert!(link.flush());
        assert_eq!(port.written(), vec![0x7F]);

        port.queue(&[0x79]);
        assert_eq!(link.read_byte(Duration::from_millis(50)), Some(0x79));
    }

    #[test]
    fn test_drop_closes_port() {
        let (mut link, port) = scripted_link();
        assert!(link.open());
        drop(link);
        assert!(!port.is_open());
    }
}
