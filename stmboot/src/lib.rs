//! # stmboot
//!
//! A library for flashing STM32 microcontrollers through the UART ROM
//! bootloader, with GPIO control of the target's BOOT0 and NRST pins.
//!
//! This crate provides:
//!
//! - The bootloader wire format (sync, extended erase, write memory, XOR
//!   checksums)
//! - A protocol state machine with the retry and timeout policy of the ROM
//!   bootloader
//! - A dispatcher that runs requests on a worker thread and reports progress
//!   as events
//! - A GPIO line registry and board pin facade on top of `/dev/gpiochipN`
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `gpio-cdev` (default, Linux only): GPIO through the character device
//! - `serde`: serialization of configuration types
//! - `testing`: scripted serial port, simulated bootloader and in-memory GPIO
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use stmboot::{BootloaderSession, FlashImage, SerialLink};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FlashImage::from_file("firmware.bin", 0x0800_0000)?;
//!     let mut link = SerialLink::native("/dev/ttyUSB0", 115_200);
//!
//!     let mut session = BootloaderSession::new(&mut link);
//!     session.sync()?;
//!     session.flash(&image, Duration::from_secs(20), |p| {
//!         println!("{}% ({}/{})", p.percent, p.written, p.total);
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod device;
pub mod dispatcher;
pub mod error;
pub mod gpio;
pub mod image;
pub mod link;
pub mod port;
pub mod protocol;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{DetectedPort, DeviceKind, format_port_list, select_port},
    dispatcher::{Dispatcher, DispatcherSettings, Event},
    error::{Error, FailureReason, Result},
    gpio::{BoardPins, Direction, GpioRegistry, PinLevel, PinMap, PinSnapshot, ResetPolarity},
    image::{DEFAULT_BASE_ADDRESS, FlashImage},
    link::SerialLink,
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    session::{
        BootloaderSession, CancelToken, FlashProgress, ProbeOutcome, SessionState, SessionTimings,
    },
};
#[cfg(feature = "native")]
pub use device::{auto_detect_port, detect_ports};
