//! GPIO line lifecycle management.
//!
//! [`GpioRegistry`] hands out exclusive leases on `(chip, line)` pairs and
//! caches them until they are released. A lease is re-requested whenever the
//! caller asks for the other direction. Every operation runs under a single
//! mutex, so a request followed by a read or write is atomic with respect to
//! other threads.
//!
//! ```text
//! GpioRegistry ──open_chip──> GpioChip ──request_line──> LineLease
//!      │                     (per chip)                (per line)
//!      └── BoardPins (power-hold, BOOT0, NRST)
//! ```
//!
//! The kernel-facing side sits behind [`GpioBackend`]; on Linux the default is
//! [`cdev::CdevBackend`] over `/dev/gpiochipN`.

#[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
pub mod cdev;
pub mod pins;

use {
    crate::error::{Error, Result},
    log::{debug, warn},
    std::{
        collections::HashMap,
        fmt,
        sync::{Mutex, MutexGuard, PoisonError},
    },
};

pub use pins::{BoardPins, PinLevel, PinMap, PinSnapshot, ResetPolarity};

/// Consumer label attached to every line request.
pub const CONSUMER: &str = "stmboot";

/// Line direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Line is read.
    Input,
    /// Line is driven.
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "in"),
            Self::Output => write!(f, "out"),
        }
    }
}

/// Access to GPIO chips.
pub trait GpioBackend: Send + Sync {
    /// Open a chip by name (`gpiochip1`) or path (`/dev/gpiochip1`).
    fn open_chip(&self, chip: &str) -> Result<Box<dyn GpioChip>>;
}

/// An open GPIO chip.
pub trait GpioChip: Send {
    /// Request exclusive use of `line`. Outputs start at `initial`.
    fn request_line(
        &mut self,
        line: u32,
        direction: Direction,
        initial: bool,
    ) -> Result<Box<dyn LineLease>>;

    /// Close the chip handle.
    fn close(self: Box<Self>) -> Result<()>;
}

/// An exclusive request on one line.
pub trait LineLease: Send {
    /// Drive the line. Only valid for outputs.
    fn set(&mut self, value: bool) -> Result<()>;

    /// Read the line.
    fn get(&mut self) -> Result<bool>;

    /// Give the line back to the kernel.
    fn release(self: Box<Self>) -> Result<()>;
}

/// Identifies a lease held by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LineHandle {
    /// Chip name.
    pub chip: String,
    /// Line offset.
    pub line: u32,
    /// Direction the line was requested with.
    pub direction: Direction,
}

/// Outcome of [`GpioRegistry::release_all`].
#[derive(Debug, Default)]
pub struct ReleaseReport {
    /// Leases released.
    pub lines: usize,
    /// Chip handles closed.
    pub chips: usize,
    /// Failures encountered along the way.
    pub errors: Vec<Error>,
}

impl ReleaseReport {
    /// Whether every release succeeded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Lease {
    direction: Direction,
    last_value: Option<bool>,
    handle: Box<dyn LineLease>,
}

#[derive(Default)]
struct Inner {
    chips: HashMap<String, Box<dyn GpioChip>>,
    lines: HashMap<(String, u32), Lease>,
}

impl Inner {
    fn chip(&mut self, backend: &dyn GpioBackend, name: &str) -> Result<&mut Box<dyn GpioChip>> {
        if !self.chips.contains_key(name) {
            let chip = backend.open_chip(name)?;
            debug!("Opened GPIO chip {name}");
            self.chips.insert(name.to_string(), chip);
        }
        self.chips
            .get_mut(name)
            .ok_or_else(|| Error::resource(name, None, "chip handle missing"))
    }

    fn acquire(
        &mut self,
        backend: &dyn GpioBackend,
        chip: &str,
        line: u32,
        direction: Direction,
        initial: Option<bool>,
    ) -> Result<&mut Lease> {
        let key = (chip.to_string(), line);
        let current = self.lines.get(&key).map(|l| (l.direction, l.last_value));
        let last_value = match current {
            Some((held, _)) if held == direction => {
                return self
                    .lines
                    .get_mut(&key)
                    .ok_or_else(|| Error::resource(chip, Some(line), "lease missing"));
            },
            Some((_, value)) => value,
            None => None,
        };

        if let Some(old) = self.lines.remove(&key) {
            debug!(
                "Re-requesting {chip}:{line} as {direction} (was {})",
                old.direction
            );
            if let Err(e) = old.handle.release() {
                warn!("Failed to release {chip}:{line}: {e}");
            }
        }

        let initial = initial.or(last_value).unwrap_or(false);
        let handle = self
            .chip(backend, chip)?
            .request_line(line, direction, initial)?;
        let lease = Lease {
            direction,
            last_value: (direction == Direction::Output).then_some(initial),
            handle,
        };
        Ok(self.lines.entry(key).or_insert(lease))
    }
}

/// Thread-safe cache of GPIO leases.
pub struct GpioRegistry {
    backend: Box<dyn GpioBackend>,
    inner: Mutex<Inner>,
}

impl GpioRegistry {
    /// Registry over an explicit backend.
    pub fn new(backend: impl GpioBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Registry over `/dev/gpiochipN`.
    #[cfg(all(target_os = "linux", feature = "gpio-cdev"))]
    pub fn cdev() -> Self {
        Self::new(cdev::CdevBackend)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic mid-operation leaves the maps consistent
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease `(chip, line)` in `direction`, reusing a matching lease.
    pub fn acquire(&self, chip: &str, line: u32, direction: Direction) -> Result<LineHandle> {
        let mut inner = self.lock();
        inner.acquire(self.backend.as_ref(), chip, line, direction, None)?;
        Ok(LineHandle {
            chip: chip.to_string(),
            line,
            direction,
        })
    }

    /// Drive `(chip, line)` as an output.
    pub fn set(&self, chip: &str, line: u32, value: bool) -> Result<()> {
        let mut inner = self.lock();
        let lease = inner.acquire(
            self.backend.as_ref(),
            chip,
            line,
            Direction::Output,
            Some(value),
        )?;
        lease.handle.set(value)?;
        lease.last_value = Some(value);
        debug!("{chip}:{line} <- {}", u8::from(value));
        Ok(())
    }

    /// Read `(chip, line)`.
    ///
    /// With `as_input` the line is re-requested as an input first; otherwise
    /// it is read in its current direction, defaulting to output.
    pub fn get(&self, chip: &str, line: u32, as_input: bool) -> Result<bool> {
        let mut inner = self.lock();
        let direction = if as_input {
            Direction::Input
        } else {
            inner
                .lines
                .get(&(chip.to_string(), line))
                .map_or(Direction::Output, |l| l.direction)
        };
        let lease = inner.acquire(self.backend.as_ref(), chip, line, direction, None)?;
        lease.handle.get()
    }

    /// Direction of the current lease, if any.
    pub fn direction(&self, chip: &str, line: u32) -> Option<Direction> {
        self.lock()
            .lines
            .get(&(chip.to_string(), line))
            .map(|l| l.direction)
    }

    /// Number of leases currently held.
    pub fn lease_count(&self) -> usize {
        self.lock().lines.len()
    }

    /// Release one lease, reporting failure.
    pub fn try_release(&self, chip: &str, line: u32) -> Result<()> {
        let lease = self.lock().lines.remove(&(chip.to_string(), line));
        match lease {
            Some(lease) => lease.handle.release(),
            None => Ok(()),
        }
    }

    /// Release every lease and close every chip. Never fails; problems are
    /// logged and collected.
    pub fn release_all(&self) -> ReleaseReport {
        let mut inner = self.lock();
        let mut report = ReleaseReport::default();

        for ((chip, line), lease) in inner.lines.drain() {
            match lease.handle.release() {
                Ok(()) => report.lines += 1,
                Err(e) => {
                    warn!("Failed to release {chip}:{line}: {e}");
                    report.errors.push(e);
                },
            }
        }
        for (name, chip) in inner.chips.drain() {
            match chip.close() {
                Ok(()) => report.chips += 1,
                Err(e) => {
                    warn!("Failed to close {name}: {e}");
                    report.errors.push(e);
                },
            }
        }

        if report.lines > 0 || report.chips > 0 {
            debug!(
                "Released {} GPIO line(s) on {} chip(s)",
                report.lines, report.chips
            );
        }
        report
    }
}

impl Drop for GpioRegistry {
    fn drop(&mut self) {
        self.release_all();
    }
}
