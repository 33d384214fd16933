//! In-memory serial port and simulated ROM bootloader.
//!
//! [`ScriptedPort`] implements [`Port`] over shared buffers. Bytes written to
//! it are handed to an optional [`Responder`], whose replies become readable.
//! [`SimTarget`] is a responder that speaks the bootloader protocol: it parses
//! the written stream byte by byte, checks every checksum, records the blocks
//! it accepts, and can be told to NACK or stay silent.
//!
//! [`MemoryGpio`] is a GPIO backend that keeps line levels in memory and
//! counts requests and releases.

use {
    crate::{
        error::{Error, Result},
        gpio::{Direction, GpioBackend, GpioChip, LineLease},
        link::PortOpener,
        port::{Port, SerialConfig},
        protocol::{ACK, Command, ERASE_ALL, NACK, SYNC, xor_checksum},
    },
    std::{
        collections::{HashMap, HashSet, VecDeque},
        io::{Read, Write},
        sync::{Arc, Mutex, MutexGuard},
        thread,
        time::{Duration, Instant},
    },
};

/// Produces replies for bytes written to a [`ScriptedPort`].
pub trait Responder: Send {
    /// Called once per `write` call with the written bytes.
    fn respond(&mut self, written: &[u8]) -> Vec<u8>;
}

impl<F> Responder for F
where
    F: FnMut(&[u8]) -> Vec<u8> + Send,
{
    fn respond(&mut self, written: &[u8]) -> Vec<u8> {
        self(written)
    }
}

#[derive(Default)]
struct PortState {
    rx: VecDeque<u8>,
    written: Vec<u8>,
    responder: Option<Box<dyn Responder>>,
    open: bool,
    open_count: usize,
    fail_open: bool,
    fail_reads: bool,
    reads: usize,
    dtr: Option<bool>,
    rts: Option<bool>,
    clear_count: usize,
}

/// Serial port backed by in-memory buffers.
///
/// Clones share the same buffers, so a test can keep one clone for
/// inspection while the link owns another.
#[derive(Clone)]
pub struct ScriptedPort {
    state: Arc<Mutex<PortState>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl ScriptedPort {
    /// Port with no responder; replies are queued with [`ScriptedPort::queue`].
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PortState {
                open: true,
                ..PortState::default()
            })),
            name: "scripted".into(),
            timeout: Duration::from_millis(200),
            baud_rate: crate::port::BOOTLOADER_BAUD,
        }
    }

    /// Port whose replies come from `responder`.
    pub fn with_responder(responder: impl Responder + 'static) -> Self {
        let port = Self::new();
        port.lock().responder = Some(Box::new(responder));
        port
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make bytes available for reading.
    pub fn queue(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes);
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Whether the port is currently open.
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// How many times an opener produced this port.
    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    /// Make subsequent opens fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Make reads fail at once with a non-timeout error, as an unplugged
    /// USB bridge does.
    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Calls to `read`, including failed ones.
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    /// Last DTR level written.
    pub fn dtr(&self) -> Option<bool> {
        self.lock().dtr
    }

    /// Last RTS level written.
    pub fn rts(&self) -> Option<bool> {
        self.lock().rts
    }

    /// Number of buffer clears (input-only or full).
    pub fn clear_count(&self) -> usize {
        self.lock().clear_count
    }

    /// Opener handing out clones of this port.
    pub fn opener(&self) -> PortOpener<Self> {
        let port = self.clone();
        Box::new(move |config: &SerialConfig| {
            let mut state = port.lock();
            if state.fail_open {
                return Err(Error::LinkOpen(format!("cannot open {}", config.port_name)));
            }
            state.open = true;
            state.open_count += 1;
            drop(state);

            let mut opened = port.clone();
            opened.name.clone_from(&config.port_name);
            opened.timeout = config.timeout;
            opened.baud_rate = config.baud_rate;
            Ok(opened)
        })
    }
}

impl Default for ScriptedPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.lock().reads += 1;
        let deadline = Instant::now() + self.timeout;
        loop {
            {
                let mut state = self.lock();
                if !state.open {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "port closed",
                    ));
                }
                if state.fail_reads {
                    return Err(std::io::Error::other("device disconnected"));
                }
                if !state.rx.is_empty() {
                    let n = buf.len().min(state.rx.len());
                    for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.lock();
        if !state.open {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        state.written.extend_from_slice(buf);
        if let Some(mut responder) = state.responder.take() {
            let reply = responder.respond(buf);
            state.rx.extend(reply);
            state.responder = Some(responder);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for ScriptedPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_input(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.rx.clear();
        state.clear_count += 1;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.clear_input()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lock().dtr = Some(level);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.lock().rts = Some(level);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.lock().open = false;
        Ok(())
    }
}

/// How the simulated target misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Reply with NACK.
    Nack,
    /// Reply with nothing.
    Silent,
}

#[derive(Debug)]
enum Phase {
    AwaitSync,
    Command(Option<u8>),
    EraseSelector(Vec<u8>),
    WriteAddress(Vec<u8>),
    WriteData { address: u32, frame: Vec<u8> },
}

#[derive(Debug)]
struct SimState {
    phase: Phase,
    answers_sync: bool,
    erase_faults: VecDeque<Fault>,
    block_faults: HashMap<u32, VecDeque<Fault>>,
    blocks: Vec<(u32, Vec<u8>)>,
    sync_count: usize,
    erase_count: usize,
    checksum_errors: usize,
}

/// Simulated STM32 ROM bootloader.
#[derive(Clone)]
pub struct SimTarget {
    state: Arc<Mutex<SimState>>,
}

impl SimTarget {
    /// Well-behaved target waiting for the sync byte.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                phase: Phase::AwaitSync,
                answers_sync: true,
                erase_faults: VecDeque::new(),
                block_faults: HashMap::new(),
                blocks: Vec::new(),
                sync_count: 0,
                erase_count: 0,
                checksum_errors: 0,
            })),
        }
    }

    /// Target that never acknowledges anything.
    pub fn unresponsive() -> Self {
        let sim = Self::new();
        sim.lock().answers_sync = false;
        sim
    }

    /// Target that already completed sync, as after a successful probe.
    pub fn synced() -> Self {
        let sim = Self::new();
        sim.lock().phase = Phase::Command(None);
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fail the next `times` erase selectors with `fault`.
    #[must_use]
    pub fn fail_erase(self, times: usize, fault: Fault) -> Self {
        self.lock().erase_faults.extend(std::iter::repeat_n(fault, times));
        self
    }

    /// Fail the next `times` data frames for `address` with `fault`.
    #[must_use]
    pub fn fail_block(self, address: u32, times: usize, fault: Fault) -> Self {
        self.lock()
            .block_faults
            .entry(address)
            .or_default()
            .extend(std::iter::repeat_n(fault, times));
        self
    }

    /// Scripted port wired to this target.
    pub fn port(&self) -> ScriptedPort {
        ScriptedPort::with_responder(self.clone())
    }

    /// Accepted blocks in write order.
    pub fn blocks(&self) -> Vec<(u32, Vec<u8>)> {
        self.lock().blocks.clone()
    }

    /// Concatenation of all accepted block payloads.
    pub fn flashed_bytes(&self) -> Vec<u8> {
        self.lock()
            .blocks
            .iter()
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }

    /// Sync bytes received.
    pub fn sync_count(&self) -> usize {
        self.lock().sync_count
    }

    /// Completed mass erases.
    pub fn erase_count(&self) -> usize {
        self.lock().erase_count
    }

    /// Frames rejected for a bad checksum.
    pub fn checksum_errors(&self) -> usize {
        self.lock().checksum_errors
    }
}

impl Default for SimTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    fn reply(fault: Option<Fault>, out: &mut Vec<u8>) {
        match fault {
            None => out.push(ACK),
            Some(Fault::Nack) => out.push(NACK),
            Some(Fault::Silent) => {},
        }
    }

    fn feed(&mut self, byte: u8, out: &mut Vec<u8>) {
        let phase = std::mem::replace(&mut self.phase, Phase::AwaitSync);
        self.phase = match phase {
            Phase::AwaitSync => {
                if byte == SYNC {
                    self.sync_count += 1;
                    if self.answers_sync {
                        out.push(ACK);
                        Phase::Command(None)
                    } else {
                        Phase::AwaitSync
                    }
                } else {
                    Phase::AwaitSync
                }
            },
            // A lone sync byte between commands re-synchronizes
            Phase::Command(None) if byte == SYNC => {
                self.sync_count += 1;
                out.push(ACK);
                Phase::Command(None)
            },
            Phase::Command(None) => Phase::Command(Some(byte)),
            Phase::Command(Some(cmd)) => {
                if byte != !cmd {
                    out.push(NACK);
                    Phase::Command(None)
                } else if cmd == Command::ExtendedErase as u8 {
                    out.push(ACK);
                    Phase::EraseSelector(Vec::new())
                } else if cmd == Command::WriteMemory as u8 {
                    out.push(ACK);
                    Phase::WriteAddress(Vec::new())
                } else {
                    out.push(NACK);
                    Phase::Command(None)
                }
            },
            Phase::EraseSelector(mut buf) => {
                buf.push(byte);
                if buf.len() < ERASE_ALL.len() {
                    Phase::EraseSelector(buf)
                } else {
                    let fault = self.erase_faults.pop_front();
                    if buf != ERASE_ALL {
                        self.checksum_errors += 1;
                        out.push(NACK);
                    } else {
                        if fault.is_none() {
                            self.erase_count += 1;
                        }
                        Self::reply(fault, out);
                    }
                    Phase::Command(None)
                }
            },
            Phase::WriteAddress(mut buf) => {
                buf.push(byte);
                if buf.len() < 5 {
                    Phase::WriteAddress(buf)
                } else if xor_checksum(&buf[..4]) != buf[4] {
                    self.checksum_errors += 1;
                    out.push(NACK);
                    Phase::Command(None)
                } else {
                    out.push(ACK);
                    Phase::WriteData {
                        address: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
                        frame: Vec::new(),
                    }
                }
            },
            Phase::WriteData { address, mut frame } => {
                frame.push(byte);
                // len byte + (len + 1) data bytes + checksum
                let expected = usize::from(frame[0]) + 3;
                if frame.len() < expected {
                    Phase::WriteData { address, frame }
                } else {
                    if xor_checksum(&frame) != 0 {
                        self.checksum_errors += 1;
                        out.push(NACK);
                    } else {
                        let fault = self
                            .block_faults
                            .get_mut(&address)
                            .and_then(VecDeque::pop_front);
                        if fault.is_none() {
                            self.blocks.push((address, frame[1..expected - 1].to_vec()));
                        }
                        Self::reply(fault, out);
                    }
                    Phase::Command(None)
                }
            },
        };
    }
}

impl Responder for SimTarget {
    fn respond(&mut self, written: &[u8]) -> Vec<u8> {
        let mut state = self.lock();
        let mut out = Vec::new();
        for &byte in written {
            state.feed(byte, &mut out);
        }
        out
    }
}

type LineKey = (String, u32);

#[derive(Default)]
struct GpioState {
    levels: HashMap<LineKey, bool>,
    active: HashMap<LineKey, usize>,
    peak: HashMap<LineKey, usize>,
    requests: usize,
    releases: usize,
    open_chips: usize,
    failing_chips: HashSet<String>,
    failing_releases: HashSet<LineKey>,
    failing_reads: HashSet<LineKey>,
}

/// In-memory GPIO backend.
#[derive(Clone, Default)]
pub struct MemoryGpio {
    state: Arc<Mutex<GpioState>>,
}

impl MemoryGpio {
    /// Backend where every chip opens and every line reads low.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GpioState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make opening `chip` fail.
    pub fn fail_chip(&self, chip: &str) {
        self.lock().failing_chips.insert(chip.to_string());
    }

    /// Make releasing `(chip, line)` fail.
    pub fn fail_release(&self, chip: &str, line: u32) {
        self.lock().failing_releases.insert((chip.to_string(), line));
    }

    /// Make reading `(chip, line)` fail.
    pub fn fail_read(&self, chip: &str, line: u32) {
        self.lock().failing_reads.insert((chip.to_string(), line));
    }

    /// Set the level an input on `(chip, line)` will read.
    pub fn drive_input(&self, chip: &str, line: u32, level: bool) {
        self.lock().levels.insert((chip.to_string(), line), level);
    }

    /// Current level of `(chip, line)`, if it was ever driven.
    pub fn level(&self, chip: &str, line: u32) -> Option<bool> {
        self.lock().levels.get(&(chip.to_string(), line)).copied()
    }

    /// Leases not yet released, over all lines.
    pub fn active_leases(&self) -> usize {
        self.lock().active.values().sum()
    }

    /// Highest number of simultaneous leases seen on `(chip, line)`.
    pub fn max_concurrent_leases(&self, chip: &str, line: u32) -> usize {
        self.lock()
            .peak
            .get(&(chip.to_string(), line))
            .copied()
            .unwrap_or(0)
    }

    /// Line requests made.
    pub fn request_count(&self) -> usize {
        self.lock().requests
    }

    /// Line releases made, including failed ones.
    pub fn release_count(&self) -> usize {
        self.lock().releases
    }

    /// Chips opened and not yet closed.
    pub fn open_chips(&self) -> usize {
        self.lock().open_chips
    }
}

impl GpioBackend for MemoryGpio {
    fn open_chip(&self, chip: &str) -> Result<Box<dyn GpioChip>> {
        let mut state = self.lock();
        if state.failing_chips.contains(chip) {
            return Err(Error::resource(chip, None, "No such file or directory"));
        }
        state.open_chips += 1;
        Ok(Box::new(MemoryChip {
            name: chip.to_string(),
            gpio: self.clone(),
        }))
    }
}

struct MemoryChip {
    name: String,
    gpio: MemoryGpio,
}

impl GpioChip for MemoryChip {
    fn request_line(
        &mut self,
        line: u32,
        direction: Direction,
        initial: bool,
    ) -> Result<Box<dyn LineLease>> {
        let key = (self.name.clone(), line);
        let mut state = self.gpio.lock();
        if state.active.get(&key).copied().unwrap_or(0) > 0 {
            return Err(Error::resource(&self.name, Some(line), "Device or resource busy"));
        }

        state.requests += 1;
        *state.active.entry(key.clone()).or_default() += 1;
        let now = state.active[&key];
        let peak = state.peak.entry(key.clone()).or_default();
        *peak = (*peak).max(now);
        if direction == Direction::Output {
            state.levels.insert(key.clone(), initial);
        }

        Ok(Box::new(MemoryLease {
            key,
            direction,
            gpio: self.gpio.clone(),
        }))
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.gpio.lock().open_chips -= 1;
        Ok(())
    }
}

struct MemoryLease {
    key: LineKey,
    direction: Direction,
    gpio: MemoryGpio,
}

impl LineLease for MemoryLease {
    fn set(&mut self, value: bool) -> Result<()> {
        if self.direction != Direction::Output {
            return Err(Error::resource(&self.key.0, Some(self.key.1), "line is an input"));
        }
        self.gpio.lock().levels.insert(self.key.clone(), value);
        Ok(())
    }

    fn get(&mut self) -> Result<bool> {
        let state = self.gpio.lock();
        if state.failing_reads.contains(&self.key) {
            return Err(Error::resource(&self.key.0, Some(self.key.1), "read failed"));
        }
        Ok(state.levels.get(&self.key).copied().unwrap_or(false))
    }

    fn release(self: Box<Self>) -> Result<()> {
        let mut state = self.gpio.lock();
        state.releases += 1;
        if let Some(count) = state.active.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        if state.failing_releases.contains(&self.key) {
            return Err(Error::resource(&self.key.0, Some(self.key.1), "release failed"));
        }
        Ok(())
    }
}
