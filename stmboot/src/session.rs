//! Bootloader protocol state machine.
//!
//! A [`BootloaderSession`] borrows a [`SerialLink`] for one logical operation
//! (probe, sync, erase, write or the combined flash) and tracks where it got
//! to in [`SessionState`]. Every failure is terminal for the operation and is
//! recorded as `Failed(reason)`.
//!
//! ## Flash Sequence
//!
//! ```text
//! Idle -> Erasing --(ACK)--------------------------> Writing -> Done
//!            |                                          |
//!            +--(no ACK)-> Syncing -> Synced -> Erasing |
//!                                                       v
//!                          Failed(reason) <--- any step fails
//! ```

use {
    crate::{
        error::{Error, FailureReason, Result},
        image::{Block, FlashImage},
        link::SerialLink,
        port::Port,
        protocol::{self, ACK, Command, ERASE_ALL, NACK, SYNC},
    },
    log::{debug, info, trace, warn},
    std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::{Duration, Instant},
    },
};

/// Default wait for the final ACK of a mass erase.
pub const DEFAULT_ERASE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default per-attempt deadline of a handshake probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Timing and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimings {
    /// Total time spent sending sync bytes before giving up.
    pub sync_window: Duration,
    /// Pause between sync bytes.
    pub sync_interval: Duration,
    /// Wait for an ACK after each sync byte.
    pub sync_ack_wait: Duration,
    /// Wait for the ACK of a command or address frame.
    pub command_ack_timeout: Duration,
    /// Wait for the ACK of a data frame.
    pub data_ack_timeout: Duration,
    /// Handshake probe attempts.
    pub probe_attempts: u32,
    /// Pause between probe attempts.
    pub probe_retry_delay: Duration,
    /// Pause before retrying a failed block.
    pub block_retry_delay: Duration,
    /// Attempts per block.
    pub block_attempts: u32,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            sync_window: Duration::from_secs(5),
            sync_interval: Duration::from_millis(30),
            sync_ack_wait: Duration::from_millis(250),
            command_ack_timeout: Duration::from_millis(800),
            data_ack_timeout: Duration::from_millis(1500),
            probe_attempts: 3,
            probe_retry_delay: Duration::from_millis(50),
            block_retry_delay: Duration::from_millis(50),
            block_attempts: 2,
        }
    }
}

impl SessionTimings {
    /// Set the sync window.
    #[must_use]
    pub fn with_sync_window(mut self, window: Duration) -> Self {
        self.sync_window = window;
        self
    }

    /// Set the command and data ACK timeouts.
    #[must_use]
    pub fn with_ack_timeouts(mut self, command: Duration, data: Duration) -> Self {
        self.command_ack_timeout = command;
        self.data_ack_timeout = data;
        self
    }
}

/// Where a session is in its operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent yet.
    Idle,
    /// Sending sync bytes.
    Syncing,
    /// Bootloader acknowledged sync.
    Synced,
    /// Mass erase in progress.
    Erasing,
    /// Writing blocks.
    Writing,
    /// Every block acknowledged.
    Done,
    /// Operation ended with an error.
    Failed(FailureReason),
}

/// Write progress. `percent` only reaches 100 once every byte is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashProgress {
    /// `floor(written * 100 / total)`.
    pub percent: u8,
    /// Bytes acknowledged so far.
    pub written: usize,
    /// Image size.
    pub total: usize,
}

impl FlashProgress {
    /// Progress after `written` of `total` bytes.
    pub fn new(written: usize, total: usize) -> Self {
        #[allow(clippy::cast_possible_truncation)] // Bounded by 100
        let percent = if total == 0 {
            100
        } else {
            (written.min(total) * 100 / total) as u8
        };
        Self {
            percent,
            written,
            total,
        }
    }
}

/// Shared flag used to cancel a running operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New token, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Result of a handshake probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Exactly the expected number of bytes arrived.
    pub ok: bool,
    /// Bytes collected on the last attempt.
    pub response: Vec<u8>,
}

/// Protocol driver over a borrowed link.
pub struct BootloaderSession<'a, P: Port> {
    link: &'a mut SerialLink<P>,
    timings: SessionTimings,
    cancel: Option<CancelToken>,
    state: SessionState,
}

impl<'a, P: Port> BootloaderSession<'a, P> {
    /// New idle session with default timings.
    pub fn new(link: &'a mut SerialLink<P>) -> Self {
        Self {
            link,
            timings: SessionTimings::default(),
            cancel: None,
            state: SessionState::Idle,
        }
    }

    /// Use custom timings.
    #[must_use]
    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Timings in use.
    pub fn timings(&self) -> &SessionTimings {
        &self.timings
    }

    fn fail(&mut self, reason: FailureReason) -> Error {
        debug!("Session failed in {:?}: {reason}", self.state);
        self.state = SessionState::Failed(reason);
        reason.into()
    }

    fn check_cancel(&mut self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            info!("Operation cancelled");
            return Err(self.fail(FailureReason::Cancelled));
        }
        Ok(())
    }

    fn ensure_link(&mut self) -> Result<()> {
        if self.link.open() {
            Ok(())
        } else {
            Err(self.fail(FailureReason::LinkUnavailable))
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.link.write(bytes) {
            Ok(())
        } else {
            Err(self.fail(FailureReason::LinkUnavailable))
        }
    }

    /// Wait for ACK until `timeout` elapses. NACK and noise are discarded.
    ///
    /// `Ok(false)` on timeout. A link that closed underneath, e.g. after a
    /// read error, fails the operation.
    fn wait_ack(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.link.is_open() {
                return Err(self.fail(FailureReason::LinkUnavailable));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match self.link.read_byte(remaining) {
                Some(ACK) => return Ok(true),
                Some(NACK) => debug!("NACK received, still waiting for ACK"),
                Some(byte) => debug!("Discarding unexpected byte 0x{byte:02X}"),
                None => {},
            }
        }
    }

    /// Send sync bytes until the bootloader answers or the window elapses.
    pub fn sync(&mut self) -> Result<()> {
        self.ensure_link()?;
        self.state = SessionState::Syncing;
        let window = self.timings.sync_window;
        let start = Instant::now();
        let mut sent = 0u32;

        loop {
            self.check_cancel()?;
            let remaining = window.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }

            self.send(&[SYNC])?;
            sent += 1;
            if self.wait_ack(self.timings.sync_ack_wait.min(remaining))? {
                info!("Bootloader synchronized after {sent} sync byte(s)");
                self.state = SessionState::Synced;
                return Ok(());
            }

            let remaining = window.saturating_sub(start.elapsed());
            thread::sleep(self.timings.sync_interval.min(remaining));
        }

        warn!(
            "No sync ACK within {:.1}s ({sent} sync bytes sent)",
            window.as_secs_f32()
        );
        Err(self.fail(FailureReason::Timeout))
    }

    /// Send `command` and collect `expected_len` reply bytes.
    ///
    /// Up to `probe_attempts` attempts, each bounded by `timeout`. The link
    /// stays open afterwards.
    pub fn probe(
        &mut self,
        command: &[u8],
        expected_len: usize,
        timeout: Duration,
    ) -> Result<ProbeOutcome> {
        self.ensure_link()?;
        let attempts = self.timings.probe_attempts.max(1);
        let mut response = Vec::with_capacity(expected_len);

        for attempt in 1..=attempts {
            self.check_cancel()?;
            self.send(command)?;

            response.clear();
            let deadline = Instant::now() + timeout;
            while response.len() < expected_len {
                if !self.link.is_open() {
                    return Err(self.fail(FailureReason::LinkUnavailable));
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                if let Some(byte) = self.link.read_byte(remaining) {
                    response.push(byte);
                }
            }

            if response.len() == expected_len {
                debug!("Probe answered with {response:02X?}");
                return Ok(ProbeOutcome { ok: true, response });
            }

            if attempt < attempts {
                debug!(
                    "Probe got {}/{expected_len} bytes (attempt {attempt}/{attempts})",
                    response.len()
                );
                thread::sleep(self.timings.probe_retry_delay);
            }
        }

        warn!("Probe failed after {attempts} attempts");
        Ok(ProbeOutcome {
            ok: false,
            response,
        })
    }

    fn try_erase(&mut self, erase_timeout: Duration) -> Result<bool> {
        self.link.clear_input();
        self.send(&Command::ExtendedErase.frame())?;
        if !self.wait_ack(self.timings.command_ack_timeout)? {
            return Ok(false);
        }
        self.send(&ERASE_ALL)?;
        self.wait_ack(erase_timeout)
    }

    /// Mass-erase the flash, re-syncing once if the first attempt fails.
    pub fn erase(&mut self, erase_timeout: Duration) -> Result<()> {
        self.ensure_link()?;
        self.check_cancel()?;
        self.state = SessionState::Erasing;
        info!("Erasing flash...");

        if self.try_erase(erase_timeout)? {
            info!("Erase OK");
            return Ok(());
        }

        warn!("Extended erase failed (attempt 1/2), re-syncing");
        self.sync()?;
        self.check_cancel()?;
        self.state = SessionState::Erasing;

        if self.try_erase(erase_timeout)? {
            info!("Erase OK");
            Ok(())
        } else {
            warn!("Extended erase failed (attempt 2/2)");
            Err(self.fail(FailureReason::EraseRejected))
        }
    }

    fn try_write_block(&mut self, block: Block<'_>) -> Result<bool> {
        self.send(&Command::WriteMemory.frame())?;
        if !self.wait_ack(self.timings.command_ack_timeout)? {
            trace!("No ACK for write command @0x{:08X}", block.address);
            return Ok(false);
        }

        self.send(&protocol::address_frame(block.address))?;
        if !self.wait_ack(self.timings.command_ack_timeout)? {
            trace!("No ACK for address @0x{:08X}", block.address);
            return Ok(false);
        }

        self.send(&protocol::data_frame(block.data))?;
        self.wait_ack(self.timings.data_ack_timeout)
    }

    /// Write every block of `image`, reporting progress after each ACK.
    pub fn write_image<F>(&mut self, image: &FlashImage, mut progress: F) -> Result<()>
    where
        F: FnMut(FlashProgress),
    {
        self.ensure_link()?;
        self.state = SessionState::Writing;
        let total = image.len();
        let attempts = self.timings.block_attempts.max(1);
        let mut written = 0usize;

        info!(
            "Writing {total} bytes to 0x{:08X} ({} blocks)",
            image.base_address(),
            image.block_count()
        );

        for block in image.blocks() {
            let mut acked = false;
            for attempt in 1..=attempts {
                self.check_cancel()?;
                if self.try_write_block(block)? {
                    acked = true;
                    break;
                }
                if attempt < attempts {
                    warn!(
                        "Write failed @0x{:08X} (attempt {attempt}/{attempts}), retrying",
                        block.address
                    );
                    thread::sleep(self.timings.block_retry_delay);
                    self.link.clear_input();
                }
            }

            if !acked {
                warn!("Write block failed @0x{:08X}", block.address);
                return Err(self.fail(FailureReason::BlockWriteRejected(block.address)));
            }

            written += block.data.len();
            let p = FlashProgress::new(written, total);
            debug!("Progress {}% ({written}/{total})", p.percent);
            progress(p);
        }

        self.state = SessionState::Done;
        info!("Write OK ({total} bytes)");
        Ok(())
    }

    /// Erase then write `image` as one operation.
    pub fn flash<F>(
        &mut self,
        image: &FlashImage,
        erase_timeout: Duration,
        progress: F,
    ) -> Result<()>
    where
        F: FnMut(FlashProgress),
    {
        self.erase(erase_timeout)?;
        self.write_image(image, progress)
    }
}
