//! Single-worker request dispatcher.
//!
//! The [`Dispatcher`] owns a [`SerialLink`] on a dedicated thread. Requests
//! are queued on a channel and run strictly in order, so two operations never
//! share the wire. Results and progress come back as [`Event`]s on the
//! receiver returned by [`Dispatcher::spawn`]; every request produces exactly
//! one terminal event.
//!
//! Shutdown cancels the running operation and answers whatever is still
//! queued without touching the wire.

use {
    crate::{
        error::{Error, FailureReason, Result},
        image::FlashImage,
        link::SerialLink,
        port::Port,
        session::{BootloaderSession, CancelToken, FlashProgress, SessionTimings},
    },
    log::{debug, info, warn},
    std::{
        path::PathBuf,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc::{self, Receiver, Sender},
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Work accepted by the dispatcher.
#[derive(Debug, Clone)]
enum Request {
    Probe {
        command: Vec<u8>,
        expected_len: usize,
        timeout: Duration,
    },
    Flash {
        path: PathBuf,
        base_address: u32,
        erase_timeout: Duration,
    },
    Disconnect,
    Shutdown,
}

/// Results reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Probe finished.
    ProbeDone {
        /// The expected number of bytes arrived.
        ok: bool,
        /// Bytes received.
        response: Vec<u8>,
    },
    /// A block was acknowledged.
    Progress(FlashProgress),
    /// Erase and write completed.
    FlashDone,
    /// Flash ended early.
    FlashFailed(FailureReason),
    /// Link closed on request.
    Disconnected,
}

impl Event {
    /// Whether this event ends a request.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Default)]
pub struct DispatcherSettings {
    /// Protocol timings used by every session.
    pub timings: SessionTimings,
}

impl DispatcherSettings {
    /// Use custom protocol timings.
    #[must_use]
    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }
}

/// Handle to the worker thread.
pub struct Dispatcher<P: Port + 'static> {
    requests: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
    cancel: CancelToken,
    pending: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    settings: DispatcherSettings,
    _port: std::marker::PhantomData<fn() -> P>,
}

impl<P: Port + 'static> Dispatcher<P> {
    /// Start a worker owning `link`.
    pub fn spawn(link: SerialLink<P>, settings: DispatcherSettings) -> (Self, Receiver<Event>) {
        let mut dispatcher = Self {
            requests: None,
            worker: None,
            cancel: CancelToken::new(),
            pending: Arc::new(AtomicUsize::new(0)),
            stopping: Arc::new(AtomicBool::new(false)),
            settings,
            _port: std::marker::PhantomData,
        };
        let events = dispatcher.start(link);
        (dispatcher, events)
    }

    fn start(&mut self, link: SerialLink<P>) -> Receiver<Event> {
        let (req_tx, req_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        self.stopping = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            link,
            events: event_tx,
            cancel: self.cancel.clone(),
            pending: Arc::clone(&self.pending),
            stopping: Arc::clone(&self.stopping),
            timings: self.settings.timings.clone(),
        };
        self.requests = Some(req_tx);
        self.worker = Some(thread::spawn(move || worker.run(&req_rx)));
        event_rx
    }

    fn submit(&self, request: Request) -> Result<()> {
        let tx = self
            .requests
            .as_ref()
            .ok_or_else(|| Error::LinkOpen("dispatcher is shut down".into()))?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        tx.send(request).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            Error::LinkOpen("dispatcher worker exited".into())
        })
    }

    fn try_submit(&self, request: Request) -> Result<()> {
        let tx = self
            .requests
            .as_ref()
            .ok_or_else(|| Error::LinkOpen("dispatcher is shut down".into()))?;
        if self
            .pending
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Busy);
        }
        tx.send(request).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            Error::LinkOpen("dispatcher worker exited".into())
        })
    }

    /// Queue a handshake probe.
    pub fn probe(
        &self,
        command: impl Into<Vec<u8>>,
        expected_len: usize,
        timeout: Duration,
    ) -> Result<()> {
        self.submit(Request::Probe {
            command: command.into(),
            expected_len,
            timeout,
        })
    }

    /// Queue an erase-and-write of the file at `path`.
    pub fn flash(
        &self,
        path: impl Into<PathBuf>,
        base_address: u32,
        erase_timeout: Duration,
    ) -> Result<()> {
        self.submit(Request::Flash {
            path: path.into(),
            base_address,
            erase_timeout,
        })
    }

    /// Like [`Dispatcher::probe`], but fails with [`Error::Busy`] instead of queueing.
    pub fn try_probe(
        &self,
        command: impl Into<Vec<u8>>,
        expected_len: usize,
        timeout: Duration,
    ) -> Result<()> {
        self.try_submit(Request::Probe {
            command: command.into(),
            expected_len,
            timeout,
        })
    }

    /// Like [`Dispatcher::flash`], but fails with [`Error::Busy`] instead of queueing.
    pub fn try_flash(
        &self,
        path: impl Into<PathBuf>,
        base_address: u32,
        erase_timeout: Duration,
    ) -> Result<()> {
        self.try_submit(Request::Flash {
            path: path.into(),
            base_address,
            erase_timeout,
        })
    }

    /// Queue closing the link.
    pub fn disconnect(&self) -> Result<()> {
        self.submit(Request::Disconnect)
    }

    /// Cancel the running operation.
    pub fn cancel(&self) {
        debug!("Cancellation requested");
        self.cancel.cancel();
    }

    /// Token shared with the worker, e.g. for a Ctrl-C handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether any request is queued or running.
    pub fn is_busy(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    /// Replace the worker with one owning `link`.
    ///
    /// The old worker is torn down as by [`Dispatcher::shutdown`] and its link
    /// closed before the new one starts. Events from the new worker arrive on
    /// the returned receiver.
    pub fn reconnect(&mut self, link: SerialLink<P>) -> Receiver<Event> {
        self.shutdown();
        self.cancel.reset();
        info!("Reconnecting on {}", link.path());
        self.start(link)
    }

    /// Stop the worker and close its link. Idempotent.
    ///
    /// The running operation is cancelled. Requests still queued are not
    /// executed; each gets a failed terminal event instead.
    pub fn shutdown(&mut self) {
        // Stop flag first: the worker resets the cancel token before checking it
        self.stopping.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(tx) = self.requests.take() {
            // Worker may already be gone
            let _ = tx.send(Request::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Dispatcher worker panicked");
            }
        }
    }
}

impl<P: Port + 'static> Drop for Dispatcher<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<P: Port> {
    link: SerialLink<P>,
    events: Sender<Event>,
    cancel: CancelToken,
    pending: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    timings: SessionTimings,
}

impl<P: Port> Worker<P> {
    fn run(mut self, requests: &Receiver<Request>) {
        debug!("Dispatcher worker started for {}", self.link.path());
        for request in requests {
            if matches!(request, Request::Shutdown) {
                break;
            }
            self.cancel.reset();
            let event = if self.stopping.load(Ordering::SeqCst) {
                Self::discard(request)
            } else {
                self.handle(request)
            };
            // Busy flag clears before the terminal event is sent
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.emit(event);
        }
        self.link.close();
        debug!("Dispatcher worker stopped");
    }

    fn emit(&self, event: Event) {
        // Receiver may have been dropped; events are then discarded
        let _ = self.events.send(event);
    }

    fn discard(request: Request) -> Event {
        debug!("Dropping queued request {request:?}");
        match request {
            Request::Probe { .. } => Event::ProbeDone {
                ok: false,
                response: Vec::new(),
            },
            Request::Flash { .. } => Event::FlashFailed(FailureReason::Cancelled),
            Request::Disconnect | Request::Shutdown => Event::Disconnected,
        }
    }

    fn session(&mut self) -> BootloaderSession<'_, P> {
        BootloaderSession::new(&mut self.link)
            .with_timings(self.timings.clone())
            .with_cancel(self.cancel.clone())
    }

    fn handle(&mut self, request: Request) -> Event {
        match request {
            Request::Probe {
                command,
                expected_len,
                timeout,
            } => match self.session().probe(&command, expected_len, timeout) {
                Ok(outcome) => Event::ProbeDone {
                    ok: outcome.ok,
                    response: outcome.response,
                },
                Err(e) => {
                    warn!("Probe failed: {e}");
                    Event::ProbeDone {
                        ok: false,
                        response: Vec::new(),
                    }
                },
            },
            Request::Flash {
                path,
                base_address,
                erase_timeout,
            } => self.flash(&path, base_address, erase_timeout),
            Request::Disconnect => {
                self.link.close();
                Event::Disconnected
            },
            // Filtered out in run()
            Request::Shutdown => Event::Disconnected,
        }
    }

    fn flash(
        &mut self,
        path: &std::path::Path,
        base_address: u32,
        erase_timeout: Duration,
    ) -> Event {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                warn!("Cannot read {}: {e}", path.display());
                return Event::FlashFailed(FailureReason::ImageUnreadable);
            },
        };
        let image = match FlashImage::from_bytes(data, base_address) {
            Ok(image) => image,
            Err(e) => {
                warn!("{e}");
                return Event::FlashFailed(FailureReason::InvalidImage);
            },
        };

        info!(
            "Flashing {} ({} bytes) at 0x{base_address:08X}",
            path.display(),
            image.len()
        );
        let events = self.events.clone();
        let result = self.session().flash(&image, erase_timeout, |progress| {
            let _ = events.send(Event::Progress(progress));
        });
        match result {
            Ok(()) => Event::FlashDone,
            Err(e) => Event::FlashFailed(e.failure_reason()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        port::SerialConfig,
        testing::{Fault, ScriptedPort, SimTarget},
    };
    use std::io::Write;

    const WAIT: Duration = Duration::from_secs(10);
    const ERASE: Duration = Duration::from_millis(50);

    fn fast_settings() -> DispatcherSettings {
        DispatcherSettings::default().with_timings(SessionTimings {
            sync_window: Duration::from_millis(200),
            sync_interval: Duration::from_millis(2),
            sync_ack_wait: Duration::from_millis(20),
            command_ack_timeout: Duration::from_millis(30),
            data_ack_timeout: Duration::from_millis(200),
            probe_attempts: 3,
            probe_retry_delay: Duration::from_millis(2),
            block_retry_delay: Duration::from_millis(2),
            block_attempts: 2,
        })
    }

    fn sim_link(port: &ScriptedPort) -> SerialLink<ScriptedPort> {
        SerialLink::with_opener(SerialConfig::new("/dev/ttySIM0", 115200), port.opener())
            .with_settle(Duration::ZERO)
    }

    fn firmware(len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        (file, data)
    }

    fn until_terminal(events: &Receiver<Event>) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = events.recv_timeout(WAIT).unwrap();
            let done = event.is_terminal();
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[test]
    fn test_probe_then_flash_run_in_order() {
        let sim = SimTarget::new();
        let port = sim.port();
        let (dispatcher, events) = Dispatcher::spawn(sim_link(&port), fast_settings());
        let (file, data) = firmware(300);

        dispatcher.probe([0x7F], 1, Duration::from_millis(100)).unwrap();
        dispatcher.flash(file.path(), 0x0800_0000, ERASE).unwrap();

        assert_eq!(
            until_terminal(&events),
            vec![Event::ProbeDone {
                ok: true,
                response: vec![0x79]
            }]
        );
        let flash = until_terminal(&events);
        assert_eq!(flash.last(), Some(&Event::FlashDone));
        assert!(flash.contains(&Event::Progress(FlashProgress::new(300, 300))));
        assert_eq!(sim.flashed_bytes(), data);
        // Probe leaves the port open for the flash
        assert_eq!(port.open_count(), 1);
    }

    #[test]
    fn test_unreadable_image() {
        let port = SimTarget::synced().port();
        let (dispatcher, events) = Dispatcher::spawn(sim_link(&port), fast_settings());

        dispatcher
            .flash("/nonexistent/stmboot/fw.bin", 0x0800_0000, ERASE)
            .unwrap();
        assert_eq!(
            until_terminal(&events),
            vec![Event::FlashFailed(FailureReason::ImageUnreadable)]
        );
    }

    #[test]
    fn test_empty_image() {
        let port = SimTarget::synced().port();
        let (dispatcher, events) = Dispatcher::spawn(sim_link(&port), fast_settings());
        let (file, _) = firmware(0);

        dispatcher.flash(file.path(), 0x0800_0000, ERASE).unwrap();
        assert_eq!(
            until_terminal(&events),
            vec![Event::FlashFailed(FailureReason::InvalidImage)]
        );
    }

    #[test]
    fn test_block_failure_reported() {
        let sim = SimTarget::synced().fail_block(0x0800_0100, 2, Fault::Nack);
        let port = sim.port();
        let (dispatcher, events) = Dispatcher::spawn(sim_link(&port), fast_settings());
        let (file, _) = firmware(600);

        dispatcher.flash(file.path(), 0x0800_0000, ERASE).unwrap();
        let seen = until_terminal(&events);
        assert_eq!(
            seen.last(),
            Some(&Event::FlashFailed(FailureReason::BlockWriteRejected(
                0x0800_0100
            )))
        );
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_cancel_stops_flash() {
        // Silence on the third block leaves time to cancel before its retry
        let sim = SimTarget::synced().fail_block(0x0800_0200, 1, Fault::Silent);
        let port = sim.port();
        let (dispatcher, events) = Dispatcher::spawn(sim_link(&port), fast_settings());
        let (file, _) = firmware(4096);

        dispatcher.flash(file.path(), 0x0800_0000, ERASE).unwrap();
        let first = events.recv_timeout(WAIT).unwrap();
        assert!(matches!(first, Event::Progress(_)));
        dispatcher.cancel();

        let rest = until_terminal(&events);
        assert_eq!(
            rest.last(),
            Some(&Event::FlashFailed(FailureReason::Cancelled))
        );
        assert!(sim.blocks().len() < 16);
    }

    #[test]
    fn test_try_flash_is_busy_while_running() {
        let sim = SimTarget::synced().fail_block(0x0800_0000, 1, Fault::Silent);
        let port = sim.port();
        let (dispatcher, events) = Dispatcher::spawn(sim_link(&port), fast_settings());
        let (file, _) = firmware(16);

        dispatcher.try_flash(file.path(), 0x0800_0000, ERASE).unwrap();
        assert!(dispatcher.is_busy());
        assert!(matches!(
            dispatcher.try_probe([0x7F], 1, Duration::from_millis(10)),
            Err(Error::Busy)
        ));

        assert_eq!(until_terminal(&events).last(), Some(&Event::FlashDone));
        assert!(!dispatcher.is_busy());
    }

    #[test]
    fn test_disconnect_closes_link() {
        let sim = SimTarget::new();
        let port = sim.port();
        let (dispatcher, events) = Dispatcher::spawn(sim_link(&port), fast_settings());

        dispatcher.probe([0x7F], 1, Duration::from_millis(100)).unwrap();
        dispatcher.disconnect().unwrap();
        assert!(matches!(
            until_terminal(&events)[0],
            Event::ProbeDone { ok: true, .. }
        ));
        assert_eq!(until_terminal(&events), vec![Event::Disconnected]);
        assert!(!port.is_open());
    }

    #[test]
    fn test_probe_on_unopenable_link() {
        let port = ScriptedPort::new();
        port.set_fail_open(true);
        let (dispatcher, events) = Dispatcher::spawn(sim_link(&port), fast_settings());

        dispatcher.probe([0x7F], 1, Duration::from_millis(10)).unwrap();
        assert_eq!(
            until_terminal(&events),
            vec![Event::ProbeDone {
                ok: false,
                response: Vec::new()
            }]
        );
    }

    #[test]
    fn test_reconnect_uses_new_link() {
        let first = SimTarget::new().port();
        let (mut dispatcher, events) = Dispatcher::spawn(sim_link(&first), fast_settings());
        dispatcher.probe([0x7F], 1, Duration::from_millis(100)).unwrap();
        until_terminal(&events);

        let second = SimTarget::new().port();
        let events = dispatcher.reconnect(sim_link(&second));
        assert!(!first.is_open());

        dispatcher.probe([0x7F], 1, Duration::from_millis(100)).unwrap();
        assert!(matches!(
            until_terminal(&events)[0],
            Event::ProbeDone { ok: true, .. }
        ));
        assert_eq!(second.written(), vec![0x7F]);
    }

    #[test]
    fn test_reconnect_while_busy_drops_backlog() {
        let first = SimTarget::unresponsive().port();
        let (mut dispatcher, old_events) = Dispatcher::spawn(sim_link(&first), fast_settings());
        for _ in 0..3 {
            dispatcher.probe([0x7F], 1, Duration::from_millis(300)).unwrap();
        }
        // Let the first probe reach the wire
        thread::sleep(Duration::from_millis(50));

        let second = SimTarget::new().port();
        let start = std::time::Instant::now();
        let events = dispatcher.reconnect(sim_link(&second));
        assert!(
            start.elapsed() < Duration::from_millis(900),
            "reconnect took {:?}",
            start.elapsed()
        );
        assert!(!first.is_open());
        // Only the first attempt of the running probe was sent
        assert_eq!(first.written(), vec![0x7F]);

        // Every queued request still got its terminal event
        let old: Vec<Event> = old_events.try_iter().collect();
        assert_eq!(old.len(), 3);
        assert!(
            old.iter()
                .all(|e| matches!(e, Event::ProbeDone { ok: false, .. }))
        );
        assert!(!dispatcher.is_busy());

        dispatcher.probe([0x7F], 1, Duration::from_millis(100)).unwrap();
        assert!(matches!(
            until_terminal(&events)[0],
            Event::ProbeDone { ok: true, .. }
        ));
    }

    #[test]
    fn test_drop_closes_link() {
        let port = SimTarget::new().port();
        {
            let (dispatcher, events) = Dispatcher::spawn(sim_link(&port), fast_settings());
            dispatcher.probe([0x7F], 1, Duration::from_millis(100)).unwrap();
            until_terminal(&events);
            assert!(port.is_open());
        }
        assert!(!port.is_open());
    }
}
