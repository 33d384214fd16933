//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod flash;
pub(crate) mod gpio;
pub(crate) mod probe;

use {
    crate::{Cli, CliError, config::Config, get_port, was_interrupted},
    anyhow::Result,
    console::style,
    std::{
        sync::mpsc::{Receiver, RecvTimeoutError},
        time::Duration,
    },
    stmboot::{
        Dispatcher, DispatcherSettings, Event, NativePort, SerialLink, SessionTimings,
    },
};

/// How often a waiting command checks for Ctrl-C.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A dispatcher running on an open serial link.
pub(crate) struct Connection {
    pub(crate) dispatcher: Dispatcher<NativePort>,
    pub(crate) events: Receiver<Event>,
    pub(crate) port: String,
}

/// Resolve the port, open it and start a dispatcher on it.
pub(crate) fn connect(cli: &Cli, config: &Config, timings: SessionTimings) -> Result<Connection> {
    let port = get_port(cli, config)?;
    let baud = cli.baud(config);
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port).green(),
            baud
        );
    }

    let mut link = SerialLink::native(port.clone(), baud);
    if !link.open() {
        return Err(CliError::Device(format!("Cannot open serial port {port}")).into());
    }

    let (dispatcher, events) =
        Dispatcher::spawn(link, DispatcherSettings::default().with_timings(timings));
    Ok(Connection {
        dispatcher,
        events,
        port,
    })
}

impl Connection {
    /// Next event from the worker, forwarding Ctrl-C as cancellation.
    pub(crate) fn next_event(&self) -> Result<Event> {
        loop {
            if was_interrupted() {
                self.dispatcher.cancel();
            }
            match self.events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => return Ok(event),
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => {
                    anyhow::bail!("Dispatcher worker stopped unexpectedly")
                },
            }
        }
    }
}

/// Format bytes as space separated hex.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x79]), "79");
        assert_eq!(hex(&[0x31, 0xCE, 0x00]), "31 CE 00");
        assert_eq!(hex(&[]), "");
    }
}
