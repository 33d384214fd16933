//! Probe command implementation.

use {
    super::{connect, hex},
    crate::{Cli, CliError, config::Config, was_interrupted},
    anyhow::Result,
    console::style,
    log::debug,
    std::time::Duration,
    stmboot::{Event, SessionTimings, protocol},
};

/// Send `command` and print the reply.
pub(crate) fn cmd_probe(
    cli: &Cli,
    config: &Config,
    command: &[u8],
    expected_len: usize,
    timeout: Duration,
) -> Result<()> {
    let connection = connect(cli, config, SessionTimings::default())?;
    debug!("Probe TX: {}", hex(command));
    connection
        .dispatcher
        .probe(command.to_vec(), expected_len, timeout)?;

    let (ok, response) = loop {
        if let Event::ProbeDone { ok, response } = connection.next_event()? {
            break (ok, response);
        }
    };

    if was_interrupted() {
        return Err(CliError::Cancelled("Probe cancelled".to_string()).into());
    }

    let Some(&first) = response.first() else {
        anyhow::bail!("No response from bootloader on {}", connection.port);
    };

    println!("{}", hex(&response));
    let verdict = protocol::describe_reply(first);
    if !cli.quiet {
        let verdict = match first {
            protocol::ACK => style(verdict).green().bold(),
            protocol::NACK => style(verdict).red().bold(),
            _ => style(verdict).yellow(),
        };
        eprintln!(
            "{} Reply {}/{expected_len} bytes: {verdict}",
            style("ℹ").blue(),
            response.len()
        );
    }

    if ok {
        Ok(())
    } else {
        anyhow::bail!(
            "Incomplete reply: expected {expected_len} bytes, got {}",
            response.len()
        )
    }
}
