use std::io;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use etw_tracer::session::{DEFAULT_SESSION_NAME, TRACE_LEVEL_VERBOSE};
use etw_tracer::{
    capture, Config, DispatchOptions, Outcome, ProviderGuid, SessionConfig, SessionError,
    ShutdownSignal,
};

/// Capture the events of a single ETW provider and print them as JSON.
#[derive(Debug, Parser)]
#[command(version)]
struct Command {
    /// Provider GUID, e.g. {22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716}
    provider: String,
    /// Suppress diagnostic logging
    #[arg(long)]
    silent: bool,
    /// Include the event header in the output
    #[arg(long)]
    header: bool,
    /// Only emit events with this event ID
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    id: Option<u16>,
    #[arg(long, default_value = DEFAULT_SESSION_NAME)]
    session_name: String,
    #[arg(long, default_value = "4")]
    buffer_size_kb: u32,
    #[arg(long, default_value = "2")]
    minimum_buffers: u32,
    #[arg(long, default_value = "10")]
    flush_interval_ms: u64,
    #[arg(long, default_value_t = TRACE_LEVEL_VERBOSE)]
    level: u8,
    /// Match-any keyword mask, hex (0x...) or decimal
    #[arg(long, value_parser = parse_keywords, default_value = "0xffffffffffffffff")]
    keywords: u64,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn parse_keywords(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid keyword mask {s:?}: {e}"))
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn config_from(opts: &Command) -> Result<Config> {
    let provider = ProviderGuid::parse(&opts.provider)?;
    Ok(Config {
        provider,
        session: SessionConfig {
            name: opts.session_name.clone(),
            buffer_size_kb: opts.buffer_size_kb,
            minimum_buffers: opts.minimum_buffers,
            level: opts.level,
            match_any_keyword: opts.keywords,
            ..Default::default()
        },
        dispatch: DispatchOptions {
            include_header: opts.header,
            id_filter: opts.id,
        },
        flush_interval: Duration::from_millis(opts.flush_interval_ms.max(1)),
        ..Default::default()
    })
}

#[cfg(windows)]
use etw_tracer::etw::EtwSession as Session;

#[cfg(windows)]
fn open_session(provider: &ProviderGuid, config: &SessionConfig) -> Result<Session, SessionError> {
    Session::open(provider, config)
}

/// Stand-in session for platforms without ETW; it can never be opened.
#[cfg(not(windows))]
enum Session {}

#[cfg(not(windows))]
impl etw_tracer::TraceSession for Session {
    fn flush(&self) -> Result<(), SessionError> {
        match *self {}
    }

    fn process(
        &self,
        _deliver: &mut dyn FnMut(etw_tracer::DecodedEvent),
    ) -> Result<(), SessionError> {
        match *self {}
    }

    fn close(&self) -> Result<(), SessionError> {
        match *self {}
    }
}

#[cfg(not(windows))]
fn open_session(_: &ProviderGuid, _: &SessionConfig) -> Result<Session, SessionError> {
    Err(SessionError::Unsupported)
}

fn main() -> Result<()> {
    let opts = Command::parse();
    if !opts.silent {
        init_logging(opts.verbose);
    }

    let config = config_from(&opts)?;

    let shutdown = ShutdownSignal::new();
    let trigger = shutdown.trigger();
    ctrlc::set_handler(move || trigger.interrupt()).context("Error setting Ctrl-C handler")?;

    let report = capture(&config, open_session, shutdown, io::stdout())?;
    tracing::debug!(
        "Capture finished: {} events received, {} emitted, {} flushes ({} failed)",
        report.dispatch.received,
        report.dispatch.emitted,
        report.flush.attempts,
        report.flush.failures
    );

    match report.outcome {
        Outcome::Interrupted => Ok(()),
        Outcome::CaptureFailed(e) => bail!("Capture failed: {e}"),
        Outcome::SessionEnded => bail!("Session ended before shutdown was requested"),
    }
}
