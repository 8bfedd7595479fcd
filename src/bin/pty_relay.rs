//! pty-relay - interactive PTY relay
//!
//! Spawns a shell on a new pseudoterminal, switches the invoking terminal to
//! raw mode and relays bytes both ways until the shell goes away.
//!
//! Logs go to stderr by default, which is the raw-mode terminal while the
//! relay runs. Set `log_file` (or `--log-file`) when raising `RUST_LOG` for an
//! interactive session.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use pty_relay::app;
use pty_relay::config::{CliArgs, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    // Default to "warn" so log lines do not interleave with the shell
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn init_logging(log_file: Option<&Path>) -> io::Result<()> {
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        },
        None => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .init();
        },
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let (config, warnings) = match Config::load_with_args(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        },
    };

    // The log destination is part of the config, so warnings from loading it
    // are held until the subscriber exists
    if let Err(e) = init_logging(config.log_file.as_deref()) {
        eprintln!("Failed to open log file: {}", e);
        for warning in &warnings {
            eprintln!("{}", warning);
        }
        return ExitCode::FAILURE;
    }
    for warning in &warnings {
        tracing::warn!("{}", warning);
    }

    tracing::debug!("Starting pty-relay with shell {}", config.shell_program());
    app::run(&config)
}
