use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{self, limits, tls};
use anyhow::{Context, Result};
use std::net::SocketAddr;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let listen = matches
        .get_one::<SocketAddr>(commands::ARG_LISTEN)
        .copied()
        .context("missing required argument: --listen")?;

    let tls = tls::Options::parse(matches)?;
    let limits = limits::Options::parse(matches)?;

    Ok(Action::Server(Args {
        listen,
        tls,
        limits,
    }))
}
