use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("tls-cert")
                .long("tls-cert")
                .help("Path to the server certificate chain (PEM)")
                .env("OTP_SERVER_TLS_CERT")
                .required(true),
        )
        .arg(
            Arg::new("tls-key")
                .long("tls-key")
                .help("Path to the server private key (PEM)")
                .env("OTP_SERVER_TLS_KEY")
                .required(true),
        )
        .arg(
            Arg::new("tls-client-ca")
                .long("tls-client-ca")
                .help(
                    "Path to a CA bundle (PEM); when set, clients must present a certificate \
                     it issued",
                )
                .env("OTP_SERVER_TLS_CLIENT_CA"),
        )
}

#[derive(Debug, Clone)]
pub struct Options {
    pub cert: String,
    pub key: String,
    pub client_ca: Option<String>,
}

impl Options {
    /// # Errors
    /// Returns an error if a required TLS path is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            cert: matches
                .get_one::<String>("tls-cert")
                .cloned()
                .context("missing required argument: --tls-cert")?,
            key: matches
                .get_one::<String>("tls-key")
                .cloned()
                .context("missing required argument: --tls-key")?,
            client_ca: matches.get_one::<String>("tls-client-ca").cloned(),
        })
    }
}
