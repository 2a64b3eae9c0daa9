use crate::authority::AuthorityConfig;
use crate::server::ServerConfig;
use crate::session::SessionConfig;
use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

fn seconds(
    name: &'static str,
    help: &'static str,
    env: &'static str,
    default: &'static str,
) -> Arg {
    Arg::new(name)
        .long(name)
        .help(help)
        .env(env)
        .default_value(default)
        .value_parser(clap::value_parser!(u64).range(1..))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("max-connections")
                .long("max-connections")
                .help("Maximum number of concurrent client connections")
                .env("OTP_SERVER_MAX_CONNECTIONS")
                .default_value("1024")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-packet-bytes")
                .long("max-packet-bytes")
                .help("Largest packet accepted from a client, in bytes")
                .env("OTP_SERVER_MAX_PACKET_BYTES")
                .default_value("65536")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("first-process-id")
                .long("first-process-id")
                .help("First process identifier handed out by HELLO")
                .env("OTP_SERVER_FIRST_PROCESS_ID")
                .default_value("1001")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(seconds(
            "handshake-timeout",
            "Seconds allowed for the TLS handshake",
            "OTP_SERVER_HANDSHAKE_TIMEOUT",
            "10",
        ))
        .arg(seconds(
            "authority-timeout",
            "Seconds to wait for the authority to answer a request",
            "OTP_SERVER_AUTHORITY_TIMEOUT",
            "30",
        ))
        .arg(seconds(
            "idle-timeout",
            "Seconds a connection may stay silent before it is closed",
            "OTP_SERVER_IDLE_TIMEOUT",
            "300",
        ))
        .arg(seconds(
            "flow-ttl",
            "Seconds an unused authentication flow is kept",
            "OTP_SERVER_FLOW_TTL",
            "600",
        ))
}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub max_connections: usize,
    pub max_packet_bytes: usize,
    pub first_process_id: u32,
    pub handshake_timeout: Duration,
    pub authority_timeout: Duration,
    pub idle_timeout: Duration,
    pub flow_ttl: Duration,
}

impl Options {
    /// # Errors
    /// Returns an error if a limit is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let secs = |name: &str| -> Result<Duration> {
            matches
                .get_one::<u64>(name)
                .copied()
                .map(Duration::from_secs)
                .with_context(|| format!("missing argument: --{name}"))
        };

        Ok(Self {
            max_connections: matches
                .get_one::<usize>("max-connections")
                .copied()
                .context("missing argument: --max-connections")?,
            max_packet_bytes: matches
                .get_one::<usize>("max-packet-bytes")
                .copied()
                .context("missing argument: --max-packet-bytes")?,
            first_process_id: matches
                .get_one::<u32>("first-process-id")
                .copied()
                .context("missing argument: --first-process-id")?,
            handshake_timeout: secs("handshake-timeout")?,
            authority_timeout: secs("authority-timeout")?,
            idle_timeout: secs("idle-timeout")?,
            flow_ttl: secs("flow-ttl")?,
        })
    }

    #[must_use]
    pub fn authority_config(&self) -> AuthorityConfig {
        AuthorityConfig::new()
            .with_first_process_id(self.first_process_id)
            .with_flow_ttl(self.flow_ttl)
    }

    /// Flows are swept at a tenth of their lifetime, at least once a second.
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_connections: self.max_connections,
            sweep_interval: (self.flow_ttl / 10).max(Duration::from_secs(1)),
            session: SessionConfig {
                handshake_timeout: self.handshake_timeout,
                authority_timeout: self.authority_timeout,
                idle_timeout: self.idle_timeout,
                max_packet_bytes: self.max_packet_bytes,
            },
            ..ServerConfig::default()
        }
    }
}
