use crate::authority::{Authority, MemoryStore, TotpPolicy};
use crate::cli::commands::{limits, tls};
use crate::server::Server;
use crate::tls::{TlsPaths, load_acceptor};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug)]
pub struct Args {
    pub listen: SocketAddr,
    pub tls: tls::Options,
    pub limits: limits::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the TLS assets cannot be loaded or the listener cannot be bound.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let paths = TlsPaths::from_cli(
        args.tls.cert.clone(),
        args.tls.key.clone(),
        args.tls.client_ca.clone(),
    );
    let acceptor = load_acceptor(&paths).context("TLS initialization failed")?;

    let authority = Authority::new(
        args.limits.authority_config(),
        Arc::new(MemoryStore::new()),
        Arc::new(TotpPolicy::new()),
    );

    let server = Server::bind(args.listen, acceptor, authority, args.limits.server_config())
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;

    server.run(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", args.listen.to_string()),
        ("tls_cert", args.tls.cert.clone()),
        ("tls_key", args.tls.key.clone()),
        (
            "tls_client_ca",
            args.tls
                .client_ca
                .clone()
                .unwrap_or_else(|| "none".to_string()),
        ),
        ("max_connections", args.limits.max_connections.to_string()),
        ("max_packet_bytes", args.limits.max_packet_bytes.to_string()),
        ("first_process_id", args.limits.first_process_id.to_string()),
        (
            "handshake_timeout",
            format!("{}s", args.limits.handshake_timeout.as_secs()),
        ),
        (
            "authority_timeout",
            format!("{}s", args.limits.authority_timeout.as_secs()),
        ),
        (
            "idle_timeout",
            format!("{}s", args.limits.idle_timeout.as_secs()),
        ),
        ("flow_ttl", format!("{}s", args.limits.flow_ttl.as_secs())),
    ];
    log_entries("Startup configuration", &entries);
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("{}\n\n{title}:", banner());
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn banner() -> String {
    format!(
        "otp-server {} ({})",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    )
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed).to_string()
}
