//! TCP accept loop.
//!
//! Every accepted connection gets its own [`Session`] task. The loop caps the
//! number of concurrent sessions, periodically sweeps idle flows out of the
//! [`Authority`], and on shutdown stops accepting, asks every session to stop
//! and waits for them up to a drain deadline.

use crate::authority::Authority;
use crate::session::{Session, SessionConfig};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub drain_timeout: Duration,
    pub sweep_interval: Duration,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            drain_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            session: SessionConfig::default(),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    authority: Authority,
    config: ServerConfig,
}

impl Server {
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        acceptor: TlsAcceptor,
        authority: Authority,
        config: ServerConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            acceptor,
            authority,
            config,
        })
    }

    /// # Errors
    /// Returns an error if the listener has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then drain.
    ///
    /// # Errors
    /// Returns an error if the listener has no local address.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            acceptor,
            authority,
            config,
        } = self;
        info!("server listening on {}", listener.local_addr()?);

        let (stop_tx, stop_rx) = watch::channel(false);
        let slots = Arc::new(Semaphore::new(config.max_connections.max(1)));
        let mut sessions = JoinSet::new();
        let sweeper = tokio::spawn(sweep(authority.clone(), config.sweep_interval));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("session task failed: {e}");
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                            warn!("max connections reached, rejecting {peer}");
                            drop(tcp);
                            continue;
                        };
                        let session =
                            Session::new(authority.clone(), config.session, stop_rx.clone());
                        let acceptor = acceptor.clone();
                        sessions.spawn(async move {
                            let _permit = permit;
                            let id = session.id();
                            debug!(session = %id, peer = %peer, "connection accepted");
                            if let Err(e) = session.run_tls(tcp, &acceptor).await {
                                debug!(session = %id, peer = %peer, "connection closed: {e}");
                            }
                        });
                    }
                    Err(e) => error!("failed to accept connection: {e}"),
                },
            }
        }

        info!("shutdown signal received, draining {} sessions", sessions.len());
        stop_tx.send_replace(true);
        drop(listener);

        let drained = tokio::time::timeout(config.drain_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "drain timeout reached with {} sessions still active",
                sessions.len()
            );
            sessions.shutdown().await;
        }
        sweeper.abort();

        info!("server shut down gracefully");
        Ok(())
    }
}

async fn sweep(authority: Authority, every: Duration) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let evicted = authority.sweep_expired();
        if evicted > 0 {
            debug!(evicted, "idle flows evicted");
        }
    }
}
