//! One client connection.
//!
//! A session owns its stream and walks it through
//! `Idle → TlsHandshaking → Ready → AwaitingPacket → Dispatched →
//! AwaitingAuthorityResponse → WritingResponse → AwaitingPacket …` until the peer
//! hangs up, a fatal error occurs or the server asks it to stop. Packets are
//! handled strictly one at a time.
//!
//! Stopping is idempotent: the stream is shut down once and the session's
//! pending requests are detached from the [`Authority`] exactly once, even when
//! the session future is dropped mid-wait. A stop never interrupts a write in
//! progress; it only cancels a pending read or authority wait.

use crate::authority::{Authority, AuthorityResponse, SessionId};
use crate::notify::WaitError;
use crate::packet::framing::{DEFAULT_MAX_PACKET_BYTES, Frame};
use crate::packet::{
    CodecError, MessageType, OtpPacket, PacketReader, ProcessIdentifier, StatusCode,
};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

const MALFORMED_TEXT: &str = "Malformed packet or wrong protocol version";
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("tls handshake did not finish within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed packet: {0}")]
    Malformed(#[source] CodecError),
    #[error("no packet received within {0:?}")]
    Idle(Duration),
    #[error("authority did not answer: {0}")]
    Authority(#[source] WaitError),
    #[error("could not encode response: {0}")]
    Encode(#[source] CodecError),
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TlsHandshaking,
    AuthFailed,
    Ready,
    AwaitingPacket,
    Dispatched,
    AwaitingAuthorityResponse,
    WritingResponse,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub authority_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_packet_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            authority_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
        }
    }
}

/// Detaches the session from the authority when dropped.
struct Detach {
    authority: Authority,
    session: SessionId,
}

impl Drop for Detach {
    fn drop(&mut self) {
        self.authority.detach(self.session);
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    authority: Authority,
    config: SessionConfig,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
}

impl Session {
    /// `shutdown` flipping to `true` asks the session to stop.
    #[must_use]
    pub fn new(
        authority: Authority,
        config: SessionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            authority,
            config,
            shutdown,
            state: SessionState::Idle,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        trace!(session = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Complete the TLS handshake on `io`, then serve the connection.
    ///
    /// # Errors
    /// [`SessionError::Handshake`] or [`SessionError::HandshakeTimeout`] if the
    /// client could not be authenticated, otherwise as [`Session::serve`].
    pub async fn run_tls<IO>(
        mut self,
        io: IO,
        acceptor: &TlsAcceptor,
    ) -> Result<CloseReason, SessionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        self.transition(SessionState::TlsHandshaking);
        let limit = self.config.handshake_timeout;
        let handshake = tokio::select! {
            biased;
            () = stop_requested(self.shutdown.clone()) => {
                self.transition(SessionState::Closed);
                return Ok(CloseReason::Stopped);
            }
            handshake = tokio::time::timeout(limit, acceptor.accept(io)) => handshake,
        };

        match handshake {
            Ok(Ok(stream)) => self.serve(stream).await,
            Ok(Err(e)) => {
                self.transition(SessionState::AuthFailed);
                warn!(session = %self.id, "tls handshake failed: {e}");
                Err(SessionError::Handshake(e))
            }
            Err(_) => {
                self.transition(SessionState::AuthFailed);
                warn!(session = %self.id, "tls handshake timed out");
                Err(SessionError::HandshakeTimeout(limit))
            }
        }
    }

    /// Serve an already authenticated stream until it ends.
    ///
    /// # Errors
    /// Transport failures, an unreadable packet, an idle peer or an authority
    /// that does not answer in time end the session with an error. In the last
    /// two protocol cases an ERROR packet is written first.
    pub async fn serve<S>(mut self, mut stream: S) -> Result<CloseReason, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let _detach = Detach {
            authority: self.authority.clone(),
            session: self.id,
        };
        self.transition(SessionState::Ready);
        debug!(session = %self.id, "session ready");

        let mut reader = PacketReader::new(self.config.max_packet_bytes);
        let result = self.exchange(&mut stream, &mut reader).await;
        self.close(&mut stream).await;

        match &result {
            Ok(reason) => info!(session = %self.id, reason = ?reason, "session closed"),
            Err(e) => info!(session = %self.id, "session closed: {e}"),
        }
        result
    }

    async fn exchange<S>(
        &mut self,
        stream: &mut S,
        reader: &mut PacketReader,
    ) -> Result<CloseReason, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            self.transition(SessionState::AwaitingPacket);
            let idle = self.config.idle_timeout;
            let frame = tokio::select! {
                biased;
                () = stop_requested(self.shutdown.clone()) => return Ok(CloseReason::Stopped),
                frame = tokio::time::timeout(idle, reader.read_frame(stream)) => {
                    frame.map_err(|_| SessionError::Idle(idle))??
                }
            };

            let xml = match frame {
                Frame::Packet(xml) => xml,
                Frame::Closed => return Ok(CloseReason::PeerClosed),
                Frame::Malformed(e) => return self.reject(stream, e).await,
            };
            let packet = match OtpPacket::from_xml(&xml) {
                Ok(packet) => packet,
                Err(e) => return self.reject(stream, e).await,
            };

            self.transition(SessionState::Dispatched);
            let pid = packet.process_identifier;
            let is_hello = packet.message_type() == MessageType::Hello;
            let (request, _, completion) = self.authority.submit(self.id, packet).into_parts();

            self.transition(SessionState::AwaitingAuthorityResponse);
            let waited = completion
                .wait_or_cancel(
                    self.config.authority_timeout,
                    stop_requested(self.shutdown.clone()),
                )
                .await;
            let response = match waited {
                Ok(response) => response,
                Err(WaitError::Cancelled) => return Ok(CloseReason::Stopped),
                Err(e) => {
                    warn!(session = %self.id, request = %request, pid = %pid, "{e}");
                    let reply = OtpPacket::error(pid, "Unknown error", StatusCode::Unknown);
                    self.write_packet(stream, &reply).await?;
                    return Err(SessionError::Authority(e));
                }
            };

            let reply = reply_for(is_hello, response);
            self.write_packet(stream, &reply).await?;
        }
    }

    async fn reject<S>(
        &mut self,
        stream: &mut S,
        error: CodecError,
    ) -> Result<CloseReason, SessionError>
    where
        S: AsyncWrite + Unpin,
    {
        warn!(session = %self.id, "rejecting packet: {error}");
        let reply = OtpPacket::error(ProcessIdentifier::NONE, MALFORMED_TEXT, StatusCode::Error);
        self.write_packet(stream, &reply).await?;
        Err(SessionError::Malformed(error))
    }

    async fn write_packet<S>(
        &mut self,
        stream: &mut S,
        packet: &OtpPacket,
    ) -> Result<(), SessionError>
    where
        S: AsyncWrite + Unpin,
    {
        self.transition(SessionState::WritingResponse);
        let xml = packet.to_xml().map_err(SessionError::Encode)?;
        stream.write_all(xml.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn close<S>(&mut self, stream: &mut S)
    where
        S: AsyncWrite + Unpin,
    {
        if self.state == SessionState::Closed {
            return;
        }
        self.transition(SessionState::Closed);
        match tokio::time::timeout(CLOSE_GRACE, stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session = %self.id, "shutdown failed: {e}"),
            Err(_) => debug!(session = %self.id, "shutdown timed out"),
        }
    }
}

/// Resolves once `shutdown` reads `true`; never resolves if its sender is gone.
async fn stop_requested(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn reply_for(is_hello: bool, response: AuthorityResponse) -> OtpPacket {
    match response {
        AuthorityResponse::Simple(ack) if is_hello => OtpPacket::hello(ack.process_identifier),
        AuthorityResponse::Simple(ack) => {
            OtpPacket::success(ack.process_identifier, "", StatusCode::Ok)
        }
        AuthorityResponse::Complex(outcome) if outcome.status.is_success() => {
            OtpPacket::success(outcome.process_identifier, outcome.text, outcome.status)
        }
        AuthorityResponse::Complex(outcome) => {
            OtpPacket::error(outcome.process_identifier, outcome.text, outcome.status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{
        AuthorityConfig, MemoryStore, OtpPolicy, OtpSecret, PolicyError, TotpPolicy,
    };
    use crate::packet::{DataItem, KeyData, Message};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    /// Accepts every code after sleeping for the given delay.
    struct SlowPolicy(Duration);

    impl OtpPolicy for SlowPolicy {
        fn verify(&self, _: &OtpSecret, _: i64, _: &str) -> Result<bool, PolicyError> {
            std::thread::sleep(self.0);
            Ok(true)
        }

        fn resync(
            &self,
            _: &OtpSecret,
            _: i64,
            _: &str,
            _: &str,
        ) -> Result<Option<i64>, PolicyError> {
            Ok(None)
        }
    }

    fn authority() -> Authority {
        Authority::new(
            AuthorityConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(TotpPolicy::new()),
        )
    }

    fn slow_authority(delay: Duration) -> Authority {
        Authority::new(
            AuthorityConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(SlowPolicy(delay)),
        )
    }

    fn signed(kind: MessageType, pid: ProcessIdentifier) -> OtpPacket {
        OtpPacket::new(Message::new(kind).with_mac(b"mac".to_vec()), pid)
    }

    async fn send(client: &mut DuplexStream, packet: &OtpPacket) {
        let xml = packet.to_xml().unwrap_or_default();
        assert!(client.write_all(xml.as_bytes()).await.is_ok());
    }

    /// HELLO then ADD, leaving a registered user on the returned identifier.
    async fn register(client: &mut DuplexStream) -> ProcessIdentifier {
        send(client, &OtpPacket::hello(ProcessIdentifier::NONE)).await;
        let pid = read_reply(client).await.process_identifier;

        let add = signed(MessageType::Add, pid)
            .with_item(DataItem::Username("dave".to_string()))
            .with_item(DataItem::Key(KeyData::rsa(vec![0xa1, 0x07], vec![1, 0, 1])))
            .with_item(DataItem::Seed(b"12345678901234567890".to_vec()));
        send(client, &add).await;
        assert_eq!(read_reply(client).await.message.status, StatusCode::Ok);
        pid
    }

    async fn read_reply(client: &mut DuplexStream) -> OtpPacket {
        let mut reader = PacketReader::default();
        match reader.read_frame(client).await {
            Ok(Frame::Packet(xml)) => match OtpPacket::from_xml(&xml) {
                Ok(packet) => packet,
                Err(e) => panic!("bad reply {xml}: {e}"),
            },
            other => panic!("expected a packet, got {other:?}"),
        }
    }

    #[test]
    fn reply_shapes() {
        let pid = ProcessIdentifier::new(1001);
        let hello = reply_for(true, AuthorityResponse::acknowledge(pid));
        assert_eq!(hello, OtpPacket::hello(pid));

        let ok = reply_for(false, AuthorityResponse::outcome(pid, StatusCode::ResyncOk, "done"));
        assert_eq!(ok.message_type(), MessageType::Success);
        assert_eq!(ok.message.status, StatusCode::ResyncOk);
        assert_eq!(ok.message.content, "done");

        let failed = reply_for(true, AuthorityResponse::internal_error(ProcessIdentifier::NONE));
        assert_eq!(failed.message_type(), MessageType::Error);
        assert_eq!(failed.message.status, StatusCode::Unknown);
    }

    #[tokio::test]
    async fn hello_then_peer_close() {
        let (mut client, server) = duplex(4096);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let session = Session::new(authority(), SessionConfig::default(), stop_rx);
        let task = tokio::spawn(session.serve(server));

        let hello = OtpPacket::hello(ProcessIdentifier::NONE)
            .to_xml()
            .unwrap_or_default();
        assert!(client.write_all(hello.as_bytes()).await.is_ok());

        let reply = read_reply(&mut client).await;
        assert_eq!(reply, OtpPacket::hello(ProcessIdentifier::new(1001)));

        drop(client);
        let outcome = task.await;
        assert!(matches!(outcome, Ok(Ok(CloseReason::PeerClosed))));
    }

    #[tokio::test]
    async fn garbage_gets_one_error_then_close() {
        let (mut client, server) = duplex(4096);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let session = Session::new(authority(), SessionConfig::default(), stop_rx);
        let task = tokio::spawn(session.serve(server));

        assert!(client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.is_ok());
        let reply = read_reply(&mut client).await;
        assert_eq!(reply.message_type(), MessageType::Error);
        assert_eq!(reply.message.status, StatusCode::Error);
        assert_eq!(reply.message.content, MALFORMED_TEXT);
        assert_eq!(reply.process_identifier, ProcessIdentifier::NONE);

        let mut rest = Vec::new();
        assert!(client.read_to_end(&mut rest).await.is_ok());
        assert!(rest.is_empty());
        assert!(matches!(task.await, Ok(Err(SessionError::Malformed(_)))));
    }

    #[tokio::test]
    async fn stop_cancels_pending_read() {
        let (_client, server) = duplex(4096);
        let (stop_tx, stop_rx) = watch::channel(false);
        let authority = authority();
        let session = Session::new(authority.clone(), SessionConfig::default(), stop_rx);
        let task = tokio::spawn(session.serve(server));

        tokio::task::yield_now().await;
        assert!(stop_tx.send(true).is_ok());
        let outcome = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(matches!(outcome, Ok(Ok(Ok(CloseReason::Stopped)))));
        assert_eq!(authority.pending_count(), 0);
    }

    #[tokio::test]
    async fn authority_timeout_answers_unknown_then_closes() {
        let (mut client, server) = duplex(4096);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let config = SessionConfig {
            authority_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        };
        let session = Session::new(slow_authority(Duration::from_millis(600)), config, stop_rx);
        let task = tokio::spawn(session.serve(server));

        let pid = register(&mut client).await;
        let verify = signed(MessageType::Verify, pid).with_item(DataItem::Otp("123456".into()));
        send(&mut client, &verify).await;

        let reply = read_reply(&mut client).await;
        assert_eq!(reply.message_type(), MessageType::Error);
        assert_eq!(reply.message.status, StatusCode::Unknown);
        assert_eq!(reply.process_identifier, pid);

        let mut reader = PacketReader::default();
        assert!(matches!(reader.read_frame(&mut client).await, Ok(Frame::Closed)));

        let outcome = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(matches!(
            outcome,
            Ok(Ok(Err(SessionError::Authority(WaitError::TimedOut(limit)))))
                if limit == Duration::from_millis(100)
        ));
    }

    #[tokio::test]
    async fn stop_cancels_pending_authority_wait() {
        let (mut client, server) = duplex(4096);
        let (stop_tx, stop_rx) = watch::channel(false);
        let authority = slow_authority(Duration::from_millis(600));
        let session = Session::new(authority.clone(), SessionConfig::default(), stop_rx);
        let task = tokio::spawn(session.serve(server));

        let pid = register(&mut client).await;
        let verify = signed(MessageType::Verify, pid).with_item(DataItem::Otp("123456".into()));
        send(&mut client, &verify).await;

        let submitted = tokio::time::timeout(Duration::from_secs(5), async {
            while authority.pending_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(submitted.is_ok());

        assert!(stop_tx.send(true).is_ok());
        let outcome = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(matches!(outcome, Ok(Ok(Ok(CloseReason::Stopped)))));
        assert_eq!(authority.pending_count(), 0);
    }

    #[tokio::test]
    async fn idle_peer_is_dropped() {
        let (_client, server) = duplex(4096);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let config = SessionConfig {
            idle_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let session = Session::new(authority(), config, stop_rx);
        let outcome = session.serve(server).await;
        assert!(matches!(outcome, Err(SessionError::Idle(_))));
    }
}
