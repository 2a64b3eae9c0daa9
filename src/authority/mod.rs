//! The request broker every connection session submits packets to.
//!
//! ## Serialization model
//! Each submitted request runs on its own task. Requests that touch a flow
//! (`ADD`, `VERIFY`, `RESYNC`) hold that flow's lock for their whole duration, so
//! at most one of them is in flight per [`ProcessIdentifier`] while requests on
//! other identifiers proceed in parallel. `HELLO` only mints an identifier and
//! never waits on a flow lock.
//!
//! ## Notification
//! [`Authority::submit`] registers the request's [`Notifier`] in a pending table
//! and returns the matching completion inside a [`RequestObject`]. The entry is
//! removed exactly once, when the answer is delivered or when the owning session
//! detaches, so every request is answered at most once and a vanished waiter
//! never leaks.
//!
//! ## Failure containment
//! Identity store and OTP policy calls run on the blocking pool. Their errors,
//! and panics anywhere in request handling, become an `E_UNKNOWN` outcome for
//! that request only.

pub mod flow;
pub mod policy;
pub mod request;
pub mod store;

pub use policy::{OtpPolicy, PolicyError, TotpPolicy};
pub use request::{
    Acknowledgement, AuthorityResponse, Outcome, RequestId, RequestObject, SessionId,
};
pub use store::{IdentityRecord, IdentityStore, MemoryStore, OtpSecret, StoreError};

use crate::notify::{self, Notifier};
use crate::packet::{KeyData, MessageType, OtpPacket, ProcessIdentifier, StatusCode};
use flow::{Flow, FlowTable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default first identifier handed out by `HELLO`.
pub const DEFAULT_FIRST_PROCESS_ID: u32 = 1001;

/// Default idle lifetime of a flow.
pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    first_process_id: u32,
    flow_ttl: Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            first_process_id: DEFAULT_FIRST_PROCESS_ID,
            flow_ttl: DEFAULT_FLOW_TTL,
        }
    }
}

impl AuthorityConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_first_process_id(mut self, id: u32) -> Self {
        self.first_process_id = id.max(1);
        self
    }

    #[must_use]
    pub fn with_flow_ttl(mut self, ttl: Duration) -> Self {
        self.flow_ttl = ttl;
        self
    }

    #[must_use]
    pub fn flow_ttl(&self) -> Duration {
        self.flow_ttl
    }
}

struct Pending {
    session: SessionId,
    notifier: Notifier<AuthorityResponse>,
}

struct Inner {
    config: AuthorityConfig,
    next_process_id: AtomicU32,
    next_request_id: AtomicU64,
    flows: FlowTable,
    pending: Mutex<HashMap<RequestId, Pending>>,
    store: Arc<dyn IdentityStore>,
    policy: Arc<dyn OtpPolicy>,
}

/// Shared handle to the broker. Cheap to clone; all clones see the same state.
#[derive(Clone)]
pub struct Authority {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("config", &self.inner.config)
            .field("flows", &self.inner.flows.len())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl Authority {
    #[must_use]
    pub fn new(
        config: AuthorityConfig,
        store: Arc<dyn IdentityStore>,
        policy: Arc<dyn OtpPolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_process_id: AtomicU32::new(config.first_process_id),
                next_request_id: AtomicU64::new(1),
                config,
                flows: FlowTable::default(),
                pending: Mutex::new(HashMap::new()),
                store,
                policy,
            }),
        }
    }

    /// Queue `packet` on behalf of `session` and return the handle its answer arrives on.
    ///
    /// Never waits for processing; must be called from within a tokio runtime.
    #[must_use]
    pub fn submit(
        &self,
        session: SessionId,
        packet: OtpPacket,
    ) -> RequestObject<OtpPacket, AuthorityResponse> {
        let id = RequestId(self.inner.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (notifier, completion) = notify::channel();
        self.inner
            .pending()
            .insert(id, Pending { session, notifier });

        let packet = Arc::new(packet);
        debug!(
            request = %id,
            session = %session,
            pid = %packet.process_identifier,
            kind = %packet.message_type(),
            "request submitted"
        );

        let inner = Arc::clone(&self.inner);
        let request = Arc::clone(&packet);
        tokio::spawn(async move {
            let pid = request.process_identifier;
            let worker = tokio::spawn(Arc::clone(&inner).process(request));
            let response = match worker.await {
                Ok(response) => response,
                Err(e) => {
                    error!(request = %id, pid = %pid, "request handler failed: {e}");
                    AuthorityResponse::internal_error(pid)
                }
            };
            inner.complete(id, response);
        });

        RequestObject::new(id, packet, completion)
    }

    /// Forget every pending request of `session`. Returns how many were dropped.
    pub fn detach(&self, session: SessionId) -> usize {
        let mut pending = self.inner.pending();
        let before = pending.len();
        pending.retain(|_, entry| entry.session != session);
        let dropped = before - pending.len();
        if dropped > 0 {
            debug!(session = %session, dropped, "detached pending requests");
        }
        dropped
    }

    /// Evict flows idle for longer than the configured TTL.
    pub fn sweep_expired(&self) -> usize {
        let evicted = self.inner.flows.evict_idle(self.inner.config.flow_ttl);
        for pid in &evicted {
            debug!(pid = %pid, "flow expired");
        }
        evicted.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.inner.flows.len()
    }

    /// Number of requests applied to the flow, waiting for any request in progress.
    pub async fn flow_revision(&self, pid: ProcessIdentifier) -> Option<u64> {
        let flow = self.inner.flows.get(pid)?;
        let revision = flow.lock().await.revision;
        Some(revision)
    }
}

impl Inner {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, id: RequestId, response: AuthorityResponse) {
        let entry = self.pending().remove(&id);
        let Some(entry) = entry else {
            debug!(request = %id, "requester detached before completion");
            return;
        };
        if entry.notifier.notify(response).is_err() {
            debug!(request = %id, session = %entry.session, "requester stopped waiting");
        }
    }

    async fn process(self: Arc<Self>, packet: Arc<OtpPacket>) -> AuthorityResponse {
        let pid = packet.process_identifier;
        let kind = packet.message_type();

        match kind {
            MessageType::Hello => self.hello(),
            MessageType::Add | MessageType::Verify | MessageType::Resync => {
                if pid.is_none() {
                    return AuthorityResponse::outcome(
                        pid,
                        StatusCode::Error,
                        format!("{kind} requires a process identifier; send HELLO first"),
                    );
                }
                let Some(flow) = self.flows.get(pid) else {
                    return AuthorityResponse::outcome(
                        pid,
                        StatusCode::NotFound,
                        "Unknown process identifier",
                    );
                };
                if !packet.message.has_mac() {
                    return AuthorityResponse::outcome(pid, StatusCode::Incomplete, "MAC missing");
                }

                let mut flow = flow.lock().await;
                flow.touch();
                let response = match kind {
                    MessageType::Add => self.add(&mut flow, &packet).await,
                    MessageType::Verify => self.verify(&mut flow, &packet).await,
                    _ => self.resync(&mut flow, &packet).await,
                };
                info!(
                    pid = %pid,
                    kind = %kind,
                    status = %response.status(),
                    revision = flow.revision,
                    "request processed"
                );
                response
            }
            MessageType::Success | MessageType::Error | MessageType::None => {
                AuthorityResponse::outcome(
                    pid,
                    StatusCode::Error,
                    format!("{kind} is not a request"),
                )
            }
        }
    }

    fn hello(&self) -> AuthorityResponse {
        let minted = self
            .next_process_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1));
        match minted {
            Ok(id) => {
                let pid = ProcessIdentifier::new(id);
                self.flows.insert(pid);
                info!(pid = %pid, "flow started");
                AuthorityResponse::acknowledge(pid)
            }
            Err(_) => {
                error!("process identifier space exhausted");
                AuthorityResponse::internal_error(ProcessIdentifier::NONE)
            }
        }
    }

    async fn add(&self, flow: &mut Flow, packet: &OtpPacket) -> AuthorityResponse {
        let pid = packet.process_identifier;
        if flow.merge(packet, true).is_err() {
            return AuthorityResponse::outcome(
                pid,
                StatusCode::Error,
                "Username cannot change within a process",
            );
        }

        let Some(username) = flow.username.clone() else {
            return AuthorityResponse::outcome(pid, StatusCode::Incomplete, "Username missing");
        };
        let Some(public_key) = flow.public_key.clone() else {
            return AuthorityResponse::outcome(pid, StatusCode::Incomplete, "Public key missing");
        };

        let existing = match self.load(&username).await {
            Ok(record) => record,
            Err(response) => return response.at(pid),
        };

        let mut record = existing.unwrap_or_else(|| IdentityRecord::new(&username, KeyData::None));
        record.public_key = public_key;
        if let Some(seed) = flow.seed.clone() {
            record.secret = Some(seed);
            record.drift = 0;
        }

        if let Err(response) = self.save(record).await {
            return response.at(pid);
        }
        AuthorityResponse::outcome(pid, StatusCode::Ok, "Identity data stored")
    }

    async fn verify(&self, flow: &mut Flow, packet: &OtpPacket) -> AuthorityResponse {
        let pid = packet.process_identifier;
        let record = match self.prepare_check(flow, packet).await {
            Ok(record) => record,
            Err(response) => return response,
        };
        let Some(otp) = packet.otps().next().map(ToString::to_string) else {
            return AuthorityResponse::outcome(pid, StatusCode::Incomplete, "OTP missing");
        };
        let Some(secret) = record.secret.clone() else {
            return AuthorityResponse::outcome(pid, StatusCode::NotFound, "No OTP secret for user");
        };

        let policy = Arc::clone(&self.policy);
        let drift = record.drift;
        let verdict = run_blocking(move || policy.verify(&secret, drift, &otp)).await;
        match verdict {
            Ok(Ok(true)) => AuthorityResponse::outcome(pid, StatusCode::Ok, "OTP verified"),
            Ok(Ok(false)) => {
                warn!(pid = %pid, user = %record.username, "otp rejected");
                AuthorityResponse::outcome(
                    pid,
                    StatusCode::NotVerified,
                    "OTP could not be verified",
                )
            }
            Ok(Err(e)) => {
                error!(pid = %pid, "otp policy failed: {e}");
                AuthorityResponse::internal_error(pid)
            }
            Err(e) => {
                error!(pid = %pid, "otp policy panicked: {e}");
                AuthorityResponse::internal_error(pid)
            }
        }
    }

    async fn resync(&self, flow: &mut Flow, packet: &OtpPacket) -> AuthorityResponse {
        let pid = packet.process_identifier;
        let mut record = match self.prepare_check(flow, packet).await {
            Ok(record) => record,
            Err(response) => return response,
        };
        let otps: Vec<String> = packet.otps().map(ToString::to_string).collect();
        let [first, second, ..] = otps.as_slice() else {
            return AuthorityResponse::outcome(
                pid,
                StatusCode::Incomplete,
                "Two consecutive OTPs required",
            );
        };
        let Some(secret) = record.secret.clone() else {
            return AuthorityResponse::outcome(pid, StatusCode::NotFound, "No OTP secret for user");
        };

        let policy = Arc::clone(&self.policy);
        let drift = record.drift;
        let (first, second) = (first.clone(), second.clone());
        let found = run_blocking(move || policy.resync(&secret, drift, &first, &second)).await;
        match found {
            Ok(Ok(Some(drift))) => {
                record.drift = drift;
                if let Err(response) = self.save(record).await {
                    return response.at(pid);
                }
                info!(pid = %pid, drift, "counter resynchronized");
                AuthorityResponse::outcome(pid, StatusCode::ResyncOk, "Counter resynchronized")
            }
            Ok(Ok(None)) => AuthorityResponse::outcome(
                pid,
                StatusCode::NotVerified,
                "OTPs do not match any nearby counter",
            ),
            Ok(Err(e)) => {
                error!(pid = %pid, "otp policy failed: {e}");
                AuthorityResponse::internal_error(pid)
            }
            Err(e) => {
                error!(pid = %pid, "otp policy panicked: {e}");
                AuthorityResponse::internal_error(pid)
            }
        }
    }

    /// Shared front half of `VERIFY` and `RESYNC`: merge the packet, require a
    /// username and key, and load a stored record whose key matches.
    async fn prepare_check(
        &self,
        flow: &mut Flow,
        packet: &OtpPacket,
    ) -> Result<IdentityRecord, AuthorityResponse> {
        let pid = packet.process_identifier;
        if flow.merge(packet, false).is_err() {
            return Err(AuthorityResponse::outcome(
                pid,
                StatusCode::Error,
                "Username cannot change within a process",
            ));
        }
        let Some(username) = flow.username.clone() else {
            return Err(AuthorityResponse::outcome(
                pid,
                StatusCode::Incomplete,
                "Username missing",
            ));
        };
        let Some(public_key) = flow.public_key.clone() else {
            return Err(AuthorityResponse::outcome(
                pid,
                StatusCode::Incomplete,
                "Public key missing",
            ));
        };

        let record = self
            .load(&username)
            .await
            .map_err(|response| response.at(pid))?
            .ok_or_else(|| AuthorityResponse::outcome(pid, StatusCode::NotFound, "Unknown user"))?;

        if record.public_key != public_key {
            warn!(pid = %pid, user = %username, "public key mismatch");
            return Err(AuthorityResponse::outcome(
                pid,
                StatusCode::NotVerified,
                "Public key does not match",
            ));
        }
        Ok(record)
    }

    async fn load(&self, username: &str) -> Result<Option<IdentityRecord>, InternalError> {
        let store = Arc::clone(&self.store);
        let username = username.to_string();
        match run_blocking(move || store.load(&username)).await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(e)) => {
                error!("identity store load failed: {e}");
                Err(InternalError)
            }
            Err(e) => {
                error!("identity store load panicked: {e}");
                Err(InternalError)
            }
        }
    }

    async fn save(&self, record: IdentityRecord) -> Result<(), InternalError> {
        let store = Arc::clone(&self.store);
        match run_blocking(move || store.save(record)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("identity store save failed: {e}");
                Err(InternalError)
            }
            Err(e) => {
                error!("identity store save panicked: {e}");
                Err(InternalError)
            }
        }
    }
}

/// Marker for a failure already logged; turned into `E_UNKNOWN` at the request's identifier.
struct InternalError;

impl InternalError {
    fn at(self, pid: ProcessIdentifier) -> AuthorityResponse {
        AuthorityResponse::internal_error(pid)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, tokio::task::JoinError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await
}
