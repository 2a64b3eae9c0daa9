use super::store::OtpSecret;
use crate::packet::{DataItem, KeyData, OtpPacket, ProcessIdentifier};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Transient state of one authentication flow, accumulated across packets.
#[derive(Debug)]
pub struct Flow {
    pub username: Option<String>,
    pub public_key: Option<KeyData>,
    pub seed: Option<OtpSecret>,
    /// Number of requests applied to this flow.
    pub revision: u64,
    last_seen: Instant,
}

/// The username of a flow is fixed by the first packet that names one.
#[derive(Debug, PartialEq, Eq)]
pub struct UsernameConflict;

impl Flow {
    fn new() -> Self {
        Self {
            username: None,
            public_key: None,
            seed: None,
            revision: 0,
            last_seen: Instant::now(),
        }
    }

    /// Record one applied request.
    pub fn touch(&mut self) {
        self.revision += 1;
        self.last_seen = Instant::now();
    }

    /// Merge the data items of `packet`. Seeds are only taken when `with_seed` is set.
    ///
    /// # Errors
    /// Returns [`UsernameConflict`] if the packet names a different user than the flow.
    pub fn merge(&mut self, packet: &OtpPacket, with_seed: bool) -> Result<(), UsernameConflict> {
        if let (Some(current), Some(name)) = (self.username.as_deref(), packet.username()) {
            if current != name {
                return Err(UsernameConflict);
            }
        }

        for item in &packet.data_items {
            match item {
                DataItem::Username(name) => self.username = Some(name.clone()),
                DataItem::Key(key) if !key.is_none() => self.public_key = Some(key.clone()),
                DataItem::Seed(seed) if with_seed => self.seed = Some(OtpSecret::new(seed.clone())),
                DataItem::Key(_) | DataItem::Seed(_) | DataItem::Otp(_) => {}
            }
        }
        Ok(())
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// All live flows. Each flow has its own lock; the table lock is held only to
/// look up, insert or evict entries.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: RwLock<HashMap<ProcessIdentifier, Arc<Mutex<Flow>>>>,
}

impl FlowTable {
    pub fn insert(&self, pid: ProcessIdentifier) {
        self.flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, Arc::new(Mutex::new(Flow::new())));
    }

    #[must_use]
    pub fn get(&self, pid: ProcessIdentifier) -> Option<Arc<Mutex<Flow>>> {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop flows idle for `ttl` or longer. Flows currently locked by a request
    /// are in use and always kept.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<ProcessIdentifier> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|pid, flow| {
                let expired = flow
                    .try_lock()
                    .is_ok_and(|flow| flow.idle_for(now) >= ttl);
                if expired {
                    evicted.push(*pid);
                }
                !expired
            });
        evicted
    }
}
