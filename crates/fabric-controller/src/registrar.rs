//! Instance registrar: joins and leaves the registry of a controller type.
//!
//! Registration lists the live instances of the type, derives the joiner's
//! ring key from their keys, and creates the record. Two instances racing
//! for the same key are serialized by the store's uniqueness check; the
//! loser re-lists and tries again.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fabric_core::{ControllerInstance, epoch_secs};
use fabric_ring::{RingError, assign_new_key};
use fabric_state::{InstanceStore, StateError};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{ControllerError, ControllerResult};

/// Registers, renews and removes controller instance records.
#[derive(Clone)]
pub struct Registrar {
    store: Arc<dyn InstanceStore>,
    register_retries: u32,
    retry_backoff: Duration,
    retry_backoff_max: Duration,
}

impl Registrar {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            register_retries: 5,
            retry_backoff: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(5),
        }
    }

    /// Set how many create attempts registration makes before giving up.
    pub fn with_register_retries(mut self, retries: u32) -> Self {
        self.register_retries = retries.max(1);
        self
    }

    /// Set the retry backoff bounds for transient store failures.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.retry_backoff_max = max;
        self
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    /// Join the ring of `controller_type`.
    ///
    /// Returns the created record: unlocked, serving nothing yet, with a
    /// fresh lease.
    pub async fn register(&self, controller_type: &str) -> ControllerResult<ControllerInstance> {
        let mut backoff = Backoff::new(self.retry_backoff, self.retry_backoff_max);
        let mut conflicted_key: Option<i64> = None;
        let mut last_unavailable: Option<StateError> = None;

        for attempt in 1..=self.register_retries {
            let peers = match self.store.list(controller_type) {
                Ok(peers) => peers,
                Err(e) if e.is_transient() => {
                    warn!(%controller_type, attempt, error = %e, "registry list failed, retrying");
                    last_unavailable = Some(e);
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let keys: BTreeSet<i64> = peers.iter().map(|p| p.controller_key).collect();
            let key = assign_new_key(&keys)?;
            if conflicted_key == Some(key) {
                // The store refused this key but the view does not explain why.
                return Err(RingError::DuplicateKey(key).into());
            }

            let record = ControllerInstance::new(
                &generate_instance_name(controller_type),
                controller_type,
                key,
            );
            match self.store.create(&record) {
                Ok(created) => {
                    info!(
                        name = %created.name,
                        %controller_type,
                        key,
                        peers = peers.len(),
                        "controller instance registered"
                    );
                    return Ok(created);
                }
                Err(e) if e.is_conflict() => {
                    debug!(%controller_type, key, attempt, error = %e, "registration conflict");
                    conflicted_key = Some(key);
                    last_unavailable = None;
                }
                Err(e) if e.is_transient() => {
                    warn!(%controller_type, attempt, error = %e, "registry create failed, retrying");
                    last_unavailable = Some(e);
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        match last_unavailable {
            Some(e) => Err(ControllerError::StoreUnavailable(e)),
            None => Err(ControllerError::RegistrationConflict {
                controller_type: controller_type.to_string(),
                attempts: self.register_retries,
            }),
        }
    }

    /// Delete an instance record. Returns false if it was already gone.
    pub fn deregister(&self, name: &str) -> ControllerResult<bool> {
        let existed = self.store.delete(name)?;
        if existed {
            info!(%name, "controller instance deregistered");
        }
        Ok(existed)
    }

    /// Live instances of a type, anchor first (key descending).
    pub fn list_peers(&self, controller_type: &str) -> ControllerResult<Vec<ControllerInstance>> {
        let mut peers = self.store.list(controller_type)?;
        peers.sort_by(|a, b| b.controller_key.cmp(&a.controller_key));
        Ok(peers)
    }

    /// Persist a new revision of an instance's own record.
    ///
    /// Only the owning instance writes its record, so a version conflict
    /// means our cached version is stale; it is refreshed once and retried.
    pub fn update_own(&self, record: &ControllerInstance) -> ControllerResult<ControllerInstance> {
        match self.store.update(record, record.resource_version) {
            Ok(updated) => Ok(updated),
            Err(StateError::NotFound(_)) => Err(ControllerError::NotRegistered(record.name.clone())),
            Err(StateError::Conflict(reason)) => {
                let current = self
                    .store
                    .get(&record.name)?
                    .ok_or_else(|| ControllerError::NotRegistered(record.name.clone()))?;
                debug!(name = %record.name, %reason, "refreshing stale record version");
                match self.store.update(record, current.resource_version) {
                    Err(StateError::NotFound(_)) => {
                        Err(ControllerError::NotRegistered(record.name.clone()))
                    }
                    other => Ok(other?),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh the lease of an instance's own record.
    pub fn renew_lease(&self, record: &ControllerInstance) -> ControllerResult<ControllerInstance> {
        let mut renewed = record.clone();
        renewed.last_heartbeat = epoch_secs();
        self.update_own(&renewed)
    }

    /// Delete peers of `controller_type` whose lease is older than `ttl`.
    ///
    /// The caller's own record is never reaped. A peer whose record was
    /// written after it was listed (a renewal racing the reaper) survives.
    /// Returns the reaped names.
    pub fn reap_expired(
        &self,
        controller_type: &str,
        ttl: Duration,
        self_name: &str,
    ) -> ControllerResult<Vec<String>> {
        let now = epoch_secs();
        let mut reaped = Vec::new();
        for peer in self.store.list(controller_type)? {
            if peer.name == self_name || !peer.lease_expired(now, ttl) {
                continue;
            }
            match self.store.delete_at_version(&peer.name, peer.resource_version) {
                Ok(true) => {
                    warn!(
                        name = %peer.name,
                        key = peer.controller_key,
                        last_heartbeat = peer.last_heartbeat,
                        "reaped controller instance with expired lease"
                    );
                    reaped.push(peer.name);
                }
                Ok(false) => {}
                Err(e) if e.is_conflict() => {
                    debug!(name = %peer.name, "lease renewed while reaping, kept");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(reaped)
    }
}

/// Unique instance name: `{type}-{16 hex}`.
///
/// Derived from the process id, the wall clock and a process-local
/// counter, so names are never reused across restarts.
pub fn generate_instance_name(controller_type: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_be_bytes());
    hasher.update(nanos.to_be_bytes());
    hasher.update(counter.to_be_bytes());
    let digest = hasher.finalize();

    format!("{controller_type}-{}", hex::encode(&digest[..8]))
}
