//! Coordination control loop: keeps one instance's filter in step with the ring.
//!
//! One task per instance. It registers, list-then-watches the registry for
//! its controller type, recomputes its owned range on every change, and
//! drives the handoff with its neighbours:
//!
//! ```text
//!            register             first range claimed
//!   start ───────────▶ Joining ─────────────────────────▶ Active ◀──┐
//!                                                           │      │ drained, or
//!                                          joiner took part │      │ joiner gone
//!                                                           ▼      │
//!                                                      Rebalancing ┘
//!   lease about to lapse ──▶ Joining (serving nothing)
//!   shutdown / own record deleted ──▶ Terminated
//! ```
//!
//! Handoff rules, as seen by every instance:
//! - A range that shrank keeps being served (record locked) until the
//!   workload signals it is done with the items outside the new range.
//!   Only then the filter shrinks, the record advertises the smaller
//!   `serving` range and unlocks.
//! - A range that grew is claimed as soon as no peer advertises serving
//!   any part of the growth. No lock is taken. The claim is advertised
//!   before the filter widens and re-checked against the registry.
//!
//! - An instance that has not renewed its lease for
//!   [`CoordinatorConfig::fence_after`] stops serving before any peer may
//!   reap it, and only claims again once a renewal succeeds.
//!
//! A filter never serves more than its record advertises, so the filters
//! of live instances never overlap.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fabric_core::{
    ControllerConfig, ControllerInstance, KeyRange, MAX_HEARTBEAT_INTERVAL_SECS, epoch_secs,
};
use fabric_ring::Ring;
use fabric_state::{InstanceEvent, InstanceStore, InstanceWatch};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::error::{ControllerError, ControllerResult};
use crate::filter::PartitionFilter;
use crate::registrar::Registrar;

// ── State ──────────────────────────────────────────────────────────

/// Lifecycle state of a coordinated controller instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Registered, waiting for the previous owner to release the range.
    Joining,
    /// Serving exactly its owned range.
    Active,
    /// Still serving a wider range than it owns, until drained.
    Rebalancing { target: KeyRange },
    /// Stopped serving; the loop has exited.
    Terminated,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Joining => write!(f, "joining"),
            CoordinatorState::Active => write!(f, "active"),
            CoordinatorState::Rebalancing { target } => write!(f, "rebalancing to {target}"),
            CoordinatorState::Terminated => write!(f, "terminated"),
        }
    }
}

// ── Config ─────────────────────────────────────────────────────────

/// Leases are stamped in whole epoch seconds.
const LEASE_CLOCK_SLACK: Duration = Duration::from_secs(1);

/// Runtime settings of a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub controller_type: String,
    pub heartbeat_interval: Duration,
    pub lease_ttl: Duration,
    pub register_retries: u32,
    pub write_retries: u32,
    pub deregister_timeout: Duration,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

impl CoordinatorConfig {
    pub fn new(controller_type: &str) -> Self {
        Self::from(&ControllerConfig::new(controller_type))
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_register_retries(mut self, retries: u32) -> Self {
        self.register_retries = retries;
        self
    }

    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = retries;
        self
    }

    pub fn with_deregister_timeout(mut self, timeout: Duration) -> Self {
        self.deregister_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.retry_backoff_max = max;
        self
    }

    /// Heartbeat period actually used by the loop.
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.clamp(
            Duration::from_millis(1),
            Duration::from_secs(MAX_HEARTBEAT_INTERVAL_SECS),
        )
    }

    /// How long after its last successful lease renewal an instance keeps
    /// serving. Peers reap at `lease_ttl`; this is one heartbeat and one
    /// clock second earlier.
    pub fn fence_after(&self) -> Duration {
        self.lease_ttl
            .saturating_sub(self.heartbeat_period())
            .saturating_sub(LEASE_CLOCK_SLACK)
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_backoff, self.retry_backoff_max)
    }
}

impl From<&ControllerConfig> for CoordinatorConfig {
    fn from(c: &ControllerConfig) -> Self {
        Self {
            controller_type: c.controller_type.clone(),
            heartbeat_interval: Duration::from_secs(c.heartbeat_interval_secs),
            lease_ttl: Duration::from_secs(c.lease_ttl_secs),
            register_retries: c.register_retries,
            write_retries: c.write_retries,
            deregister_timeout: Duration::from_millis(c.deregister_timeout_ms),
            retry_backoff: Duration::from_millis(c.retry_backoff_ms),
            retry_backoff_max: Duration::from_millis(c.retry_backoff_max_ms),
        }
    }
}

// ── Handle ─────────────────────────────────────────────────────────

/// What the workload side of an instance holds on to.
#[derive(Clone)]
pub struct CoordinatorHandle {
    name: String,
    controller_type: String,
    controller_key: i64,
    filter: Arc<PartitionFilter>,
    state: watch::Receiver<CoordinatorState>,
    drained: mpsc::UnboundedSender<KeyRange>,
}

impl CoordinatorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controller_type(&self) -> &str {
        &self.controller_type
    }

    pub fn controller_key(&self) -> i64 {
        self.controller_key
    }

    /// The filter workers consult for every object.
    pub fn filter(&self) -> &Arc<PartitionFilter> {
        &self.filter
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Receiver for state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `pred`. `None` if the loop is gone
    /// without ever reaching such a state.
    pub async fn wait_for_state(
        &self,
        pred: impl FnMut(&CoordinatorState) -> bool,
    ) -> Option<CoordinatorState> {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(pred).await.ok().map(|s| *s);
        reached
    }

    /// Workload signal that nothing outside the shrunk range is still
    /// being processed.
    ///
    /// While rebalancing, returns true and lets the loop finish the
    /// handoff once no claimed item lies outside the new range; returns
    /// false while such items are still in flight. If a worker claims
    /// another such item before the loop gets to it, the handoff completes
    /// when that item finishes, without a second call. In any other state
    /// there is nothing to release: returns true and does nothing.
    pub fn is_done_processing_current_workloads(&self) -> bool {
        match self.state() {
            CoordinatorState::Rebalancing { target } => {
                if self.filter.has_inflight_outside(&target) {
                    debug!(name = %self.name, %target, "drain requested with items in flight");
                    return false;
                }
                // The loop may already be gone; then there is nothing to release.
                let _ = self.drained.send(target);
                true
            }
            _ => true,
        }
    }
}

// ── Control loop ───────────────────────────────────────────────────

/// The control loop of one controller instance.
pub struct Coordinator {
    registrar: Registrar,
    config: CoordinatorConfig,
    /// Own record as last written (or pending, when `dirty`).
    record: ControllerInstance,
    dirty: bool,
    /// Taken just before the last lease write that succeeded.
    lease_renewed: Instant,
    /// Drain acknowledged but blocked by an item claimed afterwards.
    deferred_release: Option<KeyRange>,
    /// Last observed records of the controller type, by name.
    view: BTreeMap<String, ControllerInstance>,
    filter: Arc<PartitionFilter>,
    state: watch::Sender<CoordinatorState>,
}

impl Coordinator {
    /// Register a new instance and spawn its control loop.
    ///
    /// Fails if registration fails; the instance then never serves.
    pub async fn start(
        store: Arc<dyn InstanceStore>,
        config: CoordinatorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> ControllerResult<(CoordinatorHandle, JoinHandle<()>)> {
        let registrar = Registrar::new(store)
            .with_register_retries(config.register_retries)
            .with_backoff(config.retry_backoff, config.retry_backoff_max);
        if config.fence_after() <= config.heartbeat_period() {
            warn!(
                controller_type = %config.controller_type,
                lease_ttl = ?config.lease_ttl,
                heartbeat = ?config.heartbeat_interval,
                "lease ttl leaves no room for a renewal, instance will rarely serve"
            );
        }
        let registering = Instant::now();
        let record = registrar.register(&config.controller_type).await?;

        let filter = Arc::new(PartitionFilter::new());
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Joining);
        let (drained_tx, drained_rx) = mpsc::unbounded_channel();

        let handle = CoordinatorHandle {
            name: record.name.clone(),
            controller_type: record.controller_type.clone(),
            controller_key: record.controller_key,
            filter: filter.clone(),
            state: state_rx,
            drained: drained_tx,
        };

        let coordinator = Coordinator {
            registrar,
            config,
            record,
            dirty: false,
            lease_renewed: registering,
            deferred_release: None,
            view: BTreeMap::new(),
            filter,
            state: state_tx,
        };
        let task = tokio::spawn(coordinator.run(shutdown, drained_rx));
        Ok((handle, task))
    }

    async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut drained: mpsc::UnboundedReceiver<KeyRange>,
    ) {
        let name = self.record.name.clone();
        info!(
            %name,
            controller_type = %self.config.controller_type,
            key = self.record.controller_key,
            "coordination loop starting"
        );

        let mut events = match self.establish(&mut shutdown).await {
            Some(events) => events,
            None => return self.leave().await,
        };
        self.reconcile().await;

        let period = self.config.heartbeat_period();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let filter = self.filter.clone();

        while !self.is_terminated() {
            if *shutdown.borrow() {
                return self.leave().await;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    return self.leave().await;
                }
                event = events.recv() => match event {
                    Some(InstanceEvent::Resync) | None => {
                        events = match self.establish(&mut shutdown).await {
                            Some(events) => events,
                            None => return self.leave().await,
                        };
                    }
                    Some(event) => self.apply(event),
                },
                Some(target) = drained.recv() => {
                    self.on_drained(target).await;
                }
                _ = filter.item_finished(), if self.deferred_release.is_some() => {
                    if let Some(target) = self.deferred_release.take() {
                        self.on_drained(target).await;
                    }
                }
                _ = heartbeat.tick() => {
                    self.on_heartbeat().await;
                }
            }
            self.reconcile().await;
        }

        info!(%name, "coordination loop stopped");
    }

    fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    fn is_terminated(&self) -> bool {
        self.state() == CoordinatorState::Terminated
    }

    fn set_state(&self, next: CoordinatorState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(name = %self.record.name, from = %prev, to = %next, "state changed");
        }
    }

    /// Subscribe, then list. Retries until it succeeds or shutdown.
    async fn establish(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<InstanceWatch> {
        let mut backoff = self.config.backoff();
        loop {
            let events = self.registrar.store().watch(&self.config.controller_type);
            match self.registrar.store().list(&self.config.controller_type) {
                Ok(records) => {
                    self.view = records.into_iter().map(|r| (r.name.clone(), r)).collect();
                    debug!(name = %self.record.name, peers = self.view.len(), "registry view synced");
                    return Some(events);
                }
                Err(e) => {
                    if self.lease_lapsing() {
                        self.fence();
                    }
                    let delay = backoff.next_delay();
                    warn!(name = %self.record.name, error = %e, ?delay, "registry list failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return None,
                    }
                }
            }
        }
    }

    fn apply(&mut self, event: InstanceEvent) {
        match event {
            InstanceEvent::Added(record) | InstanceEvent::Modified(record) => {
                let stale = self
                    .view
                    .get(&record.name)
                    .is_some_and(|known| known.resource_version > record.resource_version);
                if !stale {
                    self.view.insert(record.name.clone(), record);
                }
            }
            InstanceEvent::Deleted(record) => {
                self.view.remove(&record.name);
            }
            InstanceEvent::Resync => {}
        }
    }

    /// Bring the served range in line with the ring as currently observed.
    async fn reconcile(&mut self) {
        if self.is_terminated() {
            return;
        }
        if !self.view.contains_key(&self.record.name) {
            return self.lose_record();
        }
        if self.lease_lapsing() {
            return self.fence();
        }

        let Some(target) = self.owned_range() else {
            return;
        };
        let serving = self.filter.range();
        let releasing = serving.subtract(&target);

        match self.state() {
            CoordinatorState::Terminated => return,
            CoordinatorState::Rebalancing { target: pending } => {
                if !releasing.is_empty() {
                    if pending != target {
                        info!(name = %self.record.name, from = %pending, to = %target, "rebalance target moved");
                        self.set_state(CoordinatorState::Rebalancing { target });
                    }
                    return;
                }
                info!(name = %self.record.name, %serving, "joiner left before drain, rebalance cancelled");
                self.record.is_locked = false;
                self.persist().await;
                if self.is_terminated() {
                    return;
                }
                self.set_state(CoordinatorState::Active);
            }
            CoordinatorState::Joining | CoordinatorState::Active => {
                if !releasing.is_empty() {
                    info!(
                        name = %self.record.name,
                        %serving,
                        %target,
                        "range shrinking, locking until drained"
                    );
                    self.record.is_locked = true;
                    self.persist().await;
                    if self.is_terminated() {
                        return;
                    }
                    self.set_state(CoordinatorState::Rebalancing { target });
                    return;
                }
            }
        }

        // Nothing to release: serving lies inside target.
        let claiming = target.subtract(&serving);
        if !claiming.is_empty() && self.claim(serving, target, &claiming).await {
            info!(name = %self.record.name, from = %serving, to = %target, "range claimed");
        }

        if self.state() == CoordinatorState::Joining && !self.filter.range().is_empty() {
            self.set_state(CoordinatorState::Active);
        }
    }

    fn owned_range(&self) -> Option<KeyRange> {
        let key = self.record.controller_key;
        match Ring::from_instances(self.view.values()).and_then(|r| r.owned_range(key)) {
            Ok(target) => Some(target),
            Err(e) => {
                error!(name = %self.record.name, error = %e, "cannot compute owned range");
                None
            }
        }
    }

    /// Widen from `serving` to `target`.
    ///
    /// The wider range is advertised first and the registry re-read
    /// afterwards; the filter only widens if no peer advertises any part of
    /// the claim at that point. Of two instances claiming overlapping
    /// ranges at once, at least one sees the other and backs off.
    async fn claim(&mut self, serving: KeyRange, target: KeyRange, claiming: &[KeyRange]) -> bool {
        if let Some(holder) = self.peer_serving(claiming) {
            debug!(
                name = %self.record.name,
                %target,
                holder = %holder.name,
                holder_serving = %holder.serving,
                "waiting for peer to release range"
            );
            return false;
        }

        if self.record.serving != target {
            self.record.serving = target;
            self.persist().await;
        }
        if self.dirty || self.is_terminated() {
            // Not advertised yet; the heartbeat flush re-triggers the claim.
            return false;
        }

        match self.registrar.store().list(&self.config.controller_type) {
            Ok(records) => {
                self.view = records.into_iter().map(|r| (r.name.clone(), r)).collect();
            }
            Err(e) => {
                warn!(name = %self.record.name, error = %e, "cannot verify claim, retrying later");
                return false;
            }
        }
        if !self.view.contains_key(&self.record.name) {
            self.lose_record();
            return false;
        }

        let contended = self.peer_serving(claiming).map(|p| p.name.clone());
        if contended.is_some() || self.owned_range() != Some(target) {
            info!(
                name = %self.record.name,
                %target,
                contended_by = ?contended,
                "claim contended, backing off"
            );
            self.record.serving = if serving.is_empty() {
                KeyRange::empty_at(self.record.controller_key)
            } else {
                serving
            };
            self.persist().await;
            return false;
        }

        if self.lease_lapsing() {
            debug!(name = %self.record.name, %target, "lease too old to widen");
            return false;
        }
        self.filter.update_range(target);
        true
    }

    /// First peer that advertises serving any part of `ranges`.
    fn peer_serving(&self, ranges: &[KeyRange]) -> Option<&ControllerInstance> {
        self.view
            .values()
            .filter(|p| p.name != self.record.name)
            .find(|p| ranges.iter().any(|r| p.serving.intersects(r)))
    }

    async fn on_drained(&mut self, signalled: KeyRange) {
        let CoordinatorState::Rebalancing { target } = self.state() else {
            return;
        };
        if signalled != target {
            debug!(name = %self.record.name, %signalled, %target, "ignoring drain for an older target");
            return;
        }
        let serving = self.filter.range();
        let keep = serving.intersection(&target);
        if !self.filter.release_to(keep) {
            debug!(name = %self.record.name, %keep, "items still in flight, handoff deferred");
            self.deferred_release = Some(signalled);
            return;
        }
        self.deferred_release = None;
        info!(name = %self.record.name, from = %serving, to = %keep, "range released");
        // Filter first, then the record: peers only claim what we advertise as free.
        self.record.serving = keep;
        self.record.is_locked = false;
        self.persist().await;
        if self.is_terminated() {
            return;
        }
        self.set_state(CoordinatorState::Active);
    }

    async fn on_heartbeat(&mut self) {
        let renewing = Instant::now();
        match self.registrar.renew_lease(&self.record) {
            Ok(stored) => {
                self.lease_renewed = renewing;
                self.stored(stored);
            }
            Err(ControllerError::NotRegistered(_)) => return self.lose_record(),
            Err(e) => {
                warn!(name = %self.record.name, error = %e, "lease renewal failed");
                self.dirty = true;
            }
        }

        match self.registrar.reap_expired(
            &self.config.controller_type,
            self.config.lease_ttl,
            &self.record.name,
        ) {
            Ok(reaped) => {
                for name in reaped {
                    self.view.remove(&name);
                }
            }
            Err(e) => warn!(name = %self.record.name, error = %e, "lease reaping failed"),
        }

        if let Some(target) = self.deferred_release.take() {
            self.on_drained(target).await;
        }
    }

    fn lease_lapsing(&self) -> bool {
        self.lease_renewed.elapsed() >= self.config.fence_after()
    }

    /// Lease renewals keep failing: stop serving before peers may reap us.
    ///
    /// The record is rewritten as serving nothing with the next successful
    /// renewal; the ring is then claimed again as by a joiner.
    fn fence(&mut self) {
        if self.state() == CoordinatorState::Joining && self.filter.range().is_empty() {
            return;
        }
        warn!(
            name = %self.record.name,
            serving = %self.filter.range(),
            since_renewal = ?self.lease_renewed.elapsed(),
            "lease about to lapse, no longer serving"
        );
        self.filter.update_range(KeyRange::empty_at(0));
        self.record.serving = KeyRange::empty_at(self.record.controller_key);
        self.record.is_locked = false;
        self.dirty = true;
        self.deferred_release = None;
        self.set_state(CoordinatorState::Joining);
    }

    /// Write the own record, retrying transient failures a bounded number
    /// of times. Whatever is left is flushed by the next heartbeat.
    async fn persist(&mut self) {
        let mut backoff = self.config.backoff();
        let attempts = self.config.write_retries.max(1);
        for attempt in 1..=attempts {
            match self.registrar.update_own(&self.record) {
                Ok(stored) => return self.stored(stored),
                Err(ControllerError::NotRegistered(_)) => return self.lose_record(),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = backoff.next_delay();
                    warn!(name = %self.record.name, attempt, error = %e, ?delay, "record write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(name = %self.record.name, error = %e, "record write deferred to next heartbeat");
                    break;
                }
            }
        }
        self.dirty = true;
    }

    fn stored(&mut self, stored: ControllerInstance) {
        if self.dirty {
            debug!(name = %stored.name, "pending record write flushed");
        }
        self.dirty = false;
        self.view.insert(stored.name.clone(), stored.clone());
        self.record = stored;
    }

    /// Own record vanished (reaped or deleted by an operator): stop serving.
    fn lose_record(&mut self) {
        warn!(name = %self.record.name, "own record deleted, terminating");
        self.filter.update_range(KeyRange::empty_at(0));
        self.set_state(CoordinatorState::Terminated);
    }

    /// Stop serving, then deregister, bounded by the deregister timeout.
    async fn leave(mut self) {
        self.filter.update_range(KeyRange::empty_at(0));
        self.record.serving = KeyRange::empty_at(self.record.controller_key);

        let registrar = self.registrar.clone();
        let name = self.record.name.clone();
        let mut backoff = self.config.backoff();
        let attempt = async {
            loop {
                let registrar = registrar.clone();
                let target = name.clone();
                match tokio::task::spawn_blocking(move || registrar.deregister(&target)).await {
                    Ok(Ok(_)) => return Ok(()),
                    Ok(Err(e)) if e.is_transient() => {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                    Ok(Err(e)) => return Err(e.to_string()),
                    Err(e) => return Err(e.to_string()),
                }
            }
        };
        match tokio::time::timeout(self.config.deregister_timeout, attempt).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%name, error = %e, "deregistration failed"),
            Err(_) => warn!(
                %name,
                timeout = ?self.config.deregister_timeout,
                last_heartbeat = self.record.last_heartbeat,
                now = epoch_secs(),
                "deregistration timed out, record left to lease expiry"
            ),
        }
        self.set_state(CoordinatorState::Terminated);
        info!(%name, "coordination loop stopped");
    }
}
