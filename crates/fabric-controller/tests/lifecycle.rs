//! Multi-instance coordination tests.
//!
//! Every test runs several coordinators in-process against one in-memory
//! registry and drives the join/leave handshake end to end: registration,
//! range claims, lock-and-drain on shrink, lock-free widening on removal,
//! lease reaping and fencing, and registry failures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use fabric_controller::{
    ControllerError, Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorState,
};
use fabric_core::{ControllerInstance, KeyRange, MAX_CONTROLLER_KEY, epoch_secs};
use fabric_ring::{verify_tiling, workload_hash};
use fabric_state::{InstanceEvent, InstanceStore, InstanceWatch, StateError, StateResult, StateStore};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const TYPE: &str = "replicaset";

// ── Harness ────────────────────────────────────────────────────────

struct Node {
    handle: CoordinatorHandle,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    fn name(&self) -> &str {
        self.handle.name()
    }

    fn state(&self) -> CoordinatorState {
        self.handle.state()
    }

    fn range(&self) -> KeyRange {
        self.handle.filter().range()
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("coordination loop exits on shutdown")
            .expect("coordination loop does not panic");
    }
}

/// Heartbeats far apart so only handshake writes hit the registry.
fn quiet_config() -> CoordinatorConfig {
    CoordinatorConfig::new(TYPE)
        .with_heartbeat_interval(Duration::from_secs(3600))
        .with_lease_ttl(Duration::from_secs(10_800))
        .with_backoff(Duration::from_millis(1), Duration::from_millis(10))
        .with_deregister_timeout(Duration::from_millis(500))
}

fn shared(store: &StateStore) -> Arc<dyn InstanceStore> {
    Arc::new(store.clone())
}

async fn start(store: Arc<dyn InstanceStore>, config: CoordinatorConfig) -> Node {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (handle, task) = Coordinator::start(store, config, shutdown_rx)
        .await
        .expect("registration succeeds");
    Node {
        handle,
        task,
        shutdown,
    }
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Drain whoever is rebalancing until every node is active and the
/// filters tile the key space.
async fn settle(nodes: &[&Node]) {
    wait_for("nodes to settle", || {
        let mut settled = true;
        for node in nodes {
            match node.state() {
                CoordinatorState::Active => {}
                CoordinatorState::Rebalancing { .. } => {
                    node.handle.is_done_processing_current_workloads();
                    settled = false;
                }
                _ => settled = false,
            }
        }
        let ranges: Vec<KeyRange> = nodes.iter().map(|n| n.range()).collect();
        settled && verify_tiling(&ranges).is_ok()
    })
    .await;
}

fn record(store: &StateStore, name: &str) -> ControllerInstance {
    store
        .get_instance(name)
        .unwrap()
        .unwrap_or_else(|| panic!("record {name} exists"))
}

fn assert_disjoint(records: &[ControllerInstance]) {
    for (i, a) in records.iter().enumerate() {
        for b in &records[i + 1..] {
            assert!(
                !a.serving.intersects(&b.serving),
                "{} serves {} and {} serves {}",
                a.name,
                a.serving,
                b.name,
                b.serving
            );
        }
    }
}

/// First object id whose hash satisfies `pred`.
fn object_where(pred: impl Fn(i64) -> bool) -> String {
    (0..10_000)
        .map(|i| format!("default/rs-{i}"))
        .find(|id| pred(workload_hash(id)))
        .expect("some object id matches")
}

/// Collect whatever the watch has buffered.
async fn drain_events(events: &mut InstanceWatch) -> Vec<InstanceEvent> {
    let mut out = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(100), events.recv()).await
    {
        out.push(event);
    }
    out
}

// ── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn single_instance_takes_anchor_and_whole_ring() {
    let store = StateStore::open_in_memory().unwrap();
    let a = start(shared(&store), quiet_config()).await;

    assert_eq!(a.handle.controller_key(), MAX_CONTROLLER_KEY);
    wait_for("anchor active", || a.state() == CoordinatorState::Active).await;

    let rec = record(&store, a.name());
    assert_eq!(rec.controller_key, MAX_CONTROLLER_KEY);
    assert!(!rec.is_locked);
    assert_eq!(rec.serving, KeyRange::FULL);
    assert_eq!(a.range(), KeyRange::FULL);
    assert!(a.handle.filter().contains("default/frontend"));

    a.stop().await;
    assert!(store.list_instances(TYPE).unwrap().is_empty());
}

#[tokio::test]
async fn second_instance_waits_for_anchor_to_drain() {
    let store = StateStore::open_in_memory().unwrap();
    let a = start(shared(&store), quiet_config()).await;
    wait_for("anchor active", || a.state() == CoordinatorState::Active).await;

    let b = start(shared(&store), quiet_config()).await;
    let k2 = b.handle.controller_key();
    assert!(k2 > 0 && k2 < MAX_CONTROLLER_KEY);
    assert_eq!(record(&store, a.name()).controller_key, MAX_CONTROLLER_KEY);

    wait_for("anchor locks", || {
        matches!(a.state(), CoordinatorState::Rebalancing { .. })
    })
    .await;
    assert!(record(&store, a.name()).is_locked);
    assert_eq!(
        a.state(),
        CoordinatorState::Rebalancing {
            target: KeyRange::new(k2, MAX_CONTROLLER_KEY)
        }
    );

    // Still the anchor's until it drains.
    assert_eq!(a.range(), KeyRange::FULL);
    assert_eq!(b.state(), CoordinatorState::Joining);
    assert!(b.range().is_empty());
    assert_disjoint(&store.list_instances(TYPE).unwrap());

    assert!(a.handle.is_done_processing_current_workloads());
    wait_for("joiner active", || b.state() == CoordinatorState::Active).await;
    wait_for("anchor unlocked", || !record(&store, a.name()).is_locked).await;

    assert_eq!(a.state(), CoordinatorState::Active);
    assert_eq!(a.range(), KeyRange::new(k2, MAX_CONTROLLER_KEY));
    assert_eq!(b.range(), KeyRange::new(0, k2));
    verify_tiling(&[a.range(), b.range()]).unwrap();

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn third_instance_splits_the_lowest_range() {
    let store = StateStore::open_in_memory().unwrap();
    let a = start(shared(&store), quiet_config()).await;
    let b = start(shared(&store), quiet_config()).await;
    settle(&[&a, &b]).await;
    let k2 = b.handle.controller_key();

    let c = start(shared(&store), quiet_config()).await;
    let k3 = c.handle.controller_key();
    assert_ne!(k3, k2);
    assert!(k3 < MAX_CONTROLLER_KEY && k3 > 0);

    wait_for("k2 holder locks", || {
        matches!(b.state(), CoordinatorState::Rebalancing { .. })
    })
    .await;
    assert!(record(&store, b.name()).is_locked);
    assert!(!record(&store, a.name()).is_locked);
    assert_eq!(a.state(), CoordinatorState::Active);

    assert!(b.handle.is_done_processing_current_workloads());
    settle(&[&a, &b, &c]).await;
    wait_for("k2 holder unlocked", || !record(&store, b.name()).is_locked).await;

    assert_eq!(a.range(), KeyRange::new(k2, MAX_CONTROLLER_KEY));
    assert_eq!(b.range(), KeyRange::new(k3, k2));
    assert_eq!(c.range(), KeyRange::new(0, k3));

    let records = store.list_instances(TYPE).unwrap();
    assert!(records.iter().all(|r| !r.is_locked));
    assert_disjoint(&records);

    for node in [c, b, a] {
        node.stop().await;
    }
}

#[tokio::test]
async fn removal_retiles_without_locking() {
    let store = StateStore::open_in_memory().unwrap();
    let a = start(shared(&store), quiet_config()).await;
    let b = start(shared(&store), quiet_config()).await;
    settle(&[&a, &b]).await;
    let c = start(shared(&store), quiet_config()).await;
    settle(&[&a, &b, &c]).await;
    let k3 = c.handle.controller_key();

    let mut events = store.watch_instances(TYPE);
    b.stop().await;
    settle(&[&a, &c]).await;

    assert_eq!(a.range(), KeyRange::new(k3, MAX_CONTROLLER_KEY));
    assert_eq!(c.range(), KeyRange::new(0, k3));

    let events = drain_events(&mut events).await;
    assert!(events.iter().any(|e| matches!(e, InstanceEvent::Deleted(_))));
    for event in &events {
        if let Some(rec) = event.record() {
            assert!(!rec.is_locked, "unexpected lock on {}", rec.name);
        }
    }

    c.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn anchor_removal_hands_top_of_ring_to_survivor() {
    let store = StateStore::open_in_memory().unwrap();
    let a = start(shared(&store), quiet_config()).await;
    let b = start(shared(&store), quiet_config()).await;
    settle(&[&a, &b]).await;

    a.stop().await;
    settle(&[&b]).await;
    assert_eq!(b.range(), KeyRange::FULL);
    assert_eq!(record(&store, b.name()).serving, KeyRange::FULL);

    // A newcomer still bisects below the survivor's key.
    let c = start(shared(&store), quiet_config()).await;
    assert_eq!(c.handle.controller_key(), b.handle.controller_key() / 2);
    settle(&[&b, &c]).await;

    c.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn repeated_drain_signals_write_nothing() {
    let store = StateStore::open_in_memory().unwrap();
    let a = start(shared(&store), quiet_config()).await;
    let b = start(shared(&store), quiet_config()).await;
    settle(&[&a, &b]).await;

    let version = record(&store, a.name()).resource_version;
    for _ in 0..5 {
        assert!(a.handle.is_done_processing_current_workloads());
        assert!(b.handle.is_done_processing_current_workloads());
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(record(&store, a.name()).resource_version, version);
    assert_eq!(a.state(), CoordinatorState::Active);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn handoff_waits_for_inflight_items() {
    let store = StateStore::open_in_memory().unwrap();
    let a = start(shared(&store), quiet_config()).await;
    wait_for("anchor active", || a.state() == CoordinatorState::Active).await;

    // The joiner will take (0, MAX / 2].
    let low = object_where(|h| h <= MAX_CONTROLLER_KEY / 2);
    let guard = a.handle.filter().begin(&low).expect("anchor owns everything");

    let b = start(shared(&store), quiet_config()).await;
    assert_eq!(b.handle.controller_key(), MAX_CONTROLLER_KEY / 2);
    wait_for("anchor locks", || {
        matches!(a.state(), CoordinatorState::Rebalancing { .. })
    })
    .await;

    assert!(!a.handle.is_done_processing_current_workloads());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.state(), CoordinatorState::Joining);
    assert!(a.handle.filter().contains(&low));

    drop(guard);
    assert!(a.handle.is_done_processing_current_workloads());
    settle(&[&a, &b]).await;
    assert!(!a.handle.filter().contains(&low));
    assert!(b.handle.filter().contains(&low));

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn joiner_leaving_before_drain_cancels_rebalance() {
    let store = StateStore::open_in_memory().unwrap();
    let a = start(shared(&store), quiet_config()).await;
    wait_for("anchor active", || a.state() == CoordinatorState::Active).await;

    let b = start(shared(&store), quiet_config()).await;
    wait_for("anchor locks", || {
        matches!(a.state(), CoordinatorState::Rebalancing { .. })
    })
    .await;

    b.stop().await;
    wait_for("anchor back to active", || a.state() == CoordinatorState::Active).await;
    wait_for("anchor unlocked", || !record(&store, a.name()).is_locked).await;
    assert_eq!(a.range(), KeyRange::FULL);
    assert_eq!(record(&store, a.name()).serving, KeyRange::FULL);

    a.stop().await;
}

#[tokio::test]
async fn deleted_own_record_stops_serving() {
    let store = StateStore::open_in_memory().unwrap();
    let a = start(shared(&store), quiet_config()).await;
    wait_for("anchor active", || a.state() == CoordinatorState::Active).await;

    assert!(store.delete_instance(a.name()).unwrap());
    wait_for("terminated", || a.state() == CoordinatorState::Terminated).await;
    assert!(a.range().is_empty());
    assert!(!a.handle.filter().contains("default/frontend"));

    tokio::time::timeout(Duration::from_secs(5), a.task)
        .await
        .expect("loop exits after losing its record")
        .unwrap();
}

#[tokio::test]
async fn expired_peer_is_reaped_and_its_range_reclaimed() {
    let store = StateStore::open_in_memory().unwrap();

    // A crashed anchor: still advertises the whole ring, lease long gone.
    let mut ghost = ControllerInstance::new("replicaset-crashed", TYPE, MAX_CONTROLLER_KEY);
    ghost.serving = KeyRange::FULL;
    ghost.last_heartbeat = epoch_secs() - 1_000;
    store.create_instance(&ghost).unwrap();

    let config = quiet_config()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_lease_ttl(Duration::from_secs(2));
    let a = start(shared(&store), config).await;
    assert_eq!(a.handle.controller_key(), MAX_CONTROLLER_KEY / 2);

    wait_for("survivor active", || a.state() == CoordinatorState::Active).await;
    assert!(store.get_instance("replicaset-crashed").unwrap().is_none());
    assert_eq!(a.range(), KeyRange::FULL);

    a.stop().await;
}

#[tokio::test]
async fn item_claimed_after_drain_signal_completes_handoff_when_done() {
    let store = StateStore::open_in_memory().unwrap();
    let a = start(shared(&store), quiet_config()).await;
    wait_for("anchor active", || a.state() == CoordinatorState::Active).await;

    let low = object_where(|h| h <= MAX_CONTROLLER_KEY / 2);
    let b = start(shared(&store), quiet_config()).await;
    wait_for("anchor locks", || {
        matches!(a.state(), CoordinatorState::Rebalancing { .. })
    })
    .await;

    // Nothing in flight when signalled, but a worker claims one more item
    // before the loop acts on the signal.
    assert!(a.handle.is_done_processing_current_workloads());
    let guard = a.handle.filter().begin(&low).expect("served until released");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(a.state(), CoordinatorState::Rebalancing { .. }));
    assert_eq!(b.state(), CoordinatorState::Joining);

    // No second signal: finishing the item is enough.
    drop(guard);
    wait_for("handoff completes", || {
        a.state() == CoordinatorState::Active && b.state() == CoordinatorState::Active
    })
    .await;
    assert!(!a.handle.filter().contains(&low));
    assert!(b.handle.filter().contains(&low));

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn heartbeat_renews_lease() {
    let store = StateStore::open_in_memory().unwrap();
    let config = quiet_config().with_heartbeat_interval(Duration::from_millis(20));
    let a = start(shared(&store), config).await;
    wait_for("anchor active", || a.state() == CoordinatorState::Active).await;

    let version = record(&store, a.name()).resource_version;
    wait_for("lease renewed", || {
        record(&store, a.name()).resource_version > version
    })
    .await;
    assert!(record(&store, a.name()).last_heartbeat + 5 >= epoch_secs());

    a.stop().await;
}

#[tokio::test]
async fn oversized_heartbeat_interval_is_clamped() {
    let store = StateStore::open_in_memory().unwrap();
    let config = quiet_config()
        .with_heartbeat_interval(Duration::MAX)
        .with_lease_ttl(Duration::MAX);
    let a = start(shared(&store), config).await;
    wait_for("anchor active", || a.state() == CoordinatorState::Active).await;
    assert_eq!(a.range(), KeyRange::FULL);
    a.stop().await;
}

#[tokio::test]
async fn advertised_ranges_never_overlap_under_churn() {
    let store = StateStore::open_in_memory().unwrap().with_watch_capacity(4096);
    let mut events = store.watch_instances(TYPE);

    let a = start(shared(&store), quiet_config()).await;
    let b = start(shared(&store), quiet_config()).await;
    settle(&[&a, &b]).await;
    let c = start(shared(&store), quiet_config()).await;
    settle(&[&a, &b, &c]).await;
    let d = start(shared(&store), quiet_config()).await;
    settle(&[&a, &b, &c, &d]).await;

    a.stop().await;
    settle(&[&b, &c, &d]).await;
    c.stop().await;
    settle(&[&b, &d]).await;
    let e = start(shared(&store), quiet_config()).await;
    settle(&[&b, &d, &e]).await;

    let mut view: BTreeMap<String, ControllerInstance> = BTreeMap::new();
    let history = drain_events(&mut events).await;
    assert!(!history.iter().any(|e| matches!(e, InstanceEvent::Resync)));
    for event in history {
        match event {
            InstanceEvent::Added(r) | InstanceEvent::Modified(r) => {
                view.insert(r.name.clone(), r);
            }
            InstanceEvent::Deleted(r) => {
                view.remove(&r.name);
            }
            InstanceEvent::Resync => unreachable!(),
        }
        let records: Vec<ControllerInstance> = view.values().cloned().collect();
        assert_disjoint(&records);
    }

    let records = store.list_instances(TYPE).unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| !r.is_locked));
    let ranges: Vec<KeyRange> = records.iter().map(|r| r.serving).collect();
    verify_tiling(&ranges).unwrap();

    for node in [e, d, b] {
        node.stop().await;
    }
}

// ── Registry failures ──────────────────────────────────────────────

/// Registry wrapper that injects failures and racing registrations.
struct FlakyStore {
    inner: StateStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Creates that lose the race to a phantom instance taking the same key.
    racing_creates: AtomicU32,
}

impl FlakyStore {
    fn new(inner: StateStore) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            racing_creates: AtomicU32::new(0),
        }
    }

    fn check_writes(&self) -> StateResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StateError::Write("injected write failure".into()));
        }
        Ok(())
    }
}

impl InstanceStore for FlakyStore {
    fn list(&self, controller_type: &str) -> StateResult<Vec<ControllerInstance>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StateError::Unavailable("injected read failure".into()));
        }
        self.inner.list_instances(controller_type)
    }

    fn get(&self, name: &str) -> StateResult<Option<ControllerInstance>> {
        self.inner.get_instance(name)
    }

    fn create(&self, record: &ControllerInstance) -> StateResult<ControllerInstance> {
        self.check_writes()?;
        let race = self
            .racing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if race {
            let racer = ControllerInstance::new(
                &format!("racer-{}", record.controller_key),
                &record.controller_type,
                record.controller_key,
            );
            self.inner.create_instance(&racer)?;
        }
        self.inner.create_instance(record)
    }

    fn update(
        &self,
        record: &ControllerInstance,
        expected_version: u64,
    ) -> StateResult<ControllerInstance> {
        self.check_writes()?;
        self.inner.update_instance(record, expected_version)
    }

    fn delete(&self, name: &str) -> StateResult<bool> {
        self.check_writes()?;
        self.inner.delete_instance(name)
    }

    fn delete_at_version(&self, name: &str, expected_version: u64) -> StateResult<bool> {
        self.check_writes()?;
        self.inner.delete_instance_at_version(name, expected_version)
    }

    fn watch(&self, controller_type: &str) -> InstanceWatch {
        self.inner.watch_instances(controller_type)
    }
}

/// One instance's path to the registry, which can be severed entirely:
/// reads and writes fail and its watch stream goes silent.
struct SeveredStore {
    inner: StateStore,
    cut: Arc<AtomicBool>,
}

impl SeveredStore {
    fn reachable(&self) -> StateResult<()> {
        if self.cut.load(Ordering::SeqCst) {
            return Err(StateError::Unavailable("registry unreachable".into()));
        }
        Ok(())
    }
}

impl InstanceStore for SeveredStore {
    fn list(&self, controller_type: &str) -> StateResult<Vec<ControllerInstance>> {
        self.reachable()?;
        self.inner.list_instances(controller_type)
    }

    fn get(&self, name: &str) -> StateResult<Option<ControllerInstance>> {
        self.reachable()?;
        self.inner.get_instance(name)
    }

    fn create(&self, record: &ControllerInstance) -> StateResult<ControllerInstance> {
        self.reachable()?;
        self.inner.create_instance(record)
    }

    fn update(
        &self,
        record: &ControllerInstance,
        expected_version: u64,
    ) -> StateResult<ControllerInstance> {
        self.reachable()?;
        self.inner.update_instance(record, expected_version)
    }

    fn delete(&self, name: &str) -> StateResult<bool> {
        self.reachable()?;
        self.inner.delete_instance(name)
    }

    fn delete_at_version(&self, name: &str, expected_version: u64) -> StateResult<bool> {
        self.reachable()?;
        self.inner.delete_instance_at_version(name, expected_version)
    }

    fn watch(&self, controller_type: &str) -> InstanceWatch {
        let mut upstream = self.inner.watch_instances(controller_type);
        let (tx, rx) = broadcast::channel(256);
        let cut = self.cut.clone();
        tokio::spawn(async move {
            while let Some(event) = upstream.recv().await {
                if cut.load(Ordering::SeqCst) {
                    continue;
                }
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        InstanceWatch::new(controller_type, rx)
    }
}

#[tokio::test]
async fn unreachable_registry_fails_registration() {
    let flaky = Arc::new(FlakyStore::new(StateStore::open_in_memory().unwrap()));
    flaky.fail_reads.store(true, Ordering::SeqCst);

    let (_tx, rx) = watch::channel(false);
    let config = quiet_config().with_register_retries(3);
    let err = Coordinator::start(flaky.clone(), config, rx)
        .await
        .err()
        .expect("registration fails");
    assert!(matches!(err, ControllerError::StoreUnavailable(_)), "{err}");
    assert!(flaky.inner.list_instances(TYPE).unwrap().is_empty());
}

#[tokio::test]
async fn persistent_key_races_surface_as_conflict() {
    let flaky = Arc::new(FlakyStore::new(StateStore::open_in_memory().unwrap()));
    flaky.racing_creates.store(10, Ordering::SeqCst);

    let (_tx, rx) = watch::channel(false);
    let config = quiet_config().with_register_retries(3);
    let err = Coordinator::start(flaky.clone(), config, rx)
        .await
        .err()
        .expect("registration fails");
    match err {
        ControllerError::RegistrationConflict {
            controller_type,
            attempts,
        } => {
            assert_eq!(controller_type, TYPE);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected RegistrationConflict, got {other}"),
    }
}

#[tokio::test]
async fn lost_key_races_are_retried() {
    let flaky = Arc::new(FlakyStore::new(StateStore::open_in_memory().unwrap()));
    flaky.racing_creates.store(2, Ordering::SeqCst);

    let node = start(flaky.clone(), quiet_config()).await;
    // The two racers took MAX and MAX / 2.
    assert_eq!(node.handle.controller_key(), MAX_CONTROLLER_KEY / 4);
    // Racers never serve anything, so the range is free to claim.
    wait_for("active", || node.state() == CoordinatorState::Active).await;
    assert_eq!(node.range(), KeyRange::new(0, MAX_CONTROLLER_KEY / 4));

    node.stop().await;
}

#[tokio::test]
async fn failed_release_write_is_flushed_by_heartbeat() {
    let flaky = Arc::new(FlakyStore::new(StateStore::open_in_memory().unwrap()));
    let config = quiet_config()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_write_retries(1);

    let a = start(flaky.clone(), config.clone()).await;
    wait_for("anchor active", || a.state() == CoordinatorState::Active).await;
    let b = start(flaky.clone(), config).await;
    wait_for("anchor locks", || {
        matches!(a.state(), CoordinatorState::Rebalancing { .. })
    })
    .await;

    flaky.fail_writes.store(true, Ordering::SeqCst);
    assert!(a.handle.is_done_processing_current_workloads());
    wait_for("anchor released locally", || a.state() == CoordinatorState::Active).await;
    assert_eq!(a.range(), KeyRange::new(b.handle.controller_key(), MAX_CONTROLLER_KEY));

    // The release never reached the registry, so the joiner keeps waiting.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(b.state(), CoordinatorState::Joining);
    assert!(flaky.inner.get_instance(a.name()).unwrap().unwrap().is_locked);

    flaky.fail_writes.store(false, Ordering::SeqCst);
    settle(&[&a, &b]).await;
    let rec = flaky.inner.get_instance(a.name()).unwrap().unwrap();
    assert!(!rec.is_locked);
    assert_eq!(rec.serving, a.range());

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn severed_instance_stops_serving_before_it_is_reaped() {
    let store = StateStore::open_in_memory().unwrap();
    let cut = Arc::new(AtomicBool::new(false));
    let severed = Arc::new(SeveredStore {
        inner: store.clone(),
        cut: cut.clone(),
    });
    let config = quiet_config()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_lease_ttl(Duration::from_secs(2))
        .with_write_retries(1);

    let a = start(severed, config.clone()).await;
    wait_for("anchor active", || a.state() == CoordinatorState::Active).await;
    let b = start(shared(&store), config).await;
    settle(&[&a, &b]).await;

    cut.store(true, Ordering::SeqCst);

    // The peer reaps the silent instance and takes the whole ring; at no
    // point do the two filters admit the same hash.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (ra, rb) = (a.range(), b.range());
        assert!(
            !ra.intersects(&rb),
            "{} admits {ra} while {} admits {rb}",
            a.name(),
            b.name()
        );
        if rb == KeyRange::FULL {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "peer never took over the ring"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(store.get_instance(a.name()).unwrap().is_none());
    assert!(a.range().is_empty());
    assert_eq!(a.state(), CoordinatorState::Joining);

    // Reconnected, it finds its record gone and stays out.
    cut.store(false, Ordering::SeqCst);
    wait_for("severed instance terminates", || {
        a.state() == CoordinatorState::Terminated
    })
    .await;
    assert!(a.range().is_empty());
    assert_eq!(b.range(), KeyRange::FULL);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn coordinates_over_on_disk_registry() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(&dir.path().join("registry.redb")).unwrap();

    let a = start(shared(&store), quiet_config()).await;
    let b = start(shared(&store), quiet_config()).await;
    settle(&[&a, &b]).await;

    let records = store.list_instances(TYPE).unwrap();
    assert_eq!(records.len(), 2);
    assert_disjoint(&records);

    b.stop().await;
    settle(&[&a]).await;
    assert_eq!(record(&store, a.name()).serving, KeyRange::FULL);
    a.stop().await;
}
