//! In-process simulation: several coordinated instances on one registry.
//!
//! Each simulated instance runs its own coordination loop plus a worker
//! that sweeps a fixed set of synthetic workload ids, processes the ones
//! its filter admits, and signals drain completion whenever its instance
//! is rebalancing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fabric_controller::{Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorState};
use fabric_core::KeyRange;
use fabric_ring::verify_tiling;
use fabric_state::InstanceStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Knobs of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub instances: usize,
    pub workloads: usize,
    /// Instances stopped (anchor first) after the first settle.
    pub remove: usize,
    /// Worker sweep period.
    pub tick: Duration,
    /// Upper bound for the ring to settle after each phase.
    pub settle_timeout: Duration,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            instances: 3,
            workloads: 1_000,
            remove: 0,
            tick: Duration::from_millis(20),
            settle_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of one settled phase.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: &'static str,
    pub members: Vec<MemberReport>,
    /// Workload ids no instance admits.
    pub unowned: usize,
    /// Workload ids admitted by more than one instance.
    pub overlapping: usize,
}

#[derive(Debug, Clone)]
pub struct MemberReport {
    pub name: String,
    pub key: i64,
    pub range: KeyRange,
    pub owned: usize,
    pub processed: u64,
}

impl PhaseReport {
    pub fn is_consistent(&self) -> bool {
        self.unowned == 0 && self.overlapping == 0
    }
}

struct Member {
    handle: CoordinatorHandle,
    coordinator: JoinHandle<()>,
    worker: JoinHandle<()>,
    stop: watch::Sender<bool>,
    processed: Arc<AtomicU64>,
}

impl Member {
    async fn start(
        store: Arc<dyn InstanceStore>,
        config: CoordinatorConfig,
        ids: Arc<Vec<String>>,
        tick: Duration,
    ) -> anyhow::Result<Self> {
        let (stop, stop_rx) = watch::channel(false);
        let (handle, coordinator) = Coordinator::start(store, config, stop_rx.clone()).await?;
        let processed = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(run_worker(
            handle.clone(),
            ids,
            processed.clone(),
            tick,
            stop_rx,
        ));
        Ok(Self {
            handle,
            coordinator,
            worker,
            stop,
            processed,
        })
    }

    async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.coordinator.await;
        let _ = self.worker.await;
    }
}

/// Sweep the workload ids, processing what this instance owns.
async fn run_worker(
    handle: CoordinatorHandle,
    ids: Arc<Vec<String>>,
    processed: Arc<AtomicU64>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sweep = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let filter = handle.filter();
                for id in ids.iter() {
                    if let Some(_work) = filter.begin(id) {
                        processed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if matches!(handle.state(), CoordinatorState::Rebalancing { .. }) {
                    // Items are processed synchronously above, so nothing is in flight.
                    let done = handle.is_done_processing_current_workloads();
                    debug!(name = %handle.name(), done, "drain signalled");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Run the simulation and return one report per settled phase.
pub async fn run(
    store: Arc<dyn InstanceStore>,
    config: CoordinatorConfig,
    options: SimulateOptions,
) -> anyhow::Result<Vec<PhaseReport>> {
    if options.instances == 0 {
        anyhow::bail!("at least one instance is required");
    }
    if options.remove >= options.instances {
        anyhow::bail!(
            "cannot remove {} of {} instances",
            options.remove,
            options.instances
        );
    }

    let ids: Arc<Vec<String>> = Arc::new(
        (0..options.workloads)
            .map(|i| format!("default/workload-{i}"))
            .collect(),
    );

    let mut members = Vec::with_capacity(options.instances);
    for _ in 0..options.instances {
        let member = Member::start(store.clone(), config.clone(), ids.clone(), options.tick).await?;
        info!(name = %member.handle.name(), key = member.handle.controller_key(), "instance started");
        members.push(member);
    }

    let mut reports = Vec::new();
    settle(&members, options.settle_timeout).await?;
    reports.push(report("joined", &members, &ids));

    if options.remove > 0 {
        // Members are in join order, so the anchor goes first.
        let survivors = members.split_off(options.remove);
        for member in members {
            info!(name = %member.handle.name(), "stopping instance");
            member.stop().await;
        }
        members = survivors;
        settle(&members, options.settle_timeout).await?;
        reports.push(report("after removal", &members, &ids));
    }

    for member in members {
        member.stop().await;
    }
    Ok(reports)
}

/// Wait until every member is active and their filters tile the key space.
async fn settle(members: &[Member], timeout: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let all_active = members
            .iter()
            .all(|m| m.handle.state() == CoordinatorState::Active);
        let ranges: Vec<KeyRange> = members.iter().map(|m| m.handle.filter().range()).collect();
        if all_active && verify_tiling(&ranges).is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            let states: Vec<String> = members
                .iter()
                .map(|m| format!("{}={}", m.handle.name(), m.handle.state()))
                .collect();
            anyhow::bail!("ring did not settle within {timeout:?}: {}", states.join(", "));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn report(phase: &'static str, members: &[Member], ids: &[String]) -> PhaseReport {
    let mut owned = vec![0usize; members.len()];
    let mut unowned = 0;
    let mut overlapping = 0;
    for id in ids {
        let owners: Vec<usize> = members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.handle.filter().contains(id))
            .map(|(i, _)| i)
            .collect();
        match owners.len() {
            0 => unowned += 1,
            1 => owned[owners[0]] += 1,
            _ => overlapping += 1,
        }
    }

    PhaseReport {
        phase,
        members: members
            .iter()
            .zip(owned)
            .map(|(m, owned)| MemberReport {
                name: m.handle.name().to_string(),
                key: m.handle.controller_key(),
                range: m.handle.filter().range(),
                owned,
                processed: m.processed.load(Ordering::Relaxed),
            })
            .collect(),
        unowned,
        overlapping,
    }
}
