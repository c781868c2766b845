//! fabricd: the fabric daemon.
//!
//! Runs coordinated controller instances against a shared registry:
//! - Registry (redb, on disk or in memory)
//! - Coordination loops (one per instance)
//! - Synthetic workers exercising the partition filters
//!
//! # Usage
//!
//! ```text
//! fabricd simulate --instances 3 --workloads 1000
//! fabricd inspect --data-dir /var/lib/fabric
//! fabricd init-config --output fabric.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fabric_controller::CoordinatorConfig;
use fabric_core::{DEFAULT_CONTROLLER_TYPE, FabricConfig};
use fabric_ring::Ring;
use fabric_state::{InstanceStore, StateStore};
use tracing::info;

mod simulate;

use simulate::{PhaseReport, SimulateOptions};

const REGISTRY_FILE: &str = "registry.redb";

#[derive(Parser)]
#[command(name = "fabricd", about = "fabric controller coordination daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run several coordinated instances in one process and report the ring.
    Simulate {
        /// Number of controller instances.
        #[arg(long, default_value = "3")]
        instances: usize,

        /// Number of synthetic workload objects.
        #[arg(long, default_value = "1000")]
        workloads: usize,

        /// Instances to stop after the ring settles (anchor first).
        #[arg(long, default_value = "0")]
        remove: usize,

        /// Path to fabric.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory for an on-disk registry (in memory when omitted).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Seconds to wait for the ring to settle.
        #[arg(long, default_value = "30")]
        settle_timeout: u64,
    },

    /// Print the registry records as JSON.
    Inspect {
        /// Directory holding the registry.
        #[arg(long)]
        data_dir: PathBuf,

        /// Only show instances of this controller type.
        #[arg(long)]
        controller_type: Option<String>,
    },

    /// Write a fabric.toml scaffold.
    InitConfig {
        /// Controller type the instances coordinate on.
        #[arg(long, default_value = DEFAULT_CONTROLLER_TYPE)]
        controller_type: String,

        /// Registry path written into the scaffold.
        #[arg(long)]
        store_path: Option<PathBuf>,

        /// Output file (stdout when omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fabricd=debug,fabric=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            instances,
            workloads,
            remove,
            config,
            data_dir,
            settle_timeout,
        } => {
            let options = SimulateOptions {
                instances,
                workloads,
                remove,
                settle_timeout: Duration::from_secs(settle_timeout),
                ..SimulateOptions::default()
            };
            run_simulate(config.as_deref(), data_dir.as_deref(), options).await
        }
        Command::Inspect {
            data_dir,
            controller_type,
        } => run_inspect(&data_dir, controller_type.as_deref()),
        Command::InitConfig {
            controller_type,
            store_path,
            output,
        } => run_init_config(&controller_type, store_path, output.as_deref()),
    }
}

/// Load fabric.toml, or the defaults when no path is given.
fn load_config(path: Option<&Path>) -> anyhow::Result<FabricConfig> {
    match path {
        Some(path) => {
            let config = FabricConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(FabricConfig::scaffold(DEFAULT_CONTROLLER_TYPE, None)),
    }
}

/// `--data-dir` wins over `[store].path`; neither means in memory.
fn open_store(config: &FabricConfig, data_dir: Option<&Path>) -> anyhow::Result<StateStore> {
    let path = match (data_dir, &config.store.path) {
        (Some(dir), _) => {
            std::fs::create_dir_all(dir)?;
            Some(dir.join(REGISTRY_FILE))
        }
        (None, Some(path)) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Some(path.clone())
        }
        (None, None) => None,
    };
    let store = match path {
        Some(path) => {
            let store = StateStore::open(&path)?;
            info!(path = %path.display(), "registry opened");
            store
        }
        None => StateStore::open_in_memory()?,
    };
    Ok(store)
}

async fn run_simulate(
    config_path: Option<&Path>,
    data_dir: Option<&Path>,
    options: SimulateOptions,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config, data_dir)?;
    let coordinator_config = CoordinatorConfig::from(&config.controller);

    info!(
        instances = options.instances,
        workloads = options.workloads,
        controller_type = %coordinator_config.controller_type,
        "simulation starting"
    );

    let shared: Arc<dyn InstanceStore> = Arc::new(store);
    let reports = simulate::run(shared, coordinator_config, options).await?;

    let mut consistent = true;
    for report in &reports {
        print_report(report);
        consistent &= report.is_consistent();
    }
    if !consistent {
        anyhow::bail!("workload ownership is inconsistent");
    }
    Ok(())
}

fn print_report(report: &PhaseReport) {
    println!("── {} ──", report.phase);
    println!(
        "{:<28} {:>20}  {:<44} {:>7} {:>10}",
        "INSTANCE", "KEY", "RANGE", "OWNED", "PROCESSED"
    );
    for m in &report.members {
        println!(
            "{:<28} {:>20}  {:<44} {:>7} {:>10}",
            m.name,
            m.key,
            m.range.to_string(),
            m.owned,
            m.processed
        );
    }
    println!(
        "unowned: {}  overlapping: {}",
        report.unowned, report.overlapping
    );
}

fn run_inspect(data_dir: &Path, controller_type: Option<&str>) -> anyhow::Result<()> {
    let path = data_dir.join(REGISTRY_FILE);
    if !path.exists() {
        anyhow::bail!("no registry at {}", path.display());
    }
    let store = StateStore::open(&path)?;
    let mut records = match controller_type {
        Some(t) => store.list_instances(t)?,
        None => store.list_all_instances()?,
    };
    records.sort_by(|a, b| {
        a.controller_type
            .cmp(&b.controller_type)
            .then(b.controller_key.cmp(&a.controller_key))
    });

    if let Some(t) = controller_type {
        let ring = Ring::from_instances(&records)?;
        for (key, range) in ring.ranges() {
            info!(controller_type = %t, key, %range, "owned range");
        }
    }

    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

fn run_init_config(
    controller_type: &str,
    store_path: Option<PathBuf>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let config = FabricConfig::scaffold(controller_type, store_path);
    config.validate()?;
    let toml = config.to_toml_string()?;
    match output {
        Some(path) => {
            std::fs::write(path, toml)?;
            println!("✓ Generated {}", path.display());
        }
        None => print!("{toml}"),
    }
    Ok(())
}
