//! fabric-controller: sharded ownership of a controller type's workload.
//!
//! Several instances of the same controller type run side by side without a
//! leader. Each one holds a point on the ring of its type and processes only
//! the objects whose hash falls in the slice it owns.
//!
//! # Architecture
//!
//! ```text
//! Coordinator (one tokio task per instance)
//!   ├── Registrar ──────────▶ InstanceStore (list / create / update / delete / watch)
//!   │     ├── register      key = assign_new_key(peer keys)
//!   │     ├── renew_lease   heartbeat
//!   │     └── reap_expired  peers past the lease TTL
//!   ├── Ring                owned range = f(all keys of the type)
//!   └── PartitionFilter ◀── workers: contains / begin
//!
//! CoordinatorHandle
//!   ├── state()             Joining / Active / Rebalancing / Terminated
//!   ├── filter()
//!   └── is_done_processing_current_workloads()
//! ```
//!
//! See [`coordinator`] for the join/leave handshake.

pub mod backoff;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod registrar;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorState};
pub use error::{ControllerError, ControllerResult};
pub use filter::{PartitionFilter, WorkGuard};
pub use registrar::{Registrar, generate_instance_name};
