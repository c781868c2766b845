//! fabric-state: the controller-instance registry.
//!
//! Backed by [redb](https://docs.rs/redb). Holds one `ControllerInstance`
//! record per live controller process, keyed by instance name, and
//! publishes every committed change on a broadcast channel so control
//! loops can list-then-watch their controller type.
//!
//! # Architecture
//!
//! ```text
//! StateStore (Clone + Send + Sync)
//!   ├── redb Database
//!   │   ├── controller_instances: name → JSON record
//!   │   └── meta: resource_version counter
//!   └── broadcast::Sender<InstanceEvent>
//!       └── InstanceWatch (per subscriber, filtered by controller type)
//! ```
//!
//! Every write bumps a store-wide `resource_version`. Updates carry the
//! version the writer last saw and fail with `StateError::Conflict` when
//! someone else wrote in between. Creates fail with a conflict when the
//! name or the `(controller_type, controller_key)` pair is already taken.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod watch;

pub use error::{StateError, StateResult};
pub use registry::InstanceStore;
pub use store::StateStore;
pub use watch::{InstanceEvent, InstanceWatch};
