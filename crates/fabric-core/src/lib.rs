pub mod config;
pub mod types;

pub use config::{ControllerConfig, FabricConfig, MAX_HEARTBEAT_INTERVAL_SECS, StoreConfig};
pub use types::*;
