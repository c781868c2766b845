//! redb table definitions for the fabric registry.

use redb::TableDefinition;

/// Controller instance records keyed by instance name (JSON values).
pub const CONTROLLER_INSTANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("controller_instances");

/// Store-wide counters.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the monotonically increasing resource version in `META`.
pub const RESOURCE_VERSION: &str = "resource_version";
