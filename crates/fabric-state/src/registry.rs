//! The registry surface the coordination layer depends on.

use fabric_core::ControllerInstance;

use crate::error::StateResult;
use crate::store::StateStore;
use crate::watch::InstanceWatch;

/// Versioned CRUD plus watch over controller instance records.
///
/// [`StateStore`] is the embedded implementation. Coordination code only
/// talks to this trait so another registry (or a fault-injecting wrapper
/// in tests) can be slotted in.
pub trait InstanceStore: Send + Sync {
    /// All live records of a controller type.
    fn list(&self, controller_type: &str) -> StateResult<Vec<ControllerInstance>>;

    fn get(&self, name: &str) -> StateResult<Option<ControllerInstance>>;

    /// Insert a new record. `Conflict` if the name or the key (within the
    /// controller type) is already taken.
    fn create(&self, record: &ControllerInstance) -> StateResult<ControllerInstance>;

    /// Replace a record if its stored version still equals `expected_version`.
    fn update(
        &self,
        record: &ControllerInstance,
        expected_version: u64,
    ) -> StateResult<ControllerInstance>;

    /// Remove a record. Returns false if it did not exist.
    fn delete(&self, name: &str) -> StateResult<bool>;

    /// Remove a record if its stored version still equals `expected_version`.
    /// Returns false if it did not exist, `Conflict` if it changed.
    fn delete_at_version(&self, name: &str, expected_version: u64) -> StateResult<bool>;

    /// Subscribe to changes of a controller type.
    fn watch(&self, controller_type: &str) -> InstanceWatch;
}

impl InstanceStore for StateStore {
    fn list(&self, controller_type: &str) -> StateResult<Vec<ControllerInstance>> {
        self.list_instances(controller_type)
    }

    fn get(&self, name: &str) -> StateResult<Option<ControllerInstance>> {
        self.get_instance(name)
    }

    fn create(&self, record: &ControllerInstance) -> StateResult<ControllerInstance> {
        self.create_instance(record)
    }

    fn update(
        &self,
        record: &ControllerInstance,
        expected_version: u64,
    ) -> StateResult<ControllerInstance> {
        self.update_instance(record, expected_version)
    }

    fn delete(&self, name: &str) -> StateResult<bool> {
        self.delete_instance(name)
    }

    fn delete_at_version(&self, name: &str, expected_version: u64) -> StateResult<bool> {
        self.delete_instance_at_version(name, expected_version)
    }

    fn watch(&self, controller_type: &str) -> InstanceWatch {
        self.watch_instances(controller_type)
    }
}
