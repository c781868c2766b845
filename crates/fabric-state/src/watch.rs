//! Watch stream over registry changes.

use fabric_core::ControllerInstance;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// A committed change to a controller instance record.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    Added(ControllerInstance),
    Modified(ControllerInstance),
    /// Carries the last stored version of the record.
    Deleted(ControllerInstance),
    /// The subscriber missed events and must re-list.
    Resync,
}

impl InstanceEvent {
    /// The record the event refers to (`None` for `Resync`).
    pub fn record(&self) -> Option<&ControllerInstance> {
        match self {
            InstanceEvent::Added(r) | InstanceEvent::Modified(r) | InstanceEvent::Deleted(r) => {
                Some(r)
            }
            InstanceEvent::Resync => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InstanceEvent::Added(_) => "added",
            InstanceEvent::Modified(_) => "modified",
            InstanceEvent::Deleted(_) => "deleted",
            InstanceEvent::Resync => "resync",
        }
    }
}

/// Subscription to the changes of one controller type.
///
/// Events arrive in commit order. A subscriber that falls behind the
/// broadcast buffer gets a single [`InstanceEvent::Resync`] instead of
/// the dropped events.
pub struct InstanceWatch {
    controller_type: String,
    rx: broadcast::Receiver<InstanceEvent>,
}

impl InstanceWatch {
    pub fn new(controller_type: &str, rx: broadcast::Receiver<InstanceEvent>) -> Self {
        Self {
            controller_type: controller_type.to_string(),
            rx,
        }
    }

    pub fn controller_type(&self) -> &str {
        &self.controller_type
    }

    /// Next event for this controller type. `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<InstanceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => match event.record() {
                    Some(r) if r.controller_type != self.controller_type => continue,
                    _ => return Some(event),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        controller_type = %self.controller_type,
                        skipped,
                        "watch subscriber lagged, resync required"
                    );
                    return Some(InstanceEvent::Resync);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
