//! Observational registry of widget comms flowing through the bridge.
//!
//! The gateway never rewrites comm frames; it only records which comms
//! exist, which instance opened them, and how much traffic they have seen.
//! That answers "which widgets does this peer own?" when a client
//! reconnects, and gives the deduplicator its per-comm scope.

use dashmap::DashMap;
use serde_json::json;

use crate::frame::KernelFrame;

/// Lifecycle state of a tracked comm.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommState {
    /// The comm has been opened and not yet closed.
    Open,
    /// A `comm_close` has been observed.
    Closed,
}

/// What the registry knows about one comm.
#[derive(Clone, Debug)]
pub struct CommRecord {
    /// The instance the comm is associated with, when known.
    pub instance_id: Option<String>,
    /// Target name from the `comm_open`, e.g. `jupyter.widget`.
    pub target_name: Option<String>,
    /// Whether the comm is open or closed.
    pub state: CommState,
    /// Count of comm messages observed in either direction.
    pub message_count: u64,
}

/// Tracks comm lifecycles without interpreting their payloads.
#[derive(Default)]
pub struct WidgetRegistry {
    comms: DashMap<String, CommRecord>,
}

impl WidgetRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a comm-bearing kernel frame passing through the bridge.
    pub fn observe(&self, frame: KernelFrame<'_>, instance_id: Option<&str>) {
        let Some(comm_id) = frame.comm_id() else {
            return;
        };

        let mut record = self.comms.entry(comm_id.to_string()).or_insert(CommRecord {
            instance_id: instance_id.map(String::from),
            target_name: None,
            state: CommState::Open,
            message_count: 0,
        });

        record.message_count += 1;
        if record.instance_id.is_none() {
            record.instance_id = instance_id.map(String::from);
        }
        match frame.msg_type() {
            Some("comm_open") => {
                record.state = CommState::Open;
                if let Some(target) = frame.comm_target() {
                    record.target_name = Some(target.to_string());
                }
            }
            Some("comm_close") => record.state = CommState::Closed,
            _ => {}
        }
    }

    /// Comm ids currently owned by an instance, for reconnection handoff.
    pub fn comms_for_instance(&self, instance_id: &str) -> Vec<String> {
        self.comms
            .iter()
            .filter(|entry| {
                entry.value().state == CommState::Open
                    && entry.value().instance_id.as_deref() == Some(instance_id)
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Forget comms owned by instances that no longer exist.
    pub fn drop_instance(&self, instance_id: &str) {
        self.comms
            .retain(|_, record| record.instance_id.as_deref() != Some(instance_id));
    }

    /// Counter snapshot for the status endpoint.
    pub fn status(&self) -> serde_json::Value {
        let open = self
            .comms
            .iter()
            .filter(|entry| entry.value().state == CommState::Open)
            .count();
        json!({
            "tracked_comms": self.comms.len(),
            "open_comms": open,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::KernelFrame;
    use serde_json::{json, Value};

    fn comm_frame(msg_type: &str, comm_id: &str, target: Option<&str>) -> Value {
        let mut content = json!({ "comm_id": comm_id });
        if let Some(target) = target {
            content["target_name"] = json!(target);
        }
        json!({
            "header": { "msg_id": "m1", "msg_type": msg_type },
            "content": content,
        })
    }

    #[test]
    fn open_message_close_lifecycle() {
        let registry = WidgetRegistry::new();

        let open = comm_frame("comm_open", "c1", Some("jupyter.widget"));
        registry.observe(KernelFrame(&open), Some("i1"));
        let msg = comm_frame("comm_msg", "c1", None);
        registry.observe(KernelFrame(&msg), Some("i1"));

        assert_eq!(registry.comms_for_instance("i1"), vec!["c1".to_string()]);
        let record = registry.comms.get("c1").unwrap();
        assert_eq!(record.message_count, 2);
        assert_eq!(record.target_name.as_deref(), Some("jupyter.widget"));
        drop(record);

        let close = comm_frame("comm_close", "c1", None);
        registry.observe(KernelFrame(&close), Some("i1"));
        assert!(registry.comms_for_instance("i1").is_empty());
    }

    #[test]
    fn frames_without_comm_id_are_ignored() {
        let registry = WidgetRegistry::new();
        let frame = json!({ "header": { "msg_type": "stream" }, "content": {} });
        registry.observe(KernelFrame(&frame), None);
        assert_eq!(registry.comms.len(), 0);
    }

    #[test]
    fn drop_instance_forgets_its_comms() {
        let registry = WidgetRegistry::new();
        let open = comm_frame("comm_open", "c1", None);
        registry.observe(KernelFrame(&open), Some("i1"));
        let other = comm_frame("comm_open", "c2", None);
        registry.observe(KernelFrame(&other), Some("i2"));

        registry.drop_instance("i1");
        assert!(registry.comms.get("c1").is_none());
        assert!(registry.comms.get("c2").is_some());
    }
}
