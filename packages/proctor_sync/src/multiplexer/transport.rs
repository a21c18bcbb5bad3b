//! Push-subscription transport contract.
//!
//! The transport is an external collaborator (a realtime websocket client, for
//! instance). The multiplexer only needs to open one subscription per
//! `ChannelKey` and read its lifecycle signals in order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::error::Result;

/// Identifies one shared subscription: a resource plus a row filter,
/// e.g. `("assessment_instances", "id=eq.123")`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub resource: String,
    pub filter: String,
}

impl ChannelKey {
    pub fn new(resource: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            filter: filter.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.filter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row change pushed by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// New row (empty object for deletes)
    pub record: serde_json::Value,
    /// Previous row when the transport provides it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn insert(record: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record,
            old_record: None,
        }
    }

    pub fn update(record: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            record,
            old_record: None,
        }
    }

    pub fn delete(old_record: serde_json::Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            record: serde_json::Value::Object(Default::default()),
            old_record: Some(old_record),
        }
    }
}

/// Lifecycle signals a transport delivers for one open subscription:
/// the onOpen / onEvent / onClose / onError callbacks, as a queue.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    Opened,
    Event(ChangeEvent),
    Closed { reason: Option<String> },
    Error(String),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open a subscription for `key`. Signals must be sent on `signals` in
    /// arrival order. Returning `Err` counts as an unexpected close.
    async fn open(
        &self,
        key: &ChannelKey,
        signals: mpsc::Sender<TransportSignal>,
    ) -> Result<Box<dyn TransportHandle>>;
}

/// An open subscription. Closing must be idempotent.
pub trait TransportHandle: Send {
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_display() {
        let key = ChannelKey::new("assessment_instances", "id=eq.123");
        assert_eq!(key.to_string(), "assessment_instances:id=eq.123");
    }

    #[test]
    fn change_event_wire_shape() {
        let event = ChangeEvent::update(json!({"id": 123, "status": "active"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "UPDATE");
        assert!(value.get("old_record").is_none());

        let delete = ChangeEvent::delete(json!({"id": 1}));
        assert_eq!(delete.record, json!({}));
        assert_eq!(delete.old_record, Some(json!({"id": 1})));
    }
}
