//! Inbound events.
//!
//! Freshet's own JSON encoding of the upstream notifications it reacts to.
//! This is what travels through the ingress queue and what handlers emit as
//! follow-ups; translating a concrete message bus into it is out of scope.

use serde::{Deserialize, Serialize};

use crate::model::{Advisory, EventType};

/// State of a build-system task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Open,
    Closed,
    Failed,
    Canceled,
}

/// State of a compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposeState {
    Wait,
    Generating,
    #[serde(alias = "ready")]
    Done,
    Failed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// All RPMs of an advisory got signed.
    AdvisoryRpmsSigned {
        message_id: String,
        advisory: Advisory,
    },
    AdvisoryStateChanged {
        message_id: String,
        advisory_id: i64,
        state: String,
    },
    BuildTaskStateChanged {
        message_id: String,
        task_id: i64,
        state: TaskState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ComposeStateChanged {
        message_id: String,
        compose_id: i64,
        state: ComposeState,
    },
    /// Operator-requested rebuild. An empty `images` list means every image
    /// affected by the advisory.
    ManualRebuild {
        message_id: String,
        advisory: Advisory,
        #[serde(default)]
        images: Vec<String>,
    },
}

impl InboundEvent {
    pub fn message_id(&self) -> &str {
        match self {
            InboundEvent::AdvisoryRpmsSigned { message_id, .. }
            | InboundEvent::AdvisoryStateChanged { message_id, .. }
            | InboundEvent::BuildTaskStateChanged { message_id, .. }
            | InboundEvent::ComposeStateChanged { message_id, .. }
            | InboundEvent::ManualRebuild { message_id, .. } => message_id,
        }
    }

    /// Business key the persisted event is indexed by.
    pub fn search_key(&self) -> String {
        match self {
            InboundEvent::AdvisoryRpmsSigned { advisory, .. }
            | InboundEvent::ManualRebuild { advisory, .. } => advisory.id.to_string(),
            InboundEvent::AdvisoryStateChanged { advisory_id, .. } => advisory_id.to_string(),
            InboundEvent::BuildTaskStateChanged { task_id, .. } => task_id.to_string(),
            InboundEvent::ComposeStateChanged { compose_id, .. } => compose_id.to_string(),
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            InboundEvent::AdvisoryRpmsSigned { .. } => EventType::AdvisoryRpmsSigned,
            InboundEvent::AdvisoryStateChanged { .. } => EventType::AdvisoryStateChanged,
            InboundEvent::BuildTaskStateChanged { .. } => EventType::BuildTaskStateChanged,
            InboundEvent::ComposeStateChanged { .. } => EventType::ComposeStateChanged,
            InboundEvent::ManualRebuild { .. } => EventType::ManualRebuild,
        }
    }

    /// Short name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        self.event_type().as_str()
    }
}
