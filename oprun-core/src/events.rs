//! Lifecycle Events
//!
//! Every run publishes an ordered stream of events to a single consumer.
//! Producers are the dispatcher (call start/end/skip) and the container output
//! adapters. The channel is bounded, so a slow consumer applies backpressure
//! to the whole run instead of losing events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::types::{Call, CallId, Scope};

/// Default channel capacity for a run's event stream.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

// ─── Event model ──────────────────────────────────────────────

/// A timestamped lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Exactly one populated variant per event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventPayload {
    CallStarted(CallStarted),
    CallEnded(CallEnded),
    CallSkipped(CallSkipped),
    ContainerStdOutWrittenTo(ContainerOutput),
    ContainerStdErrWrittenTo(ContainerOutput),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStarted {
    pub call: Call,
    #[serde(rename = "ref")]
    pub op_ref: String,
}

/// A call whose `if` resolved false. Never paired with start/end events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSkipped {
    pub call: Call,
    #[serde(rename = "ref")]
    pub op_ref: String,
}

/// No further events follow for the call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub call: Call,
    #[serde(rename = "ref")]
    pub op_ref: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallEndedError>,
    #[serde(default)]
    pub outputs: Scope,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEndedError {
    pub message: String,
}

/// One newline-terminated chunk written to a container's stdout or stderr.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    pub image_ref: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub root_call_id: CallId,
    pub container_id: CallId,
    pub op_ref: String,
}

// ─── Outcome ──────────────────────────────────────────────────

/// Terminal status of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Outcome {
    Succeeded,
    Failed,
    Killed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Outcome {
    /// Anything other than the canonical values is an error outcome.
    fn from(s: String) -> Self {
        match s.as_str() {
            "SUCCEEDED" => Self::Succeeded,
            "KILLED" => Self::Killed,
            _ => Self::Failed,
        }
    }
}

impl From<Outcome> for String {
    fn from(outcome: Outcome) -> Self {
        outcome.as_str().to_string()
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ─── Sink / stream ────────────────────────────────────────────

/// Receiver end of a run's events.
pub type EventStream = mpsc::Receiver<Event>;

/// Producer handle for a run's event stream. Cheap to clone.
#[derive(Clone, Debug)]
pub struct EventSink {
    sender: mpsc::Sender<Event>,
}

impl EventSink {
    /// Create a sink with its single consumer.
    pub fn channel(buffer: usize) -> (Self, EventStream) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }

    /// Publish an event stamped now. Waits for room in the channel.
    pub async fn emit(&self, payload: EventPayload) {
        self.emit_at(Utc::now(), payload).await;
    }

    pub async fn emit_at(&self, timestamp: DateTime<Utc>, payload: EventPayload) {
        if self
            .sender
            .send(Event { timestamp, payload })
            .await
            .is_err()
        {
            tracing::debug!("Event stream closed, dropping event");
        }
    }

    /// Publish from a context that cannot await (drop guards). When the
    /// channel is full the send completes on a spawned task if a runtime is
    /// available; otherwise the event is lost.
    pub fn emit_detached(&self, payload: EventPayload) {
        let event = Event {
            timestamp: Utc::now(),
            payload,
        };
        let event = match self.sender.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Event stream closed, dropping event");
                return;
            }
            Err(TrySendError::Full(event)) => event,
        };
        match Handle::try_current() {
            Ok(handle) => {
                let sender = self.sender.clone();
                handle.spawn(async move {
                    if sender.send(event).await.is_err() {
                        tracing::debug!("Event stream closed, dropping event");
                    }
                });
            }
            Err(_) => tracing::warn!("Event stream full outside a runtime, dropping event"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
