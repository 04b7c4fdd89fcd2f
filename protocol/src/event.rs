//! Generation events carried by the backend stream.
//!
//! Each record on the wire is a JSON object with a `type` field. Known types
//! decode into a closed set of variants; anything else is kept as
//! [`GenerationEvent::Unknown`] so callers can still inspect it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::material::{Coordinates, MaterialKind};

/// A typed event decoded from one stream record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// The backend accepted the request and started producing output.
    Start(StartPayload),

    /// A piece of generated content.
    #[serde(alias = "content_delta", alias = "delta")]
    Content(ContentDelta),

    /// A scoped modification proposal for an existing unit.
    #[serde(alias = "targeted-change")]
    TargetedChange(TargetedChangePayload),

    /// Informational progress report.
    Progress(ProgressPayload),

    /// The backend finished the unit.
    #[serde(alias = "done")]
    Complete(CompletePayload),

    /// The backend reported a failure.
    Error(ErrorPayload),

    /// A record whose `type` is missing or not recognized.
    #[serde(skip)]
    Unknown { kind: Option<String>, raw: Value },
}

impl GenerationEvent {
    /// Decode an event from an already-parsed JSON value.
    ///
    /// Records with a recognized `type` must match that variant's payload
    /// shape; records with any other `type` (or none) become `Unknown`.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match kind.as_deref().and_then(EventKind::from_wire) {
            Some(_) => serde_json::from_value(value),
            None => Ok(Self::Unknown { kind, raw: value }),
        }
    }

    /// The kind of this event, if it is a recognized one.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::Start(_) => Some(EventKind::Start),
            Self::Content(_) => Some(EventKind::ContentDelta),
            Self::TargetedChange(_) => Some(EventKind::TargetedChange),
            Self::Progress(_) => Some(EventKind::Progress),
            Self::Complete(_) => Some(EventKind::Complete),
            Self::Error(_) => Some(EventKind::Error),
            Self::Unknown { .. } => None,
        }
    }

    /// Whether this event ends the stream for its unit.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }

    /// Build an error event with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Build a content event carrying only a delta.
    pub fn delta(delta: impl Into<String>) -> Self {
        Self::Content(ContentDelta {
            delta: delta.into(),
            total: None,
        })
    }

    /// Build a complete event without final content.
    pub fn complete() -> Self {
        Self::Complete(CompletePayload::default())
    }
}

/// Recognized event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    ContentDelta,
    TargetedChange,
    Progress,
    Complete,
    Error,
}

impl EventKind {
    /// Map a wire `type` value to a kind.
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "start" => Some(Self::Start),
            "content" | "content_delta" | "delta" => Some(Self::ContentDelta),
            "targeted_change" | "targeted-change" => Some(Self::TargetedChange),
            "progress" => Some(Self::Progress),
            "complete" | "done" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ContentDelta => "content",
            Self::TargetedChange => "targeted_change",
            Self::Progress => "progress",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// Payload of a `start` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartPayload {
    pub title: Option<String>,
    pub material_kind: Option<MaterialKind>,
    pub module_number: Option<u32>,
    pub chapter_number: Option<u32>,
    pub slide_number: Option<u32>,
}

impl StartPayload {
    /// Coordinates announced by the backend, if it named a module.
    pub fn coordinates(&self) -> Option<Coordinates> {
        self.module_number.map(|module_number| Coordinates {
            module_number,
            chapter_number: self.chapter_number,
            slide_number: self.slide_number,
        })
    }
}

/// Payload of a `content` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentDelta {
    /// Text appended since the previous record.
    #[serde(alias = "content")]
    pub delta: String,

    /// Accumulated content so far, when the backend sends it.
    #[serde(alias = "accumulated")]
    pub total: Option<String>,
}

/// Payload of a `targeted_change` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetedChangePayload {
    pub change_type: ChangeType,
    pub target: String,
    pub replacement: String,
    pub description: String,
    pub coordinates: Option<LineSpan>,
}

/// Line range (1-based, inclusive) locating a change inside a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSpan {
    pub start_line: usize,
    #[serde(default)]
    pub end_line: Option<usize>,
}

impl LineSpan {
    pub fn contains(&self, line: usize) -> bool {
        line >= self.start_line && self.end_line.is_none_or(|end| line <= end)
    }
}

/// How a targeted change applies to its target excerpt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeType {
    #[default]
    Replace,
    InsertAfter,
    InsertBefore,
    Delete,
    Rewrite,
    /// Any other label; applied like `Replace`.
    Other(String),
}

impl From<String> for ChangeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "replace" | "edit" | "modify" => Self::Replace,
            "insert_after" | "insert" | "add" => Self::InsertAfter,
            "insert_before" => Self::InsertBefore,
            "delete" | "remove" => Self::Delete,
            "rewrite" | "full" => Self::Rewrite,
            _ => Self::Other(value),
        }
    }
}

impl From<ChangeType> for String {
    fn from(value: ChangeType) -> Self {
        match value {
            ChangeType::Replace => "replace".to_string(),
            ChangeType::InsertAfter => "insert_after".to_string(),
            ChangeType::InsertBefore => "insert_before".to_string(),
            ChangeType::Delete => "delete".to_string(),
            ChangeType::Rewrite => "rewrite".to_string(),
            ChangeType::Other(label) => label,
        }
    }
}

/// Payload of a `progress` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressPayload {
    pub message: Option<String>,
    pub percent: Option<f32>,
}

/// Payload of a `complete` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletePayload {
    /// Final content, used only when no delta was streamed.
    pub content: Option<String>,
}

/// Payload of an `error` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPayload {
    #[serde(alias = "error")]
    pub message: String,
}
