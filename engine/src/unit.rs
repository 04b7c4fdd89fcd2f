//! Content units and their lifecycle vocabulary.

use std::fmt;

use chrono::{DateTime, Utc};
use coursegen_protocol::{
    ChangeType, Coordinates, LineSpan, MaterialKind, TargetedChangePayload, UnitKind,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a content unit, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Allocate a fresh id for a unit created by the engine.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UnitId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for UnitId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a content unit.
///
/// ```text
/// pending ──► generating ──► streaming ──► complete
///    │             │              │
///    └─────────────┴──────┬───────┘
///                         ▼
///                 error / cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Generating,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl UnitStatus {
    /// Terminal statuses accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    pub fn is_in_progress(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the forward-only state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        match (self, next) {
            (a, b) if *a == b => a.is_in_progress(),
            (Pending, Generating | Error | Cancelled) => true,
            (Generating, Streaming | Complete | Error | Cancelled) => true,
            (Streaming, Complete | Error | Cancelled) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What an orchestration run does to its unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Stream fresh content into the unit.
    #[default]
    Generate,

    /// Stream a proposal; committed content stays untouched until approval.
    Modify,
}

/// Bookkeeping for the run currently owning a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Run id; 0 means no run has started yet.
    pub id: u64,

    pub kind: RunKind,

    /// Highest sequence number applied in this run.
    pub last_seq: u64,

    /// Text streamed by a modify run.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub draft: String,
}

impl RunState {
    pub fn new(id: u64, kind: RunKind) -> Self {
        Self {
            id,
            kind,
            last_seq: 0,
            draft: String::new(),
        }
    }
}

/// Last progress report received for a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub message: Option<String>,
    pub percent: Option<f32>,
}

/// A proposed modification of a unit's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetedChange {
    pub change_type: ChangeType,
    pub target_excerpt: String,
    pub replacement_excerpt: String,
    pub description: String,
    pub location: Option<LineSpan>,

    /// Whether the target was found and the change folded into the proposal.
    pub applied: bool,
}

impl From<TargetedChangePayload> for TargetedChange {
    fn from(payload: TargetedChangePayload) -> Self {
        Self {
            change_type: payload.change_type,
            target_excerpt: payload.target,
            replacement_excerpt: payload.replacement,
            description: payload.description,
            location: payload.coordinates,
            applied: false,
        }
    }
}

/// Author decision on a pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    AwaitingApproval,
    Approved,
    Rejected,
}

/// The proposal assembled by one modify run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Changes in the order the backend emitted them.
    pub changes: Vec<TargetedChange>,

    /// Committed content when the proposal was created.
    pub base_content: String,

    /// Content the unit will have once approved.
    pub proposed_content: String,

    pub decision_status: DecisionStatus,
}

impl PendingChange {
    pub fn new(base_content: impl Into<String>) -> Self {
        let base_content = base_content.into();
        Self {
            changes: Vec::new(),
            proposed_content: base_content.clone(),
            base_content,
            decision_status: DecisionStatus::AwaitingApproval,
        }
    }

    pub fn is_awaiting(&self) -> bool {
        self.decision_status == DecisionStatus::AwaitingApproval
    }

    /// Human-readable summary of every change in the proposal.
    pub fn description(&self) -> String {
        self.changes
            .iter()
            .map(|c| c.description.as_str())
            .filter(|d| !d.is_empty())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// One generated artifact (material) or grouping folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: UnitId,
    pub kind: UnitKind,

    /// Material kind; `None` for folders.
    pub material_kind: Option<MaterialKind>,

    pub coordinates: Coordinates,
    pub title: Option<String>,
    pub status: UnitStatus,
    pub content: String,
    pub pending_change: Option<PendingChange>,
    pub progress: Option<Progress>,
    pub error: Option<String>,
    pub run: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentUnit {
    fn new(kind: UnitKind, material_kind: Option<MaterialKind>, coordinates: Coordinates) -> Self {
        let now = Utc::now();
        Self {
            id: UnitId::generate(),
            kind,
            material_kind,
            coordinates,
            title: None,
            status: UnitStatus::Pending,
            content: String::new(),
            pending_change: None,
            progress: None,
            error: None,
            run: RunState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A new material awaiting generation.
    pub fn material(material_kind: MaterialKind, coordinates: Coordinates) -> Self {
        Self::new(UnitKind::File, Some(material_kind), coordinates)
    }

    /// A new module or chapter folder awaiting generation.
    pub fn folder(coordinates: Coordinates) -> Self {
        Self::new(UnitKind::Folder, None, coordinates)
    }

    pub fn with_id(mut self, id: impl Into<UnitId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Mark the unit as finished with the given content, as for units
    /// hydrated from persistence.
    pub fn completed(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self.status = UnitStatus::Complete;
        self
    }

    pub fn is_folder(&self) -> bool {
        self.kind == UnitKind::Folder
    }

    pub fn is_assessment(&self) -> bool {
        self.material_kind.is_some_and(|k| k.is_assessment())
    }

    /// Whether a proposal is waiting for the author's decision.
    pub fn is_awaiting_approval(&self) -> bool {
        self.pending_change
            .as_ref()
            .is_some_and(PendingChange::is_awaiting)
    }

    /// Whether an orchestration run currently owns the unit.
    pub fn is_running(&self) -> bool {
        self.run.id != 0 && self.status.is_in_progress()
    }

    /// The module/chapter/slide slot the unit occupies once complete.
    ///
    /// Only placed materials with a slide number occupy a slot.
    pub fn slot(&self) -> Option<(u32, u32, u32)> {
        if self.is_folder() {
            return None;
        }
        let c = self.coordinates;
        Some((c.module_number, c.chapter_number?, c.slide_number?))
    }

    /// Display label for tree views.
    pub fn display_title(&self) -> String {
        if let Some(title) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return title.to_string();
        }

        let c = self.coordinates;
        match (self.kind, self.material_kind) {
            (UnitKind::Folder, _) => match c.chapter_number {
                Some(chapter) => format!("Chapter {chapter}"),
                None => format!("Module {}", c.module_number),
            },
            (UnitKind::File, Some(MaterialKind::Slide)) => match c.slide_number {
                Some(slide) => format!("Slide {slide}"),
                None => "Slide".to_string(),
            },
            (UnitKind::File, Some(kind)) => {
                let label = kind.label();
                let mut chars = label.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
            (UnitKind::File, None) => "Material".to_string(),
        }
    }
}
