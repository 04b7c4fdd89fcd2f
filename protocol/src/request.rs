//! Requests sent from the engine to the generation backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::material::{Coordinates, MaterialKind, UnitKind};

/// A generation or modification request for one content unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Engine-side id of the unit the stream belongs to.
    pub unit_id: String,

    /// Course the unit belongs to, when known.
    pub course_id: Option<String>,

    pub kind: UnitKind,
    pub material_kind: Option<MaterialKind>,
    pub coordinates: Coordinates,
    pub title: Option<String>,

    /// Operation-specific payload.
    #[serde(flatten)]
    pub operation: Operation,
}

impl GenerationRequest {
    /// Request a fresh generation for a unit.
    pub fn generate(unit_id: impl Into<String>, coordinates: Coordinates) -> Self {
        Self {
            unit_id: unit_id.into(),
            course_id: None,
            kind: UnitKind::File,
            material_kind: None,
            coordinates,
            title: None,
            operation: Operation::Generate {
                parameters: Value::Null,
            },
        }
    }

    /// Request a modification of an existing unit's content.
    pub fn modify(
        unit_id: impl Into<String>,
        coordinates: Coordinates,
        instruction: impl Into<String>,
        current_content: impl Into<String>,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            course_id: None,
            kind: UnitKind::File,
            material_kind: None,
            coordinates,
            title: None,
            operation: Operation::Modify {
                instruction: instruction.into(),
                current_content: current_content.into(),
            },
        }
    }

    pub fn with_course(mut self, course_id: impl Into<String>) -> Self {
        self.course_id = Some(course_id.into());
        self
    }

    pub fn with_material_kind(mut self, kind: MaterialKind) -> Self {
        self.material_kind = Some(kind);
        self
    }

    pub fn with_kind(mut self, kind: UnitKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        if let Operation::Generate { parameters: p } = &mut self.operation {
            *p = parameters;
        }
        self
    }

    pub fn is_modification(&self) -> bool {
        matches!(self.operation, Operation::Modify { .. })
    }
}

/// What the backend is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    /// Produce new content from generation parameters.
    Generate {
        #[serde(default)]
        parameters: Value,
    },

    /// Propose changes to existing content from a natural-language instruction.
    Modify {
        instruction: String,
        current_content: String,
    },
}
