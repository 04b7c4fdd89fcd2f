//! Course material vocabulary shared by requests, events and the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a unit is a leaf material or a grouping folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    #[default]
    File,
    Folder,
}

/// The kind of a generated material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialKind {
    Slide,
    Assessment,
    Quiz,
    Resource,
    Interactive,
    Discussion,
}

impl MaterialKind {
    /// Assessments and quizzes sort after every other material in a chapter.
    pub fn is_assessment(&self) -> bool {
        matches!(self, Self::Assessment | Self::Quiz)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Slide => "slide",
            Self::Assessment => "assessment",
            Self::Quiz => "quiz",
            Self::Resource => "resource",
            Self::Interactive => "interactive",
            Self::Discussion => "discussion",
        }
    }
}

impl fmt::Display for MaterialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Position of a unit in the module → chapter → material hierarchy.
///
/// Folders and units that have not been placed yet leave the chapter and/or
/// slide number empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinates {
    pub module_number: u32,
    #[serde(default)]
    pub chapter_number: Option<u32>,
    #[serde(default)]
    pub slide_number: Option<u32>,
}

impl Coordinates {
    pub fn module(module_number: u32) -> Self {
        Self {
            module_number,
            chapter_number: None,
            slide_number: None,
        }
    }

    pub fn chapter(module_number: u32, chapter_number: u32) -> Self {
        Self {
            module_number,
            chapter_number: Some(chapter_number),
            slide_number: None,
        }
    }

    pub fn slide(module_number: u32, chapter_number: u32, slide_number: u32) -> Self {
        Self {
            module_number,
            chapter_number: Some(chapter_number),
            slide_number: Some(slide_number),
        }
    }

    /// Whether the unit has been placed inside a chapter.
    pub fn is_placed(&self) -> bool {
        self.chapter_number.is_some()
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.module_number)?;
        if let Some(chapter) = self.chapter_number {
            write!(f, ".C{chapter}")?;
        }
        if let Some(slide) = self.slide_number {
            write!(f, ".S{slide}")?;
        }
        Ok(())
    }
}
