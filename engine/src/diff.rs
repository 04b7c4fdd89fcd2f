//! Line diffs for reviewing proposed modifications.
//!
//! The diff is positional: line `i` of the original is compared with line `i`
//! of the proposal. It is meant for short edits of a single document, where
//! the author reviews each changed line.

use serde::{Deserialize, Serialize};

use crate::unit::{ContentUnit, TargetedChange, UnitId, UnitStatus};

/// Classification of one diff line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineChange {
    Unchanged,
    Removed,
    Added,
}

/// One line of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub change: LineChange,
    pub text: String,

    /// 1-based line number in the original, for unchanged and removed lines.
    pub old_line: Option<usize>,

    /// 1-based line number in the proposal, for unchanged and added lines.
    pub new_line: Option<usize>,
}

/// One cell of a side-by-side column. Placeholders have no change and no
/// line number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideLine {
    pub change: Option<LineChange>,
    pub text: String,
    pub line_number: Option<usize>,
}

impl SideLine {
    fn placeholder() -> Self {
        Self {
            change: None,
            text: String::new(),
            line_number: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.change.is_none()
    }
}

/// Two aligned columns; `left[i]` and `right[i]` describe the same row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideBySide {
    pub left: Vec<SideLine>,
    pub right: Vec<SideLine>,
}

/// Line counts of a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub unchanged: usize,
    pub removed: usize,
    pub added: usize,
}

impl DiffSummary {
    pub fn of(lines: &[DiffLine]) -> Self {
        let mut summary = Self::default();
        for line in lines {
            match line.change {
                LineChange::Unchanged => summary.unchanged += 1,
                LineChange::Removed => summary.removed += 1,
                LineChange::Added => summary.added += 1,
            }
        }
        summary
    }

    pub fn is_identical(&self) -> bool {
        self.removed == 0 && self.added == 0
    }
}

/// Rows of a positional diff: the original and proposed line at each index.
fn rows<'a>(
    original: &'a str,
    proposed: &'a str,
) -> impl Iterator<Item = (usize, Option<&'a str>, Option<&'a str>)> {
    let old: Vec<&str> = original.split('\n').collect();
    let new: Vec<&str> = proposed.split('\n').collect();
    let len = old.len().max(new.len());
    (0..len).map(move |i| (i + 1, old.get(i).copied(), new.get(i).copied()))
}

/// Interleaved diff: at each differing index the removed line comes first.
/// Empty lines are never reported as removed or added.
pub fn unified_diff(original: &str, proposed: &str) -> Vec<DiffLine> {
    let mut lines = Vec::new();
    for (number, old, new) in rows(original, proposed) {
        if old == new {
            lines.push(DiffLine {
                change: LineChange::Unchanged,
                text: old.unwrap_or_default().to_string(),
                old_line: Some(number),
                new_line: Some(number),
            });
            continue;
        }
        if let Some(old) = old.filter(|l| !l.is_empty()) {
            lines.push(DiffLine {
                change: LineChange::Removed,
                text: old.to_string(),
                old_line: Some(number),
                new_line: None,
            });
        }
        if let Some(new) = new.filter(|l| !l.is_empty()) {
            lines.push(DiffLine {
                change: LineChange::Added,
                text: new.to_string(),
                old_line: None,
                new_line: Some(number),
            });
        }
    }
    lines
}

/// Parallel columns with a placeholder wherever one side has nothing to show.
pub fn side_by_side(original: &str, proposed: &str) -> SideBySide {
    let mut columns = SideBySide::default();
    for (number, old, new) in rows(original, proposed) {
        if old == new {
            let line = SideLine {
                change: Some(LineChange::Unchanged),
                text: old.unwrap_or_default().to_string(),
                line_number: Some(number),
            };
            columns.left.push(line.clone());
            columns.right.push(line);
            continue;
        }

        columns.left.push(match old.filter(|l| !l.is_empty()) {
            Some(text) => SideLine {
                change: Some(LineChange::Removed),
                text: text.to_string(),
                line_number: Some(number),
            },
            None => SideLine::placeholder(),
        });
        columns.right.push(match new.filter(|l| !l.is_empty()) {
            Some(text) => SideLine {
                change: Some(LineChange::Added),
                text: text.to_string(),
                line_number: Some(number),
            },
            None => SideLine::placeholder(),
        });
    }
    columns
}

/// Everything the author needs to decide on a unit's pending change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeReview {
    pub unit_id: UnitId,
    pub description: String,
    pub changes: Vec<TargetedChange>,
    pub original_content: String,
    pub proposed_content: String,
    pub lines: Vec<DiffLine>,
    pub side_by_side: SideBySide,
    pub summary: DiffSummary,

    /// Whether the modify run has finished and the change can be decided.
    pub decidable: bool,
}

/// Build the review of a unit's pending change, if it has one awaiting a
/// decision.
pub fn review(unit: &ContentUnit) -> Option<ChangeReview> {
    let pending = unit.pending_change.as_ref().filter(|p| p.is_awaiting())?;
    let lines = unified_diff(&unit.content, &pending.proposed_content);
    Some(ChangeReview {
        unit_id: unit.id.clone(),
        description: pending.description(),
        changes: pending.changes.clone(),
        original_content: unit.content.clone(),
        proposed_content: pending.proposed_content.clone(),
        summary: DiffSummary::of(&lines),
        side_by_side: side_by_side(&unit.content, &pending.proposed_content),
        lines,
        decidable: unit.status == UnitStatus::Complete,
    })
}
