//! Pure event reducer for content units.
//!
//! `reduce` computes the next state of a unit from its current state and one
//! sequenced event. It never reads the clock and never touches other units;
//! the store wraps it with run checks, timestamps and logging.

use coursegen_protocol::{
    ChangeType, CompletePayload, ContentDelta, GenerationEvent, LineSpan, StartPayload,
    TargetedChangePayload,
};

use crate::unit::{ContentUnit, PendingChange, Progress, RunKind, TargetedChange, UnitStatus};

/// Marker prefix for failures caused by the transport rather than the model.
pub const TRANSPORT_ERROR_MARKER: &str = "Generation failed. You can retry or delete this item.";

/// Message used when the backend sends an empty error record.
const UNKNOWN_ERROR: &str = "Unknown generation error";

/// Build the human-readable marker for a transport failure.
pub fn transport_error_message(detail: &str) -> String {
    format!("{TRANSPORT_ERROR_MARKER} ({detail})")
}

/// Apply one event to a unit and return the resulting unit.
///
/// Events with a sequence number at or below the last applied one, events for
/// terminal units and unrecognized events leave the unit unchanged.
pub fn reduce(unit: &ContentUnit, seq: u64, event: &GenerationEvent) -> ContentUnit {
    if seq <= unit.run.last_seq || unit.status.is_terminal() {
        return unit.clone();
    }
    if matches!(event, GenerationEvent::Unknown { .. }) {
        return unit.clone();
    }

    let mut next = unit.clone();
    next.run.last_seq = seq;
    if next.status == UnitStatus::Pending {
        next.status = UnitStatus::Generating;
    }

    match event {
        GenerationEvent::Start(start) => apply_start(&mut next, start),
        GenerationEvent::Content(delta) => apply_delta(&mut next, delta),
        GenerationEvent::TargetedChange(change) => apply_targeted_change(&mut next, change),
        GenerationEvent::Progress(progress) => {
            next.progress = Some(Progress {
                message: progress.message.clone(),
                percent: progress.percent,
            });
        }
        GenerationEvent::Complete(complete) => apply_complete(&mut next, complete),
        GenerationEvent::Error(error) => apply_error(&mut next, &error.message),
        GenerationEvent::Unknown { .. } => {}
    }

    next
}

fn apply_start(unit: &mut ContentUnit, start: &StartPayload) {
    if unit.title.is_none() {
        unit.title.clone_from(&start.title);
    }
    if unit.material_kind.is_none() && !unit.is_folder() {
        unit.material_kind = start.material_kind;
    }

    let Some(announced) = start.coordinates() else {
        return;
    };
    if !unit.coordinates.is_placed() {
        unit.coordinates = announced;
    } else if unit.coordinates.slide_number.is_none()
        && announced.module_number == unit.coordinates.module_number
        && announced.chapter_number == unit.coordinates.chapter_number
    {
        unit.coordinates.slide_number = announced.slide_number;
    }
}

fn apply_delta(unit: &mut ContentUnit, delta: &ContentDelta) {
    let buffer = match unit.run.kind {
        RunKind::Generate => &mut unit.content,
        RunKind::Modify => &mut unit.run.draft,
    };

    let appended = if !delta.delta.is_empty() {
        delta.delta.as_str()
    } else {
        // Some backends only send the accumulated text; append what is new.
        delta
            .total
            .as_deref()
            .and_then(|total| total.strip_prefix(buffer.as_str()))
            .unwrap_or_default()
    };
    if appended.is_empty() {
        return;
    }

    buffer.push_str(appended);
    unit.status = UnitStatus::Streaming;
}

fn apply_targeted_change(unit: &mut ContentUnit, payload: &TargetedChangePayload) {
    if unit.run.kind != RunKind::Modify {
        return;
    }

    let mut change = TargetedChange::from(payload.clone());
    let pending = unit
        .pending_change
        .get_or_insert_with(|| PendingChange::new(unit.content.clone()));

    match apply_change(&pending.proposed_content, &change) {
        Some(proposed) => {
            change.applied = true;
            pending.proposed_content = proposed;
        }
        None if !unit.run.draft.is_empty() => {
            pending.proposed_content.clone_from(&unit.run.draft);
        }
        None => {}
    }
    pending.changes.push(change);
}

fn apply_complete(unit: &mut ContentUnit, complete: &CompletePayload) {
    match unit.run.kind {
        RunKind::Generate => {
            if unit.status == UnitStatus::Generating {
                if let Some(content) = &complete.content {
                    unit.content.clone_from(content);
                }
            }
        }
        RunKind::Modify => {
            let rewrite = if unit.run.draft.is_empty() {
                complete.content.clone().unwrap_or_default()
            } else {
                std::mem::take(&mut unit.run.draft)
            };
            if unit.pending_change.is_none() && !rewrite.is_empty() && rewrite != unit.content {
                let mut pending = PendingChange::new(unit.content.clone());
                pending.changes.push(TargetedChange {
                    change_type: ChangeType::Rewrite,
                    target_excerpt: String::new(),
                    replacement_excerpt: rewrite.clone(),
                    description: "Rewrite proposed by modification".to_string(),
                    location: None,
                    applied: true,
                });
                pending.proposed_content = rewrite;
                unit.pending_change = Some(pending);
            }
        }
    }

    unit.run.draft.clear();
    unit.progress = None;
    unit.error = None;
    unit.status = UnitStatus::Complete;
}

fn apply_error(unit: &mut ContentUnit, message: &str) {
    let message = if message.trim().is_empty() {
        UNKNOWN_ERROR
    } else {
        message
    };

    match unit.run.kind {
        RunKind::Generate => unit.content = message.to_string(),
        RunKind::Modify => unit.pending_change = None,
    }

    unit.run.draft.clear();
    unit.progress = None;
    unit.error = Some(message.to_string());
    unit.status = UnitStatus::Error;
}

/// Apply a targeted change to a document.
///
/// Returns `None` when the change cannot be located in the document.
pub fn apply_change(document: &str, change: &TargetedChange) -> Option<String> {
    if change.change_type == ChangeType::Rewrite {
        return Some(change.replacement_excerpt.clone());
    }

    let target = change.target_excerpt.as_str();
    if target.is_empty() {
        return match change.change_type {
            ChangeType::InsertBefore => Some(format!("{}{document}", change.replacement_excerpt)),
            ChangeType::InsertAfter => Some(format!("{document}{}", change.replacement_excerpt)),
            _ => None,
        };
    }

    let start = locate(document, target, change.location)?;
    let end = start + target.len();
    let replacement = change.replacement_excerpt.as_str();

    let result = match change.change_type {
        ChangeType::InsertAfter => format!("{}{replacement}{}", &document[..end], &document[end..]),
        ChangeType::InsertBefore => {
            format!("{}{replacement}{}", &document[..start], &document[start..])
        }
        ChangeType::Delete => format!("{}{}", &document[..start], &document[end..]),
        ChangeType::Replace | ChangeType::Rewrite | ChangeType::Other(_) => {
            format!("{}{replacement}{}", &document[..start], &document[end..])
        }
    };
    Some(result)
}

/// Byte offset of the occurrence of `target` to change: the first one
/// starting inside `location`, else the first one overall.
fn locate(document: &str, target: &str, location: Option<LineSpan>) -> Option<usize> {
    let mut first = None;
    for (offset, _) in document.match_indices(target) {
        let Some(span) = location else {
            return Some(offset);
        };
        let line = document[..offset].matches('\n').count() + 1;
        if span.contains(line) {
            return Some(offset);
        }
        first.get_or_insert(offset);
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursegen_protocol::{Coordinates, MaterialKind, ProgressPayload};
    use pretty_assertions::assert_eq;

    fn generating_unit() -> ContentUnit {
        let mut unit = ContentUnit::material(MaterialKind::Slide, Coordinates::slide(1, 1, 1));
        unit.run.id = 1;
        unit
    }

    fn modifying_unit(content: &str) -> ContentUnit {
        let mut unit = ContentUnit::material(MaterialKind::Slide, Coordinates::slide(1, 1, 1))
            .completed(content);
        unit.status = UnitStatus::Pending;
        unit.run = crate::unit::RunState::new(2, RunKind::Modify);
        unit
    }

    fn change(change_type: ChangeType, target: &str, replacement: &str) -> TargetedChange {
        TargetedChange {
            change_type,
            target_excerpt: target.to_string(),
            replacement_excerpt: replacement.to_string(),
            description: String::new(),
            location: None,
            applied: false,
        }
    }

    fn reduce_all(unit: &ContentUnit, events: &[GenerationEvent]) -> ContentUnit {
        events
            .iter()
            .enumerate()
            .fold(unit.clone(), |acc, (i, e)| reduce(&acc, i as u64 + 1, e))
    }

    #[test]
    fn test_deltas_concatenate_in_order() {
        let events = vec![
            GenerationEvent::Start(StartPayload::default()),
            GenerationEvent::delta("Hello"),
            GenerationEvent::Progress(ProgressPayload::default()),
            GenerationEvent::delta(", "),
            GenerationEvent::delta("world"),
        ];

        let unit = reduce_all(&generating_unit(), &events);
        assert_eq!(unit.status, UnitStatus::Streaming);
        assert_eq!(unit.content, "Hello, world");
        assert_eq!(unit.run.last_seq, 5);
    }

    #[test]
    fn test_first_event_moves_pending_to_generating() {
        let unit = reduce(
            &generating_unit(),
            1,
            &GenerationEvent::Start(StartPayload::default()),
        );
        assert_eq!(unit.status, UnitStatus::Generating);
    }

    #[test]
    fn test_duplicate_sequence_is_noop() {
        let once = reduce(&generating_unit(), 1, &GenerationEvent::delta("A"));
        let twice = reduce(&once, 1, &GenerationEvent::delta("A"));
        assert_eq!(once, twice);

        let older = reduce(&twice, 0, &GenerationEvent::delta("B"));
        assert_eq!(older, once);
    }

    #[test]
    fn test_unknown_event_is_noop() {
        let unit = generating_unit();
        let next = reduce(
            &unit,
            1,
            &GenerationEvent::Unknown {
                kind: Some("heartbeat".to_string()),
                raw: serde_json::json!({}),
            },
        );
        assert_eq!(next, unit);
    }

    #[test]
    fn test_total_only_delta_appends_suffix() {
        let unit = reduce(&generating_unit(), 1, &GenerationEvent::delta("Hel"));
        let unit = reduce(
            &unit,
            2,
            &GenerationEvent::Content(ContentDelta {
                delta: String::new(),
                total: Some("Hello".to_string()),
            }),
        );
        assert_eq!(unit.content, "Hello");

        // A total that does not extend the content is ignored.
        let unit = reduce(
            &unit,
            3,
            &GenerationEvent::Content(ContentDelta {
                delta: String::new(),
                total: Some("Goodbye".to_string()),
            }),
        );
        assert_eq!(unit.content, "Hello");
    }

    #[test]
    fn test_complete_freezes_content() {
        let unit = reduce_all(
            &generating_unit(),
            &[GenerationEvent::delta("Body"), GenerationEvent::complete()],
        );
        assert_eq!(unit.status, UnitStatus::Complete);

        let after = reduce(&unit, 3, &GenerationEvent::delta(" more"));
        assert_eq!(after.content, "Body");
        assert_eq!(after.status, UnitStatus::Complete);
    }

    #[test]
    fn test_complete_content_used_without_deltas() {
        let unit = reduce(
            &generating_unit(),
            1,
            &GenerationEvent::Complete(CompletePayload {
                content: Some("All at once".to_string()),
            }),
        );
        assert_eq!(unit.content, "All at once");
        assert_eq!(unit.status, UnitStatus::Complete);
    }

    #[test]
    fn test_error_replaces_generated_content() {
        let unit = reduce_all(
            &generating_unit(),
            &[
                GenerationEvent::delta("partial"),
                GenerationEvent::error("model overloaded"),
            ],
        );
        assert_eq!(unit.status, UnitStatus::Error);
        assert_eq!(unit.content, "model overloaded");
        assert_eq!(unit.error.as_deref(), Some("model overloaded"));

        let empty = reduce(&generating_unit(), 1, &GenerationEvent::error(""));
        assert_eq!(empty.content, UNKNOWN_ERROR);
    }

    #[test]
    fn test_start_places_unplaced_unit() {
        let mut unit = generating_unit();
        unit.coordinates = Coordinates::module(2);
        unit.material_kind = None;

        let start = StartPayload {
            title: Some("Traits".to_string()),
            material_kind: Some(MaterialKind::Slide),
            module_number: Some(2),
            chapter_number: Some(3),
            slide_number: Some(1),
        };
        let unit = reduce(&unit, 1, &GenerationEvent::Start(start));

        assert_eq!(unit.coordinates, Coordinates::slide(2, 3, 1));
        assert_eq!(unit.title.as_deref(), Some("Traits"));
        assert_eq!(unit.material_kind, Some(MaterialKind::Slide));
    }

    #[test]
    fn test_start_does_not_move_placed_unit() {
        let start = StartPayload {
            module_number: Some(9),
            chapter_number: Some(9),
            slide_number: Some(9),
            ..Default::default()
        };
        let unit = reduce(&generating_unit(), 1, &GenerationEvent::Start(start));
        assert_eq!(unit.coordinates, Coordinates::slide(1, 1, 1));
    }

    #[test]
    fn test_modify_run_builds_proposal_without_touching_content() {
        let unit = modifying_unit("A\nB\nC");
        let events = vec![
            GenerationEvent::TargetedChange(TargetedChangePayload {
                change_type: ChangeType::Replace,
                target: "B".to_string(),
                replacement: "X".to_string(),
                description: "swap B".to_string(),
                coordinates: None,
            }),
            GenerationEvent::complete(),
        ];

        let unit = reduce_all(&unit, &events);
        assert_eq!(unit.status, UnitStatus::Complete);
        assert_eq!(unit.content, "A\nB\nC");

        let pending = unit.pending_change.as_ref().unwrap();
        assert!(pending.is_awaiting());
        assert_eq!(pending.proposed_content, "A\nX\nC");
        assert_eq!(pending.base_content, "A\nB\nC");
        assert!(pending.changes[0].applied);
    }

    #[test]
    fn test_modify_draft_becomes_rewrite_proposal() {
        let unit = reduce_all(
            &modifying_unit("old"),
            &[
                GenerationEvent::delta("new "),
                GenerationEvent::delta("text"),
                GenerationEvent::complete(),
            ],
        );

        assert_eq!(unit.content, "old");
        let pending = unit.pending_change.unwrap();
        assert_eq!(pending.proposed_content, "new text");
        assert_eq!(pending.changes[0].change_type, ChangeType::Rewrite);
        assert!(unit.run.draft.is_empty());
    }

    #[test]
    fn test_modify_identical_draft_creates_no_proposal() {
        let unit = reduce_all(
            &modifying_unit("same"),
            &[GenerationEvent::delta("same"), GenerationEvent::complete()],
        );
        assert!(unit.pending_change.is_none());
        assert_eq!(unit.status, UnitStatus::Complete);
    }

    #[test]
    fn test_modify_error_keeps_content_and_drops_proposal() {
        let unit = reduce_all(
            &modifying_unit("keep me"),
            &[
                GenerationEvent::TargetedChange(TargetedChangePayload {
                    change_type: ChangeType::Delete,
                    target: "keep ".to_string(),
                    ..Default::default()
                }),
                GenerationEvent::error("aborted"),
            ],
        );
        assert_eq!(unit.status, UnitStatus::Error);
        assert_eq!(unit.content, "keep me");
        assert!(unit.pending_change.is_none());
        assert_eq!(unit.error.as_deref(), Some("aborted"));
    }

    #[test]
    fn test_targeted_change_ignored_in_generate_run() {
        let unit = reduce(
            &generating_unit(),
            1,
            &GenerationEvent::TargetedChange(TargetedChangePayload::default()),
        );
        assert!(unit.pending_change.is_none());
    }

    #[test]
    fn test_apply_change_types() {
        let doc = "one two three";
        assert_eq!(
            apply_change(doc, &change(ChangeType::Replace, "two", "2")).unwrap(),
            "one 2 three"
        );
        assert_eq!(
            apply_change(doc, &change(ChangeType::InsertAfter, "two", " and a half")).unwrap(),
            "one two and a half three"
        );
        assert_eq!(
            apply_change(doc, &change(ChangeType::InsertBefore, "two", "really ")).unwrap(),
            "one really two three"
        );
        assert_eq!(
            apply_change(doc, &change(ChangeType::Delete, " two", "")).unwrap(),
            "one three"
        );
        assert_eq!(
            apply_change(doc, &change(ChangeType::Rewrite, "", "fresh")).unwrap(),
            "fresh"
        );
        assert_eq!(
            apply_change(doc, &change(ChangeType::Other("tone".into()), "one", "uno")).unwrap(),
            "uno two three"
        );
        assert_eq!(apply_change(doc, &change(ChangeType::Replace, "four", "4")), None);
        assert_eq!(apply_change(doc, &change(ChangeType::Replace, "", "4")), None);
    }

    #[test]
    fn test_location_selects_occurrence() {
        let doc = "intro\nstep\noutro\nstep";
        let mut c = change(ChangeType::Replace, "step", "STEP");
        c.location = Some(LineSpan {
            start_line: 3,
            end_line: None,
        });
        assert_eq!(apply_change(doc, &c).unwrap(), "intro\nstep\noutro\nSTEP");

        c.location = Some(LineSpan {
            start_line: 10,
            end_line: Some(12),
        });
        assert_eq!(apply_change(doc, &c).unwrap(), "intro\nSTEP\noutro\nstep");
    }

    #[test]
    fn test_transport_error_message() {
        let message = transport_error_message("timeout");
        assert!(message.starts_with(TRANSPORT_ERROR_MARKER));
        assert!(message.ends_with("(timeout)"));
    }
}
