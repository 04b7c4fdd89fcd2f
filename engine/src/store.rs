//! Authoritative in-session state for every content unit.
//!
//! The `ContentUnitStore` is the only place units are mutated. Every mutation
//! is synchronous; callers serialize access by owning the store (see
//! [`crate::manager::GenerationManager`]).

use chrono::Utc;
use coursegen_protocol::GenerationEvent;
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::reducer::{reduce, transport_error_message};
use crate::unit::{
    ContentUnit, DecisionStatus, PendingChange, RunKind, RunState, UnitId, UnitStatus,
};

/// What happened to an event handed to [`ContentUnitStore::apply_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The unit changed.
    Applied,

    /// The sequence number was already applied.
    Duplicate,

    /// The event belongs to a run that no longer owns the unit.
    Stale,

    /// The unit is terminal or the event had no effect.
    Ignored,

    /// No unit with that id exists.
    Missing,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        *self == Self::Applied
    }
}

/// Counts of units per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub generating: usize,
    pub streaming: usize,
    pub complete: usize,
    pub error: usize,
    pub cancelled: usize,
    pub awaiting_approval: usize,
}

/// In-memory store of content units, in insertion order.
#[derive(Debug, Default)]
pub struct ContentUnitStore {
    units: IndexMap<UnitId, ContentUnit>,
    last_run_id: u64,
}

impl ContentUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &UnitId) -> Option<&ContentUnit> {
        self.units.get(id)
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.units.contains_key(id)
    }

    /// All units in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ContentUnit> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Insert a new unit.
    pub fn insert(&mut self, unit: ContentUnit) -> Result<()> {
        if self.units.contains_key(&unit.id) {
            return Err(EngineError::DuplicateUnit(unit.id));
        }
        debug!(
            "Inserted unit {} at {} ({})",
            unit.id, unit.coordinates, unit.status
        );
        self.units.insert(unit.id.clone(), unit);
        Ok(())
    }

    /// Fail with `DecisionConflict` if the unit has a change awaiting approval.
    pub fn ensure_unlocked(&self, id: &UnitId) -> Result<&ContentUnit> {
        let unit = self.require(id)?;
        if unit.is_awaiting_approval() {
            return Err(EngineError::DecisionConflict(id.clone()));
        }
        Ok(unit)
    }

    /// Start a new orchestration run against a unit and return its run id.
    ///
    /// Generate runs clear the content; modify runs require committed content
    /// and leave it untouched.
    pub fn begin_run(&mut self, id: &UnitId, kind: RunKind) -> Result<u64> {
        let unit = self.ensure_unlocked(id)?;
        if unit.is_running() {
            return Err(EngineError::RunInProgress(id.clone()));
        }
        // A failed or cancelled modify run left the committed content intact,
        // so it can be modified again.
        let modifiable = unit.status == UnitStatus::Complete
            || (unit.run.kind == RunKind::Modify
                && matches!(unit.status, UnitStatus::Error | UnitStatus::Cancelled));
        if kind == RunKind::Modify && !modifiable {
            return Err(EngineError::InvalidState {
                id: id.clone(),
                status: unit.status,
                operation: "modify",
            });
        }

        self.last_run_id += 1;
        let run_id = self.last_run_id;
        let unit = self.require_mut(id)?;

        unit.run = RunState::new(run_id, kind);
        unit.status = UnitStatus::Pending;
        unit.progress = None;
        unit.error = None;
        unit.pending_change = None;
        if kind == RunKind::Generate {
            unit.content.clear();
        }
        unit.updated_at = Utc::now();

        info!("Started {kind:?} run {run_id} for unit {id}");
        Ok(run_id)
    }

    /// Apply one sequenced event from run `run_id`.
    pub fn apply_event(
        &mut self,
        id: &UnitId,
        run_id: u64,
        seq: u64,
        event: &GenerationEvent,
    ) -> ApplyOutcome {
        let Some(unit) = self.units.get(id) else {
            debug!("Dropping event for unknown unit {id}");
            return ApplyOutcome::Missing;
        };
        if unit.run.id != run_id {
            debug!("Dropping event from stale run {run_id} for unit {id}");
            return ApplyOutcome::Stale;
        }
        if seq <= unit.run.last_seq {
            debug!("Dropping duplicate event #{seq} for unit {id}");
            return ApplyOutcome::Duplicate;
        }
        if unit.status.is_terminal() {
            debug!("Ignoring event #{seq} for {} unit {id}", unit.status);
            return ApplyOutcome::Ignored;
        }

        let mut next = reduce(unit, seq, event);
        if next == *unit {
            return ApplyOutcome::Ignored;
        }

        let previous = unit.status;
        if next.status != previous {
            info!("Unit {id}: {previous} -> {}", next.status);
        }
        if let Some(message) = next.error.as_deref().filter(|_| previous != next.status) {
            warn!("Unit {id} failed: {message}");
        }

        if next.status == UnitStatus::Complete && previous != UnitStatus::Complete {
            self.claim_slot(&mut next);
        }

        next.updated_at = Utc::now();
        self.units.insert(id.clone(), next);
        ApplyOutcome::Applied
    }

    /// Close out a run whose connection ended.
    ///
    /// A run that never reached a terminal state fails with a transport
    /// error instead of staying in progress forever.
    pub fn finalize(&mut self, id: &UnitId, run_id: u64) -> ApplyOutcome {
        let Some(unit) = self.units.get(id) else {
            return ApplyOutcome::Missing;
        };
        if unit.run.id != run_id {
            return ApplyOutcome::Stale;
        }
        if unit.status.is_terminal() {
            return ApplyOutcome::Ignored;
        }

        let seq = unit.run.last_seq + 1;
        let message = transport_error_message("connection closed before generation completed");
        self.apply_event(id, run_id, seq, &GenerationEvent::error(message))
    }

    /// Cancel the unit's run. Returns `false` if it was already terminal.
    pub fn cancel(&mut self, id: &UnitId) -> Result<bool> {
        let unit = self.require_mut(id)?;
        if unit.status.is_terminal() {
            return Ok(false);
        }

        unit.status = UnitStatus::Cancelled;
        unit.progress = None;
        unit.run.draft.clear();
        if unit.run.kind == RunKind::Modify {
            unit.pending_change = None;
        }
        unit.updated_at = Utc::now();

        info!("Cancelled unit {id}");
        Ok(true)
    }

    /// Remove a unit.
    pub fn remove(&mut self, id: &UnitId) -> Result<ContentUnit> {
        self.ensure_unlocked(id)?;
        let unit = self
            .units
            .shift_remove(id)
            .ok_or_else(|| EngineError::UnitNotFound(id.clone()))?;
        info!("Removed unit {id}");
        Ok(unit)
    }

    /// Commit the pending proposal into the unit's content.
    pub fn approve(&mut self, id: &UnitId) -> Result<PendingChange> {
        let mut pending = self.take_decision(id)?;
        let unit = self.require_mut(id)?;

        unit.content.clone_from(&pending.proposed_content);
        unit.updated_at = Utc::now();
        pending.decision_status = DecisionStatus::Approved;

        info!("Approved change for unit {id}");
        Ok(pending)
    }

    /// Discard the pending proposal, leaving the content untouched.
    pub fn reject(&mut self, id: &UnitId) -> Result<PendingChange> {
        let mut pending = self.take_decision(id)?;
        if let Some(unit) = self.units.get_mut(id) {
            unit.updated_at = Utc::now();
        }
        pending.decision_status = DecisionStatus::Rejected;

        info!("Rejected change for unit {id}");
        Ok(pending)
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            total: self.units.len(),
            ..StoreStats::default()
        };
        for unit in self.units.values() {
            match unit.status {
                UnitStatus::Pending => stats.pending += 1,
                UnitStatus::Generating => stats.generating += 1,
                UnitStatus::Streaming => stats.streaming += 1,
                UnitStatus::Complete => stats.complete += 1,
                UnitStatus::Error => stats.error += 1,
                UnitStatus::Cancelled => stats.cancelled += 1,
            }
            if unit.is_awaiting_approval() {
                stats.awaiting_approval += 1;
            }
        }
        stats
    }

    fn require(&self, id: &UnitId) -> Result<&ContentUnit> {
        self.units
            .get(id)
            .ok_or_else(|| EngineError::UnitNotFound(id.clone()))
    }

    fn require_mut(&mut self, id: &UnitId) -> Result<&mut ContentUnit> {
        self.units
            .get_mut(id)
            .ok_or_else(|| EngineError::UnitNotFound(id.clone()))
    }

    fn take_decision(&mut self, id: &UnitId) -> Result<PendingChange> {
        let unit = self.require_mut(id)?;
        if !unit.is_awaiting_approval() {
            return Err(EngineError::NoPendingChange(id.clone()));
        }
        if unit.status != UnitStatus::Complete {
            return Err(EngineError::RunInProgress(id.clone()));
        }
        unit.pending_change
            .take()
            .ok_or_else(|| EngineError::NoPendingChange(id.clone()))
    }

    /// Complete unit other than `except` holding `slot`.
    pub fn slot_holder(
        &self,
        slot: (u32, u32, u32),
        except: Option<&UnitId>,
    ) -> Option<&ContentUnit> {
        self.units.values().find(|u| {
            Some(&u.id) != except && u.status == UnitStatus::Complete && u.slot() == Some(slot)
        })
    }

    /// Keep slots unique among complete materials.
    ///
    /// A generate run completing into an occupied slot supersedes the
    /// occupant, unless the occupant has a change awaiting approval. A modify
    /// run never moves or evicts anything: if the slot was taken while it ran,
    /// the modified unit fails and the occupant stays.
    fn claim_slot(&mut self, next: &mut ContentUnit) {
        let Some(slot) = next.slot() else {
            return;
        };
        let Some((occupant, awaiting)) = self
            .slot_holder(slot, Some(&next.id))
            .map(|u| (u.id.clone(), u.is_awaiting_approval()))
        else {
            return;
        };

        if next.run.kind == RunKind::Modify {
            let message = format!(
                "Slot {} was taken by unit {occupant} while this unit was being modified",
                next.coordinates
            );
            fail_slot_claim(next, message);
        } else if awaiting {
            let message = format!(
                "Slot {} is held by unit {occupant}, which has a change awaiting approval",
                next.coordinates
            );
            fail_slot_claim(next, message);
        } else {
            info!(
                "Unit {} supersedes unit {occupant} at {}",
                next.id, next.coordinates
            );
            self.units.shift_remove(&occupant);
        }
    }
}

fn fail_slot_claim(unit: &mut ContentUnit, message: String) {
    warn!("Unit {}: {message}", unit.id);
    unit.status = UnitStatus::Error;
    unit.error = Some(message.clone());
    if unit.run.kind == RunKind::Generate {
        unit.content = message;
    }
    unit.pending_change = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursegen_protocol::{ChangeType, Coordinates, MaterialKind, TargetedChangePayload};
    use pretty_assertions::assert_eq;

    fn slide(module: u32, chapter: u32, slide: u32) -> ContentUnit {
        ContentUnit::material(MaterialKind::Slide, Coordinates::slide(module, chapter, slide))
    }

    fn started(store: &mut ContentUnitStore, unit: ContentUnit) -> (UnitId, u64) {
        let id = unit.id.clone();
        store.insert(unit).unwrap();
        let run = store.begin_run(&id, RunKind::Generate).unwrap();
        (id, run)
    }

    fn complete_with(store: &mut ContentUnitStore, unit: ContentUnit, content: &str) -> UnitId {
        let (id, run) = started(store, unit);
        store.apply_event(&id, run, 1, &GenerationEvent::delta(content));
        store.apply_event(&id, run, 2, &GenerationEvent::complete());
        id
    }

    fn propose(store: &mut ContentUnitStore, id: &UnitId, target: &str, replacement: &str) {
        let run = store.begin_run(id, RunKind::Modify).unwrap();
        let change = GenerationEvent::TargetedChange(TargetedChangePayload {
            change_type: ChangeType::Replace,
            target: target.to_string(),
            replacement: replacement.to_string(),
            description: "edit".to_string(),
            coordinates: None,
        });
        assert_eq!(store.apply_event(id, run, 1, &change), ApplyOutcome::Applied);
        assert_eq!(
            store.apply_event(id, run, 2, &GenerationEvent::complete()),
            ApplyOutcome::Applied
        );
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let mut store = ContentUnitStore::new();
        let unit = slide(1, 1, 1);
        store.insert(unit.clone()).unwrap();
        assert!(matches!(
            store.insert(unit),
            Err(EngineError::DuplicateUnit(_))
        ));
    }

    #[test]
    fn test_apply_event_outcomes() {
        let mut store = ContentUnitStore::new();
        let (id, run) = started(&mut store, slide(1, 1, 1));

        assert_eq!(
            store.apply_event(&id, run, 1, &GenerationEvent::delta("a")),
            ApplyOutcome::Applied
        );
        assert_eq!(
            store.apply_event(&id, run, 1, &GenerationEvent::delta("a")),
            ApplyOutcome::Duplicate
        );
        assert_eq!(
            store.apply_event(&id, run + 1, 2, &GenerationEvent::delta("b")),
            ApplyOutcome::Stale
        );
        assert_eq!(
            store.apply_event(&UnitId::from("nope"), run, 2, &GenerationEvent::delta("b")),
            ApplyOutcome::Missing
        );
        assert_eq!(store.get(&id).unwrap().content, "a");
    }

    #[test]
    fn test_finalize_without_complete_is_error() {
        let mut store = ContentUnitStore::new();
        let (id, run) = started(&mut store, slide(1, 1, 1));
        store.apply_event(&id, run, 1, &GenerationEvent::delta("half"));

        assert_eq!(store.finalize(&id, run), ApplyOutcome::Applied);
        let unit = store.get(&id).unwrap();
        assert_eq!(unit.status, UnitStatus::Error);
        assert!(unit.content.contains("connection closed"));

        assert_eq!(store.finalize(&id, run), ApplyOutcome::Ignored);
    }

    #[test]
    fn test_finalize_after_complete_is_noop() {
        let mut store = ContentUnitStore::new();
        let id = complete_with(&mut store, slide(1, 1, 1), "done");
        let run = store.get(&id).unwrap().run.id;
        assert_eq!(store.finalize(&id, run), ApplyOutcome::Ignored);
        assert_eq!(store.get(&id).unwrap().status, UnitStatus::Complete);
    }

    #[test]
    fn test_cancelled_unit_ignores_late_complete() {
        let mut store = ContentUnitStore::new();
        let (id, run) = started(&mut store, slide(1, 1, 1));
        store.apply_event(&id, run, 1, &GenerationEvent::delta("x"));

        assert!(store.cancel(&id).unwrap());
        assert_eq!(
            store.apply_event(&id, run, 2, &GenerationEvent::complete()),
            ApplyOutcome::Ignored
        );
        assert_eq!(store.get(&id).unwrap().status, UnitStatus::Cancelled);
        assert!(!store.cancel(&id).unwrap());
    }

    #[test]
    fn test_retry_starts_fresh_run() {
        let mut store = ContentUnitStore::new();
        let (id, run) = started(&mut store, slide(1, 1, 1));
        store.apply_event(&id, run, 1, &GenerationEvent::error("boom"));

        let retry = store.begin_run(&id, RunKind::Generate).unwrap();
        assert!(retry > run);
        let unit = store.get(&id).unwrap();
        assert_eq!(unit.status, UnitStatus::Pending);
        assert!(unit.content.is_empty());
        assert_eq!(unit.error, None);

        // Events from the failed run no longer apply.
        assert_eq!(
            store.apply_event(&id, run, 5, &GenerationEvent::delta("old")),
            ApplyOutcome::Stale
        );
        assert_eq!(
            store.apply_event(&id, retry, 1, &GenerationEvent::delta("new")),
            ApplyOutcome::Applied
        );
    }

    #[test]
    fn test_begin_run_rejects_active_run() {
        let mut store = ContentUnitStore::new();
        let (id, _) = started(&mut store, slide(1, 1, 1));
        assert!(matches!(
            store.begin_run(&id, RunKind::Generate),
            Err(EngineError::RunInProgress(_))
        ));
    }

    #[test]
    fn test_modify_requires_complete_unit() {
        let mut store = ContentUnitStore::new();
        let unit = slide(1, 1, 1);
        let id = unit.id.clone();
        store.insert(unit).unwrap();
        assert!(matches!(
            store.begin_run(&id, RunKind::Modify),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_failed_modify_can_be_modified_again() {
        let mut store = ContentUnitStore::new();
        let id = complete_with(&mut store, slide(1, 1, 1), "A\nB");

        let run = store.begin_run(&id, RunKind::Modify).unwrap();
        store.apply_event(&id, run, 1, &GenerationEvent::error("model overloaded"));
        let unit = store.get(&id).unwrap();
        assert_eq!(unit.status, UnitStatus::Error);
        assert_eq!(unit.content, "A\nB");

        store.begin_run(&id, RunKind::Modify).unwrap();
        assert_eq!(store.get(&id).unwrap().content, "A\nB");
    }

    #[test]
    fn test_approve_commits_proposal() {
        let mut store = ContentUnitStore::new();
        let id = complete_with(&mut store, slide(1, 1, 1), "A\nB\nC");
        propose(&mut store, &id, "B", "X");

        let decided = store.approve(&id).unwrap();
        assert_eq!(decided.decision_status, DecisionStatus::Approved);

        let unit = store.get(&id).unwrap();
        assert_eq!(unit.content, "A\nX\nC");
        assert!(unit.pending_change.is_none());
        assert_eq!(unit.status, UnitStatus::Complete);
    }

    #[test]
    fn test_reject_keeps_content() {
        let mut store = ContentUnitStore::new();
        let id = complete_with(&mut store, slide(1, 1, 1), "A\nB\nC");
        propose(&mut store, &id, "B", "X");

        let decided = store.reject(&id).unwrap();
        assert_eq!(decided.decision_status, DecisionStatus::Rejected);

        let unit = store.get(&id).unwrap();
        assert_eq!(unit.content, "A\nB\nC");
        assert!(unit.pending_change.is_none());
        assert!(matches!(
            store.reject(&id),
            Err(EngineError::NoPendingChange(_))
        ));
    }

    #[test]
    fn test_awaiting_approval_blocks_mutation() {
        let mut store = ContentUnitStore::new();
        let id = complete_with(&mut store, slide(1, 1, 1), "A");
        propose(&mut store, &id, "A", "B");

        let before = store.get(&id).unwrap().clone();
        assert!(matches!(
            store.begin_run(&id, RunKind::Generate),
            Err(EngineError::DecisionConflict(_))
        ));
        assert!(matches!(
            store.begin_run(&id, RunKind::Modify),
            Err(EngineError::DecisionConflict(_))
        ));
        assert!(matches!(
            store.remove(&id),
            Err(EngineError::DecisionConflict(_))
        ));
        assert_eq!(store.get(&id).unwrap(), &before);
        assert_eq!(store.stats().awaiting_approval, 1);
    }

    #[test]
    fn test_approve_while_modify_running_is_rejected() {
        let mut store = ContentUnitStore::new();
        let id = complete_with(&mut store, slide(1, 1, 1), "A");
        let run = store.begin_run(&id, RunKind::Modify).unwrap();
        store.apply_event(
            &id,
            run,
            1,
            &GenerationEvent::TargetedChange(TargetedChangePayload {
                target: "A".to_string(),
                replacement: "B".to_string(),
                ..Default::default()
            }),
        );

        assert!(matches!(
            store.approve(&id),
            Err(EngineError::RunInProgress(_))
        ));

        // Cancelling the modify run drops the partial proposal.
        assert!(store.cancel(&id).unwrap());
        let unit = store.get(&id).unwrap();
        assert!(unit.pending_change.is_none());
        assert_eq!(unit.content, "A");
    }

    #[test]
    fn test_completed_unit_supersedes_slot_occupant() {
        let mut store = ContentUnitStore::new();
        let old = complete_with(&mut store, slide(1, 1, 1), "old");
        let new = complete_with(&mut store, slide(1, 1, 1), "new");

        assert!(store.get(&old).is_none());
        assert_eq!(store.get(&new).unwrap().content, "new");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_slot_held_by_awaiting_unit_fails_newcomer() {
        let mut store = ContentUnitStore::new();
        let old = complete_with(&mut store, slide(1, 1, 1), "old");
        propose(&mut store, &old, "old", "older");

        let new = complete_with(&mut store, slide(1, 1, 1), "new");
        assert_eq!(store.get(&new).unwrap().status, UnitStatus::Error);
        assert!(store.get(&old).unwrap().is_awaiting_approval());
    }

    #[test]
    fn test_modify_never_evicts_slot_taken_meanwhile() {
        let mut store = ContentUnitStore::new();
        let first = complete_with(&mut store, slide(1, 1, 1), "first");
        let run = store.begin_run(&first, RunKind::Modify).unwrap();

        let second = complete_with(&mut store, slide(1, 1, 1), "second");
        assert_eq!(store.get(&first).unwrap().status, UnitStatus::Pending);

        store.apply_event(&first, run, 1, &GenerationEvent::delta("first"));
        store.apply_event(&first, run, 2, &GenerationEvent::complete());

        let second = store.get(&second).unwrap();
        assert_eq!(second.status, UnitStatus::Complete);
        assert_eq!(second.content, "second");

        let first = store.get(&first).unwrap();
        assert_eq!(first.status, UnitStatus::Error);
        assert_eq!(first.content, "first");
        assert!(first.pending_change.is_none());
        assert_eq!(store.stats().complete, 1);
    }

    #[test]
    fn test_slot_holder() {
        let mut store = ContentUnitStore::new();
        let id = complete_with(&mut store, slide(1, 1, 1), "A");

        assert_eq!(store.slot_holder((1, 1, 1), None).map(|u| &u.id), Some(&id));
        assert!(store.slot_holder((1, 1, 1), Some(&id)).is_none());
        assert!(store.slot_holder((1, 1, 2), None).is_none());
    }

    #[test]
    fn test_stats() {
        let mut store = ContentUnitStore::new();
        complete_with(&mut store, slide(1, 1, 1), "a");
        started(&mut store, slide(1, 1, 2));
        let (failed, run) = started(&mut store, slide(1, 1, 3));
        store.apply_event(&failed, run, 1, &GenerationEvent::error("x"));

        let stats = store.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.complete, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.error, 1);
    }
}
