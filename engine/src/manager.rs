//! The generation manager: the engine's single entry point.
//!
//! The manager owns the store and the tree reconciler and is the only writer
//! of either. Orchestrators run as separate tasks and report back through a
//! bounded dispatch channel, which the host drains with
//! [`GenerationManager::next_update`]. Operations that start a run spawn
//! tasks and must be called from within a tokio runtime.

use std::collections::HashMap;
use std::sync::Arc;

use coursegen_protocol::{
    Coordinates, GenerationRequest, MaterialKind, Operation, UnitKind,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::GenerationBackend;
use crate::config::EngineConfig;
use crate::diff::{self, ChangeReview};
use crate::error::{EngineError, Result};
use crate::orchestrator::{
    Dispatch, DispatchKind, HandleId, OrchestratorContext, OrchestratorHandle, StreamOrchestrator,
};
use crate::persistence::CourseRepository;
use crate::store::{ContentUnitStore, StoreStats};
use crate::tree::{NodeKey, TreeReconciler, TreeView};
use crate::unit::{ContentUnit, PendingChange, RunKind, UnitId, UnitStatus};

/// What to generate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateSpec {
    /// Id for the new unit; allocated when absent.
    #[serde(default)]
    pub id: Option<UnitId>,

    #[serde(default)]
    pub kind: UnitKind,

    #[serde(default)]
    pub material_kind: Option<MaterialKind>,

    pub coordinates: Coordinates,

    #[serde(default)]
    pub title: Option<String>,

    /// Backend-specific generation parameters.
    #[serde(default)]
    pub parameters: Value,
}

impl GenerateSpec {
    pub fn material(material_kind: MaterialKind, coordinates: Coordinates) -> Self {
        Self {
            id: None,
            kind: UnitKind::File,
            material_kind: Some(material_kind),
            coordinates,
            title: None,
            parameters: Value::Null,
        }
    }

    pub fn folder(coordinates: Coordinates) -> Self {
        Self {
            id: None,
            kind: UnitKind::Folder,
            material_kind: None,
            coordinates,
            title: None,
            parameters: Value::Null,
        }
    }

    pub fn with_id(mut self, id: impl Into<UnitId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    fn into_unit(self) -> (ContentUnit, Value) {
        let unit = match (self.kind, self.material_kind) {
            (UnitKind::File, Some(kind)) => ContentUnit::material(kind, self.coordinates),
            (UnitKind::File, None) => {
                ContentUnit::material(MaterialKind::Slide, self.coordinates)
            }
            (UnitKind::Folder, _) => ContentUnit::folder(self.coordinates),
        };
        let unit = match self.id {
            Some(id) => unit.with_id(id),
            None => unit,
        };
        let unit = match self.title {
            Some(title) => unit.with_title(title),
            None => unit,
        };
        (unit, self.parameters)
    }
}

/// Result of processing one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// An event changed the unit.
    Changed { unit_id: UnitId, status: UnitStatus },

    /// The dispatch was dropped: cancelled handle, stale run, duplicate or
    /// no-op event.
    Discarded { unit_id: UnitId },

    /// An orchestrator finished. `changed` is set when the run had not
    /// reached a terminal state and was failed on close.
    Closed { unit_id: UnitId, changed: bool },
}

impl Update {
    pub fn unit_id(&self) -> &UnitId {
        match self {
            Self::Changed { unit_id, .. }
            | Self::Discarded { unit_id }
            | Self::Closed { unit_id, .. } => unit_id,
        }
    }

    /// Whether the tree needs to be re-rendered.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Self::Changed { .. } | Self::Closed { changed: true, .. }
        )
    }
}

/// Composes the store, the reconciler and the orchestrators.
pub struct GenerationManager {
    store: ContentUnitStore,
    reconciler: TreeReconciler,
    ctx: OrchestratorContext,
    dispatch_rx: mpsc::Receiver<Dispatch>,
    handles: HashMap<HandleId, OrchestratorHandle>,
    active: HashMap<UnitId, HandleId>,
    requests: HashMap<UnitId, GenerationRequest>,
    next_handle: u64,
    course_id: Option<String>,
    repository: Option<Arc<dyn CourseRepository>>,
}

impl GenerationManager {
    pub fn new(backend: Arc<dyn GenerationBackend>, config: &EngineConfig) -> Self {
        let (dispatch, dispatch_rx) = mpsc::channel(config.dispatch.capacity.max(1));
        let ctx = OrchestratorContext {
            backend,
            parser: config.parser_config(),
            idle_timeout: config.stream.idle_timeout(),
            dispatch,
        };
        Self {
            store: ContentUnitStore::new(),
            reconciler: TreeReconciler::new(&config.tree),
            ctx,
            dispatch_rx,
            handles: HashMap::new(),
            active: HashMap::new(),
            requests: HashMap::new(),
            next_handle: 0,
            course_id: None,
            repository: None,
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn CourseRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Course attached to every request.
    pub fn with_course(mut self, course_id: impl Into<String>) -> Self {
        self.course_id = Some(course_id.into());
        self
    }

    pub fn course_id(&self) -> Option<&str> {
        self.course_id.as_deref()
    }

    /// Hydrate the store with a course's existing units and make it the
    /// current course. Units already in the store are kept as they are.
    pub async fn load_existing(&mut self, course_id: &str) -> Result<usize> {
        let repository = self
            .repository
            .clone()
            .ok_or_else(|| EngineError::Config("no course repository configured".to_string()))?;
        let units = repository.load_existing(course_id).await?;

        self.course_id = Some(course_id.to_string());
        let loaded = self.seed(units)?;
        info!("Loaded {loaded} units for course {course_id}");
        Ok(loaded)
    }

    /// Insert already-built units, skipping ids the store knows and complete
    /// units whose slot is already held.
    pub fn seed(&mut self, units: impl IntoIterator<Item = ContentUnit>) -> Result<usize> {
        let mut inserted = 0;
        for unit in units {
            if self.store.contains(&unit.id) {
                debug!("Skipping known unit {}", unit.id);
                continue;
            }
            let holder = unit
                .slot()
                .filter(|_| unit.status == UnitStatus::Complete)
                .and_then(|slot| self.store.slot_holder(slot, None));
            if let Some(holder) = holder {
                warn!(
                    "Skipping unit {} at {}: slot is held by unit {}",
                    unit.id, unit.coordinates, holder.id
                );
                continue;
            }
            self.store.insert(unit)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Insert a pending unit and start generating it.
    pub fn generate(&mut self, spec: GenerateSpec) -> Result<UnitId> {
        let (unit, parameters) = spec.into_unit();
        let id = unit.id.clone();
        let request = self.generate_request(&unit, parameters);
        let coordinates = unit.coordinates;

        self.store.insert(unit)?;
        self.reconciler.reveal(coordinates);
        self.launch(&id, RunKind::Generate, request)?;
        Ok(id)
    }

    /// Ask the backend for changes to a complete unit. The result is a
    /// pending change awaiting approval; the content stays as it is.
    pub fn modify(&mut self, id: &UnitId, instruction: impl Into<String>) -> Result<()> {
        let unit = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::UnitNotFound(id.clone()))?;
        let request = self.modify_request(unit, instruction.into());
        self.launch(id, RunKind::Modify, request)
    }

    /// Start a fresh run repeating the unit's last request.
    pub fn retry(&mut self, id: &UnitId) -> Result<()> {
        let unit = self.store.ensure_unlocked(id)?;
        let mut request = match self.requests.get(id) {
            Some(request) => request.clone(),
            None => self.generate_request(unit, Value::Null),
        };
        if let Operation::Modify {
            current_content, ..
        } = &mut request.operation
        {
            current_content.clone_from(&unit.content);
        }

        let kind = if request.is_modification() {
            RunKind::Modify
        } else {
            RunKind::Generate
        };
        info!("Retrying unit {id}");
        self.launch(id, kind, request)
    }

    /// Cancel the unit's run. Returns `false` if it had already finished.
    pub fn cancel(&mut self, id: &UnitId) -> Result<bool> {
        if let Some(handle) = self.active.remove(id).and_then(|h| self.handles.get(&h)) {
            handle.cancel();
        }
        self.store.cancel(id)
    }

    /// Remove a unit, cancelling its run if one is active.
    pub fn remove(&mut self, id: &UnitId) -> Result<ContentUnit> {
        self.store.ensure_unlocked(id)?;
        if let Some(handle) = self.active.remove(id).and_then(|h| self.handles.get(&h)) {
            handle.cancel();
        }
        let unit = self.store.remove(id)?;
        self.requests.remove(id);
        self.reconciler.forget(id);
        Ok(unit)
    }

    /// Select a unit, or clear the selection.
    pub fn select(&mut self, id: Option<UnitId>) -> Result<()> {
        if let Some(missing) = id.as_ref().filter(|id| !self.store.contains(id)) {
            return Err(EngineError::UnitNotFound(missing.clone()));
        }
        self.reconciler.select(id);
        Ok(())
    }

    pub fn toggle_expanded(&mut self, key: NodeKey) -> bool {
        self.reconciler.toggle(key)
    }

    pub fn set_expanded(&mut self, key: NodeKey, expanded: bool) {
        self.reconciler.set_expanded(key, expanded);
    }

    /// Diff of the unit's pending change, if one awaits a decision.
    pub fn review(&self, id: &UnitId) -> Result<Option<ChangeReview>> {
        let unit = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::UnitNotFound(id.clone()))?;
        Ok(diff::review(unit))
    }

    pub fn approve(&mut self, id: &UnitId) -> Result<PendingChange> {
        self.store.approve(id)
    }

    pub fn reject(&mut self, id: &UnitId) -> Result<PendingChange> {
        self.store.reject(id)
    }

    pub fn tree(&self) -> TreeView {
        self.reconciler.project(&self.store)
    }

    pub fn unit(&self, id: &UnitId) -> Option<&ContentUnit> {
        self.store.get(id)
    }

    pub fn store(&self) -> &ContentUnitStore {
        &self.store
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Whether no orchestrator is still running.
    pub fn is_idle(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for the next dispatch and apply it. Returns `None` once every
    /// orchestrator has closed.
    pub async fn next_update(&mut self) -> Option<Update> {
        if self.is_idle() {
            return None;
        }
        let dispatch = self.dispatch_rx.recv().await?;
        Some(self.apply(dispatch))
    }

    /// Apply every dispatch that is already queued, without waiting.
    pub fn drain(&mut self) -> Vec<Update> {
        let mut updates = Vec::new();
        while let Ok(dispatch) = self.dispatch_rx.try_recv() {
            updates.push(self.apply(dispatch));
        }
        updates
    }

    /// Apply dispatches until every orchestrator has closed.
    pub async fn run_until_idle(&mut self) -> Vec<Update> {
        let mut updates = Vec::new();
        while let Some(update) = self.next_update().await {
            updates.push(update);
        }
        updates
    }

    fn apply(&mut self, dispatch: Dispatch) -> Update {
        let Dispatch {
            handle,
            unit_id,
            run_id,
            kind,
        } = dispatch;
        let live = self
            .handles
            .get(&handle)
            .is_some_and(OrchestratorHandle::is_live);

        match kind {
            DispatchKind::Event { seq, event } => {
                if !live {
                    debug!("Discarding event #{seq} from cancelled orchestrator {handle}");
                    return Update::Discarded { unit_id };
                }
                if !self.store.apply_event(&unit_id, run_id, seq, &event).changed() {
                    return Update::Discarded { unit_id };
                }

                // Completion may have superseded another unit.
                self.reconciler.retain(&self.store);
                let store = &self.store;
                self.requests.retain(|id, _| store.contains(id));

                match self.store.get(&unit_id) {
                    Some(unit) => Update::Changed {
                        unit_id,
                        status: unit.status,
                    },
                    None => Update::Discarded { unit_id },
                }
            }
            DispatchKind::Closed => {
                self.handles.remove(&handle);
                if self.active.get(&unit_id) == Some(&handle) {
                    self.active.remove(&unit_id);
                }
                let changed = live && self.store.finalize(&unit_id, run_id).changed();
                debug!("Orchestrator {handle} for unit {unit_id} closed");
                Update::Closed { unit_id, changed }
            }
        }
    }

    fn launch(&mut self, id: &UnitId, kind: RunKind, request: GenerationRequest) -> Result<()> {
        let run_id = self.store.begin_run(id, kind)?;

        self.next_handle += 1;
        let handle_id = HandleId::new(self.next_handle);
        let handle = StreamOrchestrator::new(
            self.ctx.clone(),
            handle_id,
            id.clone(),
            run_id,
            request.clone(),
        )
        .start();

        self.handles.insert(handle_id, handle);
        self.active.insert(id.clone(), handle_id);
        self.requests.insert(id.clone(), request);
        Ok(())
    }

    fn base_request(&self, unit: &ContentUnit, operation: Operation) -> GenerationRequest {
        GenerationRequest {
            unit_id: unit.id.to_string(),
            course_id: self.course_id.clone(),
            kind: unit.kind,
            material_kind: unit.material_kind,
            coordinates: unit.coordinates,
            title: unit.title.clone(),
            operation,
        }
    }

    fn generate_request(&self, unit: &ContentUnit, parameters: Value) -> GenerationRequest {
        self.base_request(unit, Operation::Generate { parameters })
    }

    fn modify_request(&self, unit: &ContentUnit, instruction: String) -> GenerationRequest {
        self.base_request(
            unit,
            Operation::Modify {
                instruction,
                current_content: unit.content.clone(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChannelBackend, OpenedStream};
    use crate::persistence::{InMemoryCourseRepository, MaterialRecord};
    use coursegen_protocol::GenerationEvent;
    use pretty_assertions::assert_eq;

    fn manager() -> (GenerationManager, mpsc::UnboundedReceiver<OpenedStream>) {
        let (backend, opened) = ChannelBackend::new();
        let manager = GenerationManager::new(Arc::new(backend), &EngineConfig::default());
        (manager, opened)
    }

    #[tokio::test]
    async fn test_generate_inserts_pending_unit_immediately() {
        let (mut manager, _opened) = manager();
        let id = manager
            .generate(GenerateSpec::material(
                MaterialKind::Slide,
                Coordinates::slide(1, 1, 1),
            ))
            .unwrap();

        let tree = manager.tree();
        assert_eq!(tree.pending.len(), 1);
        assert_eq!(tree.pending[0].id, id);
        assert_eq!(tree.pending[0].status, UnitStatus::Pending);
        assert!(!manager.is_idle());
    }

    #[tokio::test]
    async fn test_request_carries_unit_and_course() {
        let (manager, mut opened) = manager();
        let mut manager = manager.with_course("c-1");
        let id = manager
            .generate(
                GenerateSpec::material(MaterialKind::Quiz, Coordinates::chapter(2, 3))
                    .with_title("Checkpoint"),
            )
            .unwrap();

        let server = opened.recv().await.unwrap();
        assert_eq!(server.request.unit_id, id.as_str());
        assert_eq!(server.request.course_id.as_deref(), Some("c-1"));
        assert_eq!(server.request.material_kind, Some(MaterialKind::Quiz));
        assert_eq!(server.request.title.as_deref(), Some("Checkpoint"));
    }

    #[tokio::test]
    async fn test_modify_requires_existing_unit() {
        let (mut manager, _opened) = manager();
        let result = manager.modify(&UnitId::from("missing"), "shorter");
        assert!(matches!(result, Err(EngineError::UnitNotFound(_))));
    }

    #[tokio::test]
    async fn test_select_unknown_unit() {
        let (mut manager, _opened) = manager();
        assert!(manager.select(Some(UnitId::from("nope"))).is_err());
        assert!(manager.select(None).is_ok());
    }

    #[tokio::test]
    async fn test_load_existing_skips_known_units() {
        let record = MaterialRecord {
            id: "m-1".to_string(),
            kind: UnitKind::File,
            material_kind: Some(MaterialKind::Slide),
            module_number: 1,
            chapter_number: Some(1),
            slide_number: Some(1),
            title: None,
            content: "Intro".to_string(),
        };
        let repository = InMemoryCourseRepository::new().with_course("c-1", vec![record]);
        let (manager, _opened) = manager();
        let mut manager = manager.with_repository(Arc::new(repository));

        assert_eq!(manager.load_existing("c-1").await.unwrap(), 1);
        assert_eq!(manager.load_existing("c-1").await.unwrap(), 0);
        assert_eq!(manager.course_id(), Some("c-1"));
        assert_eq!(manager.tree().permanent_entries().count(), 1);
    }

    #[tokio::test]
    async fn test_load_existing_keeps_slots_unique() {
        let (mut manager, mut opened) = manager();
        let id = manager
            .generate(GenerateSpec::material(
                MaterialKind::Slide,
                Coordinates::slide(1, 1, 1),
            ))
            .unwrap();
        let server = opened.recv().await.unwrap();
        server.send_event(&GenerationEvent::delta("fresh"));
        server.send_event(&GenerationEvent::complete());
        manager.run_until_idle().await;

        let record = |id: &str, slide: u32| MaterialRecord {
            id: id.to_string(),
            kind: UnitKind::File,
            material_kind: Some(MaterialKind::Slide),
            module_number: 1,
            chapter_number: Some(1),
            slide_number: Some(slide),
            title: None,
            content: format!("stored {id}"),
        };
        let repository = InMemoryCourseRepository::new().with_course(
            "c-1",
            vec![record("m-1", 1), record("m-2", 2), record("m-3", 2)],
        );
        let mut manager = manager.with_repository(Arc::new(repository));

        assert_eq!(manager.load_existing("c-1").await.unwrap(), 1);
        assert_eq!(manager.unit(&id).unwrap().content, "fresh");
        assert!(manager.unit(&UnitId::from("m-1")).is_none());
        assert!(manager.unit(&UnitId::from("m-3")).is_none());

        let tree = manager.tree();
        let permanent: Vec<&str> = tree.permanent_entries().map(|e| e.id.as_str()).collect();
        assert_eq!(permanent, vec![id.as_str(), "m-2"]);
    }

    #[tokio::test]
    async fn test_load_existing_without_repository() {
        let (mut manager, _opened) = manager();
        assert!(matches!(
            manager.load_existing("c-1").await,
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_loaded_unit_generates_again() {
        let (mut manager, mut opened) = manager();
        let unit = ContentUnit::material(MaterialKind::Slide, Coordinates::slide(1, 1, 1))
            .with_id("m-1")
            .completed("old");
        manager.seed([unit]).unwrap();

        manager.retry(&UnitId::from("m-1")).unwrap();
        let server = opened.recv().await.unwrap();
        assert!(!server.request.is_modification());
        assert_eq!(
            manager.unit(&UnitId::from("m-1")).unwrap().status,
            UnitStatus::Pending
        );

        server.send_event(&GenerationEvent::delta("new"));
        server.send_event(&GenerationEvent::complete());
        manager.run_until_idle().await;
        assert_eq!(manager.unit(&UnitId::from("m-1")).unwrap().content, "new");
    }
}
