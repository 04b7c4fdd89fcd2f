//! # Course Generation Engine
//!
//! Tracks every content unit of a course while a language model generates it,
//! from the moment it is requested until it is complete, failed or cancelled.
//!
//! - **Store**: authoritative unit state and its lifecycle
//! - **Orchestrators**: one task per streaming request
//! - **Tree**: deterministic module → chapter → material projection
//! - **Diff**: review of proposed modifications before they are committed
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      GenerationManager                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  generate / modify / retry                                      │
//! │        │                                                        │
//! │        ▼                                                        │
//! │  StreamOrchestrator ──► GenerationBackend ──► bytes             │
//! │        │                                        │               │
//! │        │◄──────────── EventParser ◄─────────────┘               │
//! │        ▼                                                        │
//! │  dispatch channel ──► ContentUnitStore ──► TreeReconciler       │
//! │                              ▲                                  │
//! │  approve / reject / cancel ──┘                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use coursegen_engine::{EngineConfig, GenerateSpec, GenerationManager, HttpGenerationBackend};
//! use coursegen_protocol::{Coordinates, MaterialKind};
//!
//! let config = EngineConfig::default();
//! let backend = HttpGenerationBackend::new(config.backend.clone())?;
//! let mut manager = GenerationManager::new(Arc::new(backend), &config);
//!
//! manager.generate(GenerateSpec::material(MaterialKind::Slide, Coordinates::slide(1, 1, 1)))?;
//! while let Some(update) = manager.next_update().await {
//!     if update.changed() {
//!         render(manager.tree());
//!     }
//! }
//! ```

pub mod backend;
pub mod config;
pub mod diff;
pub mod error;
pub mod manager;
pub mod orchestrator;
pub mod persistence;
pub mod reducer;
pub mod store;
pub mod tree;
pub mod unit;

pub use backend::{
    ByteStream, ChannelBackend, CredentialProvider, GenerationBackend, HttpGenerationBackend,
    OpenedStream, StaticCredentials, TOKEN_ENV_VAR,
};
pub use config::{BackendConfig, DispatchConfig, EngineConfig, StreamConfig, TreeConfig};
pub use diff::{
    ChangeReview, DiffLine, DiffSummary, LineChange, SideBySide, SideLine, side_by_side,
    unified_diff,
};
pub use error::{BackendError, EngineError, Result};
pub use manager::{GenerateSpec, GenerationManager, Update};
pub use orchestrator::{
    Dispatch, DispatchKind, HandleId, OrchestratorContext, OrchestratorHandle, StreamOrchestrator,
};
pub use persistence::{
    CourseRepository, HttpCourseRepository, InMemoryCourseRepository, MaterialRecord,
};
pub use reducer::{TRANSPORT_ERROR_MARKER, reduce, transport_error_message};
pub use store::{ApplyOutcome, ContentUnitStore, StoreStats};
pub use tree::{ChapterNode, ModuleNode, NodeKey, TreeEntry, TreeReconciler, TreeView};
pub use unit::{
    ContentUnit, DecisionStatus, PendingChange, Progress, RunKind, RunState, TargetedChange,
    UnitId, UnitStatus,
};
