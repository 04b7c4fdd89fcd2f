//! Stream orchestration.
//!
//! A [`StreamOrchestrator`] owns one request/response cycle: it opens the
//! request through a [`GenerationBackend`], decodes the body into events,
//! numbers them and forwards them to the manager over the dispatch channel.
//! It never touches the store itself.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use coursegen_protocol::{GenerationEvent, GenerationRequest, ParserConfig, decode_stream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ByteStream, GenerationBackend};
use crate::error::BackendError;
use crate::reducer::transport_error_message;
use crate::unit::UnitId;

/// Identifies one orchestrator for the lifetime of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Message from an orchestrator task to the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub handle: HandleId,
    pub unit_id: UnitId,
    pub run_id: u64,
    pub kind: DispatchKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchKind {
    /// A decoded event with its per-run sequence number, starting at 1.
    Event { seq: u64, event: GenerationEvent },

    /// The task finished; no more messages follow for this handle.
    Closed,
}

/// Everything an orchestrator needs besides its request.
#[derive(Clone)]
pub struct OrchestratorContext {
    pub backend: Arc<dyn GenerationBackend>,
    pub parser: ParserConfig,
    pub idle_timeout: Option<Duration>,
    pub dispatch: mpsc::Sender<Dispatch>,
}

/// One generation or modification run, before it is started.
pub struct StreamOrchestrator {
    ctx: OrchestratorContext,
    handle: HandleId,
    unit_id: UnitId,
    run_id: u64,
    request: GenerationRequest,
    token: CancellationToken,
}

impl StreamOrchestrator {
    pub fn new(
        ctx: OrchestratorContext,
        handle: HandleId,
        unit_id: UnitId,
        run_id: u64,
        request: GenerationRequest,
    ) -> Self {
        Self {
            ctx,
            handle,
            unit_id,
            run_id,
            request,
            token: CancellationToken::new(),
        }
    }

    /// Spawn the run on the current tokio runtime.
    pub fn start(self) -> OrchestratorHandle {
        let id = self.handle;
        let unit_id = self.unit_id.clone();
        let run_id = self.run_id;
        let token = self.token.clone();
        let task = tokio::spawn(self.run());
        OrchestratorHandle {
            id,
            unit_id,
            run_id,
            token,
            task,
        }
    }

    async fn run(self) {
        info!(
            "Orchestrator {} started for unit {} (run {}, backend {})",
            self.handle,
            self.unit_id,
            self.run_id,
            self.ctx.backend.name()
        );

        let mut seq = 0;
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                debug!("Orchestrator {} cancelled", self.handle);
                Ok(())
            }
            result = self.pump(&mut seq) => result,
        };

        if let Err(e) = result {
            warn!(
                "Generation of unit {} failed in transport: {e}",
                self.unit_id
            );
            if !self.token.is_cancelled() {
                let event = GenerationEvent::error(transport_error_message(&e.to_string()));
                self.send(DispatchKind::Event {
                    seq: seq + 1,
                    event,
                })
                .await;
            }
        }

        self.send(DispatchKind::Closed).await;
        debug!("Orchestrator {} closed after {seq} events", self.handle);
    }

    /// Forward events until a terminal one, the end of the body, or the
    /// dispatch channel closes. Unrecognized events are dropped here and do
    /// not consume a sequence number.
    async fn pump(&self, seq: &mut u64) -> Result<(), BackendError> {
        let bytes = match self.ctx.idle_timeout {
            Some(limit) => {
                let bytes = tokio::time::timeout(limit, self.ctx.backend.open(&self.request))
                    .await
                    .map_err(|_| BackendError::Timeout(limit))??;
                with_idle_timeout(bytes, limit)
            }
            None => self.ctx.backend.open(&self.request).await?,
        };

        let mut events = Box::pin(decode_stream(bytes, self.ctx.parser.clone()));
        while let Some(event) = events.next().await {
            let event = event?;
            if let GenerationEvent::Unknown { kind, .. } = &event {
                debug!(
                    "Orchestrator {} skipping unrecognized event {kind:?}",
                    self.handle
                );
                continue;
            }
            let terminal = event.is_terminal();

            *seq += 1;
            if !self.send(DispatchKind::Event { seq: *seq, event }).await {
                break;
            }
            if terminal {
                break;
            }
        }
        Ok(())
    }

    async fn send(&self, kind: DispatchKind) -> bool {
        let dispatch = Dispatch {
            handle: self.handle,
            unit_id: self.unit_id.clone(),
            run_id: self.run_id,
            kind,
        };
        if self.ctx.dispatch.send(dispatch).await.is_err() {
            debug!("Dispatch channel closed; orchestrator {} stops", self.handle);
            return false;
        }
        true
    }
}

/// Fail the stream when no chunk arrives within `limit`.
fn with_idle_timeout(bytes: ByteStream, limit: Duration) -> ByteStream {
    tokio_stream::StreamExt::timeout(bytes, limit)
        .map(move |chunk| chunk.unwrap_or(Err(BackendError::Timeout(limit))))
        .boxed()
}

/// Control side of a started orchestrator.
#[derive(Debug)]
pub struct OrchestratorHandle {
    pub id: HandleId,
    pub unit_id: UnitId,
    pub run_id: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Stop forwarding events. Already dispatched events are discarded by
    /// the manager once it sees the handle is no longer live.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
