//! Handler turning client requests into generation manager calls.

use coursegen_engine::{EngineError, GenerationManager, Update};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::outgoing_message::OutgoingMessageSender;
use crate::protocol::{
    Ack, CancelResponse, ClientCall, ClientRequest, DecisionResponse, ErrorBody, GenerateResponse,
    INVALID_PARAMS, LoadExistingResponse, ReviewResponse, ServerNotification, ToggleResponse,
    TreeUpdatedNotification, UnitFinishedNotification,
};

/// Owns the generation manager for one client session.
pub struct GenerationHandler {
    manager: GenerationManager,
}

impl GenerationHandler {
    pub fn new(manager: GenerationManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &GenerationManager {
        &self.manager
    }

    /// Answer one request and, when it changed anything, push the new tree.
    pub async fn handle_request(&mut self, request: ClientRequest, outgoing: &OutgoingMessageSender) {
        let call = match request.call() {
            Ok(call) => call,
            Err(e) => {
                warn!("Invalid params for {}: {e}", request.method);
                outgoing
                    .send_error(
                        Some(request.id),
                        ErrorBody {
                            code: INVALID_PARAMS,
                            message: e.to_string(),
                        },
                    )
                    .await;
                return;
            }
        };

        let method = call.method();
        let read_only = matches!(call, ClientCall::Tree | ClientCall::Review(_));
        debug!("Handling {method}");

        match self.dispatch(call).await {
            Ok(result) => {
                outgoing.send_response(request.id, result).await;
                if !read_only {
                    self.notify_tree(outgoing).await;
                }
            }
            Err(e) => {
                warn!("{method} failed: {e}");
                outgoing
                    .send_error(Some(request.id), ErrorBody::from(&e))
                    .await;
            }
        }
    }

    async fn dispatch(&mut self, call: ClientCall) -> Result<Value, EngineError> {
        let manager = &mut self.manager;
        let result = match call {
            ClientCall::LoadExisting(params) => {
                let loaded = manager.load_existing(&params.course_id).await?;
                serde_json::to_value(LoadExistingResponse { loaded })?
            }
            ClientCall::Generate(spec) => {
                let unit_id = manager.generate(spec)?;
                info!("Generating unit {unit_id}");
                serde_json::to_value(GenerateResponse { unit_id })?
            }
            ClientCall::Modify(params) => {
                manager.modify(&params.unit_id, params.instruction)?;
                serde_json::to_value(Ack::ok())?
            }
            ClientCall::Retry(params) => {
                manager.retry(&params.unit_id)?;
                serde_json::to_value(Ack::ok())?
            }
            ClientCall::Cancel(params) => {
                let cancelled = manager.cancel(&params.unit_id)?;
                serde_json::to_value(CancelResponse { cancelled })?
            }
            ClientCall::Remove(params) => {
                manager.remove(&params.unit_id)?;
                serde_json::to_value(Ack::ok())?
            }
            ClientCall::Select(params) => {
                manager.select(params.unit_id)?;
                serde_json::to_value(Ack::ok())?
            }
            ClientCall::Toggle(key) => {
                let expanded = manager.toggle_expanded(key);
                serde_json::to_value(ToggleResponse { expanded })?
            }
            ClientCall::Review(params) => {
                let review = manager.review(&params.unit_id)?;
                serde_json::to_value(ReviewResponse { review })?
            }
            ClientCall::Approve(params) => {
                let change = manager.approve(&params.unit_id)?;
                serde_json::to_value(DecisionResponse {
                    unit_id: params.unit_id,
                    change,
                })?
            }
            ClientCall::Reject(params) => {
                let change = manager.reject(&params.unit_id)?;
                serde_json::to_value(DecisionResponse {
                    unit_id: params.unit_id,
                    change,
                })?
            }
            ClientCall::Tree => serde_json::to_value(manager.tree())?,
        };
        Ok(result)
    }

    pub fn is_idle(&self) -> bool {
        self.manager.is_idle()
    }

    pub async fn next_update(&mut self) -> Option<Update> {
        self.manager.next_update().await
    }

    /// Push notifications for an applied dispatch.
    pub async fn process_update(&mut self, update: Update, outgoing: &OutgoingMessageSender) {
        if !update.changed() {
            return;
        }
        self.notify_tree(outgoing).await;

        let Some(unit) = self.manager.unit(update.unit_id()) else {
            return;
        };
        if unit.status.is_terminal() {
            outgoing
                .send_server_notification(ServerNotification::UnitFinished(
                    UnitFinishedNotification {
                        unit_id: unit.id.clone(),
                        status: unit.status,
                    },
                ))
                .await;
        }
    }

    async fn notify_tree(&self, outgoing: &OutgoingMessageSender) {
        outgoing
            .send_server_notification(ServerNotification::TreeUpdated(TreeUpdatedNotification {
                tree: self.manager.tree(),
                stats: self.manager.stats().into(),
            }))
            .await;
    }
}
