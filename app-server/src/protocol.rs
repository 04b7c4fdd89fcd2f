//! Messages exchanged with the client over stdio.
//!
//! Every message is one JSON object per line. Requests carry an `id`, a
//! `method` and its `params`; the server answers each request with a response
//! holding the same `id`, and pushes notifications whenever the tree changes.

use coursegen_engine::{
    ChangeReview, EngineError, GenerateSpec, NodeKey, PendingChange, StoreStats, TreeView,
    UnitId, UnitStatus,
};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC style error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const UNIT_NOT_FOUND: i64 = -32004;
pub const DECISION_CONFLICT: i64 = -32009;
pub const INVALID_STATE: i64 = -32010;
pub const BACKEND_ERROR: i64 = -32020;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

/// A request read from the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientRequest {
    pub id: RequestId,
    pub method: String,

    #[serde(default)]
    pub params: Value,
}

impl ClientRequest {
    /// Decode the method and its parameters.
    pub fn call(&self) -> Result<ClientCall, serde_json::Error> {
        ClientCall::parse(&self.method, self.params.clone())
    }
}

/// Methods understood by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    LoadExisting(LoadExistingParams),
    Generate(GenerateSpec),
    Modify(ModifyParams),
    Retry(UnitParams),
    Cancel(UnitParams),
    Remove(UnitParams),
    Select(SelectParams),
    Toggle(NodeKey),
    Review(UnitParams),
    Approve(UnitParams),
    Reject(UnitParams),
    Tree,
}

pub const METHODS: &[&str] = &[
    "load_existing",
    "generate",
    "modify",
    "retry",
    "cancel",
    "remove",
    "select",
    "toggle",
    "review",
    "approve",
    "reject",
    "tree",
];

impl ClientCall {
    pub fn parse(method: &str, params: Value) -> Result<Self, serde_json::Error> {
        fn params_as<T: DeserializeOwned>(params: Value) -> Result<T, serde_json::Error> {
            serde_json::from_value(params)
        }

        Ok(match method {
            "load_existing" => Self::LoadExisting(params_as(params)?),
            "generate" => Self::Generate(params_as(params)?),
            "modify" => Self::Modify(params_as(params)?),
            "retry" => Self::Retry(params_as(params)?),
            "cancel" => Self::Cancel(params_as(params)?),
            "remove" => Self::Remove(params_as(params)?),
            "select" if params.is_null() => Self::Select(SelectParams { unit_id: None }),
            "select" => Self::Select(params_as(params)?),
            "toggle" => Self::Toggle(params_as(params)?),
            "review" => Self::Review(params_as(params)?),
            "approve" => Self::Approve(params_as(params)?),
            "reject" => Self::Reject(params_as(params)?),
            "tree" => Self::Tree,
            other => return Err(de::Error::unknown_variant(other, METHODS)),
        })
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::LoadExisting(_) => "load_existing",
            Self::Generate(_) => "generate",
            Self::Modify(_) => "modify",
            Self::Retry(_) => "retry",
            Self::Cancel(_) => "cancel",
            Self::Remove(_) => "remove",
            Self::Select(_) => "select",
            Self::Toggle(_) => "toggle",
            Self::Review(_) => "review",
            Self::Approve(_) => "approve",
            Self::Reject(_) => "reject",
            Self::Tree => "tree",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoadExistingParams {
    pub course_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UnitParams {
    pub unit_id: UnitId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModifyParams {
    pub unit_id: UnitId,
    pub instruction: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SelectParams {
    #[serde(default)]
    pub unit_id: Option<UnitId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadExistingResponse {
    pub loaded: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateResponse {
    pub unit_id: UnitId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToggleResponse {
    pub expanded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewResponse {
    pub review: Option<ChangeReview>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionResponse {
    pub unit_id: UnitId,
    pub change: PendingChange,
}

/// Acknowledgement for methods without a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
}

impl From<&EngineError> for ErrorBody {
    fn from(error: &EngineError) -> Self {
        let code = match error {
            EngineError::UnitNotFound(_) => UNIT_NOT_FOUND,
            EngineError::DecisionConflict(_) => DECISION_CONFLICT,
            EngineError::NoPendingChange(_)
            | EngineError::RunInProgress(_)
            | EngineError::InvalidState { .. }
            | EngineError::DuplicateUnit(_) => INVALID_STATE,
            EngineError::Backend(_) => BACKEND_ERROR,
            _ => INTERNAL_ERROR,
        };
        Self {
            code,
            message: error.to_string(),
        }
    }
}

/// Snapshot pushed after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeUpdatedNotification {
    pub tree: TreeView,
    pub stats: StatsSummary,
}

/// Serializable mirror of the store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub total: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub awaiting_approval: usize,
}

impl From<StoreStats> for StatsSummary {
    fn from(stats: StoreStats) -> Self {
        Self {
            total: stats.total,
            in_progress: stats.pending + stats.generating + stats.streaming,
            complete: stats.complete,
            failed: stats.error,
            cancelled: stats.cancelled,
            awaiting_approval: stats.awaiting_approval,
        }
    }
}

/// Pushed when a unit reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFinishedNotification {
    pub unit_id: UnitId,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ServerNotification {
    TreeUpdated(TreeUpdatedNotification),
    UnitFinished(UnitFinishedNotification),
}

/// Anything the server writes to stdout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    Response {
        id: RequestId,
        result: Value,
    },
    Error {
        id: Option<RequestId>,
        error: ErrorBody,
    },
    Notification(ServerNotification),
}
