//! # Course Generation App Server
//!
//! Hosts a [`GenerationManager`] behind a line-delimited JSON protocol on
//! stdio. Requests are answered in order; tree snapshots are pushed as
//! notifications whenever a streamed event changes a unit.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        App Server                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  stdin ──► ClientRequest ──► GenerationHandler ──► response     │
//! │                                    │                            │
//! │               orchestrators ──► next_update ──► tree_updated    │
//! │                                                     │           │
//! │                          OutgoingMessageSender ──► stdout       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod generation_handler;
pub mod outgoing_message;
pub mod protocol;

use std::sync::Arc;

use coursegen_engine::{
    CredentialProvider, EngineConfig, GenerationManager, HttpCourseRepository,
    HttpGenerationBackend, StaticCredentials,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::{info, warn};

pub use generation_handler::GenerationHandler;
pub use outgoing_message::{OutgoingMessageSender, spawn_writer};

use crate::protocol::{ClientRequest, ErrorBody, INVALID_REQUEST, PARSE_ERROR, RequestId};

/// Build the HTTP-backed manager and serve it on stdio.
pub async fn run_main(config: EngineConfig, course_id: Option<String>) -> anyhow::Result<()> {
    let credentials: Arc<dyn CredentialProvider> = Arc::new(StaticCredentials::from_env());
    let backend = HttpGenerationBackend::new(config.backend.clone())?
        .with_credentials(Arc::clone(&credentials));
    let repository =
        HttpCourseRepository::new(config.backend.clone())?.with_credentials(credentials);

    let mut manager =
        GenerationManager::new(Arc::new(backend), &config).with_repository(Arc::new(repository));
    if let Some(course_id) = course_id {
        manager = manager.with_course(course_id);
    }

    run(
        GenerationHandler::new(manager),
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
}

/// Serve requests read from `input` until it closes, then let running
/// generations finish before returning.
pub async fn run<R, W>(mut handler: GenerationHandler, input: R, output: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outgoing, writer) = spawn_writer(output);
    let mut lines = BufReader::new(input).lines();
    info!("App server ready");

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&mut handler, &line, &outgoing).await,
                None => break,
            },
            Some(update) = handler.next_update(), if !handler.is_idle() => {
                handler.process_update(update, &outgoing).await;
            }
        }
    }

    info!("Input closed; waiting for running generations");
    while let Some(update) = handler.next_update().await {
        handler.process_update(update, &outgoing).await;
    }

    drop(outgoing);
    writer.await??;
    Ok(())
}

async fn handle_line(handler: &mut GenerationHandler, line: &str, outgoing: &OutgoingMessageSender) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!("Unparseable request: {e}");
            outgoing
                .send_error(
                    None,
                    ErrorBody {
                        code: PARSE_ERROR,
                        message: e.to_string(),
                    },
                )
                .await;
            return;
        }
    };

    let id = value
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
    match serde_json::from_value::<ClientRequest>(value) {
        Ok(request) => handler.handle_request(request, outgoing).await,
        Err(e) => {
            warn!("Invalid request: {e}");
            outgoing
                .send_error(
                    id,
                    ErrorBody {
                        code: INVALID_REQUEST,
                        message: e.to_string(),
                    },
                )
                .await;
        }
    }
}
