//! Outgoing messages and the task writing them to the client.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{ErrorBody, OutgoingMessage, RequestId, ServerNotification};

/// Capacity of the queue between handlers and the writer task.
const OUTGOING_CAPACITY: usize = 128;

/// Cloneable handle used to queue messages for the client.
#[derive(Debug, Clone)]
pub struct OutgoingMessageSender {
    tx: mpsc::Sender<OutgoingMessage>,
}

impl OutgoingMessageSender {
    pub fn new(tx: mpsc::Sender<OutgoingMessage>) -> Self {
        Self { tx }
    }

    pub async fn send_response<T: Serialize>(&self, id: RequestId, result: T) {
        match serde_json::to_value(result) {
            Ok(result) => self.send(OutgoingMessage::Response { id, result }).await,
            Err(e) => {
                warn!("Failed to serialize response: {e}");
                self.send_error(
                    Some(id),
                    ErrorBody {
                        code: crate::protocol::INTERNAL_ERROR,
                        message: e.to_string(),
                    },
                )
                .await;
            }
        }
    }

    pub async fn send_error(&self, id: Option<RequestId>, error: ErrorBody) {
        self.send(OutgoingMessage::Error { id, error }).await;
    }

    pub async fn send_server_notification(&self, notification: ServerNotification) {
        self.send(OutgoingMessage::Notification(notification)).await;
    }

    async fn send(&self, message: OutgoingMessage) {
        if self.tx.send(message).await.is_err() {
            warn!("Outgoing channel closed; dropping message");
        }
    }
}

/// Spawn the task that serializes queued messages as JSON lines.
///
/// The task ends once every sender is dropped and the queue is drained.
pub fn spawn_writer<W>(mut writer: W) -> (OutgoingMessageSender, JoinHandle<std::io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<OutgoingMessage>(OUTGOING_CAPACITY);
    let task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to serialize outgoing message: {e}");
                    continue;
                }
            };
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;
        }
        debug!("Outgoing writer finished");
        Ok(())
    });
    (OutgoingMessageSender::new(tx), task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_writes_one_json_object_per_line() {
        let (client, server) = tokio::io::duplex(1024);
        let (sender, task) = spawn_writer(server);

        sender
            .send_response(RequestId::Integer(1), json!({"ok": true}))
            .await;
        sender
            .send_error(
                None,
                ErrorBody {
                    code: -32700,
                    message: "bad json".to_string(),
                },
            )
            .await;
        drop(sender);
        task.await.unwrap().unwrap();

        let mut output = String::new();
        let mut client = client;
        client.read_to_string(&mut output).await.unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                json!({"id": 1, "result": {"ok": true}}),
                json!({"id": null, "error": {"code": -32700, "message": "bad json"}}),
            ]
        );
    }
}
