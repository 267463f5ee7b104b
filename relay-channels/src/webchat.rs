use crate::error::{ChannelError, Result};
use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, MessageId, OutboundMessage};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const WEBCHAT_CHANNEL_ID: &str = "webchat";
const WEBCHAT_MAX_MESSAGE_CHARS: usize = 64 * 1024;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Hello { sender_id: &'a str },
    Message { id: &'a str, content: &'a str },
    Update { id: &'a str, content: &'a str },
    Typing { active: bool },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Message { content: String },
}

#[derive(Clone)]
struct WebChatState {
    inbound_tx: Arc<tokio::sync::RwLock<Option<mpsc::Sender<InboundMessage>>>>,
    connections: Arc<DashMap<String, mpsc::UnboundedSender<Message>>>,
}

#[derive(Clone)]
pub struct WebChatAdapter {
    state: WebChatState,
}

impl Default for WebChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self {
            state: WebChatState {
                inbound_tx: Arc::new(tokio::sync::RwLock::new(None)),
                connections: Arc::new(DashMap::new()),
            },
        }
    }

    /// Router that serves the WebChat WebSocket at `/ws`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_upgrade)).with_state(self)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    /// Registers an outbound queue for `sender_id`.
    fn attach(&self, sender_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.connections.insert(sender_id.to_string(), tx);
        rx
    }

    fn detach(&self, sender_id: &str) {
        self.state.connections.remove(sender_id);
    }

    fn deliver(&self, recipient_id: &str, frame: &ServerFrame<'_>) -> Result<()> {
        let Some(conn) = self.state.connections.get(recipient_id) else {
            return Err(ChannelError::Fatal(format!(
                "webchat connection not found for recipient_id={recipient_id}"
            )));
        };
        let payload = serde_json::to_string(frame).map_err(ChannelError::fatal)?;
        conn.send(Message::Text(payload.into()))
            .map_err(|_| ChannelError::Fatal("webchat send failed: socket closed".to_string()))
    }
}

async fn ws_upgrade(
    State(adapter): State<Arc<WebChatAdapter>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(adapter, socket))
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_socket(adapter: Arc<WebChatAdapter>, socket: WebSocket) {
    let sender_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut outbound_rx = adapter.attach(&sender_id);

    let hello = ServerFrame::Hello {
        sender_id: &sender_id,
    };
    let hello = match serde_json::to_string(&hello) {
        Ok(hello) => hello,
        Err(e) => {
            tracing::error!(%e, "webchat hello frame failed to serialize");
            adapter.detach(&sender_id);
            return;
        }
    };
    if ws_sender.send(Message::Text(hello.into())).await.is_err() {
        adapter.detach(&sender_id);
        return;
    }
    tracing::info!(sender_id = %sender_id, "webchat connection opened");

    let adapter_out = adapter.clone();
    let sender_id_out = sender_id.clone();
    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        adapter_out.detach(&sender_id_out);
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let content = match parse_client_frame(&text) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(error = %e, sender_id = %sender_id, "webchat invalid payload");
                break;
            }
        };

        let inbound = InboundMessage {
            message_id: Uuid::new_v4().to_string().into(),
            channel_id: WEBCHAT_CHANNEL_ID.into(),
            sender_id: sender_id.as_str().into(),
            thread_id: sender_id.as_str().into(),
            is_group: false,
            content,
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        };

        let tx = adapter.state.inbound_tx.read().await.clone();
        if let Some(tx) = tx {
            if let Err(e) = tx.send(inbound).await {
                tracing::error!(%e, sender_id = %sender_id, "webchat inbound queue closed");
                break;
            }
        } else {
            tracing::error!(
                sender_id = %sender_id,
                "webchat adapter started without inbound queue"
            );
            break;
        }
    }

    outbound_task.abort();
    adapter.detach(&sender_id);
    tracing::info!(sender_id = %sender_id, "webchat connection closed");
}

fn parse_client_frame(text: &str) -> std::result::Result<String, String> {
    let frame: ClientFrame =
        serde_json::from_str(text).map_err(|e| format!("unrecognised frame: {e}"))?;
    match frame {
        ClientFrame::Message { content } if content.trim().is_empty() => {
            Err("message content is empty".to_string())
        }
        ClientFrame::Message { content } => Ok(content),
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn channel_id(&self) -> &str {
        WEBCHAT_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.state.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId> {
        let id = MessageId::new(Uuid::new_v4().to_string());
        self.deliver(
            recipient_id,
            &ServerFrame::Message {
                id: &id,
                content: &message.content,
            },
        )?;
        Ok(id)
    }

    async fn edit(&self, recipient_id: &str, message_id: &MessageId, content: &str) -> Result<()> {
        self.deliver(
            recipient_id,
            &ServerFrame::Update {
                id: message_id,
                content,
            },
        )
    }

    async fn send_typing(&self, recipient_id: &str, active: bool) -> Result<()> {
        self.deliver(recipient_id, &ServerFrame::Typing { active })
    }

    fn supports_edits(&self) -> bool {
        true
    }

    fn supports_typing_events(&self) -> bool {
        true
    }

    fn max_message_chars(&self) -> usize {
        WEBCHAT_MAX_MESSAGE_CHARS
    }
}
