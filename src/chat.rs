//! Chat completions delegated to a connected client.
//!
//! A job asks for a completion, the server pushes `chat.start` to every
//! connection and whichever client owns a model answers with `chat.chunk`
//! requests. Chunks are routed back to the waiting job by `chatId`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cancellation::{CancelledError, Token};
use crate::connections::ConnectionManager;
use crate::frame::FrameCodec;
use crate::messages::{ChatCancel, ChatChunk, ChatMessage, ChatStart, ServerEvent};
use crate::runner::JobError;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    #[error("chat failed: {0}")]
    Failed(String),
    #[error("chat closed before finishing")]
    Closed,
}

impl From<ChatError> for JobError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::Cancelled(c) => JobError::Cancelled(c),
            other => JobError::failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatReply {
    pub text: String,
    pub finish_reason: Option<String>,
    pub tokens: Option<u64>,
}

pub struct ChatRelay {
    chats: Mutex<HashMap<String, mpsc::UnboundedSender<ChatChunk>>>,
    connections: Arc<ConnectionManager>,
    codec: FrameCodec,
}

impl ChatRelay {
    pub fn new(connections: Arc<ConnectionManager>, codec: FrameCodec) -> Self {
        Self { chats: Mutex::new(HashMap::new()), connections, codec }
    }

    pub fn start(self: &Arc<Self>, model: &str, messages: Vec<ChatMessage>) -> ChatStream {
        let chat_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.chats.lock().insert(chat_id.clone(), tx);

        let event = ServerEvent::ChatStart(ChatStart {
            chat_id: chat_id.clone(),
            model: model.to_string(),
            messages,
        });
        match self.codec.encode(&event) {
            Ok(frame) => {
                let reached = self.connections.broadcast(&[frame]);
                tracing::debug!(chat_id = %chat_id, model, reached, "chat delegated");
            }
            Err(e) => tracing::warn!(chat_id = %chat_id, error = %e, "failed to encode chat.start"),
        }
        ChatStream { relay: Arc::clone(self), chat_id, rx, finished: false }
    }

    /// Route a client chunk. `false` when no chat with that id is waiting.
    pub fn handle_chunk(&self, chunk: ChatChunk) -> bool {
        let mut chats = self.chats.lock();
        let chat_id = chunk.chat_id.clone();
        let Some(tx) = chats.get(&chat_id) else {
            return false;
        };
        let last = chunk.is_final();
        let delivered = tx.send(chunk).is_ok();
        if last || !delivered {
            chats.remove(&chat_id);
        }
        delivered
    }

    pub fn active_chats(&self) -> usize {
        self.chats.lock().len()
    }

    fn cancel(&self, chat_id: &str) {
        if self.chats.lock().remove(chat_id).is_none() {
            return;
        }
        let event = ServerEvent::ChatCancel(ChatCancel { chat_id: chat_id.to_string() });
        match self.codec.encode(&event) {
            Ok(frame) => {
                self.connections.broadcast(&[frame]);
            }
            Err(e) => tracing::warn!(chat_id, error = %e, "failed to encode chat.cancel"),
        }
    }
}

/// Receiving half of a delegated chat. Dropping it before the final chunk
/// tells clients to stop generating.
pub struct ChatStream {
    relay: Arc<ChatRelay>,
    chat_id: String,
    rx: mpsc::UnboundedReceiver<ChatChunk>,
    finished: bool,
}

impl ChatStream {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub async fn next(&mut self) -> Option<ChatChunk> {
        if self.finished {
            return None;
        }
        let chunk = self.rx.recv().await;
        match &chunk {
            Some(c) if c.is_final() => self.finished = true,
            None => self.finished = true,
            Some(_) => {}
        }
        chunk
    }

    pub async fn collect_text(mut self, token: &Token) -> Result<ChatReply, ChatError> {
        let mut reply = ChatReply::default();
        loop {
            let chunk = tokio::select! {
                reason = token.cancelled() => return Err(CancelledError::new(reason).into()),
                chunk = self.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Err(ChatError::Closed);
            };
            if let Some(error) = chunk.error {
                return Err(ChatError::Failed(error.message));
            }
            if let Some(text) = chunk.chunk.as_deref() {
                reply.text.push_str(text);
            }
            if chunk.tokens.is_some() {
                reply.tokens = chunk.tokens;
            }
            if chunk.finish_reason.is_some() {
                reply.finish_reason = chunk.finish_reason;
                return Ok(reply);
            }
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if !self.finished {
            self.relay.cancel(&self.chat_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::Controller;
    use crate::connections::{DeliveryMode, Outbound};
    use crate::messages::{SerializedError, ServerMessage};

    fn relay() -> (Arc<ChatRelay>, mpsc::UnboundedReceiver<Outbound>) {
        let connections = Arc::new(ConnectionManager::new());
        let rx = connections.add("c1".into(), DeliveryMode::Unicast);
        (Arc::new(ChatRelay::new(connections, FrameCodec::default())), rx)
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> ServerEvent {
        match rx.try_recv() {
            Ok(Outbound::Frame(text)) => match FrameCodec::default().decode(&text).unwrap() {
                ServerMessage::Event(event) => event,
                other => panic!("expected event, got {other:?}"),
            },
            other => panic!("expected frame, got {other:?}"),
        }
    }

    fn chunk(chat_id: &str, text: &str) -> ChatChunk {
        ChatChunk { chat_id: chat_id.into(), chunk: Some(text.into()), ..Default::default() }
    }

    #[tokio::test]
    async fn chunks_are_collected_until_finish() {
        let (relay, mut rx) = relay();
        let stream = relay.start("ollama:phi3", vec![ChatMessage::user("hi")]);
        let chat_id = stream.chat_id().to_string();

        match next_event(&mut rx) {
            ServerEvent::ChatStart(start) => {
                assert_eq!(start.chat_id, chat_id);
                assert_eq!(start.model, "ollama:phi3");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(relay.handle_chunk(chunk(&chat_id, "hel")));
        assert!(relay.handle_chunk(ChatChunk {
            finish_reason: Some("stop".into()),
            tokens: Some(3),
            ..chunk(&chat_id, "lo")
        }));
        assert_eq!(relay.active_chats(), 0);

        let token = Controller::new().token();
        let reply = stream.collect_text(&token).await.unwrap();
        assert_eq!(reply.text, "hello");
        assert_eq!(reply.finish_reason.as_deref(), Some("stop"));
        assert_eq!(reply.tokens, Some(3));
        assert!(rx.try_recv().is_err(), "finished chat must not be cancelled");
    }

    #[tokio::test]
    async fn client_error_fails_the_chat() {
        let (relay, _rx) = relay();
        let stream = relay.start("m", Vec::new());
        let chat_id = stream.chat_id().to_string();
        relay.handle_chunk(ChatChunk {
            chat_id,
            error: Some(SerializedError::new("quota")),
            ..Default::default()
        });
        let err = stream.collect_text(&Controller::new().token()).await.unwrap_err();
        assert!(matches!(err, ChatError::Failed(ref m) if m == "quota"));
    }

    #[tokio::test]
    async fn dropping_an_unfinished_chat_broadcasts_cancel() {
        let (relay, mut rx) = relay();
        let stream = relay.start("m", Vec::new());
        let chat_id = stream.chat_id().to_string();
        let _ = next_event(&mut rx);

        drop(stream);
        assert!(matches!(next_event(&mut rx), ServerEvent::ChatCancel(c) if c.chat_id == chat_id));
        assert!(!relay.handle_chunk(chunk(&chat_id, "late")));
    }

    #[tokio::test]
    async fn cancellation_interrupts_collection() {
        let (relay, _rx) = relay();
        let stream = relay.start("m", Vec::new());
        let controller = Controller::new();
        controller.abort("user");
        let err = stream.collect_text(&controller.token()).await.unwrap_err();
        assert!(matches!(err, ChatError::Cancelled(ref c) if c.reason == "user"));
        assert_eq!(relay.active_chats(), 0);
    }

    #[test]
    fn unknown_chat_is_rejected() {
        let (relay, _rx) = relay();
        assert!(!relay.handle_chunk(chunk("nope", "x")));
    }
}
