// crates/engram-server/src/transcript.rs
// External transcript store contract
//
// Thread history is owned by an external store; the core only consumes
// this interface for routing context and reply assembly. `message_uuid`
// is assigned by the core's synchronous pre-step and must survive
// save/load round trips.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// One conversational turn as the transcript store sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_uuid: Option<String>,
    pub role: String,
    pub content: String,
}

impl TranscriptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            message_uuid: None,
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            message_uuid: None,
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Interface to the external transcript store.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn load_thread_history(
        &self,
        target: &str,
        thread: &str,
        project_id: &Uuid,
    ) -> Result<Vec<TranscriptMessage>>;

    async fn save_thread_history(
        &self,
        target: &str,
        thread: &str,
        messages: &[TranscriptMessage],
        project_id: &Uuid,
    ) -> Result<()>;
}
