use std::sync::Arc;

use anyhow::Result;
use serenity::{
    all::{ChannelId, EditMessage, Http, MessageId},
    async_trait,
};
use tracing::error;

use crate::queue::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

/// Posting and editing plain-text messages in guild text channels.
#[async_trait]
pub trait ChatOutput: Send + Sync {
    async fn post(&self, channel_id: ChannelId, content: &str) -> Result<MessageRef>;
    async fn edit(&self, message: MessageRef, content: &str) -> Result<()>;
}

pub struct SerenityChat {
    http: Arc<Http>,
}

impl SerenityChat {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChatOutput for SerenityChat {
    async fn post(&self, channel_id: ChannelId, content: &str) -> Result<MessageRef> {
        let msg = channel_id.say(&self.http, content).await?;
        Ok(MessageRef {
            channel_id,
            message_id: msg.id,
        })
    }

    async fn edit(&self, message: MessageRef, content: &str) -> Result<()> {
        message
            .channel_id
            .edit_message(&self.http, message.message_id, EditMessage::new().content(content))
            .await?;
        Ok(())
    }
}

/// Reports bulk progress by editing one status message.
pub struct MessageProgress {
    chat: Arc<dyn ChatOutput>,
    message: MessageRef,
}

impl MessageProgress {
    pub fn new(chat: Arc<dyn ChatOutput>, message: MessageRef) -> Self {
        Self { chat, message }
    }
}

#[async_trait]
impl Progress for MessageProgress {
    async fn report(&self, done: usize, total: usize) {
        let content = format!("Processing songs… {done}/{total}");
        if let Err(e) = self.chat.edit(self.message, &content).await {
            error!("failed to update progress message: {e:?}");
        }
    }
}
