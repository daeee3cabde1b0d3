use async_trait::async_trait;

use crate::{
    domain::{ChannelId, ChatUser, IncomingMessage},
    Result,
};

/// Chat platform port.
///
/// Slack is the implementation; the bot only ever talks to users in direct
/// messages and posts summaries to one reporting channel.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Verify credentials and resolve the bot's own identity.
    async fn connect(&self) -> Result<()>;

    /// All workspace members (including deleted and bot accounts).
    async fn get_users(&self) -> Result<Vec<ChatUser>>;

    /// Direct messages received since the previous call, oldest first.
    async fn get_messages(&self) -> Result<Vec<IncomingMessage>>;

    async fn send_message(&self, channel: &ChannelId, text: &str) -> Result<()>;

    /// Send a direct message, opening the conversation if needed.
    async fn message_user(&self, user: &ChatUser, text: &str) -> Result<()>;
}
