use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};

use crate::{
    chat::port::ChatPort,
    domain::{ChannelId, ChatUser, IncomingMessage},
    Result,
};

/// Slack allows about one post per second per conversation, with a looser
/// workspace-wide limit on top.
#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    pub global_min_interval: Duration,
    pub per_channel_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(50),
            per_channel_min_interval: Duration::from_millis(1050),
        }
    }
}

/// Hands out send slots that satisfy both spacing rules at once.
#[derive(Debug)]
struct Pacer {
    cfg: ThrottleConfig,
    global_free_at: Option<Instant>,
    channel_free_at: HashMap<String, Instant>,
}

impl Pacer {
    fn new(cfg: ThrottleConfig) -> Self {
        Self {
            cfg,
            global_free_at: None,
            channel_free_at: HashMap::new(),
        }
    }

    /// Book the earliest slot for `key`; returns how long to wait for it.
    fn book(&mut self, key: &str, now: Instant) -> Duration {
        let mut slot = now;
        if let Some(t) = self.global_free_at {
            slot = slot.max(t);
        }
        if let Some(t) = self.channel_free_at.get(key) {
            slot = slot.max(*t);
        }

        self.global_free_at = Some(slot + self.cfg.global_min_interval);
        self.channel_free_at
            .insert(key.to_string(), slot + self.cfg.per_channel_min_interval);
        // Conversations idle past their interval no longer constrain anything.
        self.channel_free_at.retain(|_, t| *t > now);

        slot.saturating_duration_since(now)
    }
}

/// ChatPort decorator that spaces outbound posts.
///
/// Reads (`get_users`, `get_messages`) pass straight through.
pub struct ThrottledChat {
    inner: Arc<dyn ChatPort>,
    pacer: Mutex<Pacer>,
}

impl ThrottledChat {
    pub fn new(inner: Arc<dyn ChatPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            pacer: Mutex::new(Pacer::new(cfg)),
        }
    }

    async fn wait_turn(&self, key: &str) {
        let wait = self.pacer.lock().await.book(key, Instant::now());
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl ChatPort for ThrottledChat {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn get_users(&self) -> Result<Vec<ChatUser>> {
        self.inner.get_users().await
    }

    async fn get_messages(&self) -> Result<Vec<IncomingMessage>> {
        self.inner.get_messages().await
    }

    async fn send_message(&self, channel: &ChannelId, text: &str) -> Result<()> {
        self.wait_turn(&channel.0).await;
        self.inner.send_message(channel, text).await
    }

    async fn message_user(&self, user: &ChatUser, text: &str) -> Result<()> {
        self.wait_turn(&format!("user:{}", user.id)).await;
        self.inner.message_user(user, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: fn(u64) -> Duration = Duration::from_millis;

    #[tokio::test(start_paused = true)]
    async fn slots_respect_both_intervals() {
        let mut p = Pacer::new(ThrottleConfig {
            global_min_interval: MS(50),
            per_channel_min_interval: MS(1000),
        });
        let t0 = Instant::now();

        assert_eq!(p.book("C1", t0), Duration::ZERO);
        // Another conversation only waits for the global gap.
        assert_eq!(p.book("C2", t0), MS(50));
        // Same conversation waits a full second.
        assert_eq!(p.book("C1", t0), MS(1000));

        tokio::time::advance(MS(2000)).await;
        assert_eq!(p.book("C1", Instant::now()), Duration::ZERO);
        assert_eq!(p.channel_free_at.len(), 1);
    }
}
