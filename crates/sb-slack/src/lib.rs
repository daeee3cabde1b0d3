//! Slack adapter (Web API over reqwest).
//!
//! This crate implements the `sb-core` ChatPort. Inbound direct messages are
//! polled from `conversations.history` of the bot's IM channels. Reads are
//! paced under Slack's per-method limits: the IM list is refreshed once a
//! minute, and history reads draw from a token bucket, busy channels first.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{sync::Mutex, time::sleep};

use sb_core::{
    chat::port::ChatPort,
    domain::{ChannelId, ChatUser, IncomingMessage},
    errors::Error,
    Result,
};

const SLACK_API: &str = "https://slack.com/api";
const PAGE_LIMIT: &str = "200";

/// `conversations.list` is Tier 2 (about 20 calls a minute).
const IM_LIST_REFRESH: Duration = Duration::from_secs(60);
/// `conversations.history` is Tier 3 (about 50 calls a minute).
const HISTORY_READS_PER_MINUTE: u32 = 40;
const HISTORY_BURST: u32 = 8;
/// Channels with traffic this recent are read before the rotation.
const ACTIVE_FOR: Duration = Duration::from_secs(600);

/// Token bucket for history reads. Following `has_more` pages may borrow
/// ahead, which delays later rounds.
#[derive(Debug)]
struct ReadBudget {
    per_sec: f64,
    burst: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl ReadBudget {
    fn new(per_minute: u32, burst: u32, now: Instant) -> Self {
        Self {
            per_sec: f64::from(per_minute) / 60.0,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            refilled_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_sec).min(self.burst);
        self.refilled_at = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn borrow_ahead(&mut self, now: Instant) {
        self.refill(now);
        self.tokens -= 1.0;
    }
}

struct SlackState {
    self_id: Option<String>,
    /// user id -> IM channel id
    dm_channels: HashMap<String, String>,
    /// IM channel id -> newest ts already delivered
    cursors: HashMap<String, String>,
    /// Messages older than this are never delivered.
    started_at: String,
    ims: Vec<String>,
    ims_listed_at: Option<Instant>,
    /// IM channel id -> last post or delivery
    active: HashMap<String, Instant>,
    rotation: usize,
    reads: ReadBudget,
}

impl SlackState {
    fn new(now: Instant) -> Self {
        Self {
            self_id: None,
            dm_channels: HashMap::new(),
            cursors: HashMap::new(),
            started_at: now_ts(),
            ims: Vec::new(),
            ims_listed_at: None,
            active: HashMap::new(),
            rotation: 0,
            reads: ReadBudget::new(HISTORY_READS_PER_MINUTE, HISTORY_BURST, now),
        }
    }

    fn add_im(&mut self, channel: &str) {
        if !self.ims.iter().any(|c| c == channel) {
            self.ims.push(channel.to_string());
        }
    }

    fn touch(&mut self, channel: &str, now: Instant) {
        self.active.insert(channel.to_string(), now);
    }
}

pub struct SlackChat {
    token: String,
    base_url: String,
    http: reqwest::Client,
    state: Mutex<SlackState>,
}

impl SlackChat {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, SLACK_API)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Chat(format!("slack client build failed: {e}")))?;
        Ok(Self {
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            state: Mutex::new(SlackState::new(Instant::now())),
        })
    }

    fn map_err(e: reqwest::Error) -> Error {
        Error::Chat(format!("slack error: {e}"))
    }

    async fn with_retry<F, Fut>(&self, mut op: F) -> Result<serde_json::Value>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            let resp = op().await.map_err(Self::map_err)?;
            if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS && attempts < MAX_RETRIES {
                attempts += 1;
                let wait = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);
                tracing::warn!("[SLACK] Rate limited, retrying in {wait}s");
                sleep(Duration::from_secs(wait)).await;
                continue;
            }
            let status = resp.status();
            let v: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| Error::Chat(format!("slack json error ({status}): {e}")))?;
            return check_ok(v);
        }
    }

    async fn api_get(&self, method: &str, query: &[(&str, &str)]) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, method);
        self.with_retry(|| {
            self.http
                .get(&url)
                .bearer_auth(&self.token)
                .query(query)
                .send()
        })
        .await
    }

    async fn api_post(&self, method: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, method);
        self.with_retry(|| {
            self.http
                .post(&url)
                .bearer_auth(&self.token)
                .json(body)
                .send()
        })
        .await
    }

    async fn list_ims(&self) -> Result<Vec<ImChannel>> {
        let mut out = Vec::new();
        let mut cursor = String::new();
        loop {
            let v = self
                .api_get(
                    "conversations.list",
                    &[("types", "im"), ("limit", PAGE_LIMIT), ("cursor", cursor.as_str())],
                )
                .await?;
            let page: ChannelsPage = serde_json::from_value(v)?;
            out.extend(page.channels);
            match page.response_metadata.next_cursor() {
                Some(next) => cursor = next,
                None => return Ok(out),
            }
        }
    }

    async fn dm_channel(&self, user_id: &str) -> Result<String> {
        if let Some(c) = self.state.lock().await.dm_channels.get(user_id) {
            return Ok(c.clone());
        }
        let v = self
            .api_post(
                "conversations.open",
                &serde_json::json!({ "users": user_id }),
            )
            .await?;
        let channel = v
            .get("channel")
            .and_then(|c| c.get("id"))
            .and_then(|id| id.as_str())
            .ok_or_else(|| Error::Chat("conversations.open returned no channel".to_string()))?
            .to_string();
        let mut st = self.state.lock().await;
        st.dm_channels.insert(user_id.to_string(), channel.clone());
        st.add_im(&channel);
        Ok(channel)
    }

    /// Refresh the IM list when stale. A failed refresh keeps the old list.
    async fn refresh_ims(&self) -> Result<()> {
        let now = Instant::now();
        let stale = {
            let st = self.state.lock().await;
            st.ims_listed_at
                .map_or(true, |at| now.saturating_duration_since(at) >= IM_LIST_REFRESH)
        };
        if !stale {
            return Ok(());
        }

        let listed = self.list_ims().await;
        let mut st = self.state.lock().await;
        st.ims_listed_at = Some(now);
        let channels = match listed {
            Ok(c) => c,
            Err(e) if !st.ims.is_empty() => {
                tracing::warn!("[SLACK] Listing IM channels failed: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for channel in channels {
            st.add_im(&channel.id);
            st.dm_channels.insert(channel.user, channel.id);
        }
        tracing::debug!("[SLACK] Watching {} IM channels", st.ims.len());
        Ok(())
    }

    /// One channel's messages newer than `oldest`, across all pages.
    async fn read_channel(
        &self,
        channel: &str,
        oldest: &str,
        self_id: Option<&str>,
    ) -> Result<(Vec<IncomingMessage>, Option<String>)> {
        let mut messages = Vec::new();
        let mut cursor = String::new();
        loop {
            let v = {
                let mut query = vec![
                    ("channel", channel),
                    ("oldest", oldest),
                    ("limit", PAGE_LIMIT),
                ];
                if !cursor.is_empty() {
                    query.push(("cursor", cursor.as_str()));
                }
                self.api_get("conversations.history", &query).await?
            };
            let page: HistoryPage = serde_json::from_value(v)?;
            let next_cursor = page.next_cursor();
            messages.extend(page.messages);
            match next_cursor {
                Some(next) => {
                    self.state.lock().await.reads.borrow_ahead(Instant::now());
                    cursor = next;
                }
                None => break,
            }
        }
        Ok(incoming_from_history(channel, messages, oldest, self_id))
    }
}

/// Recently active channels first, then the others starting at `rotation`.
fn read_order(ims: &[String], active: &HashSet<&str>, rotation: usize) -> Vec<String> {
    let (hot, cold): (Vec<&String>, Vec<&String>) =
        ims.iter().partition(|c| active.contains(c.as_str()));
    let mut out: Vec<String> = hot.into_iter().cloned().collect();
    if !cold.is_empty() {
        let start = rotation % cold.len();
        out.extend(cold[start..].iter().chain(&cold[..start]).map(|c| (*c).clone()));
    }
    out
}

#[async_trait]
impl ChatPort for SlackChat {
    async fn connect(&self) -> Result<()> {
        let v = self.api_get("auth.test", &[]).await?;
        let user_id = v
            .get("user_id")
            .and_then(|u| u.as_str())
            .ok_or_else(|| Error::Chat("auth.test returned no user_id".to_string()))?
            .to_string();
        let team = v.get("team").and_then(|t| t.as_str()).unwrap_or("?");
        tracing::info!("[SLACK] Connected to {team} as {user_id}");
        self.state.lock().await.self_id = Some(user_id);
        Ok(())
    }

    async fn get_users(&self) -> Result<Vec<ChatUser>> {
        let mut out = Vec::new();
        let mut cursor = String::new();
        loop {
            let v = self
                .api_get("users.list", &[("limit", PAGE_LIMIT), ("cursor", cursor.as_str())])
                .await?;
            let page: UsersPage = serde_json::from_value(v)?;
            out.extend(page.members.into_iter().map(ChatUser::from));
            match page.response_metadata.next_cursor() {
                Some(next) => cursor = next,
                None => break,
            }
        }
        tracing::debug!("[SLACK] Loaded {} users", out.len());
        Ok(out)
    }

    async fn get_messages(&self) -> Result<Vec<IncomingMessage>> {
        self.refresh_ims().await?;

        let (order, hot, self_id) = {
            let mut st = self.state.lock().await;
            let now = Instant::now();
            st.active
                .retain(|_, at| now.saturating_duration_since(*at) < ACTIVE_FOR);
            let active: HashSet<&str> = st.active.keys().map(String::as_str).collect();
            let order = read_order(&st.ims, &active, st.rotation);
            let hot = active.len();
            (order, hot, st.self_id.clone())
        };

        let mut out = Vec::new();
        let mut cold_read = 0;
        for (i, channel) in order.iter().enumerate() {
            let oldest = {
                let mut st = self.state.lock().await;
                if !st.reads.try_take(Instant::now()) {
                    break;
                }
                st.cursors
                    .get(channel)
                    .cloned()
                    .unwrap_or_else(|| st.started_at.clone())
            };
            if i >= hot {
                cold_read += 1;
            }

            let (msgs, newest) = match self
                .read_channel(channel, &oldest, self_id.as_deref())
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("[SLACK] History for {channel} failed: {e}");
                    break;
                }
            };
            if let Some(newest) = newest {
                let mut st = self.state.lock().await;
                st.cursors.insert(channel.clone(), newest);
                st.touch(channel, Instant::now());
            }
            out.extend(msgs);
        }
        self.state.lock().await.rotation += cold_read;

        out.sort_by_key(|m| ts_key(&m.ts));
        Ok(out)
    }

    async fn send_message(&self, channel: &ChannelId, text: &str) -> Result<()> {
        self.api_post(
            "chat.postMessage",
            &serde_json::json!({
                "channel": channel.0,
                "text": text,
                "unfurl_links": false,
            }),
        )
        .await?;
        Ok(())
    }

    async fn message_user(&self, user: &ChatUser, text: &str) -> Result<()> {
        let channel = self.dm_channel(&user.id).await?;
        // A reply is likely soon; read this channel ahead of the rotation.
        self.state.lock().await.touch(&channel, Instant::now());
        self.send_message(&ChannelId(channel), text).await
    }
}

// ============== Wire types ==============

#[derive(Debug, Default, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

impl ResponseMetadata {
    fn next_cursor(&self) -> Option<String> {
        (!self.next_cursor.is_empty()).then(|| self.next_cursor.clone())
    }
}

#[derive(Debug, Deserialize)]
struct UsersPage {
    #[serde(default)]
    members: Vec<SlackMember>,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct SlackProfile {
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    real_name: String,
}

#[derive(Debug, Deserialize)]
struct SlackMember {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    profile: SlackProfile,
}

impl From<SlackMember> for ChatUser {
    fn from(m: SlackMember) -> Self {
        let display_name = [m.profile.display_name, m.profile.real_name]
            .into_iter()
            .find(|n| !n.is_empty())
            .unwrap_or_else(|| m.name.clone());
        // Slackbot is a bot even though the API says otherwise.
        let is_bot = m.is_bot || m.id == "USLACKBOT";
        ChatUser {
            id: m.id,
            name: m.name,
            display_name,
            deleted: m.deleted,
            is_bot,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChannelsPage {
    #[serde(default)]
    channels: Vec<ImChannel>,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

#[derive(Debug, Deserialize)]
struct ImChannel {
    id: String,
    #[serde(default)]
    user: String,
}

#[derive(Debug, Deserialize)]
struct HistoryPage {
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

impl HistoryPage {
    fn next_cursor(&self) -> Option<String> {
        if self.has_more {
            self.response_metadata.next_cursor()
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct SlackMessage {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: String,
    ts: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
}

fn check_ok(v: serde_json::Value) -> Result<serde_json::Value> {
    if v.get("ok").and_then(|ok| ok.as_bool()) == Some(true) {
        return Ok(v);
    }
    let err = v
        .get("error")
        .and_then(|e| e.as_str())
        .unwrap_or("unknown_error");
    Err(Error::Chat(format!("slack api error: {err}")))
}

/// Keep plain user messages newer than `oldest`, oldest first.
/// Returns them with the newest ts seen.
fn incoming_from_history(
    channel: &str,
    messages: Vec<SlackMessage>,
    oldest: &str,
    self_id: Option<&str>,
) -> (Vec<IncomingMessage>, Option<String>) {
    let floor = ts_key(oldest);
    let newest = messages
        .iter()
        .map(|m| m.ts.as_str())
        .filter(|ts| ts_key(ts) > floor)
        .max_by_key(|ts| ts_key(ts))
        .map(str::to_string);

    let mut out: Vec<IncomingMessage> = messages
        .into_iter()
        .filter(|m| ts_key(&m.ts) > floor)
        .filter(|m| m.subtype.is_none() && m.bot_id.is_none())
        .filter_map(|m| {
            let user = m.user?;
            if Some(user.as_str()) == self_id {
                return None;
            }
            Some(IncomingMessage {
                user_id: user,
                channel: ChannelId(channel.to_string()),
                text: m.text,
                ts: m.ts,
            })
        })
        .collect();
    out.sort_by_key(|m| ts_key(&m.ts));
    (out, newest)
}

/// Slack timestamps are `seconds.micros`; compare numerically.
fn ts_key(ts: &str) -> (u64, u64) {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    (secs.parse().unwrap_or(0), frac.parse().unwrap_or(0))
}

fn now_ts() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}
