//! The bot loop: poll chat, poll tasks, drive every user's conversation.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::Authenticator,
    chat::port::ChatPort,
    commands::{help_text, parse_command, Command, COMMAND_PREFIX},
    config::BotConfig,
    domain::{ChannelId, ChatUser, IncomingMessage, Ldap},
    formatting::{code_span, escape_mrkdwn, format_escalation, format_unknown_user},
    messages,
    security::CommandLimiter,
    store::{BotStore, IgnoredAlert, NewAlert},
    tasker::{Task, TaskStatus},
    user::{StepContext, User},
    utils::format_duration,
    Result,
};

/// Runtime knobs of the bot loop (a subset of [`BotConfig`]).
#[derive(Clone, Debug)]
pub struct BotSettings {
    pub reporting_channel: ChannelId,
    /// Every alert conversation goes to this user instead of the alert's ldap.
    pub test_username: Option<Ldap>,
    pub auth_window: Duration,
    pub task_poll: Duration,
    pub message_poll: Duration,
    pub user_refresh: Duration,
    pub command_rate_limit: u32,
    pub command_rate_window: Duration,
}

impl From<&BotConfig> for BotSettings {
    fn from(cfg: &BotConfig) -> Self {
        Self {
            reporting_channel: cfg.reporting_channel.clone(),
            test_username: cfg.test_username.clone().map(Ldap),
            auth_window: cfg.auth_window,
            task_poll: cfg.task_poll,
            message_poll: cfg.message_poll,
            user_refresh: cfg.user_refresh,
            command_rate_limit: cfg.command_rate_limit,
            command_rate_window: cfg.command_rate_window,
        }
    }
}

pub struct SecurityBot {
    settings: BotSettings,
    chat: Arc<dyn ChatPort>,
    store: Arc<dyn BotStore>,
    auth: Option<Arc<dyn Authenticator>>,

    /// Keyed by chat user id.
    users: HashMap<String, User>,
    ldap_index: HashMap<Ldap, String>,
    limiter: CommandLimiter,
    last_user_refresh: Option<Instant>,
    last_task_poll: Option<Instant>,
}

fn due(last: Option<Instant>, every: Duration) -> bool {
    last.map(|t| t.elapsed() >= every).unwrap_or(true)
}

impl SecurityBot {
    pub fn new(
        settings: BotSettings,
        chat: Arc<dyn ChatPort>,
        store: Arc<dyn BotStore>,
        auth: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        let limiter =
            CommandLimiter::new(settings.command_rate_limit, settings.command_rate_window);
        Self {
            settings,
            chat,
            store,
            auth,
            users: HashMap::new(),
            ldap_index: HashMap::new(),
            limiter,
            last_user_refresh: None,
            last_task_poll: None,
        }
    }

    pub fn user(&self, ldap: &Ldap) -> Option<&User> {
        self.ldap_index.get(ldap).and_then(|id| self.users.get(id))
    }

    /// Run until `cancel` fires. Per-tick failures are logged, not fatal.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        self.chat.connect().await?;
        self.refresh_users().await?;
        tracing::info!(
            "[BOT] Started with {} users, reporting to {}",
            self.users.len(),
            self.settings.reporting_channel.0
        );
        if let Some(t) = &self.settings.test_username {
            tracing::warn!("[BOT] TEST_USERNAME set: all alerts are sent to {t}");
        }
        if self.auth.is_none() {
            tracing::warn!("[BOT] Duo is not configured; users won't be asked to verify");
        }

        let mut tick = tokio::time::interval(self.settings.message_poll);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = tick.tick() => {
                if let Err(e) = self.tick(Utc::now()).await {
                  tracing::warn!("[BOT] Loop iteration failed: {e}");
                }
              }
            }
        }

        tracing::info!("[BOT] Stopped");
        Ok(())
    }

    /// One loop iteration.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        if due(self.last_user_refresh, self.settings.user_refresh) {
            if let Err(e) = self.refresh_users().await {
                tracing::warn!("[BOT] User refresh failed: {e}");
            }
        }

        match self.chat.get_messages().await {
            Ok(msgs) => {
                for msg in msgs {
                    self.handle_message(msg, now).await;
                }
            }
            Err(e) => tracing::warn!("[BOT] Fetching messages failed: {e}"),
        }

        if due(self.last_task_poll, self.settings.task_poll) {
            self.last_task_poll = Some(Instant::now());
            self.handle_new_tasks(now).await?;
            self.handle_active_tasks(now).await?;
            if let Err(e) = self.store.purge_expired(now).await {
                tracing::warn!("[BOT] Purging ignored alerts failed: {e}");
            }
        }

        self.handle_users(now).await;
        Ok(())
    }

    // === Users ===

    pub async fn refresh_users(&mut self) -> Result<()> {
        let members = self.chat.get_users().await?;
        self.last_user_refresh = Some(Instant::now());
        self.limiter.prune(Instant::now());

        let mut seen = HashMap::new();
        for member in members.into_iter().filter(|m| !m.deleted && !m.is_bot) {
            seen.insert(member.id.clone(), member.ldap());
            match self.users.get_mut(&member.id) {
                Some(existing) => existing.chat = member,
                None => {
                    let id = member.id.clone();
                    self.users
                        .insert(id, User::new(member, self.settings.auth_window));
                }
            }
        }

        // Drop departed members unless a conversation is still in flight.
        self.users
            .retain(|id, u| seen.contains_key(id) || !u.is_idle() || u.queued() > 0);

        self.ldap_index = self
            .users
            .iter()
            .map(|(id, u)| (u.chat.ldap(), id.clone()))
            .collect();
        tracing::debug!("[BOT] Tracking {} users", self.users.len());
        Ok(())
    }

    async fn handle_users(&mut self, now: DateTime<Utc>) {
        let ctx = StepContext {
            chat: self.chat.as_ref(),
            store: self.store.as_ref(),
            auth: self.auth.as_deref(),
            reporting_channel: &self.settings.reporting_channel,
            now,
        };
        for user in self.users.values_mut() {
            if let Err(e) = user.step(&ctx).await {
                tracing::warn!("[BOT] Step for {} failed: {e}", user.chat.name);
            }
        }
    }

    // === Messages ===

    async fn handle_message(&mut self, msg: IncomingMessage, now: DateTime<Utc>) {
        let Some(user) = self.users.get_mut(&msg.user_id) else {
            tracing::debug!("[BOT] Ignoring message from unknown user {}", msg.user_id);
            return;
        };

        let forced = msg.text.trim_start().starts_with(COMMAND_PREFIX);
        if !user.is_idle() && !forced {
            user.receive(&msg.text);
            return;
        }

        let Some(cmd) = parse_command(&msg.text) else {
            return;
        };
        let chat_user = user.chat.clone();
        let last_title = user.last_answered_title().map(str::to_string);

        let reply = match self.run_command(&chat_user, last_title, cmd, now).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("[BOT] Command from {} failed: {e}", chat_user.name);
                "Something went wrong handling that command, sorry.".to_string()
            }
        };
        if let Err(e) = self.chat.message_user(&chat_user, &reply).await {
            tracing::warn!("[BOT] Replying to {} failed: {e}", chat_user.name);
        }
    }

    async fn run_command(
        &mut self,
        from: &ChatUser,
        last_title: Option<String>,
        cmd: Command,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if let Err(retry) = self.limiter.check(&from.id) {
            tracing::debug!("[BOT] {} is rate limited for {retry:?}", from.name);
            return Ok(messages::RATE_LIMITED.to_string());
        }

        let reply = match cmd {
            Command::Hi => messages::GREETING.to_string(),
            Command::Help => help_text(),
            Command::Test => {
                let hash = self
                    .store
                    .create_alert(NewAlert {
                        ldap: from.ldap(),
                        title: messages::TEST_ALERT_TITLE.to_string(),
                        description: messages::TEST_ALERT_DESCRIPTION.to_string(),
                        reason: messages::TEST_ALERT_REASON.to_string(),
                        url: String::new(),
                        escalation: vec![],
                    })
                    .await?;
                // Pick it up on this tick instead of waiting a full poll period.
                self.last_task_poll = None;
                tracing::info!("[BOT] {} created test alert {hash}", from.name);
                "Test alert created, you'll hear from me in a moment.".to_string()
            }
            Command::Ignore { duration, reason } => {
                let Some(title) = last_title else {
                    return Ok(messages::IGNORE_NOTHING.to_string());
                };
                let until = now
                    + chrono::Duration::from_std(duration)
                        .unwrap_or_else(|_| chrono::Duration::days(7));
                let reason = if reason.is_empty() {
                    format!("ignored by {} via chat", from.name)
                } else {
                    reason
                };
                self.store
                    .ignore(IgnoredAlert {
                        ldap: from.ldap(),
                        title: title.clone(),
                        reason,
                        until,
                    })
                    .await?;
                format!(
                    "Got it, I won't ask you about *{}* for {}.",
                    escape_mrkdwn(&title),
                    format_duration(duration)
                )
            }
            Command::BadArgs(usage) => usage.to_string(),
            Command::Unknown(_) => messages::HELP_HINT.to_string(),
        };
        Ok(reply)
    }

    // === Tasks ===

    /// Who is asked about an alert for `ldap`.
    fn recipient(&self, ldap: &Ldap) -> Ldap {
        self.settings
            .test_username
            .clone()
            .unwrap_or_else(|| ldap.clone())
    }

    async fn close_unanswered(&self, task: &mut Task, performed: bool, comment: String) -> Result<()> {
        task.performed = performed;
        task.comment = comment;
        self.store.save_response(task).await?;
        self.store
            .set_status(&task.hash, TaskStatus::Verification)
            .await
    }

    async fn handle_new_tasks(&mut self, now: DateTime<Utc>) -> Result<()> {
        let tasks = self.store.get_new_tasks().await?;
        for mut task in tasks {
            if self.store.is_blacklisted(&task.username).await? {
                tracing::info!("[BOT] {} is blacklisted, closing {}", task.username, task.hash);
                self.close_unanswered(&mut task, false, messages::BLACKLISTED_COMMENT.to_string())
                    .await?;
                continue;
            }

            let ignored = self.store.get_ignored(&task.username, now).await?;
            if let Some(rule) = ignored.get(&task.title) {
                tracing::info!("[BOT] {} ignores {:?}, closing {}", task.username, task.title, task.hash);
                self.close_unanswered(&mut task, true, rule.reason.clone())
                    .await?;
                continue;
            }

            let to = self.recipient(&task.username);
            let user = self
                .ldap_index
                .get(&to)
                .and_then(|id| self.users.get_mut(id));
            match user {
                Some(user) => {
                    if user.add_task(task.clone()) {
                        tracing::debug!("[BOT] Queued {} for {to}", task.hash);
                    }
                }
                None => {
                    tracing::warn!("[BOT] No chat user for {to}, closing {}", task.hash);
                    if let Err(e) = self
                        .chat
                        .send_message(&self.settings.reporting_channel, &format_unknown_user(&task))
                        .await
                    {
                        tracing::warn!("[BOT] Reporting unknown user failed: {e}");
                    }
                    self.close_unanswered(&mut task, false, messages::UNKNOWN_USER_COMMENT.to_string())
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_active_tasks(&mut self, now: DateTime<Utc>) -> Result<()> {
        let tasks = self.store.get_active_tasks().await?;
        for task in tasks {
            // In progress in the store but not in memory: we restarted mid-conversation.
            let to = self.recipient(&task.username);
            if let Some(user) = self.ldap_index.get(&to).and_then(|id| self.users.get_mut(id)) {
                if user.add_task(task.clone()) {
                    tracing::info!("[BOT] Re-queued {} for {to}", task.hash);
                }
            }

            self.escalate(&task, now).await?;
        }
        Ok(())
    }

    async fn escalate(&self, task: &Task, now: DateTime<Utc>) -> Result<()> {
        let elapsed = task.elapsed(now);
        for esc in task.escalation.iter().filter(|e| e.should_notify(elapsed)) {
            let text = format_escalation(task, now);
            let contact = self
                .ldap_index
                .get(&esc.ldap)
                .and_then(|id| self.users.get(id));

            let sent = match contact {
                Some(contact) => self.chat.message_user(&contact.chat, &text).await,
                None => {
                    let text = format!(
                        "{text}\n(escalation contact {} is not in the workspace)",
                        code_span(esc.ldap.as_str())
                    );
                    self.chat
                        .send_message(&self.settings.reporting_channel, &text)
                        .await
                }
            };
            if let Err(e) = sent {
                tracing::warn!("[BOT] Escalating {} to {} failed: {e}", task.hash, esc.ldap);
                continue;
            }

            self.store.set_escalated(&task.hash, &esc.ldap, now).await?;
            tracing::info!("[BOT] Escalated {} to {}", task.hash, esc.ldap);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::PushStatus,
        store::{memory::MemoryStore, AlertStore, BlacklistStore, IgnoredStore},
        tasker::{Escalation, Tasker},
        user::UserState,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeChat {
        users: Vec<ChatUser>,
        inbox: Mutex<Vec<IncomingMessage>>,
        dms: Mutex<Vec<(String, String)>>,
        posts: Mutex<Vec<(String, String)>>,
        /// The next this many DMs fail.
        failing_dms: Mutex<u32>,
    }

    impl FakeChat {
        fn with_users(names: &[&str]) -> Self {
            Self {
                users: names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| ChatUser {
                        id: format!("U{i}"),
                        name: n.to_string(),
                        display_name: n.to_string(),
                        deleted: false,
                        is_bot: false,
                    })
                    .collect(),
                ..Default::default()
            }
        }

        fn say(&self, user_id: &str, text: &str) {
            self.inbox.lock().unwrap().push(IncomingMessage {
                user_id: user_id.to_string(),
                channel: ChannelId(format!("D{user_id}")),
                text: text.to_string(),
                ts: "1.0".to_string(),
            });
        }

        fn dms_to(&self, user_id: &str) -> Vec<String> {
            self.dms
                .lock()
                .unwrap()
                .iter()
                .filter(|(u, _)| u == user_id)
                .map(|(_, t)| t.clone())
                .collect()
        }

        fn posts(&self) -> Vec<String> {
            self.posts.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl ChatPort for FakeChat {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn get_users(&self) -> Result<Vec<ChatUser>> {
            Ok(self.users.clone())
        }

        async fn get_messages(&self) -> Result<Vec<IncomingMessage>> {
            Ok(std::mem::take(&mut *self.inbox.lock().unwrap()))
        }

        async fn send_message(&self, channel: &ChannelId, text: &str) -> Result<()> {
            self.posts
                .lock()
                .unwrap()
                .push((channel.0.clone(), text.to_string()));
            Ok(())
        }

        async fn message_user(&self, user: &ChatUser, text: &str) -> Result<()> {
            {
                let mut failing = self.failing_dms.lock().unwrap();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(crate::Error::Chat("channel_not_found".to_string()));
                }
            }
            self.dms
                .lock()
                .unwrap()
                .push((user.id.clone(), text.to_string()));
            Ok(())
        }
    }

    struct FakeAuth {
        enrolled: bool,
        status: Mutex<PushStatus>,
        pushes: Mutex<u32>,
    }

    impl FakeAuth {
        fn new(enrolled: bool, status: PushStatus) -> Self {
            Self {
                enrolled,
                status: Mutex::new(status),
                pushes: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Authenticator for FakeAuth {
        async fn can_auth(&self, _ldap: &Ldap) -> Result<bool> {
            Ok(self.enrolled)
        }

        async fn start_push(&self, _ldap: &Ldap, _reason: &str) -> Result<String> {
            *self.pushes.lock().unwrap() += 1;
            Ok("tx".to_string())
        }

        async fn push_status(&self, _txid: &str) -> Result<PushStatus> {
            Ok(*self.status.lock().unwrap())
        }
    }

    fn settings() -> BotSettings {
        BotSettings {
            reporting_channel: ChannelId("#security".to_string()),
            test_username: None,
            auth_window: Duration::from_secs(3600),
            task_poll: Duration::ZERO,
            message_poll: Duration::from_millis(10),
            user_refresh: Duration::from_secs(3600),
            command_rate_limit: 0,
            command_rate_window: Duration::from_secs(60),
        }
    }

    fn new_alert(ldap: &str, title: &str) -> NewAlert {
        NewAlert {
            ldap: Ldap::new(ldap),
            title: title.to_string(),
            description: "Login from a new country".to_string(),
            reason: "geo".to_string(),
            url: String::new(),
            escalation: vec![],
        }
    }

    fn bot(
        chat: Arc<FakeChat>,
        store: Arc<MemoryStore>,
        auth: Option<Arc<FakeAuth>>,
        settings: BotSettings,
    ) -> SecurityBot {
        SecurityBot::new(
            settings,
            chat,
            store,
            auth.map(|a| a as Arc<dyn Authenticator>),
        )
    }

    #[tokio::test]
    async fn confirmed_alert_with_push_is_reported_authenticated() {
        let chat = Arc::new(FakeChat::with_users(&["alice"]));
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(FakeAuth::new(true, PushStatus::Allow));
        let mut bot = bot(chat.clone(), store.clone(), Some(auth.clone()), settings());
        let hash = store.create_alert(new_alert("alice", "login")).await.unwrap();

        let now = Utc::now();
        bot.tick(now).await.unwrap();
        assert_eq!(
            store.get(&hash).await.unwrap().unwrap().status,
            TaskStatus::InProgress
        );
        assert!(chat.dms_to("U0")[0].contains(messages::ACTION_PROMPT));

        chat.say("U0", "yes, that was me logging in from Lisbon");
        bot.tick(now).await.unwrap();
        assert!(chat.dms_to("U0").iter().any(|m| m == messages::MFA_PERMISSION));

        chat.say("U0", "sure");
        bot.tick(now).await.unwrap();
        assert_eq!(*auth.pushes.lock().unwrap(), 1);
        assert_eq!(
            bot.user(&Ldap::new("alice")).unwrap().state(),
            UserState::WaitingOnAuth
        );

        bot.tick(now).await.unwrap();
        let task = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Verification);
        assert!(task.performed);
        assert!(task.authenticated);
        assert_eq!(task.comment, "yes, that was me logging in from Lisbon");
        assert!(chat.posts()[0].starts_with(":white_check_mark:"));
    }

    #[tokio::test]
    async fn recent_approval_skips_second_push() {
        let chat = Arc::new(FakeChat::with_users(&["alice"]));
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(FakeAuth::new(true, PushStatus::Allow));
        let mut bot = bot(chat.clone(), store.clone(), Some(auth.clone()), settings());
        let now = Utc::now();

        store.create_alert(new_alert("alice", "first")).await.unwrap();
        bot.tick(now).await.unwrap();
        chat.say("U0", "yes");
        bot.tick(now).await.unwrap();
        chat.say("U0", "yes");
        bot.tick(now).await.unwrap();
        bot.tick(now).await.unwrap();

        let second = store.create_alert(new_alert("alice", "second")).await.unwrap();
        bot.tick(now).await.unwrap();
        chat.say("U0", "yes");
        bot.tick(now).await.unwrap();

        assert_eq!(*auth.pushes.lock().unwrap(), 1);
        let task = store.get(&second).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Verification);
        assert!(task.authenticated);
    }

    #[tokio::test]
    async fn denied_action_escalates_without_auth() {
        let chat = Arc::new(FakeChat::with_users(&["bob"]));
        let store = Arc::new(MemoryStore::new());
        let mut bot = bot(chat.clone(), store.clone(), None, settings());
        let hash = store.create_alert(new_alert("bob", "sudo")).await.unwrap();
        let now = Utc::now();

        bot.tick(now).await.unwrap();
        chat.say("U0", "what is this?");
        bot.tick(now).await.unwrap();
        assert!(chat
            .dms_to("U0")
            .iter()
            .any(|m| m == messages::ACTION_PROMPT_RETRY));

        chat.say("U0", "no, not me");
        bot.tick(now).await.unwrap();

        let task = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Verification);
        assert!(!task.performed);
        assert!(chat.dms_to("U0").iter().any(|m| m == messages::ESCALATED));
        assert!(chat.posts()[0].starts_with(":rotating_light:"));
    }

    #[tokio::test]
    async fn blacklisted_ignored_and_unknown_users_are_closed() {
        let chat = Arc::new(FakeChat::with_users(&["carol", "dave"]));
        let store = Arc::new(MemoryStore::new());
        let mut bot = bot(chat.clone(), store.clone(), None, settings());
        let now = Utc::now();

        store.add(&Ldap::new("carol")).await.unwrap();
        store
            .ignore(IgnoredAlert {
                ldap: Ldap::new("dave"),
                title: "vpn".to_string(),
                reason: "travelling".to_string(),
                until: now + chrono::Duration::hours(1),
            })
            .await
            .unwrap();

        let blacklisted = store.create_alert(new_alert("carol", "x")).await.unwrap();
        let ignored = store.create_alert(new_alert("dave", "vpn")).await.unwrap();
        let unknown = store.create_alert(new_alert("mallory", "x")).await.unwrap();

        bot.tick(now).await.unwrap();

        let t = store.get(&blacklisted).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Verification);
        assert_eq!(t.comment, messages::BLACKLISTED_COMMENT);

        let t = store.get(&ignored).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Verification);
        assert!(t.performed);
        assert_eq!(t.comment, "travelling");

        let t = store.get(&unknown).await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Verification);
        assert_eq!(t.comment, messages::UNKNOWN_USER_COMMENT);
        assert!(chat.posts().iter().any(|p| p.contains("mallory")));

        assert!(chat.dms_to("U0").is_empty());
        assert!(chat.dms_to("U1").is_empty());
    }

    #[tokio::test]
    async fn quiet_users_are_escalated_once() {
        let chat = Arc::new(FakeChat::with_users(&["erin", "boss"]));
        let store = Arc::new(MemoryStore::new());
        let mut bot = bot(chat.clone(), store.clone(), None, settings());
        let now = Utc::now();

        let mut alert = new_alert("erin", "exfil");
        alert.escalation = vec![Escalation::new(Ldap::new("boss"), Duration::from_secs(600))];
        let hash = store.create_alert(alert).await.unwrap();

        bot.tick(now).await.unwrap();
        assert!(chat.dms_to("U1").is_empty());

        let later = now + chrono::Duration::minutes(11);
        bot.tick(later).await.unwrap();
        bot.tick(later).await.unwrap();

        let to_boss = chat.dms_to("U1");
        assert_eq!(to_boss.len(), 1);
        assert!(to_boss[0].contains("has not answered"));
        let task = store.get(&hash).await.unwrap().unwrap();
        assert!(task.escalation[0].is_notified());
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn commands_are_answered_when_idle() {
        let chat = Arc::new(FakeChat::with_users(&["frank"]));
        let store = Arc::new(MemoryStore::new());
        let mut bot = bot(chat.clone(), store.clone(), None, settings());
        let now = Utc::now();

        chat.say("U0", "help");
        chat.say("U0", "ignore 2h");
        bot.tick(now).await.unwrap();
        let dms = chat.dms_to("U0");
        assert!(dms[0].contains("ignore <duration>"));
        assert_eq!(dms[1], messages::IGNORE_NOTHING);

        chat.say("U0", "test");
        bot.tick(now).await.unwrap();
        let tests = store.get_active_tasks().await.unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].title, messages::TEST_ALERT_TITLE);

        chat.say("U0", "yes");
        bot.tick(now).await.unwrap();
        chat.say("U0", "ignore 2h testing");
        bot.tick(now).await.unwrap();

        let rules = store.get_ignored(&Ldap::new("frank"), now).await.unwrap();
        assert_eq!(rules[messages::TEST_ALERT_TITLE].reason, "testing");
    }

    #[tokio::test]
    async fn test_username_receives_every_alert() {
        let chat = Arc::new(FakeChat::with_users(&["gina", "hank"]));
        let store = Arc::new(MemoryStore::new());
        let mut s = settings();
        s.test_username = Some(Ldap::new("gina"));
        let mut bot = bot(chat.clone(), store.clone(), None, s);

        let first = store.create_alert(new_alert("hank", "a")).await.unwrap();
        let second = store.create_alert(new_alert("gina", "b")).await.unwrap();
        bot.tick(Utc::now()).await.unwrap();

        // hank is never contacted; gina gets both alerts, one at a time.
        assert!(chat.dms_to("U1").is_empty());
        assert_eq!(chat.dms_to("U0").len(), 1);
        let gina = bot.user(&Ldap::new("gina")).unwrap();
        assert_eq!(gina.queued(), 1);
        let current = gina.current_task().unwrap().hash.clone();
        assert!(current == first || current == second);

        // Stored alerts keep their own ldap.
        let stored = store.get(&first).await.unwrap().unwrap();
        assert_eq!(stored.username, Ldap::new("hank"));
        let statuses = [
            store.get(&first).await.unwrap().unwrap().status,
            store.get(&second).await.unwrap().unwrap().status,
        ];
        assert!(statuses.contains(&TaskStatus::InProgress));
        assert!(statuses.contains(&TaskStatus::Open));
    }

    #[tokio::test]
    async fn restart_requeues_in_progress_tasks() {
        let chat = Arc::new(FakeChat::with_users(&["ivy"]));
        let store = Arc::new(MemoryStore::new());
        let hash = store.create_alert(new_alert("ivy", "a")).await.unwrap();
        store.set_status(&hash, TaskStatus::InProgress).await.unwrap();

        let mut bot = bot(chat.clone(), store.clone(), None, settings());
        bot.tick(Utc::now()).await.unwrap();

        assert_eq!(chat.dms_to("U0").len(), 1);
        assert_eq!(
            bot.user(&Ldap::new("ivy")).unwrap().state(),
            UserState::ActionPerformedCheck
        );
    }

    #[tokio::test]
    async fn answer_survives_failed_follow_up() {
        let chat = Arc::new(FakeChat::with_users(&["bob"]));
        let store = Arc::new(MemoryStore::new());
        let mut bot = bot(chat.clone(), store.clone(), None, settings());
        let hash = store.create_alert(new_alert("bob", "sudo")).await.unwrap();
        let now = Utc::now();

        bot.tick(now).await.unwrap();
        *chat.failing_dms.lock().unwrap() = 1;
        chat.say("U0", "no, not me");
        bot.tick(now).await.unwrap();

        let task = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Verification);
        assert!(!task.performed);
        assert_eq!(task.comment, "no, not me");
        assert!(!chat.dms_to("U0").iter().any(|m| m == messages::ESCALATED));
        assert!(chat.dms_to("U0").iter().any(|m| m == messages::TASK_DONE));
        assert!(bot.user(&Ldap::new("bob")).unwrap().is_idle());
    }

    #[tokio::test]
    async fn permission_prompt_failure_keeps_the_confirmation() {
        let chat = Arc::new(FakeChat::with_users(&["alice"]));
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(FakeAuth::new(true, PushStatus::Allow));
        let mut bot = bot(chat.clone(), store.clone(), Some(auth), settings());
        store.create_alert(new_alert("alice", "login")).await.unwrap();
        let now = Utc::now();

        bot.tick(now).await.unwrap();
        *chat.failing_dms.lock().unwrap() = 1;
        chat.say("U0", "yes");
        bot.tick(now).await.unwrap();

        let alice = bot.user(&Ldap::new("alice")).unwrap();
        assert_eq!(alice.state(), UserState::AuthPermissionCheck);
        assert!(alice.current_task().unwrap().performed);
    }

    #[tokio::test]
    async fn unclear_permission_answer_asks_again() {
        let chat = Arc::new(FakeChat::with_users(&["alice"]));
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(FakeAuth::new(true, PushStatus::Allow));
        let mut bot = bot(chat.clone(), store.clone(), Some(auth.clone()), settings());
        store.create_alert(new_alert("alice", "login")).await.unwrap();
        let now = Utc::now();

        bot.tick(now).await.unwrap();
        chat.say("U0", "yes");
        bot.tick(now).await.unwrap();
        chat.say("U0", "which phone?");
        bot.tick(now).await.unwrap();

        assert!(chat
            .dms_to("U0")
            .iter()
            .any(|m| m == messages::MFA_PERMISSION_RETRY));
        assert_eq!(
            bot.user(&Ldap::new("alice")).unwrap().state(),
            UserState::AuthPermissionCheck
        );
        assert_eq!(*auth.pushes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn denied_push_is_reported_unauthenticated() {
        let chat = Arc::new(FakeChat::with_users(&["alice"]));
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(FakeAuth::new(true, PushStatus::Deny));
        let mut bot = bot(chat.clone(), store.clone(), Some(auth), settings());
        let hash = store.create_alert(new_alert("alice", "login")).await.unwrap();
        let now = Utc::now();

        bot.tick(now).await.unwrap();
        chat.say("U0", "yes");
        bot.tick(now).await.unwrap();
        chat.say("U0", "yes");
        bot.tick(now).await.unwrap();
        bot.tick(now).await.unwrap();

        assert!(chat.dms_to("U0").iter().any(|m| m == messages::MFA_DENIED));
        let task = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Verification);
        assert!(task.performed);
        assert!(!task.authenticated);
    }

    #[tokio::test]
    async fn unanswered_push_times_out() {
        let chat = Arc::new(FakeChat::with_users(&["alice"]));
        let store = Arc::new(MemoryStore::new());
        let auth = Arc::new(FakeAuth::new(true, PushStatus::Waiting));
        let mut bot = bot(chat.clone(), store.clone(), Some(auth), settings());
        let hash = store.create_alert(new_alert("alice", "login")).await.unwrap();
        let now = Utc::now();

        bot.tick(now).await.unwrap();
        chat.say("U0", "yes");
        bot.tick(now).await.unwrap();
        chat.say("U0", "yes");
        bot.tick(now).await.unwrap();

        bot.tick(now + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(
            bot.user(&Ldap::new("alice")).unwrap().state(),
            UserState::WaitingOnAuth
        );

        bot.tick(now + chrono::Duration::minutes(6)).await.unwrap();
        assert!(chat.dms_to("U0").iter().any(|m| m == messages::MFA_FAILED));
        let task = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Verification);
        assert!(!task.authenticated);
    }

    #[tokio::test]
    async fn commands_over_the_limit_are_refused() {
        let chat = Arc::new(FakeChat::with_users(&["frank"]));
        let store = Arc::new(MemoryStore::new());
        let mut s = settings();
        s.command_rate_limit = 2;
        let mut bot = bot(chat.clone(), store.clone(), None, s);

        for _ in 0..3 {
            chat.say("U0", "hi");
        }
        bot.tick(Utc::now()).await.unwrap();

        let dms = chat.dms_to("U0");
        assert_eq!(dms.len(), 3);
        assert_eq!(dms[0], messages::GREETING);
        assert_eq!(dms[1], messages::GREETING);
        assert_eq!(dms[2], messages::RATE_LIMITED);
    }
}
