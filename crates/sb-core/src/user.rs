//! Per-user conversation state machine.
//!
//! `NeedTask → ActionPerformedCheck → (AuthPermissionCheck → WaitingOnAuth)?
//! → TaskFinished → NeedTask`. One alert is discussed at a time; further
//! alerts for the user queue up behind it.

use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    auth::{AuthSession, AuthState, Authenticator},
    chat::port::ChatPort,
    domain::{AlertHash, ChannelId, ChatUser},
    formatting::{format_alert, format_report},
    messages,
    store::BotStore,
    tasker::{Task, TaskStatus},
    Result,
};

/// A push still pending after this long is given up on.
const AUTH_PENDING_TIMEOUT: Duration = Duration::from_secs(300);

const AFFIRMATIVE: &[&str] = &[
    "yes", "y", "yep", "yeah", "yup", "sure", "ok", "okay", "affirmative", "correct",
];
const NEGATIVE: &[&str] = &["no", "n", "nope", "nah", "negative", "not"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserState {
    NeedTask,
    ActionPerformedCheck,
    AuthPermissionCheck,
    WaitingOnAuth,
    TaskFinished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    Unclear,
}

/// Classify a reply by its first word.
pub fn classify_answer(text: &str) -> Answer {
    let first = text
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | '!' | ';' | ':'))
        .find(|w| !w.is_empty())
        .map(|w| w.to_lowercase());
    let Some(first) = first else {
        return Answer::Unclear;
    };
    if AFFIRMATIVE.contains(&first.as_str()) {
        Answer::Yes
    } else if NEGATIVE.contains(&first.as_str()) {
        Answer::No
    } else {
        Answer::Unclear
    }
}

/// Everything a user step needs from the bot.
pub struct StepContext<'a> {
    pub chat: &'a dyn ChatPort,
    pub store: &'a dyn BotStore,
    pub auth: Option<&'a dyn Authenticator>,
    pub reporting_channel: &'a ChannelId,
    pub now: DateTime<Utc>,
}

#[derive(Debug)]
pub struct User {
    pub chat: ChatUser,
    state: UserState,
    queue: VecDeque<Task>,
    current: Option<Task>,
    auth: AuthSession,
    auth_started_at: Option<DateTime<Utc>>,
    reply: Option<String>,
    last_answered_title: Option<String>,
}

impl User {
    pub fn new(chat: ChatUser, auth_window: Duration) -> Self {
        Self {
            chat,
            state: UserState::NeedTask,
            queue: VecDeque::new(),
            current: None,
            auth: AuthSession::new(auth_window),
            auth_started_at: None,
            reply: None,
            last_answered_title: None,
        }
    }

    pub fn state(&self) -> UserState {
        self.state
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.current.as_ref()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn last_answered_title(&self) -> Option<&str> {
        self.last_answered_title.as_deref()
    }

    /// No alert conversation in flight; messages are commands.
    pub fn is_idle(&self) -> bool {
        self.state == UserState::NeedTask && self.current.is_none()
    }

    /// Whether this user already has the task queued or in discussion.
    pub fn holds(&self, hash: &AlertHash) -> bool {
        self.current.as_ref().is_some_and(|t| t.hash == *hash)
            || self.queue.iter().any(|t| t.hash == *hash)
    }

    /// Queue a task unless already held. Returns whether it was added.
    pub fn add_task(&mut self, task: Task) -> bool {
        if self.holds(&task.hash) {
            return false;
        }
        self.queue.push_back(task);
        true
    }

    /// Record a reply for the next step; bursts are joined.
    pub fn receive(&mut self, text: &str) {
        match self.reply.as_mut() {
            Some(r) => {
                r.push('\n');
                r.push_str(text);
            }
            None => self.reply = Some(text.to_string()),
        }
    }

    async fn say(&self, ctx: &StepContext<'_>, text: &str) -> Result<()> {
        ctx.chat.message_user(&self.chat, text).await
    }

    /// Send a follow-up whose loss must not undo a recorded answer.
    async fn tell(&self, ctx: &StepContext<'_>, text: &str) {
        if let Err(e) = self.say(ctx, text).await {
            tracing::warn!("[BOT] Failed to message {}: {e}", self.chat.name);
        }
    }

    /// Advance the state machine by at most one conversational turn.
    pub async fn step(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        match self.state {
            UserState::NeedTask => self.start_next_task(ctx).await?,
            UserState::ActionPerformedCheck => self.check_action_performed(ctx).await?,
            UserState::AuthPermissionCheck => self.check_auth_permission(ctx).await?,
            UserState::WaitingOnAuth => self.wait_on_auth(ctx).await?,
            UserState::TaskFinished => {}
        }

        if self.state == UserState::TaskFinished {
            self.finish_task(ctx).await?;
        }
        Ok(())
    }

    async fn start_next_task(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        // Stale chatter from an idle period isn't an answer.
        self.reply = None;
        let Some(task) = self.queue.pop_front() else {
            return Ok(());
        };

        let text = format!(
            "{}\n\n{}\n\n{}",
            messages::ALERT_INTRO,
            format_alert(&task),
            messages::ACTION_PROMPT
        );
        if let Err(e) = self.say(ctx, &text).await {
            self.queue.push_front(task);
            return Err(e);
        }

        ctx.store
            .set_status(&task.hash, TaskStatus::InProgress)
            .await?;
        tracing::info!(
            "[BOT] Alerted {} about {} ({})",
            self.chat.name,
            task.title,
            task.hash
        );
        self.current = Some(task);
        self.state = UserState::ActionPerformedCheck;
        Ok(())
    }

    async fn check_action_performed(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        let Some(reply) = self.reply.take() else {
            return Ok(());
        };
        let Some(task) = self.current.as_mut() else {
            self.state = UserState::NeedTask;
            return Ok(());
        };

        match classify_answer(&reply) {
            Answer::Yes => {
                task.performed = true;
                task.comment = reply.trim().to_string();
                self.after_confirmed(ctx).await?;
            }
            Answer::No => {
                task.performed = false;
                task.comment = reply.trim().to_string();
                self.state = UserState::TaskFinished;
                self.tell(ctx, messages::ESCALATED).await;
            }
            Answer::Unclear => {
                self.tell(ctx, messages::ACTION_PROMPT_RETRY).await;
            }
        }
        Ok(())
    }

    /// User says they did it: verify with a second factor when possible.
    async fn after_confirmed(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        let Some(auth) = ctx.auth else {
            self.state = UserState::TaskFinished;
            return Ok(());
        };

        if self.auth.is_recently_authorized(ctx.now) {
            if let Some(task) = self.current.as_mut() {
                task.authenticated = true;
            }
            self.state = UserState::TaskFinished;
            return Ok(());
        }

        let can_auth = match auth.can_auth(&self.chat.ldap()).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("[BOT] Preauth for {} failed: {e}", self.chat.name);
                false
            }
        };
        if can_auth {
            self.state = UserState::AuthPermissionCheck;
            self.tell(ctx, messages::MFA_PERMISSION).await;
        } else {
            self.state = UserState::TaskFinished;
        }
        Ok(())
    }

    async fn check_auth_permission(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        let Some(reply) = self.reply.take() else {
            return Ok(());
        };

        match classify_answer(&reply) {
            Answer::Yes => {
                let Some(auth) = ctx.auth else {
                    self.state = UserState::TaskFinished;
                    return Ok(());
                };
                let reason = self
                    .current
                    .as_ref()
                    .map(|t| t.title.clone())
                    .unwrap_or_default();
                match self.auth.begin(auth, &self.chat.ldap(), &reason).await {
                    Ok(()) => {
                        self.auth_started_at = Some(ctx.now);
                        self.state = UserState::WaitingOnAuth;
                        self.tell(ctx, messages::MFA_SENT).await;
                    }
                    Err(e) => {
                        tracing::warn!("[BOT] Push for {} failed: {e}", self.chat.name);
                        self.state = UserState::TaskFinished;
                        self.tell(ctx, messages::MFA_FAILED).await;
                    }
                }
            }
            Answer::No => {
                self.state = UserState::TaskFinished;
                self.tell(ctx, messages::MFA_SKIPPED).await;
            }
            Answer::Unclear => {
                self.tell(ctx, messages::MFA_PERMISSION_RETRY).await;
            }
        }
        Ok(())
    }

    async fn wait_on_auth(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        // Replies while a push is pending are not answers.
        self.reply = None;
        let Some(auth) = ctx.auth else {
            self.state = UserState::TaskFinished;
            return Ok(());
        };

        let state = match self.auth.poll(auth, ctx.now).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("[BOT] Auth status for {} failed: {e}", self.chat.name);
                AuthState::Pending
            }
        };

        match state {
            AuthState::Authorized => {
                if let Some(task) = self.current.as_mut() {
                    task.authenticated = true;
                }
                self.state = UserState::TaskFinished;
            }
            AuthState::Denied => {
                self.state = UserState::TaskFinished;
                self.tell(ctx, messages::MFA_DENIED).await;
            }
            AuthState::Pending => {
                let timed_out = self
                    .auth_started_at
                    .and_then(|at| (ctx.now - at).to_std().ok())
                    .is_some_and(|d| d > AUTH_PENDING_TIMEOUT);
                if timed_out {
                    tracing::info!("[BOT] Push for {} timed out", self.chat.name);
                    self.state = UserState::TaskFinished;
                    self.tell(ctx, messages::MFA_FAILED).await;
                }
            }
            AuthState::None => self.state = UserState::TaskFinished,
        }
        Ok(())
    }

    async fn finish_task(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        if let Some(task) = self.current.as_ref() {
            ctx.store.save_response(task).await?;
            ctx.store
                .set_status(&task.hash, TaskStatus::Verification)
                .await?;

            if let Err(e) = ctx
                .chat
                .send_message(ctx.reporting_channel, &format_report(task))
                .await
            {
                tracing::warn!("[BOT] Failed to report {}: {e}", task.hash);
            }
            self.tell(ctx, messages::TASK_DONE).await;
            tracing::info!(
                "[BOT] {} answered {} (performed={}, authenticated={})",
                self.chat.name,
                task.hash,
                task.performed,
                task.authenticated
            );
            self.last_answered_title = Some(task.title.clone());
        }

        self.current = None;
        self.auth.reset();
        self.auth_started_at = None;
        self.reply = None;
        self.state = UserState::NeedTask;
        Ok(())
    }
}
