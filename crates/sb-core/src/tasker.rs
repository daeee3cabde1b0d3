//! Retrieving tasks the bot should act upon and updating their statuses once
//! acted upon.
//!
//! A task is one alert about one user. It moves `Open` (new, nobody contacted)
//! → `InProgress` (user contacted, waiting on answers) → `Verification`
//! (user answered, waiting for manual closure by the security team).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AlertHash, Ldap},
    errors::Error,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Verification,
}

impl TaskStatus {
    /// Integer code as persisted in `alert_status.status`.
    pub fn code(self) -> u8 {
        match self {
            TaskStatus::Open => 0,
            TaskStatus::InProgress => 1,
            TaskStatus::Verification => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(TaskStatus::Open),
            1 => Ok(TaskStatus::InProgress),
            2 => Ok(TaskStatus::Verification),
            other => Err(Error::Store(format!("unknown task status code {other}"))),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "0" => Ok(TaskStatus::Open),
            "in_progress" | "inprogress" | "1" => Ok(TaskStatus::InProgress),
            "verification" | "verifying" | "2" => Ok(TaskStatus::Verification),
            other => Err(Error::InvalidInput(format!("unknown status {other:?}"))),
        }
    }
}

/// Somebody to notify when the alerted user has not answered in time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub ldap: Ldap,
    pub delay_secs: u64,
    pub notified_at: Option<DateTime<Utc>>,
}

impl Escalation {
    pub fn new(ldap: Ldap, delay: Duration) -> Self {
        Self {
            ldap,
            delay_secs: delay.as_secs(),
            notified_at: None,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn is_notified(&self) -> bool {
        self.notified_at.is_some()
    }

    pub fn set_notified(&mut self, now: DateTime<Utc>) {
        self.notified_at = Some(now);
    }

    /// True once `elapsed` is strictly past the delay and nobody was notified yet.
    pub fn should_notify(&self, elapsed: Duration) -> bool {
        !self.is_notified() && elapsed > self.delay()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub hash: AlertHash,
    pub title: String,
    pub username: Ldap,
    pub reason: String,
    pub description: String,
    pub url: String,
    pub performed: bool,
    pub comment: String,
    pub authenticated: bool,
    pub status: TaskStatus,
    pub event_time: DateTime<Utc>,
    #[serde(default)]
    pub escalation: Vec<Escalation>,
}

impl Task {
    pub fn is_open(&self) -> bool {
        self.status == TaskStatus::Open
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == TaskStatus::InProgress
    }

    pub fn is_verifying(&self) -> bool {
        self.status == TaskStatus::Verification
    }

    /// Time since the alert fired, clamped at zero for clock skew.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.event_time).to_std().unwrap_or_default()
    }
}

/// Interface to retrieve tasks on which the bot should act upon.
#[async_trait]
pub trait Tasker: Send + Sync {
    /// Tasks whose alertee still needs the initial message.
    async fn get_new_tasks(&self) -> Result<Vec<Task>>;

    /// Tasks whose alertee was contacted but has not finished answering.
    async fn get_active_tasks(&self) -> Result<Vec<Task>>;

    /// Tasks the user answered that now wait for manual closure.
    async fn get_pending_tasks(&self) -> Result<Vec<Task>>;

    async fn set_status(&self, hash: &AlertHash, status: TaskStatus) -> Result<()>;

    /// Persist `comment`, `performed` and `authenticated` of the task.
    async fn save_response(&self, task: &Task) -> Result<()>;

    async fn set_escalated(&self, hash: &AlertHash, ldap: &Ldap, at: DateTime<Utc>)
        -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        for s in [
            TaskStatus::Open,
            TaskStatus::InProgress,
            TaskStatus::Verification,
        ] {
            assert_eq!(TaskStatus::from_code(s.code()).unwrap(), s);
        }
        assert!(TaskStatus::from_code(9).is_err());
        assert_eq!(TaskStatus::parse("Verifying").unwrap(), TaskStatus::Verification);
        assert!(TaskStatus::parse("closed").is_err());
    }

    #[test]
    fn escalation_notifies_once_after_delay() {
        let mut e = Escalation::new(Ldap::new("boss"), Duration::from_secs(60));
        assert!(!e.should_notify(Duration::from_secs(60)));
        assert!(e.should_notify(Duration::from_secs(61)));

        e.set_notified(Utc::now());
        assert!(e.is_notified());
        assert!(!e.should_notify(Duration::from_secs(3600)));
    }
}
