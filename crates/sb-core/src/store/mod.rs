//! Persistence ports besides the [`Tasker`](crate::tasker::Tasker):
//! alert creation/querying, the user blacklist and ignored alerts.

pub mod memory;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AlertHash, Ldap},
    tasker::{Escalation, Task, TaskStatus},
    Error, Result,
};

pub const DEFAULT_QUERY_LIMIT: u32 = 50;
pub const MAX_QUERY_LIMIT: u32 = 1000;

// Column widths of the SQL schema. Every store enforces them.
pub const MAX_LDAP_CHARS: usize = 255;
pub const MAX_TITLE_CHARS: usize = 255;
pub const MAX_URL_CHARS: usize = 511;
pub const MAX_IGNORE_REASON_CHARS: usize = 255;

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(Error::InvalidInput(format!(
            "{field} is longer than {max} characters"
        )));
    }
    Ok(())
}

/// An alert as submitted by a producer (the frontend or the `test` command).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAlert {
    pub ldap: Ldap,
    pub title: String,
    pub description: String,
    pub reason: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub escalation: Vec<Escalation>,
}

/// An ldap fits the store's key columns.
pub fn validate_ldap(ldap: &Ldap) -> Result<()> {
    check_len("ldap", ldap.as_str(), MAX_LDAP_CHARS)
}

impl NewAlert {
    /// Field widths, and at most one escalation entry per contact.
    pub fn validate(&self) -> Result<()> {
        validate_ldap(&self.ldap)?;
        check_len("title", &self.title, MAX_TITLE_CHARS)?;
        check_len("url", &self.url, MAX_URL_CHARS)?;

        let mut contacts = HashSet::new();
        for esc in &self.escalation {
            validate_ldap(&esc.ldap)?;
            if !contacts.insert(&esc.ldap) {
                return Err(Error::InvalidInput(format!(
                    "escalation lists {} more than once",
                    esc.ldap
                )));
            }
        }
        Ok(())
    }
}

/// Filters for [`AlertStore::query`]. `None` means "don't filter".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertQuery {
    pub status: Option<TaskStatus>,
    pub ldap: Option<Ldap>,
    pub titles: Vec<String>,
    pub performed: Option<bool>,
    pub authenticated: Option<bool>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl AlertQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }

    /// In-process evaluation of the filters (ordering/limit excluded).
    pub fn matches(&self, task: &Task) -> bool {
        if self.status.is_some_and(|s| s != task.status) {
            return false;
        }
        if self.ldap.as_ref().is_some_and(|l| *l != task.username) {
            return false;
        }
        if !self.titles.is_empty() && !self.titles.iter().any(|t| *t == task.title) {
            return false;
        }
        if self.performed.is_some_and(|p| p != task.performed) {
            return false;
        }
        if self.authenticated.is_some_and(|a| a != task.authenticated) {
            return false;
        }
        if self.after.is_some_and(|t| task.event_time < t) {
            return false;
        }
        if self.before.is_some_and(|t| task.event_time > t) {
            return false;
        }
        true
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoredAlert {
    pub ldap: Ldap,
    pub title: String,
    pub reason: String,
    pub until: DateTime<Utc>,
}

impl IgnoredAlert {
    pub fn validate(&self) -> Result<()> {
        validate_ldap(&self.ldap)?;
        check_len("title", &self.title, MAX_TITLE_CHARS)?;
        check_len("reason", &self.reason, MAX_IGNORE_REASON_CHARS)
    }
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn create_alert(&self, alert: NewAlert) -> Result<AlertHash>;

    /// Matching alerts, newest event first.
    async fn query(&self, query: &AlertQuery) -> Result<Vec<Task>>;

    async fn get(&self, hash: &AlertHash) -> Result<Option<Task>>;
}

#[async_trait]
pub trait BlacklistStore: Send + Sync {
    async fn is_blacklisted(&self, ldap: &Ldap) -> Result<bool>;
    async fn add(&self, ldap: &Ldap) -> Result<()>;
    async fn remove(&self, ldap: &Ldap) -> Result<()>;
    async fn list(&self) -> Result<Vec<Ldap>>;
}

#[async_trait]
pub trait IgnoredStore: Send + Sync {
    /// Insert or replace the ignore rule for `(ldap, title)`.
    async fn ignore(&self, rule: IgnoredAlert) -> Result<()>;

    /// Unexpired rules for the user, keyed by alert title.
    async fn get_ignored(&self, ldap: &Ldap, now: DateTime<Utc>)
        -> Result<HashMap<String, IgnoredAlert>>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Everything the bot process persists through.
pub trait BotStore: crate::tasker::Tasker + AlertStore + BlacklistStore + IgnoredStore {}

impl<T> BotStore for T where T: crate::tasker::Tasker + AlertStore + BlacklistStore + IgnoredStore {}
