//! In-process store implementing every persistence port.
//!
//! Used by tests and local dry runs; state is lost on restart.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{
    domain::{AlertHash, Ldap},
    errors::Error,
    store::{
        validate_ldap, AlertQuery, AlertStore, BlacklistStore, IgnoredAlert, IgnoredStore,
        NewAlert,
    },
    tasker::{Task, TaskStatus, Tasker},
    utils::alert_hash,
    Result,
};

#[derive(Default)]
struct Inner {
    alerts: HashMap<AlertHash, Task>,
    blacklist: BTreeSet<Ldap>,
    ignored: HashMap<(Ldap, String), IgnoredAlert>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed task (tests use this to control `event_time`).
    pub async fn insert_task(&self, task: Task) {
        self.inner.lock().await.alerts.insert(task.hash.clone(), task);
    }

    async fn by_status(&self, status: TaskStatus) -> Vec<Task> {
        let st = self.inner.lock().await;
        let mut out: Vec<Task> = st
            .alerts
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.event_time);
        out
    }
}

#[async_trait]
impl Tasker for MemoryStore {
    async fn get_new_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.by_status(TaskStatus::Open).await)
    }

    async fn get_active_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.by_status(TaskStatus::InProgress).await)
    }

    async fn get_pending_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.by_status(TaskStatus::Verification).await)
    }

    async fn set_status(&self, hash: &AlertHash, status: TaskStatus) -> Result<()> {
        let mut st = self.inner.lock().await;
        let task = st
            .alerts
            .get_mut(hash)
            .ok_or_else(|| Error::NotFound(format!("alert {hash}")))?;
        task.status = status;
        Ok(())
    }

    async fn save_response(&self, task: &Task) -> Result<()> {
        let mut st = self.inner.lock().await;
        let stored = st
            .alerts
            .get_mut(&task.hash)
            .ok_or_else(|| Error::NotFound(format!("alert {}", task.hash)))?;
        stored.comment = task.comment.clone();
        stored.performed = task.performed;
        stored.authenticated = task.authenticated;
        Ok(())
    }

    async fn set_escalated(
        &self,
        hash: &AlertHash,
        ldap: &Ldap,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut st = self.inner.lock().await;
        let task = st
            .alerts
            .get_mut(hash)
            .ok_or_else(|| Error::NotFound(format!("alert {hash}")))?;
        for e in task.escalation.iter_mut().filter(|e| e.ldap == *ldap) {
            e.set_notified(at);
        }
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn create_alert(&self, alert: NewAlert) -> Result<AlertHash> {
        alert.validate()?;
        let now = Utc::now();
        let hash = alert_hash(
            &alert.ldap,
            &alert.title,
            &alert.description,
            &alert.reason,
            &alert.url,
            now,
        );
        let task = Task {
            hash: hash.clone(),
            title: alert.title,
            username: alert.ldap,
            reason: alert.reason,
            description: alert.description,
            url: alert.url,
            performed: false,
            comment: String::new(),
            authenticated: false,
            status: TaskStatus::Open,
            event_time: now,
            escalation: alert.escalation,
        };
        self.insert_task(task).await;
        Ok(hash)
    }

    async fn query(&self, query: &AlertQuery) -> Result<Vec<Task>> {
        let st = self.inner.lock().await;
        let mut out: Vec<Task> = st
            .alerts
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.event_time.cmp(&a.event_time));
        out.truncate(query.effective_limit() as usize);
        Ok(out)
    }

    async fn get(&self, hash: &AlertHash) -> Result<Option<Task>> {
        Ok(self.inner.lock().await.alerts.get(hash).cloned())
    }
}

#[async_trait]
impl BlacklistStore for MemoryStore {
    async fn is_blacklisted(&self, ldap: &Ldap) -> Result<bool> {
        Ok(self.inner.lock().await.blacklist.contains(ldap))
    }

    async fn add(&self, ldap: &Ldap) -> Result<()> {
        validate_ldap(ldap)?;
        self.inner.lock().await.blacklist.insert(ldap.clone());
        Ok(())
    }

    async fn remove(&self, ldap: &Ldap) -> Result<()> {
        self.inner.lock().await.blacklist.remove(ldap);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Ldap>> {
        Ok(self.inner.lock().await.blacklist.iter().cloned().collect())
    }
}

#[async_trait]
impl IgnoredStore for MemoryStore {
    async fn ignore(&self, rule: IgnoredAlert) -> Result<()> {
        rule.validate()?;
        let key = (rule.ldap.clone(), rule.title.clone());
        self.inner.lock().await.ignored.insert(key, rule);
        Ok(())
    }

    async fn get_ignored(
        &self,
        ldap: &Ldap,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, IgnoredAlert>> {
        let st = self.inner.lock().await;
        Ok(st
            .ignored
            .values()
            .filter(|r| r.ldap == *ldap && r.until > now)
            .map(|r| (r.title.clone(), r.clone()))
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut st = self.inner.lock().await;
        let before = st.ignored.len();
        st.ignored.retain(|_, r| r.until > now);
        Ok((before - st.ignored.len()) as u64)
    }
}
