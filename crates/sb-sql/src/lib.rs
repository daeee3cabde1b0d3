//! MySQL adapter (sqlx).
//!
//! Implements every `sb-core` persistence port over a `MySqlPool`. Queries are
//! built at runtime so the crate compiles without a live database.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{
    mysql::{MySqlPool, MySqlPoolOptions},
    MySql, QueryBuilder, Row,
};

use sb_core::{
    config::DbConfig,
    domain::{AlertHash, Ldap},
    errors::Error,
    store::{
        validate_ldap, AlertQuery, AlertStore, BlacklistStore, IgnoredAlert, IgnoredStore,
        NewAlert,
    },
    tasker::{Escalation, Task, TaskStatus, Tasker},
    utils::alert_hash,
    Result,
};

mod schema;

pub use schema::SCHEMA;

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

const TASK_SELECT: &str = "SELECT a.hash, a.ldap, a.title, a.description, a.reason, a.url, \
     a.event_time, s.status, r.comment, r.performed, r.authenticated \
     FROM alerts a \
     JOIN alert_status s ON s.hash = a.hash \
     LEFT JOIN user_responses r ON r.hash = a.hash";

fn map_err(e: sqlx::Error) -> Error {
    Error::Store(format!("mysql error: {e}"))
}

/// DATETIME columns hold UTC.
fn to_utc(t: NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(t, Utc)
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    hash: String,
    ldap: String,
    title: String,
    description: String,
    reason: String,
    url: String,
    event_time: NaiveDateTime,
    status: u8,
    comment: Option<String>,
    performed: Option<bool>,
    authenticated: Option<bool>,
}

impl TaskRow {
    fn into_task(self, escalation: Vec<Escalation>) -> Result<Task> {
        Ok(Task {
            hash: AlertHash(self.hash),
            title: self.title,
            username: Ldap(self.ldap),
            reason: self.reason,
            description: self.description,
            url: self.url,
            performed: self.performed.unwrap_or(false),
            comment: self.comment.unwrap_or_default(),
            authenticated: self.authenticated.unwrap_or(false),
            status: TaskStatus::from_code(self.status)?,
            event_time: to_utc(self.event_time),
            escalation,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EscalationRow {
    hash: String,
    ldap: String,
    delay_secs: u64,
    notified_at: Option<NaiveDateTime>,
}

impl From<EscalationRow> for Escalation {
    fn from(r: EscalationRow) -> Self {
        Escalation {
            ldap: Ldap(r.ldap),
            delay_secs: r.delay_secs,
            notified_at: r.notified_at.map(to_utc),
        }
    }
}

/// Attach escalation rows to their tasks, keeping task order.
fn assemble(rows: Vec<TaskRow>, escalations: Vec<EscalationRow>) -> Result<Vec<Task>> {
    let mut by_hash: HashMap<String, Vec<Escalation>> = HashMap::new();
    for e in escalations {
        by_hash.entry(e.hash.clone()).or_default().push(e.into());
    }
    rows.into_iter()
        .map(|r| {
            let esc = by_hash.remove(&r.hash).unwrap_or_default();
            r.into_task(esc)
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Connect, retrying while the database is still starting.
    pub async fn connect(cfg: &DbConfig) -> Result<Self> {
        let attempts = cfg.connect_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match MySqlPoolOptions::new()
                .max_connections(cfg.max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&cfg.url())
                .await
            {
                Ok(pool) => {
                    tracing::info!(
                        "[SQL] Connected to {}:{}/{}",
                        cfg.host,
                        cfg.port,
                        cfg.name
                    );
                    return Ok(Self { pool });
                }
                Err(e) => {
                    tracing::warn!("[SQL] Connect attempt {attempt}/{attempts} failed: {e}");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(match last_err {
            Some(e) => map_err(e),
            None => Error::Store("no connection attempts made".to_string()),
        })
    }

    /// Create any missing tables.
    pub async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }
        tracing::debug!("[SQL] Schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn escalations_for(&self, hashes: &[&str]) -> Result<Vec<EscalationRow>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<MySql> = QueryBuilder::new(
            "SELECT hash, ldap, delay_secs, notified_at FROM escalation WHERE hash IN (",
        );
        let mut sep = qb.separated(", ");
        for h in hashes {
            sep.push_bind(*h);
        }
        qb.push(") ORDER BY delay_secs");
        qb.build_query_as::<EscalationRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)
    }

    async fn load(&self, rows: Vec<TaskRow>) -> Result<Vec<Task>> {
        let hashes: Vec<&str> = rows.iter().map(|r| r.hash.as_str()).collect();
        let escalations = self.escalations_for(&hashes).await?;
        assemble(rows, escalations)
    }

    async fn by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "{TASK_SELECT} WHERE s.status = ? ORDER BY a.event_time"
        ))
        .bind(status.code())
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        self.load(rows).await
    }
}

#[async_trait]
impl Tasker for MySqlStore {
    async fn get_new_tasks(&self) -> Result<Vec<Task>> {
        self.by_status(TaskStatus::Open).await
    }

    async fn get_active_tasks(&self) -> Result<Vec<Task>> {
        self.by_status(TaskStatus::InProgress).await
    }

    async fn get_pending_tasks(&self) -> Result<Vec<Task>> {
        self.by_status(TaskStatus::Verification).await
    }

    async fn set_status(&self, hash: &AlertHash, status: TaskStatus) -> Result<()> {
        let res = sqlx::query("UPDATE alert_status SET status = ? WHERE hash = ?")
            .bind(status.code())
            .bind(hash.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        // MySQL reports zero affected rows when the value is unchanged.
        if res.rows_affected() == 0 && self.get(hash).await?.is_none() {
            return Err(Error::NotFound(format!("alert {hash}")));
        }
        Ok(())
    }

    async fn save_response(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_responses (hash, comment, performed, authenticated) \
             VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE comment = VALUES(comment), \
             performed = VALUES(performed), authenticated = VALUES(authenticated)",
        )
        .bind(task.hash.as_str())
        .bind(&task.comment)
        .bind(task.performed)
        .bind(task.authenticated)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn set_escalated(
        &self,
        hash: &AlertHash,
        ldap: &Ldap,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE escalation SET notified_at = ? WHERE hash = ? AND ldap = ?")
            .bind(at.naive_utc())
            .bind(hash.as_str())
            .bind(ldap.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MySqlStore {
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

        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query(
            "INSERT INTO alerts (hash, ldap, title, description, reason, url, event_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(hash.as_str())
        .bind(alert.ldap.as_str())
        .bind(&alert.title)
        .bind(&alert.description)
        .bind(&alert.reason)
        .bind(&alert.url)
        .bind(now.naive_utc())
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        sqlx::query("INSERT INTO alert_status (hash, status) VALUES (?, ?)")
            .bind(hash.as_str())
            .bind(TaskStatus::Open.code())
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        for e in &alert.escalation {
            sqlx::query(
                "INSERT INTO escalation (hash, ldap, delay_secs, notified_at) VALUES (?, ?, ?, NULL)",
            )
            .bind(hash.as_str())
            .bind(e.ldap.as_str())
            .bind(e.delay_secs)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }
        tx.commit().await.map_err(map_err)?;

        tracing::info!("[SQL] Created alert {hash} for {}", alert.ldap);
        Ok(hash)
    }

    async fn query(&self, query: &AlertQuery) -> Result<Vec<Task>> {
        let mut qb: QueryBuilder<MySql> = QueryBuilder::new(TASK_SELECT);
        qb.push(" WHERE 1 = 1");
        if let Some(status) = query.status {
            qb.push(" AND s.status = ").push_bind(status.code());
        }
        if let Some(ldap) = &query.ldap {
            qb.push(" AND a.ldap = ").push_bind(ldap.as_str().to_string());
        }
        if !query.titles.is_empty() {
            qb.push(" AND a.title IN (");
            let mut sep = qb.separated(", ");
            for t in &query.titles {
                sep.push_bind(t.clone());
            }
            qb.push(")");
        }
        if let Some(performed) = query.performed {
            qb.push(" AND COALESCE(r.performed, FALSE) = ")
                .push_bind(performed);
        }
        if let Some(authenticated) = query.authenticated {
            qb.push(" AND COALESCE(r.authenticated, FALSE) = ")
                .push_bind(authenticated);
        }
        if let Some(after) = query.after {
            qb.push(" AND a.event_time >= ").push_bind(after.naive_utc());
        }
        if let Some(before) = query.before {
            qb.push(" AND a.event_time <= ").push_bind(before.naive_utc());
        }
        qb.push(" ORDER BY a.event_time DESC LIMIT ")
            .push_bind(query.effective_limit());

        let rows = qb
            .build_query_as::<TaskRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        self.load(rows).await
    }

    async fn get(&self, hash: &AlertHash) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!("{TASK_SELECT} WHERE a.hash = ?"))
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        match row {
            Some(row) => Ok(self.load(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BlacklistStore for MySqlStore {
    async fn is_blacklisted(&self, ldap: &Ldap) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM blacklist WHERE ldap = ?")
            .bind(ldap.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(row.is_some())
    }

    async fn add(&self, ldap: &Ldap) -> Result<()> {
        validate_ldap(ldap)?;
        sqlx::query("INSERT IGNORE INTO blacklist (ldap) VALUES (?)")
            .bind(ldap.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn remove(&self, ldap: &Ldap) -> Result<()> {
        sqlx::query("DELETE FROM blacklist WHERE ldap = ?")
            .bind(ldap.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Ldap>> {
        let rows = sqlx::query("SELECT ldap FROM blacklist ORDER BY ldap")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("ldap").map(Ldap).map_err(map_err))
            .collect()
    }
}

#[async_trait]
impl IgnoredStore for MySqlStore {
    async fn ignore(&self, rule: IgnoredAlert) -> Result<()> {
        rule.validate()?;
        sqlx::query(
            "INSERT INTO ignored (ldap, title, reason, `until`) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE reason = VALUES(reason), `until` = VALUES(`until`)",
        )
        .bind(rule.ldap.as_str())
        .bind(&rule.title)
        .bind(&rule.reason)
        .bind(rule.until.naive_utc())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_ignored(
        &self,
        ldap: &Ldap,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, IgnoredAlert>> {
        let rows = sqlx::query(
            "SELECT title, reason, `until` FROM ignored WHERE ldap = ? AND `until` > ?",
        )
        .bind(ldap.as_str())
        .bind(now.naive_utc())
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            let title: String = r.try_get("title").map_err(map_err)?;
            let rule = IgnoredAlert {
                ldap: ldap.clone(),
                title: title.clone(),
                reason: r.try_get("reason").map_err(map_err)?,
                until: to_utc(r.try_get("until").map_err(map_err)?),
            };
            out.insert(title, rule);
        }
        Ok(out)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM ignored WHERE `until` <= ?")
            .bind(now.naive_utc())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn row(hash: &str, status: u8) -> TaskRow {
        TaskRow {
            hash: hash.to_string(),
            ldap: "alice".to_string(),
            title: "ssh login".to_string(),
            description: "from a new host".to_string(),
            reason: "new host".to_string(),
            url: String::new(),
            event_time: naive(10),
            status,
            comment: None,
            performed: None,
            authenticated: None,
        }
    }

    #[test]
    fn missing_response_reads_as_unanswered() {
        let task = row("a", 0).into_task(vec![]).unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert!(!task.performed);
        assert!(!task.authenticated);
        assert_eq!(task.comment, "");
        assert_eq!(task.event_time.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn unknown_status_is_a_store_error() {
        assert!(matches!(
            row("a", 7).into_task(vec![]),
            Err(Error::Store(_))
        ));
    }

    #[test]
    fn escalations_attach_to_their_alerts() {
        let rows = vec![row("a", 1), row("b", 1)];
        let escalations = vec![
            EscalationRow {
                hash: "b".to_string(),
                ldap: "manager".to_string(),
                delay_secs: 600,
                notified_at: Some(naive(11)),
            },
            EscalationRow {
                hash: "b".to_string(),
                ldap: "director".to_string(),
                delay_secs: 3600,
                notified_at: None,
            },
        ];
        let tasks = assemble(rows, escalations).unwrap();
        assert_eq!(tasks[0].hash.as_str(), "a");
        assert!(tasks[0].escalation.is_empty());
        assert_eq!(tasks[1].escalation.len(), 2);
        assert!(tasks[1].escalation[0].is_notified());
        assert_eq!(tasks[1].escalation[1].ldap.as_str(), "director");
    }

    #[test]
    fn schema_covers_every_table() {
        let all = SCHEMA.join("\n");
        for table in [
            "alerts",
            "alert_status",
            "user_responses",
            "escalation",
            "ignored",
            "blacklist",
        ] {
            assert!(
                all.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
                "{table}"
            );
        }
    }
}
