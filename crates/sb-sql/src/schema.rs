/// Idempotent DDL, run in order by `MySqlStore::migrate`.
///
/// `hash` is the hex SHA-256 alert id. DATETIME columns are UTC.
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blacklist (
        ldap VARCHAR(255) NOT NULL,
        PRIMARY KEY (ldap)
    )",
    "CREATE TABLE IF NOT EXISTS alerts (
        hash CHAR(64) NOT NULL,
        ldap VARCHAR(255) NOT NULL,
        title VARCHAR(255) NOT NULL,
        description TEXT NOT NULL,
        reason TEXT NOT NULL,
        url VARCHAR(511) NOT NULL DEFAULT '',
        event_time DATETIME NOT NULL,
        PRIMARY KEY (hash),
        KEY alerts_ldap (ldap),
        KEY alerts_event_time (event_time)
    )",
    "CREATE TABLE IF NOT EXISTS alert_status (
        hash CHAR(64) NOT NULL,
        status TINYINT UNSIGNED NOT NULL,
        PRIMARY KEY (hash),
        KEY alert_status_status (status)
    )",
    "CREATE TABLE IF NOT EXISTS user_responses (
        hash CHAR(64) NOT NULL,
        comment TEXT,
        performed BOOLEAN NOT NULL DEFAULT FALSE,
        authenticated BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (hash)
    )",
    "CREATE TABLE IF NOT EXISTS escalation (
        hash CHAR(64) NOT NULL,
        ldap VARCHAR(255) NOT NULL,
        delay_secs BIGINT UNSIGNED NOT NULL,
        notified_at DATETIME NULL,
        PRIMARY KEY (hash, ldap)
    )",
    "CREATE TABLE IF NOT EXISTS ignored (
        ldap VARCHAR(255) NOT NULL,
        title VARCHAR(255) NOT NULL,
        reason VARCHAR(255) NOT NULL,
        `until` DATETIME NOT NULL,
        PRIMARY KEY (ldap, title)
    )",
];
