//! Second-factor verification of alerted users.
//!
//! The provider is reached through the [`Authenticator`] port; [`AuthSession`]
//! keeps the per-user state (pending push, remembered approval).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{domain::Ldap, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    None,
    Pending,
    Authorized,
    Denied,
}

/// Provider-side status of a push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushStatus {
    Waiting,
    Allow,
    Deny,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Whether the user is enrolled and can receive a push.
    async fn can_auth(&self, ldap: &Ldap) -> Result<bool>;

    /// Send a push asynchronously; returns the provider transaction id.
    async fn start_push(&self, ldap: &Ldap, reason: &str) -> Result<String>;

    async fn push_status(&self, txid: &str) -> Result<PushStatus>;
}

#[derive(Clone, Debug)]
pub struct AuthSession {
    state: AuthState,
    txid: Option<String>,
    authorized_at: Option<DateTime<Utc>>,
    window: Duration,
}

impl AuthSession {
    pub fn new(window: Duration) -> Self {
        Self {
            state: AuthState::None,
            txid: None,
            authorized_at: None,
            window,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// An approval within the window counts for later alerts too.
    pub fn is_recently_authorized(&self, now: DateTime<Utc>) -> bool {
        let Some(at) = self.authorized_at else {
            return false;
        };
        (now - at).to_std().map(|d| d <= self.window).unwrap_or(true)
    }

    pub async fn begin(&mut self, auth: &dyn Authenticator, ldap: &Ldap, reason: &str) -> Result<()> {
        let txid = auth.start_push(ldap, reason).await?;
        self.txid = Some(txid);
        self.state = AuthState::Pending;
        Ok(())
    }

    /// Resolve a pending push. Non-pending states are returned unchanged.
    pub async fn poll(&mut self, auth: &dyn Authenticator, now: DateTime<Utc>) -> Result<AuthState> {
        if self.state != AuthState::Pending {
            return Ok(self.state);
        }
        let Some(txid) = self.txid.as_deref() else {
            self.state = AuthState::None;
            return Ok(self.state);
        };

        match auth.push_status(txid).await? {
            PushStatus::Waiting => {}
            PushStatus::Allow => {
                self.state = AuthState::Authorized;
                self.authorized_at = Some(now);
                self.txid = None;
            }
            PushStatus::Deny => {
                self.state = AuthState::Denied;
                self.authorized_at = None;
                self.txid = None;
            }
        }
        Ok(self.state)
    }

    /// Back to `None` for the next task; a remembered approval survives.
    pub fn reset(&mut self) {
        self.state = AuthState::None;
        self.txid = None;
    }
}
