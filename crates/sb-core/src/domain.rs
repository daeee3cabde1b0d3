use std::fmt;

use serde::{Deserialize, Serialize};

/// Directory username of the person an alert is about (chat username).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ldap(pub String);

impl Ldap {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ldap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 (hex) identifying an alert across all tables.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertHash(pub String);

impl AlertHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 64 lowercase hex chars.
    pub fn is_well_formed(s: &str) -> bool {
        s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl fmt::Display for AlertHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chat channel id (Slack `C…`/`D…`/`G…`) or a `#name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(pub String);

/// A member of the chat workspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatUser {
    pub id: String,
    /// Workspace username; matched against alert `ldap`.
    pub name: String,
    pub display_name: String,
    pub deleted: bool,
    pub is_bot: bool,
}

impl ChatUser {
    pub fn ldap(&self) -> Ldap {
        Ldap(self.name.clone())
    }
}

/// A direct message sent to the bot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingMessage {
    pub user_id: String,
    pub channel: ChannelId,
    pub text: String,
    pub ts: String,
}
