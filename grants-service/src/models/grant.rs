//! Grant model - one user's authorization of a client, redeemable once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a grant. `Used` and `Revoked` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantState {
    Active,
    Used,
    Revoked,
}

impl GrantState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantState::Active => "active",
            GrantState::Used => "used",
            GrantState::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for GrantState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted authorization event.
///
/// `used`, `used_at`, `use_ip` and `revoked` are written only by a
/// [`Storer`](crate::services::Storer) exchange or revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub id: String,
    /// Kind of credential that produced this grant, e.g. `refresh_token`.
    pub source_type: String,
    /// Identifier of that credential. `(source_type, source_id)` is unique.
    pub source_id: String,
    /// Grants this one was derived from, oldest first.
    pub ancestor_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub account_id: String,
    pub profile_id: String,
    pub client_id: String,
    pub create_ip: String,
    pub use_ip: String,
    pub used: bool,
    pub revoked: bool,
}

impl Default for Grant {
    fn default() -> Self {
        Self {
            id: String::new(),
            source_type: String::new(),
            source_id: String::new(),
            ancestor_ids: Vec::new(),
            created_at: Utc::now(),
            used_at: None,
            scopes: Vec::new(),
            account_id: String::new(),
            profile_id: String::new(),
            client_id: String::new(),
            create_ip: String::new(),
            use_ip: String::new(),
            used: false,
            revoked: false,
        }
    }
}

impl Grant {
    /// Create a new Active grant with a fresh ID.
    pub fn new(
        source_type: impl Into<String>,
        source_id: impl Into<String>,
        client_id: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            source_id: source_id.into(),
            client_id: client_id.into(),
            scopes,
            ..Default::default()
        }
        .fill_defaults()
    }

    /// Assign a random ID if none is set.
    pub fn fill_defaults(mut self) -> Self {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        self
    }

    pub fn state(&self) -> GrantState {
        if self.used {
            GrantState::Used
        } else if self.revoked {
            GrantState::Revoked
        } else {
            GrantState::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == GrantState::Active
    }
}

/// One attempt to exchange a grant. Supplies the values recorded on the
/// grant when the exchange wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantUse {
    pub grant: String,
    pub ip: String,
    pub time: DateTime<Utc>,
}

impl GrantUse {
    /// Describe an exchange happening now.
    pub fn new(grant: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            grant: grant.into(),
            ip: ip.into(),
            time: Utc::now(),
        }
    }

    /// Apply this use to `grant`, returning the exchanged copy.
    pub(crate) fn apply(&self, mut grant: Grant) -> Grant {
        grant.used = true;
        grant.used_at = Some(self.time);
        grant.use_ip = self.ip.clone();
        grant
    }
}
