//! Delegated-access grant models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ProjectId, SyncState, UserId};

/// OAuth token set for one mailbox
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
        }
    }

    /// Build from a token endpoint response's relative lifetime
    pub fn from_expires_in(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
    ) -> Self {
        let expires_at = expires_in.map(|secs| Utc::now() + Duration::seconds(secs as i64));
        Self::new(access_token, refresh_token, expires_at)
    }

    /// Whether the access token expires within `skew` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at.is_some_and(|at| at <= now + skew)
    }
}

// Tokens are secrets; keep them out of logs and panic messages.
impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Why a grant was revoked or flagged for reauthorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Security,
    UserRequest,
    TokenExpired,
    PolicyViolation,
    Reauthorization,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Security => "security",
            RevocationReason::UserRequest => "user_request",
            RevocationReason::TokenExpired => "token_expired",
            RevocationReason::PolicyViolation => "policy_violation",
            RevocationReason::Reauthorization => "reauthorization",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "security" => Some(RevocationReason::Security),
            "user_request" => Some(RevocationReason::UserRequest),
            "token_expired" => Some(RevocationReason::TokenExpired),
            "policy_violation" => Some(RevocationReason::PolicyViolation),
            "reauthorization" => Some(RevocationReason::Reauthorization),
            _ => None,
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Revocation stamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revocation {
    pub at: DateTime<Utc>,
    pub by: String,
    pub reason: RevocationReason,
    pub details: Option<String>,
}

/// Most recent token refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshStamp {
    pub at: DateTime<Utc>,
    pub count: u32,
}

/// Why and when a grant was flagged as needing reauthorization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReauthorizationStamp {
    pub at: DateTime<Utc>,
    pub reason: RevocationReason,
}

/// Context captured when the user consented
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssuanceContext {
    /// Where the consent came from (e.g. "web_consent")
    pub source: String,
    pub client_address: Option<String>,
    pub user_agent: Option<String>,
    pub consent_version: Option<String>,
}

/// Named, optional metadata carried on a grant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrantMetadata {
    #[serde(default)]
    pub last_processed_cursor: Option<SyncState>,
    #[serde(default)]
    pub last_refresh: Option<RefreshStamp>,
    #[serde(default)]
    pub revocation: Option<Revocation>,
    #[serde(default)]
    pub reauthorization: Option<ReauthorizationStamp>,
    #[serde(default)]
    pub issuance: Option<IssuanceContext>,
}

/// The single logical access grant of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub project_id: ProjectId,
    pub session_id: String,
    pub owner_id: UserId,
    /// Cleared on revocation
    pub tokens: Option<TokenSet>,
    pub scopes: Vec<String>,
    pub connected: bool,
    pub granted_at: DateTime<Utc>,
    pub granted_by: UserId,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub refresh_count: u32,
    pub reauthorization_required: bool,
    pub metadata: GrantMetadata,
}

impl AccessGrant {
    /// Whether the grant can be used to reach the mailbox
    pub fn is_active(&self) -> bool {
        self.connected && self.tokens.is_some()
    }

    /// Whole days since the grant was issued
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.granted_at).num_days()
    }

    /// Whether more than `max_age` has passed since issuance
    pub fn exceeds_age(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.granted_at > max_age
    }

    /// Whether the access token expiry has passed
    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        self.tokens
            .as_ref()
            .and_then(|t| t.expires_at)
            .is_some_and(|at| at < now)
    }
}

/// Kind of entry in a grant's audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantEventKind {
    Granted,
    Refreshed,
    Revoked,
}

impl GrantEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantEventKind::Granted => "granted",
            GrantEventKind::Refreshed => "refreshed",
            GrantEventKind::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "granted" => Some(GrantEventKind::Granted),
            "refreshed" => Some(GrantEventKind::Refreshed),
            "revoked" => Some(GrantEventKind::Revoked),
            _ => None,
        }
    }
}

/// Append-only audit record of a grant lifecycle transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantEvent {
    pub project_id: ProjectId,
    pub session_id: String,
    pub kind: GrantEventKind,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub reason: Option<RevocationReason>,
    pub details: Option<String>,
}
