//! Delegated-access grant lifecycle
//!
//! One grant per project: issued on consent, refreshed as tokens rotate,
//! revoked terminally. Every transition is appended to the grant's audit
//! trail. The project's sync cursor also lives in the grant metadata.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::models::{
    AccessGrant, GrantEvent, GrantEventKind, GrantMetadata, HistoryCursor, IssuanceContext,
    ProjectId, ReauthorizationStamp, RefreshStamp, Revocation, RevocationReason, SyncState,
    TokenSet, UserId,
};
use crate::storage::Datastore;

/// Actor recorded for transitions the pipeline makes on its own
const SYSTEM_ACTOR: &str = "system";

/// Parameters of a revocation
#[derive(Debug, Clone)]
pub struct RevocationRequest {
    pub at: DateTime<Utc>,
    pub by: String,
    pub reason: RevocationReason,
    pub details: Option<String>,
}

impl RevocationRequest {
    pub fn new(by: impl Into<String>, reason: RevocationReason) -> Self {
        Self {
            at: Utc::now(),
            by: by.into(),
            reason,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Connection state shown in a compliance report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No grant, or the grant was revoked
    Disconnected,
    /// Connected, but the project is not monitored
    Paused,
    /// Connected, but the user must consent again
    NeedsReconnection,
    Active,
}

/// Session details of the current grant
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetails {
    pub session_id: String,
    pub granted_at: DateTime<Utc>,
    pub granted_by: UserId,
    pub scopes: Vec<String>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub refresh_count: u32,
    pub issuance: Option<IssuanceContext>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityAssessment {
    pub session_age_days: Option<i64>,
    pub token_valid: bool,
    pub needs_reauthorization: bool,
    /// Why reauthorization is needed, when known
    pub reauthorization_reason: Option<RevocationReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub project_id: ProjectId,
    pub status: ConnectionStatus,
    pub session: Option<SessionDetails>,
    /// Revocations of this project's grants, oldest first
    pub revocation_history: Vec<GrantEvent>,
    pub security: SecurityAssessment,
    pub generated_at: DateTime<Utc>,
}

/// Why a grant needs reauthorization at `now`, if it does
fn reauthorization_reason(
    grant: &AccessGrant,
    now: DateTime<Utc>,
    max_age_days: i64,
) -> Option<RevocationReason> {
    if grant.token_expired(now) {
        Some(RevocationReason::TokenExpired)
    } else if grant.exceeds_age(now, Duration::days(max_age_days)) {
        Some(RevocationReason::PolicyViolation)
    } else {
        None
    }
}

/// Owns the credential lifecycle of every project's mailbox grant
///
/// Each operation is a read-modify-write of the project's grant row; there
/// is no cross-process lock.
pub struct AccessGrantManager {
    store: Arc<dyn Datastore>,
    max_grant_age_days: i64,
}

impl AccessGrantManager {
    pub fn new(store: Arc<dyn Datastore>, max_grant_age_days: i64) -> Self {
        Self {
            store,
            max_grant_age_days,
        }
    }

    fn record(
        &self,
        grant: &AccessGrant,
        kind: GrantEventKind,
        at: DateTime<Utc>,
        actor: &str,
        reason: Option<RevocationReason>,
        details: Option<String>,
    ) -> IngestResult<()> {
        self.store.append_grant_event(GrantEvent {
            project_id: grant.project_id.clone(),
            session_id: grant.session_id.clone(),
            kind,
            at,
            actor: actor.to_string(),
            reason,
            details,
        })?;
        Ok(())
    }

    /// Issue a new grant for a project and return its session id
    ///
    /// An existing active grant is revoked first with reason
    /// `reauthorization`. The sync cursor starts empty, so the first
    /// notification after consent starts from its own cursor.
    pub fn create_grant(
        &self,
        project_id: &ProjectId,
        owner_id: &UserId,
        tokens: TokenSet,
        scopes: Vec<String>,
        issuance: IssuanceContext,
    ) -> IngestResult<String> {
        if tokens.access_token.is_empty() {
            return Err(IngestError::validation("access token is empty"));
        }

        if let Some(existing) = self.store.get_grant(project_id)?
            && existing.connected
        {
            log::info!(
                "[GRANT] Superseding session {} for project {}",
                existing.session_id,
                project_id
            );
            self.revoke_grant(
                project_id,
                RevocationRequest::new(owner_id.as_str(), RevocationReason::Reauthorization)
                    .with_details("Superseded by a new grant"),
            )?;
        }

        let now = Utc::now();
        let grant = AccessGrant {
            project_id: project_id.clone(),
            session_id: Uuid::new_v4().to_string(),
            owner_id: owner_id.clone(),
            tokens: Some(tokens),
            scopes,
            connected: true,
            granted_at: now,
            granted_by: owner_id.clone(),
            last_refreshed_at: None,
            refresh_count: 0,
            reauthorization_required: false,
            metadata: GrantMetadata {
                issuance: Some(issuance.clone()),
                ..Default::default()
            },
        };

        self.store.upsert_grant(grant.clone())?;
        self.record(
            &grant,
            GrantEventKind::Granted,
            now,
            owner_id.as_str(),
            None,
            Some(issuance.source).filter(|s| !s.is_empty()),
        )?;

        log::info!(
            "[GRANT] Granted session {} for project {}",
            grant.session_id,
            project_id
        );
        Ok(grant.session_id)
    }

    /// Store rotated tokens for a connected grant
    ///
    /// The stored refresh token is kept unless `tokens` carries a new one.
    /// A pending `token_expired` reauthorization is cleared.
    pub fn refresh_tokens(&self, project_id: &ProjectId, tokens: TokenSet) -> IngestResult<()> {
        let Some(mut grant) = self.store.get_grant(project_id)? else {
            return Err(IngestError::auth(format!("no grant for project {}", project_id)));
        };
        if !grant.connected {
            return Err(IngestError::auth(format!(
                "grant for project {} is revoked",
                project_id
            )));
        }

        let now = Utc::now();
        let previous_refresh = grant.tokens.as_ref().and_then(|t| t.refresh_token.clone());
        grant.tokens = Some(TokenSet {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or(previous_refresh),
            expires_at: tokens.expires_at,
        });
        grant.refresh_count += 1;
        grant.last_refreshed_at = Some(now);
        grant.metadata.last_refresh = Some(RefreshStamp {
            at: now,
            count: grant.refresh_count,
        });

        if grant
            .metadata
            .reauthorization
            .as_ref()
            .is_some_and(|r| r.reason == RevocationReason::TokenExpired)
        {
            grant.reauthorization_required = false;
            grant.metadata.reauthorization = None;
        }

        self.store.upsert_grant(grant.clone())?;
        self.record(&grant, GrantEventKind::Refreshed, now, SYSTEM_ACTOR, None, None)?;

        log::debug!(
            "[GRANT] Refreshed tokens for project {} (count {})",
            project_id,
            grant.refresh_count
        );
        Ok(())
    }

    /// Revoke a project's grant, clearing its tokens
    ///
    /// Revoking an already revoked grant changes nothing.
    pub fn revoke_grant(
        &self,
        project_id: &ProjectId,
        request: RevocationRequest,
    ) -> IngestResult<()> {
        let Some(mut grant) = self.store.get_grant(project_id)? else {
            return Err(IngestError::validation(format!(
                "no grant for project {}",
                project_id
            )));
        };
        if !grant.connected {
            log::debug!("[GRANT] Project {} already revoked", project_id);
            return Ok(());
        }

        grant.tokens = None;
        grant.connected = false;
        grant.metadata.revocation = Some(Revocation {
            at: request.at,
            by: request.by.clone(),
            reason: request.reason,
            details: request.details.clone(),
        });

        self.store.upsert_grant(grant.clone())?;
        self.record(
            &grant,
            GrantEventKind::Revoked,
            request.at,
            &request.by,
            Some(request.reason),
            request.details,
        )?;

        log::info!(
            "[GRANT] Revoked session {} for project {} ({})",
            grant.session_id,
            project_id,
            request.reason
        );
        Ok(())
    }

    /// Whether the project's owner must consent again before syncing
    pub fn check_reauthorization_required(&self, project_id: &ProjectId) -> bool {
        self.check_reauthorization_required_at(project_id, Utc::now())
    }

    /// [`check_reauthorization_required`](Self::check_reauthorization_required)
    /// evaluated at `now`
    ///
    /// Newly detected expiry or over-age grants are flagged and stamped.
    /// Lookup failures fail closed.
    pub fn check_reauthorization_required_at(
        &self,
        project_id: &ProjectId,
        now: DateTime<Utc>,
    ) -> bool {
        let mut grant = match self.store.get_grant(project_id) {
            Ok(Some(grant)) => grant,
            Ok(None) => return true,
            Err(e) => {
                log::error!(
                    "[GRANT] Failed to load grant for project {}: {:#}",
                    project_id,
                    e
                );
                return true;
            }
        };

        if !grant.is_active() || grant.reauthorization_required {
            return true;
        }

        let Some(reason) = reauthorization_reason(&grant, now, self.max_grant_age_days) else {
            return false;
        };

        log::warn!(
            "[GRANT] Project {} needs reauthorization: {}",
            project_id,
            reason
        );
        grant.reauthorization_required = true;
        grant.metadata.reauthorization = Some(ReauthorizationStamp { at: now, reason });
        if let Err(e) = self.store.upsert_grant(grant) {
            log::error!(
                "[GRANT] Failed to flag project {} for reauthorization: {:#}",
                project_id,
                e
            );
        }
        true
    }

    /// Mark the grant as needing reauthorization after the provider
    /// rejected its credentials
    ///
    /// A missing or already flagged grant is left untouched.
    pub fn flag_reauthorization(
        &self,
        project_id: &ProjectId,
        reason: RevocationReason,
    ) -> IngestResult<()> {
        let Some(mut grant) = self.store.get_grant(project_id)? else {
            return Ok(());
        };
        if grant.reauthorization_required {
            return Ok(());
        }

        log::warn!(
            "[GRANT] Project {} flagged for reauthorization: {}",
            project_id,
            reason
        );
        grant.reauthorization_required = true;
        grant.metadata.reauthorization = Some(ReauthorizationStamp {
            at: Utc::now(),
            reason,
        });
        self.store.upsert_grant(grant)?;
        Ok(())
    }

    /// Summarize a project's grant for audits
    pub fn compliance_report(&self, project_id: &ProjectId) -> IngestResult<ComplianceReport> {
        self.compliance_report_at(project_id, Utc::now())
    }

    fn compliance_report_at(
        &self,
        project_id: &ProjectId,
        now: DateTime<Utc>,
    ) -> IngestResult<ComplianceReport> {
        let grant = self.store.get_grant(project_id)?;
        let monitoring = self
            .store
            .get_project(project_id)?
            .map(|p| p.qualifies_for_filtering())
            .unwrap_or(false);

        let revocation_history: Vec<GrantEvent> = self
            .store
            .list_grant_events(project_id)?
            .into_iter()
            .filter(|e| e.kind == GrantEventKind::Revoked)
            .collect();

        let Some(grant) = grant else {
            return Ok(ComplianceReport {
                project_id: project_id.clone(),
                status: ConnectionStatus::Disconnected,
                session: None,
                revocation_history,
                security: SecurityAssessment {
                    session_age_days: None,
                    token_valid: false,
                    needs_reauthorization: true,
                    reauthorization_reason: None,
                },
                generated_at: now,
            });
        };

        let pending = reauthorization_reason(&grant, now, self.max_grant_age_days);
        let reauthorization_reason = grant
            .metadata
            .reauthorization
            .as_ref()
            .map(|r| r.reason)
            .or(pending);
        let needs_reauthorization =
            !grant.is_active() || grant.reauthorization_required || pending.is_some();

        let status = if !grant.is_active() {
            ConnectionStatus::Disconnected
        } else if needs_reauthorization {
            ConnectionStatus::NeedsReconnection
        } else if !monitoring {
            ConnectionStatus::Paused
        } else {
            ConnectionStatus::Active
        };

        Ok(ComplianceReport {
            project_id: project_id.clone(),
            status,
            session: Some(SessionDetails {
                session_id: grant.session_id.clone(),
                granted_at: grant.granted_at,
                granted_by: grant.granted_by.clone(),
                scopes: grant.scopes.clone(),
                last_refreshed_at: grant.last_refreshed_at,
                refresh_count: grant.refresh_count,
                issuance: grant.metadata.issuance.clone(),
            }),
            revocation_history,
            security: SecurityAssessment {
                session_age_days: Some(grant.age_days(now)),
                token_valid: grant.is_active() && !grant.token_expired(now),
                needs_reauthorization,
                reauthorization_reason,
            },
            generated_at: now,
        })
    }

    /// Cursor the project's last cycle ended at
    pub fn last_cursor(&self, project_id: &ProjectId) -> IngestResult<Option<HistoryCursor>> {
        Ok(self
            .store
            .get_grant(project_id)?
            .and_then(|g| g.metadata.last_processed_cursor)
            .map(|s| s.cursor))
    }

    /// Persist `cursor` as the project's position, never moving backwards
    ///
    /// Returns the cursor actually stored.
    pub fn advance_cursor(
        &self,
        project_id: &ProjectId,
        cursor: &HistoryCursor,
    ) -> IngestResult<HistoryCursor> {
        let Some(mut grant) = self.store.get_grant(project_id)? else {
            return Err(IngestError::auth(format!("no grant for project {}", project_id)));
        };

        let state = match grant.metadata.last_processed_cursor.take() {
            Some(state) => state.advanced(cursor),
            None => SyncState::new(cursor.clone()),
        };
        if &state.cursor != cursor {
            log::warn!(
                "[GRANT] Ignoring cursor {} behind stored {} for project {}",
                cursor,
                state.cursor,
                project_id
            );
        }

        let stored = state.cursor.clone();
        grant.metadata.last_processed_cursor = Some(state);
        self.store.upsert_grant(grant)?;
        Ok(stored)
    }

    /// Live tokens for connecting to the project's mailbox
    pub fn credentials(&self, project_id: &ProjectId) -> IngestResult<TokenSet> {
        match self.store.get_grant(project_id)? {
            Some(grant) if grant.connected => grant.tokens.ok_or_else(|| {
                IngestError::auth(format!("grant for project {} has no tokens", project_id))
            }),
            Some(_) => Err(IngestError::auth(format!(
                "grant for project {} is revoked",
                project_id
            ))),
            None => Err(IngestError::auth(format!("no grant for project {}", project_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Project, User};
    use crate::storage::InMemoryDatastore;

    fn setup() -> (Arc<InMemoryDatastore>, AccessGrantManager, ProjectId, UserId) {
        let store = Arc::new(InMemoryDatastore::new());
        let owner = UserId::new("u1");
        store.upsert_user(User::new("u1", "home@owner.com")).unwrap();
        store
            .upsert_project(Project::new("p1", owner.clone(), "Kitchen"))
            .unwrap();
        let manager = AccessGrantManager::new(store.clone(), 90);
        (store, manager, ProjectId::new("p1"), owner)
    }

    fn tokens(hours: i64) -> TokenSet {
        TokenSet::new(
            "access",
            Some("refresh".to_string()),
            Some(Utc::now() + Duration::hours(hours)),
        )
    }

    fn consent() -> IssuanceContext {
        IssuanceContext {
            source: "web_consent".to_string(),
            client_address: Some("203.0.113.7".to_string()),
            ..Default::default()
        }
    }

    fn grant(manager: &AccessGrantManager, project: &ProjectId, owner: &UserId) -> String {
        manager
            .create_grant(
                project,
                owner,
                tokens(1),
                vec!["gmail.readonly".to_string()],
                consent(),
            )
            .unwrap()
    }

    #[test]
    fn test_new_grant_needs_no_reauthorization() {
        let (store, manager, project, owner) = setup();
        let session = grant(&manager, &project, &owner);

        assert!(!manager.check_reauthorization_required(&project));
        let stored = store.get_grant(&project).unwrap().unwrap();
        assert_eq!(stored.session_id, session);
        assert_eq!(stored.metadata.issuance.unwrap().source, "web_consent");
    }

    #[test]
    fn test_missing_grant_requires_reauthorization() {
        let (_, manager, _, _) = setup();
        assert!(manager.check_reauthorization_required(&ProjectId::new("nope")));
    }

    #[test]
    fn test_create_supersedes_active_grant() {
        let (store, manager, project, owner) = setup();
        let first = grant(&manager, &project, &owner);
        let second = grant(&manager, &project, &owner);
        assert_ne!(first, second);

        let events = store.list_grant_events(&project).unwrap();
        let kinds: Vec<GrantEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                GrantEventKind::Granted,
                GrantEventKind::Revoked,
                GrantEventKind::Granted
            ]
        );
        assert_eq!(events[1].session_id, first);
        assert_eq!(events[1].reason, Some(RevocationReason::Reauthorization));
        assert!(store.get_grant(&project).unwrap().unwrap().connected);
    }

    #[test]
    fn test_revoke_clears_tokens() {
        let (store, manager, project, owner) = setup();
        grant(&manager, &project, &owner);

        manager
            .revoke_grant(
                &project,
                RevocationRequest::new("u1", RevocationReason::UserRequest),
            )
            .unwrap();

        let stored = store.get_grant(&project).unwrap().unwrap();
        assert!(!stored.connected);
        assert!(stored.tokens.is_none());
        assert_eq!(
            stored.metadata.revocation.map(|r| r.reason),
            Some(RevocationReason::UserRequest)
        );
        assert!(manager.check_reauthorization_required(&project));
        assert!(matches!(
            manager.credentials(&project),
            Err(IngestError::Auth(_))
        ));

        // Second revocation is a no-op
        manager
            .revoke_grant(&project, RevocationRequest::new("u1", RevocationReason::Security))
            .unwrap();
        assert_eq!(store.list_grant_events(&project).unwrap().len(), 2);
    }

    #[test]
    fn test_over_age_grant_is_policy_violation() {
        let (store, manager, project, owner) = setup();
        grant(&manager, &project, &owner);
        let granted_at = store.get_grant(&project).unwrap().unwrap().granted_at;

        // Tokens keep being refreshed; only the grant age trips the check
        manager.refresh_tokens(&project, tokens(24 * 200)).unwrap();
        let later = granted_at + Duration::days(91);
        assert!(manager.check_reauthorization_required_at(&project, later));

        let stored = store.get_grant(&project).unwrap().unwrap();
        assert!(stored.reauthorization_required);
        assert_eq!(
            stored.metadata.reauthorization.map(|r| r.reason),
            Some(RevocationReason::PolicyViolation)
        );
    }

    #[test]
    fn test_age_limit_counts_partial_days() {
        let (_, manager, project, owner) = setup();
        grant(&manager, &project, &owner);
        manager.refresh_tokens(&project, tokens(24 * 200)).unwrap();
        let granted_at = manager.store.get_grant(&project).unwrap().unwrap().granted_at;

        let at_limit = granted_at + Duration::days(90);
        assert!(!manager.check_reauthorization_required_at(&project, at_limit));
        let later = granted_at + Duration::days(90) + Duration::hours(20);
        assert!(manager.check_reauthorization_required_at(&project, later));
    }

    #[test]
    fn test_flag_reauthorization_stamps_grant() {
        let (store, manager, project, owner) = setup();
        grant(&manager, &project, &owner);

        manager
            .flag_reauthorization(&project, RevocationReason::TokenExpired)
            .unwrap();

        assert!(manager.check_reauthorization_required(&project));
        let stored = store.get_grant(&project).unwrap().unwrap();
        assert_eq!(
            stored.metadata.reauthorization.map(|r| r.reason),
            Some(RevocationReason::TokenExpired)
        );
        let report = manager.compliance_report(&project).unwrap();
        assert_eq!(report.status, ConnectionStatus::NeedsReconnection);

        // Unknown projects are ignored
        manager
            .flag_reauthorization(&ProjectId::new("nope"), RevocationReason::TokenExpired)
            .unwrap();
    }

    #[test]
    fn test_expired_token_is_stamped_and_cleared_by_refresh() {
        let (store, manager, project, owner) = setup();
        manager
            .create_grant(&project, &owner, tokens(-1), Vec::new(), consent())
            .unwrap();

        assert!(manager.check_reauthorization_required(&project));
        let stored = store.get_grant(&project).unwrap().unwrap();
        assert_eq!(
            stored.metadata.reauthorization.map(|r| r.reason),
            Some(RevocationReason::TokenExpired)
        );

        manager
            .refresh_tokens(&project, TokenSet::new("fresh", None, None))
            .unwrap();
        assert!(!manager.check_reauthorization_required(&project));
    }

    #[test]
    fn test_refresh_keeps_refresh_token() {
        let (store, manager, project, owner) = setup();
        grant(&manager, &project, &owner);

        manager
            .refresh_tokens(&project, TokenSet::new("new-access", None, None))
            .unwrap();

        let stored = store.get_grant(&project).unwrap().unwrap();
        let tokens = stored.tokens.unwrap();
        assert_eq!(tokens.access_token, "new-access");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(stored.refresh_count, 1);
        assert!(stored.last_refreshed_at.is_some());
    }

    #[test]
    fn test_refresh_without_grant_is_auth_error() {
        let (_, manager, project, _) = setup();
        let result = manager.refresh_tokens(&project, tokens(1));
        assert!(matches!(result, Err(IngestError::Auth(_))));
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let (_, manager, project, owner) = setup();
        grant(&manager, &project, &owner);
        assert!(manager.last_cursor(&project).unwrap().is_none());

        manager
            .advance_cursor(&project, &HistoryCursor::new("500"))
            .unwrap();
        let stored = manager
            .advance_cursor(&project, &HistoryCursor::new("300"))
            .unwrap();
        assert_eq!(stored, HistoryCursor::new("500"));
        assert_eq!(
            manager.last_cursor(&project).unwrap(),
            Some(HistoryCursor::new("500"))
        );
    }

    #[test]
    fn test_compliance_report_states() {
        let (store, manager, project, owner) = setup();

        let report = manager.compliance_report(&project).unwrap();
        assert_eq!(report.status, ConnectionStatus::Disconnected);
        assert!(report.session.is_none());

        grant(&manager, &project, &owner);
        let report = manager.compliance_report(&project).unwrap();
        assert_eq!(report.status, ConnectionStatus::Active);
        assert!(report.security.token_valid);
        assert_eq!(report.security.session_age_days, Some(0));

        let paused = store
            .get_project(&project)
            .unwrap()
            .unwrap()
            .with_monitoring(false);
        store.upsert_project(paused).unwrap();
        let report = manager.compliance_report(&project).unwrap();
        assert_eq!(report.status, ConnectionStatus::Paused);

        let granted_at = store.get_grant(&project).unwrap().unwrap().granted_at;
        let report = manager
            .compliance_report_at(&project, granted_at + Duration::days(120))
            .unwrap();
        assert_eq!(report.status, ConnectionStatus::NeedsReconnection);

        manager
            .revoke_grant(
                &project,
                RevocationRequest::new("u1", RevocationReason::Security).with_details("lost phone"),
            )
            .unwrap();
        let report = manager.compliance_report(&project).unwrap();
        assert_eq!(report.status, ConnectionStatus::Disconnected);
        assert_eq!(report.revocation_history.len(), 1);
        assert_eq!(
            report.revocation_history[0].details.as_deref(),
            Some("lost phone")
        );
    }
}
