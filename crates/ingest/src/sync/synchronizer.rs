//! Notification-driven incremental sync
//!
//! For every monitored project of the notified mailbox's owner a cycle runs:
//! check the grant, walk the change history from the stored cursor, fetch
//! new messages, keep the ones the identity filter approves, and advance the
//! cursor. Cycles are independent; one project failing never stops the rest.
//!
//! Redelivered notifications are safe: a message whose record already exists
//! is skipped before it is fetched, and records are inserted only if absent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use super::notification::{ChangeNotification, decode_notification};
use crate::config::IngestSettings;
use crate::content::ContentStore;
use crate::error::{IngestError, IngestResult};
use crate::fetcher::{MailboxApi, MailboxConnector, MessageFetcher};
use crate::filter::IdentityFilter;
use crate::gmail::{HistoryExpiredError, UnauthorizedError};
use crate::gmail::api::HistoryResponse;
use crate::grants::AccessGrantManager;
use crate::models::{
    CanonicalMessage, HistoryCursor, IngestMetadata, IngestedMessage, MessageId, MessageStatuses,
    Project, ProjectId, RevocationReason, User, UserId,
};
use crate::storage::Datastore;

/// Statistics from one project's sync cycle
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CycleStats {
    /// Message-added entries in the change feed
    pub entries_seen: usize,
    /// Entries skipped because a record already exists
    pub duplicates_skipped: usize,
    /// Messages fetched successfully
    pub fetched: usize,
    /// Fetched messages the identity filter rejected
    pub filtered_out: usize,
    /// Messages stored and recorded
    pub stored: usize,
    /// Entries that failed to fetch, store or record
    pub failed: usize,
    /// The stored cursor was too old and the gap was skipped
    pub history_expired: bool,
    /// The mailbox client rotated the grant's tokens
    pub tokens_rotated: bool,
    /// Cursor persisted at the end of the cycle
    pub final_cursor: Option<HistoryCursor>,
    pub duration_ms: u64,
}

/// Result of one project's sync cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed(CycleStats),
    /// The grant is missing, revoked, expired or too old
    NeedsReconnection { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectCycle {
    pub project_id: ProjectId,
    pub outcome: CycleOutcome,
}

/// Result of handling one change notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationOutcome {
    pub email_address: String,
    pub history_id: HistoryCursor,
    /// Owner of the mailbox; `None` when the address is not known
    pub owner_id: Option<UserId>,
    pub projects: Vec<ProjectCycle>,
}

/// What happened to one fetched message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Stored,
    FilteredOut,
    /// Another run recorded it between the dedup check and the insert
    AlreadyRecorded,
}

/// Orchestrates sync cycles in response to change notifications
pub struct ChangeSynchronizer {
    store: Arc<dyn Datastore>,
    grants: Arc<AccessGrantManager>,
    filter: IdentityFilter,
    content: ContentStore,
    connector: Arc<dyn MailboxConnector>,
    batch_size: usize,
    batch_delay: Duration,
}

impl ChangeSynchronizer {
    pub fn new(
        store: Arc<dyn Datastore>,
        grants: Arc<AccessGrantManager>,
        filter: IdentityFilter,
        content: ContentStore,
        connector: Arc<dyn MailboxConnector>,
        settings: &IngestSettings,
    ) -> Self {
        Self {
            store,
            grants,
            filter,
            content,
            connector,
            batch_size: settings.batch_size.max(1),
            batch_delay: settings.batch_delay(),
        }
    }

    pub fn grants(&self) -> &AccessGrantManager {
        &self.grants
    }

    /// Decode a push envelope and process it
    ///
    /// A malformed envelope is a validation error and changes nothing.
    pub fn handle_notification(&self, body: &[u8]) -> IngestResult<NotificationOutcome> {
        let notification = decode_notification(body)?;
        self.process_change(&notification)
    }

    /// Run a sync cycle for every monitored project of the mailbox owner
    ///
    /// An unknown mailbox is a successful no-op.
    pub fn process_change(
        &self,
        notification: &ChangeNotification,
    ) -> IngestResult<NotificationOutcome> {
        let mut outcome = NotificationOutcome {
            email_address: notification.email_address.clone(),
            history_id: notification.history_id.clone(),
            owner_id: None,
            projects: Vec::new(),
        };

        let Some(owner) = self.store.find_user_by_email(&notification.email_address)? else {
            log::info!(
                "[SYNC] No user for mailbox {}; ignoring notification",
                notification.email_address
            );
            return Ok(outcome);
        };
        outcome.owner_id = Some(owner.id.clone());

        let projects: Vec<Project> = self
            .store
            .list_projects_for_owner(&owner.id)?
            .into_iter()
            .filter(|p| p.monitoring_enabled)
            .collect();

        log::info!(
            "[SYNC] Notification for {} at {}: {} monitored project(s)",
            notification.email_address,
            notification.history_id,
            projects.len()
        );

        for project in &projects {
            let result = self.sync_project(&owner, project, &notification.history_id);
            outcome.projects.push(ProjectCycle {
                project_id: project.id.clone(),
                outcome: result,
            });
        }

        Ok(outcome)
    }

    /// Run one project's cycle up to the notified cursor
    pub fn sync_project(
        &self,
        owner: &User,
        project: &Project,
        notified: &HistoryCursor,
    ) -> CycleOutcome {
        let start = Instant::now();
        match self.run_cycle(owner, project, notified) {
            Ok(mut stats) => {
                stats.duration_ms = start.elapsed().as_millis() as u64;
                log::info!(
                    "[SYNC] Project {}: {} entries, {} stored, {} duplicates, {} filtered, {} failed",
                    project.id,
                    stats.entries_seen,
                    stats.stored,
                    stats.duplicates_skipped,
                    stats.filtered_out,
                    stats.failed
                );
                CycleOutcome::Completed(stats)
            }
            Err(IngestError::Auth(reason)) => {
                log::warn!("[SYNC] Project {} needs reconnection: {}", project.id, reason);
                CycleOutcome::NeedsReconnection { reason }
            }
            Err(e) => {
                log::error!("[SYNC] Project {} cycle failed: {}", project.id, e);
                CycleOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn connect(&self, project_id: &ProjectId) -> IngestResult<Arc<dyn MailboxApi>> {
        let tokens = self.grants.credentials(project_id)?;
        self.connector
            .connect(tokens)
            .map_err(|e| IngestError::Provider(format!("{:#}", e)))
    }

    /// Exchange an expired access token before the grant check flags it
    ///
    /// Returns the connected client when a refresh was attempted.
    fn renew_expired_access(&self, project_id: &ProjectId) -> Option<Arc<dyn MailboxApi>> {
        let tokens = self.grants.credentials(project_id).ok()?;
        let expired = tokens.expires_at.is_some_and(|at| at <= Utc::now());
        if !expired || tokens.refresh_token.is_none() {
            return None;
        }

        let mailbox = match self.connect(project_id) {
            Ok(mailbox) => mailbox,
            Err(e) => {
                log::warn!("[SYNC] Could not connect project {}: {}", project_id, e);
                return None;
            }
        };
        let fetcher = MessageFetcher::new(mailbox.clone(), self.batch_delay);
        if let Some(fresh) = fetcher.refresh_token_if_needed() {
            // Collected here so the end-of-cycle rotation check does not repeat it
            mailbox.take_rotated_tokens();
            if let Err(e) = self.grants.refresh_tokens(project_id, fresh) {
                log::warn!(
                    "[SYNC] Failed to store refreshed tokens for {}: {}",
                    project_id,
                    e
                );
            }
        }
        Some(mailbox)
    }

    fn persist_rotation(
        &self,
        project_id: &ProjectId,
        mailbox: &Arc<dyn MailboxApi>,
        stats: &mut CycleStats,
    ) {
        let Some(tokens) = mailbox.take_rotated_tokens() else {
            return;
        };
        stats.tokens_rotated = true;
        if let Err(e) = self.grants.refresh_tokens(project_id, tokens) {
            log::warn!(
                "[SYNC] Failed to store rotated tokens for {}: {}",
                project_id,
                e
            );
        }
    }

    fn run_cycle(
        &self,
        owner: &User,
        project: &Project,
        notified: &HistoryCursor,
    ) -> IngestResult<CycleStats> {
        let project_id = &project.id;
        let mut stats = CycleStats::default();

        // 1. Auth check
        let renewed = self.renew_expired_access(project_id);
        if self.grants.check_reauthorization_required(project_id) {
            return Err(IngestError::auth(format!(
                "project {} requires reauthorization",
                project_id
            )));
        }
        let mailbox = match renewed {
            Some(mailbox) => mailbox,
            None => self.connect(project_id)?,
        };

        // 2. History since the stored cursor, or the notified one on first contact
        let start = self
            .grants
            .last_cursor(project_id)?
            .unwrap_or_else(|| notified.clone());

        let history = match mailbox.list_history_all(&start) {
            Ok(history) => history,
            Err(e) if e.is::<HistoryExpiredError>() => {
                log::warn!(
                    "[SYNC] Cursor {} expired for project {}; skipping to {}",
                    start,
                    project_id,
                    notified
                );
                stats.history_expired = true;
                HistoryResponse::default()
            }
            Err(e) if e.is::<UnauthorizedError>() => {
                if let Err(flag_err) = self
                    .grants
                    .flag_reauthorization(project_id, RevocationReason::TokenExpired)
                {
                    log::error!(
                        "[SYNC] Failed to flag project {} for reauthorization: {}",
                        project_id,
                        flag_err
                    );
                }
                return Err(IngestError::auth(format!(
                    "mailbox rejected the credentials of project {}: {:#}",
                    project_id, e
                )));
            }
            Err(e) => {
                self.persist_rotation(project_id, &mailbox, &mut stats);
                return Err(IngestError::Provider(format!("{:#}", e)));
            }
        };

        // 3. Dedup before fetching
        let added = history.added_message_ids();
        stats.entries_seen = added.len();

        let mut to_fetch: Vec<MessageId> = Vec::new();
        for id in added.into_iter().map(MessageId::new) {
            match self.store.has_message(&id) {
                Ok(true) => stats.duplicates_skipped += 1,
                Ok(false) => to_fetch.push(id),
                Err(e) => {
                    log::error!("[SYNC] Dedup check failed for {}: {:#}", id, e);
                    stats.failed += 1;
                }
            }
        }

        // 4. Fetch, filter, store, record
        let fetcher = MessageFetcher::new(mailbox.clone(), self.batch_delay);
        let fetched = fetcher.fetch_batch(&to_fetch, self.batch_size);

        for (id, message) in to_fetch.iter().zip(fetched) {
            let Some(message) = message else {
                stats.failed += 1;
                continue;
            };
            stats.fetched += 1;

            match self.ingest_message(&owner.id, project_id, message, notified) {
                Ok(Disposition::Stored) => stats.stored += 1,
                Ok(Disposition::FilteredOut) => stats.filtered_out += 1,
                Ok(Disposition::AlreadyRecorded) => stats.duplicates_skipped += 1,
                Err(e) => {
                    log::error!("[SYNC] Failed to ingest message {}: {}", id, e);
                    stats.failed += 1;
                }
            }
        }

        self.persist_rotation(project_id, &mailbox, &mut stats);

        // 5. Cursor advance, once per batch
        stats.final_cursor = Some(self.grants.advance_cursor(project_id, notified)?);
        Ok(stats)
    }

    fn ingest_message(
        &self,
        owner_id: &UserId,
        cycling_project: &ProjectId,
        message: CanonicalMessage,
        notified: &HistoryCursor,
    ) -> IngestResult<Disposition> {
        let decision = self.filter.should_process_email(
            &message.from.email,
            &message.recipient_addresses(),
            owner_id,
        );
        if !decision.should_process {
            log::debug!("[SYNC] Skipping message {}: {}", message.id, decision.reason);
            return Ok(Disposition::FilteredOut);
        }

        let project_id = decision
            .project_id
            .unwrap_or_else(|| cycling_project.clone());

        let stored = self.content.store_email(owner_id, &project_id, &message);
        if !stored.success {
            return Err(IngestError::Storage(
                stored.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        let record = IngestedMessage {
            id: message.id.clone(),
            project_id,
            owner_id: owner_id.clone(),
            subject: message.subject,
            from: message.from,
            to: message.to,
            cc: message.cc,
            sent_at: message.sent_at,
            content_path: stored.content_path.unwrap_or_default(),
            attachment_paths: stored.attachment_paths,
            statuses: MessageStatuses::ingested(),
            metadata: IngestMetadata {
                thread_id: message.thread_id,
                label_ids: message.label_ids,
                snippet: message.snippet,
                history_id: Some(notified.to_string()),
            },
            ingested_at: Utc::now(),
        };

        if self.store.insert_message(record)? {
            Ok(Disposition::Stored)
        } else {
            log::debug!("[SYNC] Message {} was recorded concurrently", message.id);
            Ok(Disposition::AlreadyRecorded)
        }
    }
}
