//! Integration tests for the ingest crate
//!
//! These tests drive the complete flow from a push notification to stored
//! content and records, against a scripted mailbox.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use base64::prelude::*;
use chrono::{Duration, Utc};
use ingest::gmail::api::{GmailMessage, HistoryResponse, ProfileResponse};
use ingest::models::IssuanceContext;
use ingest::storage::{BlobCipher, FileBlobStore, SqliteDatastore};
use ingest::{
    AccessGrantManager, BlobStore, ChangeSynchronizer, ConnectionStatus, ContentStore, CycleOutcome, CycleStats,
    Datastore, HistoryCursor, HistoryExpiredError, IdentityFilter, InMemoryBlobStore,
    InMemoryDatastore, IngestError, IngestSettings, MailboxApi, MailboxConnector, MemberRole,
    MessageId, Project, ProjectId, RevocationReason, RevocationRequest, TokenSet,
    UnauthorizedError, User, UserId,
};
use tempfile::TempDir;

const OWNER_EMAIL: &str = "home@owner.com";
const CONTRACTOR: &str = "carl@builders.com";

/// Mailbox with a scripted change feed
///
/// History listing returns every entry at or after the start cursor, so a
/// redelivered notification sees the same messages again.
#[derive(Default)]
struct FakeMailbox {
    messages: Mutex<HashMap<String, serde_json::Value>>,
    feed: Mutex<Vec<(u64, String)>>,
    failing: Mutex<HashSet<String>>,
    history_expired: Mutex<bool>,
    rotate_to: Mutex<Option<TokenSet>>,
    fetches: Mutex<Vec<String>>,
    /// History listing answers with a credentials rejection
    unauthorized: Mutex<bool>,
    /// Scripted token refresh: fresh tokens, or `None` for a rejected grant
    refresh_to: Mutex<Option<Option<TokenSet>>>,
    refreshes: Mutex<usize>,
}

impl FakeMailbox {
    fn deliver(&self, history_id: u64, id: &str, from: &str, to: &str) {
        self.messages.lock().unwrap().insert(
            id.to_string(),
            serde_json::json!({
                "id": id,
                "threadId": format!("t-{}", id),
                "labelIds": ["INBOX"],
                "snippet": "Framing starts Monday",
                "historyId": history_id.to_string(),
                "internalDate": "1741338000000",
                "payload": {
                    "mimeType": "text/plain",
                    "headers": [
                        {"name": "From", "value": from},
                        {"name": "To", "value": to},
                        {"name": "Subject", "value": format!("Update {}", id)}
                    ],
                    "body": {"size": 21, "data": BASE64_URL_SAFE_NO_PAD.encode("Framing starts Monday")}
                }
            }),
        );
        self.feed.lock().unwrap().push((history_id, id.to_string()));
    }

    fn fetch_count(&self, id: &str) -> usize {
        self.fetches.lock().unwrap().iter().filter(|f| *f == id).count()
    }
}

impl MailboxApi for FakeMailbox {
    fn get_message(&self, id: &MessageId) -> Result<GmailMessage> {
        self.fetches.lock().unwrap().push(id.as_str().to_string());
        if self.failing.lock().unwrap().contains(id.as_str()) {
            anyhow::bail!("simulated 500 for {}", id);
        }
        let raw = self
            .messages
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("not found: {}", id))?;
        Ok(serde_json::from_value(raw)?)
    }

    fn list_history(
        &self,
        start: &HistoryCursor,
        _page_token: Option<&str>,
    ) -> Result<HistoryResponse> {
        if *self.unauthorized.lock().unwrap() {
            return Err(UnauthorizedError { status: 401 }.into());
        }
        if *self.history_expired.lock().unwrap() {
            return Err(HistoryExpiredError.into());
        }
        let start: u64 = start.as_str().parse()?;
        let records: Vec<serde_json::Value> = self
            .feed
            .lock()
            .unwrap()
            .iter()
            .filter(|(hid, _)| *hid >= start)
            .map(|(hid, id)| {
                serde_json::json!({
                    "id": hid.to_string(),
                    "messagesAdded": [{"message": {"id": id, "threadId": format!("t-{}", id)}}]
                })
            })
            .collect();
        Ok(serde_json::from_value(serde_json::json!({
            "history": records,
            "historyId": start.to_string()
        }))?)
    }

    fn get_profile(&self) -> Result<ProfileResponse> {
        Ok(serde_json::from_value(
            serde_json::json!({"emailAddress": OWNER_EMAIL}),
        )?)
    }

    fn refresh_if_needed(&self) -> Result<Option<TokenSet>> {
        *self.refreshes.lock().unwrap() += 1;
        match self.refresh_to.lock().unwrap().clone() {
            None => Ok(None),
            Some(Some(tokens)) => Ok(Some(tokens)),
            Some(None) => Err(UnauthorizedError { status: 400 }.into()),
        }
    }

    fn take_rotated_tokens(&self) -> Option<TokenSet> {
        self.rotate_to.lock().unwrap().take()
    }
}

struct FakeConnector(Arc<FakeMailbox>);

impl MailboxConnector for FakeConnector {
    fn connect(&self, _tokens: TokenSet) -> Result<Arc<dyn MailboxApi>> {
        Ok(self.0.clone())
    }
}

/// Blob store that counts content writes per key
#[derive(Default)]
struct CountingBlobs {
    inner: InMemoryBlobStore,
    puts: Mutex<HashMap<String, usize>>,
    /// Every write fails while set
    unavailable: Mutex<bool>,
}

impl CountingBlobs {
    fn content_puts_for(&self, message_id: &str) -> usize {
        let suffix = format!("/{}/content.json", message_id);
        self.puts
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.ends_with(&suffix))
            .map(|(_, count)| *count)
            .sum()
    }
}

impl BlobStore for CountingBlobs {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        if *self.unavailable.lock().unwrap() {
            anyhow::bail!("disk full writing {}", key);
        }
        *self.puts.lock().unwrap().entry(key.to_string()).or_default() += 1;
        self.inner.put(key, data)
    }
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }
}

struct Harness {
    store: Arc<dyn Datastore>,
    blobs: Arc<CountingBlobs>,
    mailbox: Arc<FakeMailbox>,
    grants: Arc<AccessGrantManager>,
    sync: ChangeSynchronizer,
}

fn fast_settings() -> IngestSettings {
    IngestSettings {
        batch_size: 2,
        batch_delay_ms: 0,
        ..Default::default()
    }
}

fn valid_tokens() -> TokenSet {
    TokenSet::new(
        "access",
        Some("refresh".to_string()),
        Some(Utc::now() + Duration::hours(1)),
    )
}

fn harness_with(store: Arc<dyn Datastore>) -> Harness {
    let owner = UserId::new("u1");
    store.upsert_user(User::new("u1", OWNER_EMAIL)).unwrap();
    store
        .upsert_project(Project::new("p1", owner.clone(), "Kitchen remodel").with_member(
            "tm1",
            "Carl",
            CONTRACTOR,
            MemberRole::Contractor,
        ))
        .unwrap();

    let grants = Arc::new(AccessGrantManager::new(store.clone(), 90));
    grants
        .create_grant(
            &ProjectId::new("p1"),
            &owner,
            valid_tokens(),
            vec!["https://www.googleapis.com/auth/gmail.readonly".to_string()],
            IssuanceContext::default(),
        )
        .unwrap();

    let blobs = Arc::new(CountingBlobs::default());
    let mailbox = Arc::new(FakeMailbox::default());
    let sync = ChangeSynchronizer::new(
        store.clone(),
        grants.clone(),
        IdentityFilter::new(store.clone()),
        ContentStore::new(blobs.clone()),
        Arc::new(FakeConnector(mailbox.clone())),
        &fast_settings(),
    );

    Harness {
        store,
        blobs,
        mailbox,
        grants,
        sync,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(InMemoryDatastore::new()))
}

/// Helper to build a push envelope
fn envelope(email: &str, history_id: u64) -> Vec<u8> {
    let data = serde_json::json!({"emailAddress": email, "historyId": history_id}).to_string();
    serde_json::json!({
        "message": {"data": BASE64_STANDARD.encode(data), "messageId": "1"},
        "subscription": "projects/foreman/subscriptions/gmail"
    })
    .to_string()
    .into_bytes()
}

fn completed(outcome: &CycleOutcome) -> &CycleStats {
    match outcome {
        CycleOutcome::Completed(stats) => stats,
        other => panic!("expected completed cycle, got {:?}", other),
    }
}

/// Deliver a notification and return the stats of project p1's cycle
fn notify(h: &Harness, history_id: u64) -> CycleStats {
    let outcome = h
        .sync
        .handle_notification(&envelope(OWNER_EMAIL, history_id))
        .unwrap();
    let p1 = outcome
        .projects
        .iter()
        .find(|p| p.project_id.as_str() == "p1")
        .expect("p1 was not synced");
    completed(&p1.outcome).clone()
}

#[test]
fn test_first_notification_sets_cursor_without_backfill() {
    let h = harness();
    h.mailbox.deliver(50, "old", CONTRACTOR, OWNER_EMAIL);

    let stats = notify(&h, 100);

    assert_eq!(stats.entries_seen, 0);
    assert_eq!(stats.final_cursor, Some(HistoryCursor::new("100")));
    assert_eq!(h.mailbox.fetch_count("old"), 0);
}

#[test]
fn test_relevant_message_is_stored_once() {
    let h = harness();
    notify(&h, 100);
    h.mailbox.deliver(101, "m1", CONTRACTOR, OWNER_EMAIL);

    let stats = notify(&h, 101);
    assert_eq!(stats.stored, 1);

    let record = h.store.get_message(&MessageId::new("m1")).unwrap().unwrap();
    assert_eq!(record.project_id, ProjectId::new("p1"));
    assert_eq!(record.statuses, ingest::models::MessageStatuses::ingested());
    assert_eq!(record.metadata.history_id.as_deref(), Some("101"));
    assert!(record.content_path.ends_with("/u1/p1/m1/content.json"));

    let content = ContentStore::new(h.blobs.clone());
    let stored = content.retrieve_email(&record.content_path).unwrap();
    assert_eq!(stored.body_text.as_deref(), Some("Framing starts Monday"));
}

#[test]
fn test_redelivered_notification_stores_once() {
    let h = harness();
    notify(&h, 100);
    h.mailbox.deliver(101, "m1", CONTRACTOR, OWNER_EMAIL);

    notify(&h, 101);
    let again = notify(&h, 101);

    assert_eq!(again.entries_seen, 1);
    assert_eq!(again.duplicates_skipped, 1);
    assert_eq!(again.stored, 0);
    assert_eq!(h.blobs.content_puts_for("m1"), 1);
    assert_eq!(h.mailbox.fetch_count("m1"), 1);
    assert_eq!(
        h.store
            .list_messages_for_project(&ProjectId::new("p1"))
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_irrelevant_message_is_not_stored() {
    let h = harness();
    notify(&h, 100);
    h.mailbox.deliver(101, "spam", "offers@deals.example", OWNER_EMAIL);

    let stats = notify(&h, 101);

    assert_eq!(stats.fetched, 1);
    assert_eq!(stats.filtered_out, 1);
    assert_eq!(stats.stored, 0);
    assert!(!h.store.has_message(&MessageId::new("spam")).unwrap());
    assert_eq!(h.blobs.content_puts_for("spam"), 0);
}

#[test]
fn test_failed_fetch_is_skipped_not_recorded() {
    let h = harness();
    notify(&h, 100);
    h.mailbox.deliver(101, "m1", CONTRACTOR, OWNER_EMAIL);
    h.mailbox.deliver(102, "m2", CONTRACTOR, OWNER_EMAIL);
    h.mailbox.deliver(103, "m3", CONTRACTOR, OWNER_EMAIL);
    h.mailbox.failing.lock().unwrap().insert("m2".to_string());

    let stats = notify(&h, 103);

    assert_eq!(stats.entries_seen, 3);
    assert_eq!(stats.stored, 2);
    assert_eq!(stats.failed, 1);
    assert!(!h.store.has_message(&MessageId::new("m2")).unwrap());
    assert_eq!(stats.final_cursor, Some(HistoryCursor::new("103")));
}

#[test]
fn test_stale_notification_does_not_move_cursor_back() {
    let h = harness();
    notify(&h, 100);
    notify(&h, 120);

    let stats = notify(&h, 110);

    assert_eq!(stats.final_cursor, Some(HistoryCursor::new("120")));
    assert_eq!(
        h.grants.last_cursor(&ProjectId::new("p1")).unwrap(),
        Some(HistoryCursor::new("120"))
    );
}

#[test]
fn test_expired_history_skips_to_notified_cursor() {
    let h = harness();
    notify(&h, 100);
    *h.mailbox.history_expired.lock().unwrap() = true;

    let stats = notify(&h, 500);

    assert!(stats.history_expired);
    assert_eq!(stats.final_cursor, Some(HistoryCursor::new("500")));
}

#[test]
fn test_unknown_mailbox_is_noop() {
    let h = harness();
    let outcome = h
        .sync
        .handle_notification(&envelope("stranger@example.com", 100))
        .unwrap();

    assert!(outcome.owner_id.is_none());
    assert!(outcome.projects.is_empty());
    assert!(h.grants.last_cursor(&ProjectId::new("p1")).unwrap().is_none());
}

#[test]
fn test_malformed_envelope_changes_nothing() {
    let h = harness();
    let result = h.sync.handle_notification(br#"{"message": {"data": "???"}}"#);

    assert!(matches!(result, Err(IngestError::Validation(_))));
    assert!(h.grants.last_cursor(&ProjectId::new("p1")).unwrap().is_none());
}

#[test]
fn test_revoked_project_does_not_block_siblings() {
    let h = harness();
    let owner = UserId::new("u1");
    h.store
        .upsert_project(Project::new("p2", owner.clone(), "Deck").with_member(
            "tm2",
            "Ann",
            "ann@studio.com",
            MemberRole::Architect,
        ))
        .unwrap();
    h.grants
        .create_grant(
            &ProjectId::new("p2"),
            &owner,
            valid_tokens(),
            Vec::new(),
            IssuanceContext::default(),
        )
        .unwrap();
    h.grants
        .revoke_grant(
            &ProjectId::new("p1"),
            RevocationRequest::new("u1", RevocationReason::UserRequest),
        )
        .unwrap();

    let outcome = h
        .sync
        .handle_notification(&envelope(OWNER_EMAIL, 100))
        .unwrap();

    assert_eq!(outcome.projects.len(), 2);
    let by_project: HashMap<&str, &CycleOutcome> = outcome
        .projects
        .iter()
        .map(|p| (p.project_id.as_str(), &p.outcome))
        .collect();
    assert!(matches!(
        by_project["p1"],
        CycleOutcome::NeedsReconnection { .. }
    ));
    assert_eq!(
        completed(by_project["p2"]).final_cursor,
        Some(HistoryCursor::new("100"))
    );
}

#[test]
fn test_message_assigned_to_matching_project() {
    let h = harness();
    let owner = UserId::new("u1");
    h.store
        .upsert_project(Project::new("p2", owner, "Deck").with_member(
            "tm2",
            "Ann",
            "ann@studio.com",
            MemberRole::Architect,
        ))
        .unwrap();
    notify(&h, 100);
    h.mailbox.deliver(101, "m1", "Ann <ann@studio.com>", OWNER_EMAIL);

    // Only p1 has a grant, but the filter assigns the message to p2
    let stats = notify(&h, 101);
    assert_eq!(stats.stored, 1);

    let record = h.store.get_message(&MessageId::new("m1")).unwrap().unwrap();
    assert_eq!(record.project_id, ProjectId::new("p2"));
}

#[test]
fn test_rotated_tokens_are_persisted() {
    let h = harness();
    *h.mailbox.rotate_to.lock().unwrap() = Some(TokenSet::new(
        "rotated-access",
        None,
        Some(Utc::now() + Duration::hours(1)),
    ));

    let stats = notify(&h, 100);
    assert!(stats.tokens_rotated);

    let grant = h.store.get_grant(&ProjectId::new("p1")).unwrap().unwrap();
    assert_eq!(grant.refresh_count, 1);
    let tokens = grant.tokens.unwrap();
    assert_eq!(tokens.access_token, "rotated-access");
    assert_eq!(tokens.refresh_token.as_deref(), Some("refresh"));
}

#[test]
fn test_rejected_credentials_need_reconnection() {
    let h = harness();
    let project = ProjectId::new("p1");
    notify(&h, 100);
    *h.mailbox.unauthorized.lock().unwrap() = true;

    let outcome = h
        .sync
        .handle_notification(&envelope(OWNER_EMAIL, 101))
        .unwrap();

    assert!(matches!(
        outcome.projects[0].outcome,
        CycleOutcome::NeedsReconnection { .. }
    ));
    assert!(h.grants.check_reauthorization_required(&project));
    let grant = h.store.get_grant(&project).unwrap().unwrap();
    assert_eq!(
        grant.metadata.reauthorization.map(|r| r.reason),
        Some(RevocationReason::TokenExpired)
    );
    let report = h.grants.compliance_report(&project).unwrap();
    assert_eq!(report.status, ConnectionStatus::NeedsReconnection);
    assert_eq!(
        h.grants.last_cursor(&project).unwrap(),
        Some(HistoryCursor::new("100"))
    );
}

#[test]
fn test_storage_failure_is_retried_on_next_cycle() {
    let h = harness();
    notify(&h, 100);
    h.mailbox.deliver(101, "m1", CONTRACTOR, OWNER_EMAIL);
    *h.blobs.unavailable.lock().unwrap() = true;

    let stats = notify(&h, 101);

    assert_eq!(stats.fetched, 1);
    assert_eq!(stats.stored, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.final_cursor, Some(HistoryCursor::new("101")));
    assert!(!h.store.has_message(&MessageId::new("m1")).unwrap());

    // The feed still lists m1, so the next cycle picks it up
    *h.blobs.unavailable.lock().unwrap() = false;
    let retry = notify(&h, 101);

    assert_eq!(retry.stored, 1);
    assert!(h.store.has_message(&MessageId::new("m1")).unwrap());
}

fn expire_access_token(h: &Harness) {
    h.grants
        .create_grant(
            &ProjectId::new("p1"),
            &UserId::new("u1"),
            TokenSet::new(
                "stale",
                Some("refresh".to_string()),
                Some(Utc::now() - Duration::minutes(5)),
            ),
            Vec::new(),
            IssuanceContext::default(),
        )
        .unwrap();
}

#[test]
fn test_expired_access_token_is_renewed_before_cycle() {
    let h = harness();
    expire_access_token(&h);
    *h.mailbox.refresh_to.lock().unwrap() = Some(Some(TokenSet::new(
        "renewed",
        None,
        Some(Utc::now() + Duration::hours(1)),
    )));

    let stats = notify(&h, 100);

    assert_eq!(stats.final_cursor, Some(HistoryCursor::new("100")));
    assert_eq!(*h.mailbox.refreshes.lock().unwrap(), 1);
    let grant = h.store.get_grant(&ProjectId::new("p1")).unwrap().unwrap();
    assert_eq!(grant.refresh_count, 1);
    assert!(!grant.reauthorization_required);
    let tokens = grant.tokens.unwrap();
    assert_eq!(tokens.access_token, "renewed");
    assert_eq!(tokens.refresh_token.as_deref(), Some("refresh"));
}

#[test]
fn test_rejected_renewal_needs_reconnection() {
    let h = harness();
    expire_access_token(&h);
    *h.mailbox.refresh_to.lock().unwrap() = Some(None);

    let outcome = h
        .sync
        .handle_notification(&envelope(OWNER_EMAIL, 100))
        .unwrap();

    assert!(matches!(
        outcome.projects[0].outcome,
        CycleOutcome::NeedsReconnection { .. }
    ));
    let grant = h.store.get_grant(&ProjectId::new("p1")).unwrap().unwrap();
    assert_eq!(grant.refresh_count, 0);
    assert!(grant.reauthorization_required);
    assert_eq!(
        grant.metadata.reauthorization.map(|r| r.reason),
        Some(RevocationReason::TokenExpired)
    );
    assert!(h.grants.last_cursor(&ProjectId::new("p1")).unwrap().is_none());
}

// ============================================================================
// SQLite + encrypted file blob tests
// ============================================================================

#[test]
fn test_sqlite_and_encrypted_blobs_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let store: Arc<dyn Datastore> =
        Arc::new(SqliteDatastore::new(temp_dir.path().join("foreman.db")).unwrap());
    let file_blobs = Arc::new(
        FileBlobStore::new(temp_dir.path().join("content"))
            .unwrap()
            .with_cipher(BlobCipher::from_key_bytes(&[42u8; 32]).unwrap()),
    );

    let h = harness_with(store.clone());
    let sync = ChangeSynchronizer::new(
        store.clone(),
        h.grants.clone(),
        IdentityFilter::new(store.clone()),
        ContentStore::new(file_blobs.clone()),
        Arc::new(FakeConnector(h.mailbox.clone())),
        &fast_settings(),
    );

    sync.handle_notification(&envelope(OWNER_EMAIL, 100)).unwrap();
    h.mailbox.deliver(101, "m1", CONTRACTOR, OWNER_EMAIL);
    sync.handle_notification(&envelope(OWNER_EMAIL, 101)).unwrap();
    sync.handle_notification(&envelope(OWNER_EMAIL, 101)).unwrap();

    let records = store
        .list_messages_for_project(&ProjectId::new("p1"))
        .unwrap();
    assert_eq!(records.len(), 1);

    let path = temp_dir.path().join("content").join(&records[0].content_path);
    let on_disk = std::fs::read(path).unwrap();
    assert!(!String::from_utf8_lossy(&on_disk).contains("Framing"));

    let stored = ContentStore::new(file_blobs)
        .retrieve_email(&records[0].content_path)
        .unwrap();
    assert_eq!(stored.subject, "Update m1");

    // Reopen: the cursor survives in the grant row
    drop(sync);
    drop(h);
    drop(store);
    let reopened = SqliteDatastore::new(temp_dir.path().join("foreman.db")).unwrap();
    let grants = AccessGrantManager::new(Arc::new(reopened), 90);
    assert_eq!(
        grants.last_cursor(&ProjectId::new("p1")).unwrap(),
        Some(HistoryCursor::new("101"))
    );
}
