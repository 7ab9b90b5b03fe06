//! Ingest crate - identity-scoped mail ingestion for project tracking
//!
//! This crate provides:
//! - Domain models (projects, rosters, grants, canonical messages)
//! - Gmail API client and OAuth token exchange
//! - Delegated-access grant lifecycle with an audit trail
//! - Identity filtering against project rosters
//! - Encrypted content storage
//! - Notification-driven, idempotent incremental sync
//!
//! Every component is constructed explicitly and receives its collaborators,
//! so tests swap in in-memory stores and scripted mailboxes.

pub mod config;
pub mod content;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod gmail;
pub mod grants;
pub mod models;
pub mod storage;
pub mod sync;

pub use config::{GmailCredentials, IngestSettings};
pub use content::{ContentStore, StoreOutcome, StoredAttachment, StoredEmail};
pub use error::{IngestError, IngestResult};
pub use fetcher::{MailboxApi, MailboxConnector, MessageFetcher};
pub use filter::{FilterDecision, IdentityFilter};
pub use gmail::{
    GmailAuth, GmailClient, GmailConnector, HistoryExpiredError, UnauthorizedError,
};
pub use grants::{
    AccessGrantManager, ComplianceReport, ConnectionStatus, RevocationRequest,
    SecurityAssessment, SessionDetails,
};
pub use models::{
    AccessGrant, CanonicalMessage, EmailAddress, HistoryCursor, IngestedMessage, MemberRole,
    MessageId, Project, ProjectId, ProjectStatus, RevocationReason, TeamMember, TokenSet, User,
    UserId,
};
pub use storage::{
    BlobCipher, BlobStore, Datastore, FileBlobStore, InMemoryBlobStore, InMemoryDatastore,
    SqliteDatastore,
};
pub use sync::{
    ChangeNotification, ChangeSynchronizer, CycleOutcome, CycleStats, NotificationOutcome,
    ProjectCycle, decode_notification, verification_response,
};
