//! Domain models for ingestion entities

mod grant;
mod message;
mod project;
mod sync_state;

pub use grant::{
    AccessGrant, GrantEvent, GrantEventKind, GrantMetadata, IssuanceContext, ReauthorizationStamp,
    RefreshStamp, Revocation, RevocationReason, TokenSet,
};
pub use message::{
    AttachmentMeta, CanonicalMessage, CanonicalMessageBuilder, EmailAddress, IngestMetadata,
    IngestedMessage, MessageId, MessageStatuses, ProcessingStatus, normalize_address,
};
pub use project::{MemberRole, Project, ProjectId, ProjectStatus, TeamMember, User, UserId};
pub use sync_state::{HistoryCursor, SyncState};
