//! Storage trait definitions

use crate::models::{
    AccessGrant, GrantEvent, IngestedMessage, MessageId, MessageStatuses, Project, ProjectId,
    User, UserId,
};
use anyhow::Result;

/// Persistence boundary for the ingestion pipeline
///
/// The pipeline only relies on atomic single-key writes: grants are upserted
/// by project, ingested messages are inserted-if-absent by message id. No
/// operation spans several keys in one transaction.
pub trait Datastore: Send + Sync {
    // === Users ===

    /// Insert or update a user
    fn upsert_user(&self, user: User) -> Result<()>;

    /// Get a user by ID
    fn get_user(&self, id: &UserId) -> Result<Option<User>>;

    /// Find the user whose mailbox address matches (case-insensitive)
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    // === Projects ===

    /// Insert or update a project together with its roster
    fn upsert_project(&self, project: Project) -> Result<()>;

    /// Get a project (with roster) by ID
    fn get_project(&self, id: &ProjectId) -> Result<Option<Project>>;

    /// List projects owned by a user, oldest first
    fn list_projects_for_owner(&self, owner_id: &UserId) -> Result<Vec<Project>>;

    // === Ingested messages ===

    /// Check if an ingested message exists
    fn has_message(&self, id: &MessageId) -> Result<bool>;

    /// Insert a message record unless one with the same ID exists.
    ///
    /// Returns `true` if this call created the record.
    fn insert_message(&self, message: IngestedMessage) -> Result<bool>;

    /// Get an ingested message by ID
    fn get_message(&self, id: &MessageId) -> Result<Option<IngestedMessage>>;

    /// Update the processing statuses of an ingested message
    fn update_message_statuses(&self, id: &MessageId, statuses: MessageStatuses) -> Result<()>;

    /// List ingested messages for a project, ordered by sent_at ascending
    fn list_messages_for_project(&self, project_id: &ProjectId) -> Result<Vec<IngestedMessage>>;

    // === Grants ===

    /// Get the grant of a project
    fn get_grant(&self, project_id: &ProjectId) -> Result<Option<AccessGrant>>;

    /// Save the grant of a project (upsert)
    fn upsert_grant(&self, grant: AccessGrant) -> Result<()>;

    /// Append to a project's grant audit trail
    fn append_grant_event(&self, event: GrantEvent) -> Result<()>;

    /// List a project's grant audit trail, oldest first
    fn list_grant_events(&self, project_id: &ProjectId) -> Result<Vec<GrantEvent>>;
}
