//! In-memory storage implementation
//!
//! Used by tests and for dry runs where nothing should touch disk.

use anyhow::{Result, bail};
use std::collections::HashMap;
use std::sync::RwLock;

use super::Datastore;
use crate::models::{
    AccessGrant, GrantEvent, IngestedMessage, MessageId, MessageStatuses, Project, ProjectId,
    User, UserId, normalize_address,
};

/// In-memory implementation of Datastore
///
/// Uses collections protected by RwLocks for thread-safe access. Projects
/// keep insertion order so owner listings are stable.
pub struct InMemoryDatastore {
    users: RwLock<HashMap<String, User>>,
    projects: RwLock<Vec<Project>>,
    messages: RwLock<HashMap<String, IngestedMessage>>,
    grants: RwLock<HashMap<String, AccessGrant>>,
    grant_events: RwLock<Vec<GrantEvent>>,
}

impl InMemoryDatastore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            projects: RwLock::new(Vec::new()),
            messages: RwLock::new(HashMap::new()),
            grants: RwLock::new(HashMap::new()),
            grant_events: RwLock::new(Vec::new()),
        }
    }

    /// Number of ingested messages (for tests)
    pub fn message_count(&self) -> usize {
        self.messages.read().unwrap().len()
    }
}

impl Default for InMemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl Datastore for InMemoryDatastore {
    fn upsert_user(&self, user: User) -> Result<()> {
        let mut users = self.users.write().unwrap();
        users.insert(user.id.0.clone(), user);
        Ok(())
    }

    fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        let users = self.users.read().unwrap();
        Ok(users.get(&id.0).cloned())
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let wanted = normalize_address(email);
        let users = self.users.read().unwrap();
        Ok(users
            .values()
            .find(|u| u.normalized_email().as_deref() == Some(wanted.as_str()))
            .cloned())
    }

    fn upsert_project(&self, project: Project) -> Result<()> {
        let mut projects = self.projects.write().unwrap();
        match projects.iter_mut().find(|p| p.id == project.id) {
            Some(existing) => *existing = project,
            None => projects.push(project),
        }
        Ok(())
    }

    fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        let projects = self.projects.read().unwrap();
        Ok(projects.iter().find(|p| &p.id == id).cloned())
    }

    fn list_projects_for_owner(&self, owner_id: &UserId) -> Result<Vec<Project>> {
        let projects = self.projects.read().unwrap();
        let mut owned: Vec<Project> = projects
            .iter()
            .filter(|p| &p.owner_id == owner_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(owned)
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        let messages = self.messages.read().unwrap();
        Ok(messages.contains_key(&id.0))
    }

    fn insert_message(&self, message: IngestedMessage) -> Result<bool> {
        let mut messages = self.messages.write().unwrap();
        if messages.contains_key(&message.id.0) {
            return Ok(false);
        }
        messages.insert(message.id.0.clone(), message);
        Ok(true)
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<IngestedMessage>> {
        let messages = self.messages.read().unwrap();
        Ok(messages.get(&id.0).cloned())
    }

    fn update_message_statuses(&self, id: &MessageId, statuses: MessageStatuses) -> Result<()> {
        let mut messages = self.messages.write().unwrap();
        let Some(message) = messages.get_mut(&id.0) else {
            bail!("Message {} not found", id);
        };
        message.statuses = statuses;
        Ok(())
    }

    fn list_messages_for_project(&self, project_id: &ProjectId) -> Result<Vec<IngestedMessage>> {
        let messages = self.messages.read().unwrap();
        let mut result: Vec<IngestedMessage> = messages
            .values()
            .filter(|m| &m.project_id == project_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        Ok(result)
    }

    fn get_grant(&self, project_id: &ProjectId) -> Result<Option<AccessGrant>> {
        let grants = self.grants.read().unwrap();
        Ok(grants.get(&project_id.0).cloned())
    }

    fn upsert_grant(&self, grant: AccessGrant) -> Result<()> {
        let mut grants = self.grants.write().unwrap();
        grants.insert(grant.project_id.0.clone(), grant);
        Ok(())
    }

    fn append_grant_event(&self, event: GrantEvent) -> Result<()> {
        self.grant_events.write().unwrap().push(event);
        Ok(())
    }

    fn list_grant_events(&self, project_id: &ProjectId) -> Result<Vec<GrantEvent>> {
        let events = self.grant_events.read().unwrap();
        Ok(events
            .iter()
            .filter(|e| &e.project_id == project_id)
            .cloned()
            .collect())
    }
}
