//! Identity-based relevance filter
//!
//! Decides whether a message involves anyone on the rosters of the owner's
//! monitored projects, and which project it belongs to.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::models::{Project, ProjectId, TeamMember, User, UserId, normalize_address};
use crate::storage::Datastore;

/// Outcome of [`IdentityFilter::should_process_email`]
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDecision {
    pub should_process: bool,
    /// Roster members involved in the message, one entry per member
    pub matched_members: Vec<TeamMember>,
    pub reason: String,
    /// Project the message is assigned to, when it matched
    pub project_id: Option<ProjectId>,
}

impl FilterDecision {
    fn reject(reason: impl Into<String>) -> Self {
        Self {
            should_process: false,
            matched_members: Vec::new(),
            reason: reason.into(),
            project_id: None,
        }
    }
}

/// Normalized address → roster entries, in roster order
struct AddressBook {
    entries: HashMap<String, Vec<TeamMember>>,
    /// Distinct addresses in the order they were added
    known: Vec<String>,
}

impl AddressBook {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            known: Vec::new(),
        }
    }

    fn add(&mut self, member: TeamMember) {
        let address = normalize_address(&member.email);
        if address.is_empty() {
            return;
        }
        let slot = self.entries.entry(address.clone()).or_default();
        if slot.is_empty() {
            self.known.push(address);
        }
        slot.push(member);
    }

    fn lookup(&self, address: &str) -> &[TeamMember] {
        self.entries.get(address).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Decides message relevance from the owner's project rosters
pub struct IdentityFilter {
    store: Arc<dyn Datastore>,
}

impl IdentityFilter {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    /// Decide whether a message belongs to any of `owner`'s monitored projects
    ///
    /// Only projects that are Active or OnHold with monitoring enabled are
    /// considered. The owner's own address is part of every roster but never
    /// qualifies a message by itself: every message in the mailbox already
    /// involves the owner. Errors fail closed.
    pub fn should_process_email(
        &self,
        sender: &str,
        recipients: &[String],
        owner: &UserId,
    ) -> FilterDecision {
        match self.decide(sender, recipients, owner) {
            Ok(decision) => {
                log::debug!(
                    "[FILTER] {} for owner {}: {}",
                    if decision.should_process { "accept" } else { "reject" },
                    owner,
                    decision.reason
                );
                decision
            }
            Err(e) => {
                log::error!("[FILTER] Failed to evaluate message for {}: {:#}", owner, e);
                FilterDecision::reject(format!("Filter error: {:#}", e))
            }
        }
    }

    fn decide(
        &self,
        sender: &str,
        recipients: &[String],
        owner: &UserId,
    ) -> Result<FilterDecision> {
        let Some(owner_user) = self.store.get_user(owner)? else {
            return Ok(FilterDecision::reject(format!("Unknown owner {}", owner)));
        };
        let owner_address = owner_user.normalized_email();

        let projects: Vec<Project> = self
            .store
            .list_projects_for_owner(owner)?
            .into_iter()
            .filter(Project::qualifies_for_filtering)
            .collect();

        if projects.is_empty() {
            return Ok(FilterDecision::reject(
                "No active projects with monitoring enabled",
            ));
        }

        let mut book = AddressBook::new();
        for project in &projects {
            for member in members_with_owner(project, &owner_user) {
                book.add(member);
            }
        }

        let sender = normalize_address(sender);
        let recipients: Vec<String> = recipients.iter().map(|r| normalize_address(r)).collect();

        let mut matched: Vec<TeamMember> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut project_id: Option<ProjectId> = None;

        for address in std::iter::once(&sender).chain(recipients.iter()) {
            if owner_address.as_deref() == Some(address.as_str()) {
                continue;
            }
            let members = book.lookup(address);
            if let Some(first) = members.first()
                && project_id.is_none()
            {
                project_id = Some(first.project_id.clone());
            }
            for member in members {
                if seen.insert(member.id.clone()) {
                    matched.push(member.clone());
                }
            }
        }

        let Some(project_id) = project_id else {
            return Ok(FilterDecision::reject(format!(
                "No team member match. Known addresses: {}",
                book.known.join(", ")
            )));
        };

        // The chosen project must belong to the mailbox owner
        let owned = projects
            .iter()
            .any(|p| p.id == project_id && &p.owner_id == owner);
        if !owned {
            log::warn!(
                "[FILTER] Project {} is not owned by {}; rejecting",
                project_id,
                owner
            );
            return Ok(FilterDecision::reject(format!(
                "Project {} is not owned by {}",
                project_id, owner
            )));
        }

        let addresses: Vec<&str> = matched.iter().map(|m| m.email.as_str()).collect();
        Ok(FilterDecision {
            should_process: true,
            reason: format!(
                "Matched {} team member(s): {}",
                matched.len(),
                addresses.join(", ")
            ),
            matched_members: matched,
            project_id: Some(project_id),
        })
    }

    /// Roster of a project, including the implicit owner entry
    pub fn project_team_members(&self, project_id: &ProjectId) -> Result<Vec<TeamMember>> {
        let project = self
            .store
            .get_project(project_id)?
            .with_context(|| format!("Project {} not found", project_id))?;
        let owner = self
            .store
            .get_user(&project.owner_id)?
            .with_context(|| format!("Owner {} not found", project.owner_id))?;
        Ok(members_with_owner(&project, &owner))
    }

    /// Whether a user exists and has a mailbox address
    pub fn validate_user(&self, user_id: &UserId) -> bool {
        match self.store.get_user(user_id) {
            Ok(Some(user)) => user.normalized_email().is_some(),
            Ok(None) => false,
            Err(e) => {
                log::error!("[FILTER] Failed to load user {}: {:#}", user_id, e);
                false
            }
        }
    }
}

/// A project's roster followed by the owner's implicit entry
fn members_with_owner(project: &Project, owner: &User) -> Vec<TeamMember> {
    let mut members = project.roster.clone();
    if let Some(email) = &owner.email
        && !email.trim().is_empty()
    {
        members.push(TeamMember::implicit_owner(owner, email, project.id.clone()));
    }
    members
}
