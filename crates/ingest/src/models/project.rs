//! Project, roster and user models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::normalize_address;

/// Identifier of a tracked construction project
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a user (project owner)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user whose mailbox may be connected to their projects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Mailbox identity; `None` until the user has confirmed an address
    pub email: Option<String>,
    pub name: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            email: Some(email.into()),
            name: None,
        }
    }

    /// Normalized mailbox address, if any
    pub fn normalized_email(&self) -> Option<String> {
        self.email
            .as_deref()
            .map(normalize_address)
            .filter(|e| !e.is_empty())
    }
}

/// Lifecycle status of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Planning,
    Active,
    OnHold,
    Completed,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Planning => "PLANNING",
            ProjectStatus::Active => "ACTIVE",
            ProjectStatus::OnHold => "ON_HOLD",
            ProjectStatus::Completed => "COMPLETED",
            ProjectStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PLANNING" => Some(ProjectStatus::Planning),
            "ACTIVE" => Some(ProjectStatus::Active),
            "ON_HOLD" => Some(ProjectStatus::OnHold),
            "COMPLETED" => Some(ProjectStatus::Completed),
            "CANCELLED" => Some(ProjectStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether mail for a project in this status is still collected
    pub fn accepts_mail(&self) -> bool {
        matches!(self, ProjectStatus::Active | ProjectStatus::OnHold)
    }
}

/// Role of a roster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Owner,
    Contractor,
    Subcontractor,
    Architect,
    Designer,
    Inspector,
    Supplier,
    Other,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "OWNER",
            MemberRole::Contractor => "CONTRACTOR",
            MemberRole::Subcontractor => "SUBCONTRACTOR",
            MemberRole::Architect => "ARCHITECT",
            MemberRole::Designer => "DESIGNER",
            MemberRole::Inspector => "INSPECTOR",
            MemberRole::Supplier => "SUPPLIER",
            MemberRole::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "OWNER" => MemberRole::Owner,
            "CONTRACTOR" => MemberRole::Contractor,
            "SUBCONTRACTOR" => MemberRole::Subcontractor,
            "ARCHITECT" => MemberRole::Architect,
            "DESIGNER" => MemberRole::Designer,
            "INSPECTOR" => MemberRole::Inspector,
            "SUPPLIER" => MemberRole::Supplier,
            _ => MemberRole::Other,
        }
    }
}

/// A roster entry: an email identity the owner tracks for a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: MemberRole,
    pub project_id: ProjectId,
}

impl TeamMember {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        role: MemberRole,
        project_id: ProjectId,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            role,
            project_id,
        }
    }

    /// The implicit roster entry for a project's owner.
    ///
    /// Owners are never stored on the roster; this is injected at query
    /// time. Its id is the owner's user id so the same owner across several
    /// projects collapses to a single member.
    pub fn implicit_owner(owner: &User, email: &str, project_id: ProjectId) -> Self {
        Self {
            id: owner.id.0.clone(),
            name: owner.name.clone().unwrap_or_else(|| "Project owner".to_string()),
            email: email.to_string(),
            role: MemberRole::Owner,
            project_id,
        }
    }
}

/// A project as passed between components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub owner_id: UserId,
    pub name: String,
    pub status: ProjectStatus,
    pub monitoring_enabled: bool,
    pub roster: Vec<TeamMember>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Create an active, monitored project with an empty roster
    pub fn new(id: impl Into<String>, owner_id: UserId, name: impl Into<String>) -> Self {
        Self {
            id: ProjectId::new(id),
            owner_id,
            name: name.into(),
            status: ProjectStatus::Active,
            monitoring_enabled: true,
            roster: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: ProjectStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitoring_enabled = enabled;
        self
    }

    /// Add a roster member to this project
    pub fn with_member(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        role: MemberRole,
    ) -> Self {
        let member = TeamMember::new(id, name, email, role, self.id.clone());
        self.roster.push(member);
        self
    }

    /// Whether the identity filter should consider this project
    pub fn qualifies_for_filtering(&self) -> bool {
        self.monitoring_enabled && self.status.accepts_mail()
    }
}
