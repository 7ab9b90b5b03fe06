//! Message models: the fetched canonical message and its ingested record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProjectId, UserId};

/// Unique identifier for a message (provider message ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize an address for identity comparison.
///
/// Accepts either a bare address or a display form like
/// `"Jane Roe <Jane@Example.com>"`, and returns the trimmed, lower-cased
/// address part.
pub fn normalize_address(raw: &str) -> String {
    EmailAddress::parse(raw).email.trim().to_lowercase()
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// The normalized (trimmed, lower-cased) address
    pub fn normalized(&self) -> String {
        self.email.trim().to_lowercase()
    }

    /// Format the email address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Attachment metadata collected while walking the MIME part tree.
///
/// Bytes are only present when the provider embedded them inline in the
/// message payload; large attachments are fetched separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    /// Size declared by the provider, in bytes
    pub size: u64,
    /// Provider handle for downloading the attachment body
    pub attachment_id: Option<String>,
    #[serde(skip)]
    pub data: Option<Vec<u8>>,
}

/// Provider-agnostic message produced by the fetcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub id: MessageId,
    pub thread_id: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub label_ids: Vec<String>,
    pub snippet: String,
}

impl CanonicalMessage {
    /// Create a new message builder
    pub fn builder(id: MessageId) -> CanonicalMessageBuilder {
        CanonicalMessageBuilder::new(id)
    }

    /// All recipient addresses (To followed by Cc)
    pub fn recipient_addresses(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .map(|a| a.email.clone())
            .collect()
    }
}

/// Builder for creating CanonicalMessage instances
pub struct CanonicalMessageBuilder {
    id: MessageId,
    thread_id: String,
    from: Option<EmailAddress>,
    to: Vec<EmailAddress>,
    cc: Vec<EmailAddress>,
    subject: String,
    sent_at: Option<DateTime<Utc>>,
    body_text: Option<String>,
    body_html: Option<String>,
    attachments: Vec<AttachmentMeta>,
    label_ids: Vec<String>,
    snippet: String,
}

impl CanonicalMessageBuilder {
    fn new(id: MessageId) -> Self {
        Self {
            thread_id: id.0.clone(),
            id,
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            subject: String::new(),
            sent_at: None,
            body_text: None,
            body_html: None,
            attachments: Vec::new(),
            label_ids: Vec::new(),
            snippet: String::new(),
        }
    }

    pub fn thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    pub fn from(mut self, from: EmailAddress) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.to = to;
        self
    }

    pub fn cc(mut self, cc: Vec<EmailAddress>) -> Self {
        self.cc = cc;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }

    pub fn body_text(mut self, body_text: Option<String>) -> Self {
        self.body_text = body_text;
        self
    }

    pub fn body_html(mut self, body_html: Option<String>) -> Self {
        self.body_html = body_html;
        self
    }

    pub fn attachments(mut self, attachments: Vec<AttachmentMeta>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn label_ids(mut self, label_ids: Vec<String>) -> Self {
        self.label_ids = label_ids;
        self
    }

    pub fn snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn build(self) -> CanonicalMessage {
        CanonicalMessage {
            id: self.id,
            thread_id: self.thread_id,
            from: self
                .from
                .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com")),
            to: self.to,
            cc: self.cc,
            subject: self.subject,
            sent_at: self.sent_at.unwrap_or_else(Utc::now),
            body_text: self.body_text,
            body_html: self.body_html,
            attachments: self.attachments,
            label_ids: self.label_ids,
            snippet: self.snippet,
        }
    }
}

/// Progress of one processing stage for an ingested message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Completed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "completed" => Some(ProcessingStatus::Completed),
            _ => None,
        }
    }
}

/// The three independently tracked stages of an ingested message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStatuses {
    pub ingestion: ProcessingStatus,
    pub analysis: ProcessingStatus,
    pub assignment: ProcessingStatus,
}

impl MessageStatuses {
    /// Statuses of a freshly stored message
    pub fn ingested() -> Self {
        Self {
            ingestion: ProcessingStatus::Completed,
            analysis: ProcessingStatus::Pending,
            assignment: ProcessingStatus::Pending,
        }
    }
}

/// Provider-specific metadata kept alongside an ingested message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestMetadata {
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: String,
    /// Cursor of the notification that ingested this message
    pub history_id: Option<String>,
}

/// Persisted record of a message that passed the filter and was stored.
///
/// Created once; only `statuses` and `metadata` change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedMessage {
    pub id: MessageId,
    pub project_id: ProjectId,
    pub owner_id: UserId,
    pub subject: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub sent_at: DateTime<Utc>,
    pub content_path: String,
    pub attachment_paths: Vec<String>,
    pub statuses: MessageStatuses,
    pub metadata: IngestMetadata,
    pub ingested_at: DateTime<Utc>,
}
