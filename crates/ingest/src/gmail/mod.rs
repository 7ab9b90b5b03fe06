//! Gmail API integration
//!
//! This module provides:
//! - OAuth2 code and refresh-token exchange
//! - Gmail API client for messages, history and profile
//! - Response normalization to canonical messages

mod auth;
mod client;
mod normalize;

pub use auth::GmailAuth;
pub use client::{
    GmailClient, GmailConnector, HistoryExpiredError, RateLimitedError, UnauthorizedError,
};
pub use normalize::normalize_message;

/// Gmail API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: Option<String>,
    }

    /// Full message from Gmail API
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        pub history_id: Option<String>,
        pub internal_date: Option<String>,
        pub payload: Option<MessagePayload>,
    }

    /// Message payload containing headers and body
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
    }

    /// Email header (name-value pair)
    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Message body (may be base64 encoded, or a handle to an attachment)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageBody {
        pub size: Option<u64>,
        pub data: Option<String>,
        pub attachment_id: Option<String>,
    }

    /// Message part (for multipart messages)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub part_id: Option<String>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    /// One page of the history (change feed) listing
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub history_id: Option<String>,
        pub next_page_token: Option<String>,
    }

    impl HistoryResponse {
        /// IDs of added messages, in feed order, without repeats
        pub fn added_message_ids(&self) -> Vec<String> {
            let mut seen = std::collections::HashSet::new();
            self.history
                .iter()
                .flatten()
                .flat_map(|record| record.messages_added.iter().flatten())
                .map(|added| added.message.id.clone())
                .filter(|id| seen.insert(id.clone()))
                .collect()
        }
    }

    /// A single change in the history feed
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        pub id: String,
        pub messages_added: Option<Vec<HistoryMessageAdded>>,
    }

    /// A message-added change
    #[derive(Debug, Clone, Deserialize)]
    pub struct HistoryMessageAdded {
        pub message: MessageRef,
    }

    /// Mailbox profile (used for connection checks)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProfileResponse {
        pub email_address: String,
        pub messages_total: Option<u64>,
        pub history_id: Option<String>,
    }

}
