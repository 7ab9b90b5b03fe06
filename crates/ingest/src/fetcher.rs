//! Message fetching on top of a mailbox API
//!
//! [`MailboxApi`] is the seam between the pipeline and the provider: the
//! Gmail client implements it for production and tests script it. The
//! [`MessageFetcher`] adds the fail-soft single fetch and the chunked,
//! rate-limited batch fetch.

use anyhow::Result;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use crate::gmail::api::{GmailMessage, HistoryResponse, ProfileResponse};
use crate::gmail::normalize_message;
use crate::models::{CanonicalMessage, HistoryCursor, MessageId, TokenSet};

/// Provider operations needed by the pipeline
pub trait MailboxApi: Send + Sync {
    /// Get full message details by ID
    fn get_message(&self, id: &MessageId) -> Result<GmailMessage>;

    /// List one page of message-added history since `start`
    fn list_history(
        &self,
        start: &HistoryCursor,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse>;

    /// Mailbox profile
    fn get_profile(&self) -> Result<ProfileResponse>;

    /// Refresh the access token if it is about to expire, returning the new
    /// token set when a refresh happened
    fn refresh_if_needed(&self) -> Result<Option<TokenSet>>;

    /// Token set the client rotated to since the last call, if any
    fn take_rotated_tokens(&self) -> Option<TokenSet>;

    /// List all history pages since `start`
    ///
    /// Automatically handles pagination to fetch all history records.
    fn list_history_all(&self, start: &HistoryCursor) -> Result<HistoryResponse> {
        let mut all_records = Vec::new();
        let mut final_history_id = None;
        let mut page_token: Option<String> = None;

        loop {
            let response = self.list_history(start, page_token.as_deref())?;

            if let Some(records) = response.history {
                all_records.extend(records);
            }

            if response.history_id.is_some() {
                final_history_id = response.history_id;
            }

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(HistoryResponse {
            history_id: final_history_id,
            history: if all_records.is_empty() {
                None
            } else {
                Some(all_records)
            },
            next_page_token: None,
        })
    }
}

/// Creates mailbox clients for a grant's token set
pub trait MailboxConnector: Send + Sync {
    fn connect(&self, tokens: TokenSet) -> Result<Arc<dyn MailboxApi>>;
}

/// Fetches and normalizes messages, degrading instead of failing
pub struct MessageFetcher {
    mailbox: Arc<dyn MailboxApi>,
    batch_delay: Duration,
}

impl MessageFetcher {
    pub fn new(mailbox: Arc<dyn MailboxApi>, batch_delay: Duration) -> Self {
        Self {
            mailbox,
            batch_delay,
        }
    }

    /// Fetch and normalize one message
    pub fn try_fetch_one(&self, id: &MessageId) -> Result<CanonicalMessage> {
        let raw = self.mailbox.get_message(id)?;
        normalize_message(raw)
    }

    /// Fetch one message; failures are logged and yield `None`
    pub fn fetch_one(&self, id: &MessageId) -> Option<CanonicalMessage> {
        match self.try_fetch_one(id) {
            Ok(message) => Some(message),
            Err(e) => {
                log::warn!("[FETCH] Failed to fetch message {}: {:#}", id, e);
                None
            }
        }
    }

    /// Fetch many messages in fixed-size chunks
    ///
    /// Members of a chunk are fetched concurrently; chunks are separated by
    /// the configured delay. The result has one slot per input id, in input
    /// order, with `None` where the fetch failed.
    pub fn fetch_batch(
        &self,
        ids: &[MessageId],
        batch_size: usize,
    ) -> Vec<Option<CanonicalMessage>> {
        let batch_size = batch_size.max(1);
        let mut results = Vec::with_capacity(ids.len());

        for (index, chunk) in ids.chunks(batch_size).enumerate() {
            if index > 0 && !self.batch_delay.is_zero() {
                std::thread::sleep(self.batch_delay);
            }

            let fetched: Vec<Option<CanonicalMessage>> =
                chunk.par_iter().map(|id| self.fetch_one(id)).collect();
            results.extend(fetched);
        }

        log::debug!(
            "[FETCH] Batch complete: {}/{} fetched",
            results.iter().filter(|r| r.is_some()).count(),
            ids.len()
        );
        results
    }

    /// Whether the mailbox answers with the current credentials
    pub fn test_connection(&self) -> bool {
        match self.mailbox.get_profile() {
            Ok(profile) => {
                log::info!("[FETCH] Connected to mailbox {}", profile.email_address);
                true
            }
            Err(e) => {
                log::warn!("[FETCH] Connection test failed: {:#}", e);
                false
            }
        }
    }

    /// Refresh credentials if they are about to expire
    pub fn refresh_token_if_needed(&self) -> Option<TokenSet> {
        match self.mailbox.refresh_if_needed() {
            Ok(tokens) => tokens,
            Err(e) => {
                log::warn!("[FETCH] Token refresh failed: {:#}", e);
                None
            }
        }
    }

    pub fn mailbox(&self) -> &Arc<dyn MailboxApi> {
        &self.mailbox
    }
}
