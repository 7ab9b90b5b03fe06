//! Inbound change notifications and subscription verification
//!
//! Notifications arrive as push envelopes whose `data` field carries a
//! base64-encoded JSON document naming the mailbox and its new history id.

use base64::prelude::*;
use serde::Deserialize;

use crate::error::{IngestError, IngestResult};
use crate::models::{HistoryCursor, normalize_address};

/// Push envelope as delivered by the subscription
#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: Option<PushMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    data: Option<String>,
    #[serde(alias = "message_id")]
    message_id: Option<String>,
    #[serde(alias = "publish_time")]
    publish_time: Option<String>,
}

/// Decoded `data` document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailboxChange {
    email_address: Option<String>,
    history_id: Option<serde_json::Value>,
}

/// A validated change notification
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    /// Normalized mailbox address
    pub email_address: String,
    pub history_id: HistoryCursor,
    /// Delivery id; redeliveries repeat it
    pub delivery_id: Option<String>,
    pub publish_time: Option<String>,
}

fn decode_data(data: &str) -> IngestResult<Vec<u8>> {
    let data = data.trim();
    [&BASE64_STANDARD, &BASE64_URL_SAFE, &BASE64_URL_SAFE_NO_PAD, &BASE64_STANDARD_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(data).ok())
        .ok_or_else(|| IngestError::validation("message.data is not valid base64"))
}

fn history_cursor(value: serde_json::Value) -> IngestResult<HistoryCursor> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(|id| HistoryCursor::new(id.to_string()))
            .ok_or_else(|| IngestError::validation(format!("historyId {} is not a valid id", n))),
        serde_json::Value::String(s) if !s.trim().is_empty() => {
            Ok(HistoryCursor::new(s.trim()))
        }
        other => Err(IngestError::validation(format!(
            "historyId must be a number or non-empty string, got {}",
            other
        ))),
    }
}

/// Decode and validate a push envelope
///
/// Anything malformed is a validation error; nothing is read or written.
pub fn decode_notification(body: &[u8]) -> IngestResult<ChangeNotification> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| IngestError::validation(format!("envelope is not valid JSON: {}", e)))?;

    let message = envelope
        .message
        .ok_or_else(|| IngestError::validation("envelope has no message"))?;
    let data = message
        .data
        .ok_or_else(|| IngestError::validation("message has no data"))?;

    let decoded = decode_data(&data)?;
    let change: MailboxChange = serde_json::from_slice(&decoded)
        .map_err(|e| IngestError::validation(format!("message.data is not valid JSON: {}", e)))?;

    let email_address = change
        .email_address
        .map(|e| normalize_address(&e))
        .filter(|e| e.contains('@'))
        .ok_or_else(|| IngestError::validation("emailAddress is missing or invalid"))?;
    let history_id = change
        .history_id
        .ok_or_else(|| IngestError::validation("historyId is missing"))
        .and_then(history_cursor)?;

    Ok(ChangeNotification {
        email_address,
        history_id,
        delivery_id: message.message_id,
        publish_time: message.publish_time,
    })
}

/// Answer a subscription verification request
///
/// `query` is the raw query string. Returns the challenge to echo back. When
/// `expected_token` is configured the request must carry the same `token`.
pub fn verification_response(query: &str, expected_token: Option<&str>) -> IngestResult<String> {
    let mut challenge = None;
    let mut token = None;
    for (key, value) in url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
        match key.as_ref() {
            "challenge" | "hub.challenge" => challenge = Some(value.into_owned()),
            "token" | "hub.verify_token" => token = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(expected) = expected_token
        && token.as_deref() != Some(expected)
    {
        return Err(IngestError::auth("verification token mismatch"));
    }

    challenge
        .filter(|c| !c.is_empty())
        .ok_or_else(|| IngestError::validation("verification request has no challenge"))
}
