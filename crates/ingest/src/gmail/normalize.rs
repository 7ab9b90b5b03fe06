//! Gmail API response normalization
//!
//! Converts Gmail API responses to canonical messages.

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::{DateTime, TimeZone, Utc};

use super::api::{GmailMessage, MessagePart, MessagePayload};
use crate::models::{AttachmentMeta, CanonicalMessage, EmailAddress, MessageId};

/// Normalize a Gmail API message to a canonical message
pub fn normalize_message(gmail_msg: GmailMessage) -> Result<CanonicalMessage> {
    let id = MessageId::new(&gmail_msg.id);

    let payload = gmail_msg
        .payload
        .as_ref()
        .context("Message has no payload")?;

    let from = extract_header(payload, "From")
        .map(|s| EmailAddress::parse(&s))
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown.com"));

    let to = extract_header(payload, "To")
        .map(|s| parse_address_list(&s))
        .unwrap_or_default();

    let cc = extract_header(payload, "Cc")
        .map(|s| parse_address_list(&s))
        .unwrap_or_default();

    let subject = extract_header(payload, "Subject").unwrap_or_default();

    let sent_at = gmail_msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .or_else(|| extract_header(payload, "Date").and_then(|d| parse_date_header(&d)))
        .unwrap_or_else(Utc::now);

    let body_text = extract_body(payload, "text/plain");
    let body_html = extract_body(payload, "text/html");

    let mut attachments = Vec::new();
    if let Some(parts) = &payload.parts {
        collect_attachments(parts, &mut attachments);
    }

    Ok(CanonicalMessage::builder(id)
        .thread_id(gmail_msg.thread_id)
        .from(from)
        .to(to)
        .cc(cc)
        .subject(subject)
        .sent_at(sent_at)
        .body_text(body_text)
        .body_html(body_html)
        .attachments(attachments)
        .label_ids(gmail_msg.label_ids.unwrap_or_default())
        .snippet(decode_html_entities(&gmail_msg.snippet))
        .build())
}

/// Extract a header value by name
fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload.headers.as_ref()?.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

/// Parse a comma-separated list of email addresses
///
/// Commas inside quoted display names do not split.
fn parse_address_list(s: &str) -> Vec<EmailAddress> {
    let mut addresses = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                if !current.trim().is_empty() {
                    addresses.push(EmailAddress::parse(current.trim()));
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }

    if !current.trim().is_empty() {
        addresses.push(EmailAddress::parse(current.trim()));
    }

    addresses
}

fn parse_date_header(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn is_mime(mime_type: Option<&String>, wanted: &str) -> bool {
    mime_type.is_some_and(|m| m.starts_with(wanted))
}

fn is_attachment(filename: Option<&String>) -> bool {
    filename.is_some_and(|f| !f.is_empty())
}

/// Extract the first body leaf of the given MIME type
fn extract_body(payload: &MessagePayload, wanted: &str) -> Option<String> {
    // Single-part message
    if is_mime(payload.mime_type.as_ref(), wanted)
        && !is_attachment(payload.filename.as_ref())
        && let Some(body) = &payload.body
        && let Some(data) = &body.data
    {
        return decode_base64_body(data);
    }

    payload
        .parts
        .as_ref()
        .and_then(|parts| find_body_in_parts(parts, wanted))
}

/// Recursively search message parts for the first non-attachment leaf of
/// the given MIME type
fn find_body_in_parts(parts: &[MessagePart], wanted: &str) -> Option<String> {
    for part in parts {
        if is_mime(part.mime_type.as_ref(), wanted)
            && !is_attachment(part.filename.as_ref())
            && let Some(body) = &part.body
            && let Some(data) = &body.data
            && let Some(text) = decode_base64_body(data)
        {
            return Some(text);
        }

        if let Some(nested) = &part.parts
            && let Some(text) = find_body_in_parts(nested, wanted)
        {
            return Some(text);
        }
    }

    None
}

/// Collect attachment metadata from the part tree, depth first
fn collect_attachments(parts: &[MessagePart], out: &mut Vec<AttachmentMeta>) {
    for part in parts {
        if let Some(filename) = part.filename.as_ref().filter(|f| !f.is_empty()) {
            let body = part.body.as_ref();
            out.push(AttachmentMeta {
                filename: filename.clone(),
                mime_type: part
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size: body.and_then(|b| b.size).unwrap_or(0),
                attachment_id: body.and_then(|b| b.attachment_id.clone()),
                data: body
                    .and_then(|b| b.data.as_deref())
                    .and_then(decode_base64_bytes),
            });
        }

        if let Some(nested) = &part.parts {
            collect_attachments(nested, out);
        }
    }
}

/// Decode base64-encoded data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple decoders.
fn decode_base64_bytes(data: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    decoders.iter().find_map(|decoder| decoder.decode(data).ok())
}

fn decode_base64_body(data: &str) -> Option<String> {
    decode_base64_bytes(data).and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Decode HTML entities in snippet text
fn decode_html_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}
