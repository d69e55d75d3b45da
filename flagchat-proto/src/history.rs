//! History endpoint records.
//!
//! The history endpoint returns a JSON array of [`HistoryRecord`]s, oldest
//! first. `null` is a valid empty page. A record that does not match the
//! schema is skipped rather than failing the whole page, so a single bad row
//! on the server does not hide the rest of the conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::FrameError;
use crate::ids::UserId;

/// One stored message as returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Server-assigned message id.
    pub id: u64,
    /// Author of the message.
    pub from: UserId,
    /// Author display name at send time.
    #[serde(default)]
    pub user_name: Option<String>,
    /// Author avatar URL at send time.
    #[serde(default)]
    pub user_avatar: Option<String>,
    /// Plain text body.
    pub content: String,
    /// Authoritative server timestamp.
    pub created_at: DateTime<Utc>,
}

/// A decoded history page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    /// Records that matched the schema, in server order.
    pub records: Vec<HistoryRecord>,
    /// Number of array entries that were skipped as malformed.
    pub skipped: usize,
}

/// Decodes a history response body.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if the body is not JSON, or
/// [`FrameError::Invalid`] if it is JSON but neither an array nor `null`.
pub fn decode_page(body: &str) -> Result<HistoryPage, FrameError> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    let items = match value {
        serde_json::Value::Null => return Ok(HistoryPage::default()),
        serde_json::Value::Array(items) => items,
        _ => return Err(FrameError::Invalid("history body is not an array")),
    };

    let mut page = HistoryPage::default();
    for item in items {
        match serde_json::from_value::<HistoryRecord>(item) {
            Ok(record) if !record.from.is_broadcast() && !record.content.is_empty() => {
                page.records.push(record);
            }
            _ => page.skipped += 1,
        }
    }
    Ok(page)
}
