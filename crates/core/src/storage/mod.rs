//! Relational store (C2, §4.2).
//!
//! Generalizes the teacher's `storage/sqlite.rs` (`SqliteMailStore`,
//! built around one fixed Gmail-shaped `messages`/`threads` schema) to
//! the full entity set in [`crate::models`], with full-text search
//! carried by SQLite's own `fts5` virtual table in place of the
//! teacher's `tantivy` index.

mod sqlite;

pub use sqlite::RelationalStore;

use crate::models::RecipientType;

/// One recipient edge to attach while upserting a message.
#[derive(Debug, Clone)]
pub struct NewRecipient {
    pub recipient_type: RecipientType,
    pub email: String,
    pub display_name: Option<String>,
}

/// One attachment row to attach while upserting a message. The blob
/// itself is written to the [`crate::blob::BlobStore`] by the caller;
/// this only records the resulting address.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub content_hash: Option<String>,
    pub storage_path: Option<String>,
}

/// One label to ensure exists and attach to a message.
#[derive(Debug, Clone)]
pub struct NewLabel {
    pub name: String,
    pub provider_label_id: Option<String>,
}

/// Everything needed to upsert one message and its related rows in a
/// single transaction (§4.2, §4.6).
///
/// `subject`, `snippet`, `size_estimate`, `has_attachments` and
/// `sent_at`/`received_at` are all `None`-able: a metadata-only
/// re-ingest (e.g. a label-only resync that never re-fetched the
/// body) passes `None` for whatever it doesn't know, and the store
/// keeps the previously-stored value for that column rather than
/// overwriting it with a blank (§4.2).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub source_id: i64,
    pub source_message_id: String,
    pub source_conversation_id: String,
    pub conversation_title: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
    pub size_estimate: Option<i64>,
    pub has_attachments: Option<bool>,
    pub recipients: Vec<NewRecipient>,
    pub labels: Vec<NewLabel>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub raw_bytes: Option<Vec<u8>>,
    pub attachments: Vec<NewAttachment>,
}

/// Progress callback shape for long-running backfills (§4.2, §6):
/// `(done, total)`, tolerant of being called out of order or more than
/// once for the same `done` value.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

/// One recipient edge as read back for detail views and cache export.
#[derive(Debug, Clone)]
pub struct RecipientRow {
    pub participant_id: i64,
    pub recipient_type: RecipientType,
    pub email: String,
    pub display_name: Option<String>,
}

/// One exported `messages` row for the analytics cache (C8, §4.8):
/// always has `sent_at`, since rows without it are excluded from the
/// cache by construction.
#[derive(Debug, Clone)]
pub struct MessageExportRow {
    pub id: i64,
    pub source_id: i64,
    pub conversation_id: i64,
    pub subject: String,
    pub snippet: String,
    pub sent_at: chrono::DateTime<chrono::Utc>,
    pub received_at: Option<chrono::DateTime<chrono::Utc>>,
    pub size_estimate: i64,
    pub has_attachments: bool,
    pub deleted_from_source_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl MessageExportRow {
    pub fn year(&self) -> i32 {
        use chrono::Datelike;
        self.sent_at.year()
    }
}

/// One `message_recipients` junction row for cache export.
#[derive(Debug, Clone)]
pub struct RecipientExportRow {
    pub message_id: i64,
    pub participant_id: i64,
    pub recipient_type: String,
    pub display_name_snapshot: Option<String>,
}

/// One `message_labels` junction row for cache export.
#[derive(Debug, Clone)]
pub struct LabelMembershipExportRow {
    pub message_id: i64,
    pub label_id: i64,
}

/// Everything the query engine needs to render one message in full
/// (§4.9 `GetMessage`).
#[derive(Debug, Clone)]
pub struct MessageDetail {
    pub message: crate::models::Message,
    pub recipients: Vec<RecipientRow>,
    pub labels: Vec<crate::models::Label>,
    pub attachments: Vec<crate::models::Attachment>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

/// Structured predicates extracted from a Gmail-like query string
/// (§4.9), plus whatever free words remain for full-text search.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Vec<String>,
    pub label: Vec<String>,
    pub has_attachment: Option<bool>,
    pub before: Option<chrono::DateTime<chrono::Utc>>,
    pub after: Option<chrono::DateTime<chrono::Utc>>,
    pub larger: Option<i64>,
    pub smaller: Option<i64>,
    pub free_text: Vec<String>,
}

/// One row of an [`crate::query::AggregateView`] result (§4.9).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregateRow {
    pub key: String,
    pub count: i64,
    pub total_size: i64,
    pub attachment_size: i64,
}

/// Catalog-wide counters (§4.9 `GetTotalStats`).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TotalStats {
    pub sources: i64,
    pub messages: i64,
    pub attachments: i64,
    pub total_size: i64,
}
