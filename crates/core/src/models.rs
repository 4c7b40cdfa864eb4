//! Domain model for the sync-and-storage engine.
//!
//! These are semantic types (§3 of the spec); the relational store
//! ([`crate::storage`]) is one realization of them, the columnar cache
//! ([`crate::cache`]) another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A configured account (Gmail, IMAP, mbox import, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub source_type: SourceType,
    pub identifier: String,
    pub display_name: Option<String>,
    pub sync_cursor: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Tag distinguishing the remote or imported origin of a [`Source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Gmail,
    Imap,
    Mbox,
    AppleMail,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Gmail => "gmail",
            SourceType::Imap => "imap",
            SourceType::Mbox => "mbox",
            SourceType::AppleMail => "apple-mail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gmail" => Some(SourceType::Gmail),
            "imap" => Some(SourceType::Imap),
            "mbox" => Some(SourceType::Mbox),
            "apple-mail" => Some(SourceType::AppleMail),
            _ => None,
        }
    }
}

/// A provider-defined thread, created lazily on first referencing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub source_id: i64,
    pub source_conversation_id: String,
    pub title: Option<String>,
}

/// A normalized email address, globally unique on `email_address`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: i64,
    pub email_address: String,
    pub domain: String,
    pub display_name: Option<String>,
}

impl Participant {
    /// Split an address into `(local, domain)`; domain is lowercased.
    pub fn domain_of(email_address: &str) -> String {
        email_address
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// One mail message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub source_id: i64,
    pub source_message_id: String,
    pub conversation_id: i64,
    pub subject: String,
    pub snippet: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub size_estimate: i64,
    pub has_attachments: bool,
    pub deleted_from_source_at: Option<DateTime<Utc>>,
}

/// Optional `(body_text, body_html)`, 1:1 with [`Message`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    pub body_text: Option<String>,
    pub body_html: Option<String>,
}

/// Optional zlib-compressed original wire bytes, 1:1 with [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRaw {
    pub raw_bytes: Vec<u8>,
    pub compression_tag: CompressionTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionTag {
    Zlib,
    None,
}

/// Edge `(message, participant, recipient_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub message_id: i64,
    pub participant_id: i64,
    pub recipient_type: RecipientType,
    pub display_name_snapshot: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    From,
    To,
    Cc,
    Bcc,
}

impl RecipientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientType::From => "from",
            RecipientType::To => "to",
            RecipientType::Cc => "cc",
            RecipientType::Bcc => "bcc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "from" => Some(RecipientType::From),
            "to" => Some(RecipientType::To),
            "cc" => Some(RecipientType::Cc),
            "bcc" => Some(RecipientType::Bcc),
            _ => None,
        }
    }
}

/// A mailbox label/folder, unique per source on `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: i64,
    pub source_id: i64,
    pub name: String,
    pub provider_label_id: Option<String>,
}

/// An attachment row; multiple rows MAY share one blob via `content_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub message_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub content_hash: Option<String>,
    pub storage_path: Option<String>,
}

/// A sync run: at most one active run per source (single-flight).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub source_id: i64,
    pub kind: SyncRunKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SyncRunStatus,
    pub cursor_before: Option<String>,
    pub cursor_current: Option<String>,
    pub messages_found: i64,
    pub messages_added: i64,
    pub messages_skipped: i64,
    pub bytes_transferred: i64,
    pub errors: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncRunKind {
    Full,
    Incremental,
    ImportMbox,
    ImportEmlx,
}

impl SyncRunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunKind::Full => "full",
            SyncRunKind::Incremental => "incremental",
            SyncRunKind::ImportMbox => "import-mbox",
            SyncRunKind::ImportEmlx => "import-emlx",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(SyncRunKind::Full),
            "incremental" => Some(SyncRunKind::Incremental),
            "import-mbox" => Some(SyncRunKind::ImportMbox),
            "import-emlx" => Some(SyncRunKind::ImportEmlx),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    Active,
    Completed,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Active => "active",
            SyncRunStatus::Completed => "completed",
            SyncRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SyncRunStatus::Active),
            "completed" => Some(SyncRunStatus::Completed),
            "failed" => Some(SyncRunStatus::Failed),
            _ => None,
        }
    }
}

/// Summary returned from a full or incremental sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub duration_ms: u64,
    pub found: u64,
    pub added: u64,
    pub skipped: u64,
    pub bytes: u64,
    pub errors: u64,
    pub was_resumed: bool,
}

/// A file-backed staged deletion manifest (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionManifest {
    pub id: String,
    pub source_id: i64,
    pub status: ManifestStatus,
    pub provider_ids: Vec<String>,
    pub description: String,
    pub filters: serde_json::Value,
    pub execution: Option<ExecutionRecord>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ManifestStatus {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ManifestStatus::Pending => "pending",
            ManifestStatus::InProgress => "in_progress",
            ManifestStatus::Completed => "completed",
            ManifestStatus::Failed => "failed",
            ManifestStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMethod {
    BatchPermanent,
    Trash,
}

/// The sticky execution record embedded in an in-progress manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub method: ExecutionMethod,
    pub done_ids: Vec<String>,
    pub failed_ids: Vec<String>,
}

impl ExecutionRecord {
    pub fn new(method: ExecutionMethod) -> Self {
        Self {
            method,
            done_ids: Vec::new(),
            failed_ids: Vec::new(),
        }
    }
}

/// Persisted alongside the columnar cache directory (§4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheState {
    pub last_message_id: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
}
