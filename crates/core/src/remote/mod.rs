//! Remote mail client capability set (C4, §4.4).
//!
//! Generalizes the teacher's Gmail-only `gmail::GmailClient` into a
//! trait the sync engine drives without knowing which provider is
//! behind it. [`gmail`] implements it against the Gmail REST API, the
//! way the teacher's `gmail/client.rs` does; a second provider only
//! needs a second implementation of [`RemoteClient`].

pub mod gmail;
pub mod imap;

use crate::error::Result;

/// Supplies a valid bearer token on demand. Replaces the teacher's
/// `GmailAuth`, whose `get_access_token` ran an interactive browser
/// OAuth flow; here token acquisition/refresh is the caller's problem
/// (config-driven, headless), and this trait is the narrow seam the
/// remote client needs.
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Result<String>;
}

#[derive(Debug, Clone, Default)]
pub struct RemoteMessageList {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
    pub result_size_estimate: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteHistoryPage {
    pub added_message_ids: Vec<String>,
    pub deleted_message_ids: Vec<String>,
    pub next_page_token: Option<String>,
    /// The provider's latest cursor value, present on the final page.
    pub history_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteProfile {
    pub email_address: String,
    pub history_id: Option<String>,
    pub messages_total: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RemoteLabel {
    pub id: String,
    pub name: String,
}

/// Capability set a sync engine needs from any remote mail provider
/// (§4.4). Every method is expected to go through the caller's
/// [`crate::ratelimit::Throttle`] internally.
pub trait RemoteClient: Send + Sync {
    /// Lists message ids, optionally narrowed by a provider-specific
    /// query string (Gmail search syntax for [`gmail::GmailClient`];
    /// ignored by providers with no equivalent, such as [`imap::ImapClient`]).
    fn list_message_ids(&self, query: Option<&str>, page_token: Option<&str>) -> Result<RemoteMessageList>;

    /// Full RFC 5322 bytes for one message, undecoded.
    fn get_raw_message(&self, id: &str) -> Result<Vec<u8>>;

    /// Provider label/folder ids currently applied to one message.
    fn get_message_label_ids(&self, id: &str) -> Result<Vec<String>>;

    fn list_labels(&self) -> Result<Vec<RemoteLabel>>;

    fn get_profile(&self) -> Result<RemoteProfile>;

    /// Incremental changes since `cursor`. Implementations MUST return
    /// [`crate::error::MsgVaultError::HistoryExpired`] when the provider
    /// reports the cursor is too old to resume from (§4.4, §4.6).
    fn list_history_since(
        &self,
        cursor: &str,
        page_token: Option<&str>,
    ) -> Result<RemoteHistoryPage>;

    fn batch_delete(&self, ids: &[String]) -> Result<()>;
    fn trash(&self, id: &str) -> Result<()>;
    fn untrash(&self, id: &str) -> Result<()>;
}
