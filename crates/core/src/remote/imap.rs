//! IMAP remote client (C4, §4.4).
//!
//! The teacher has no IMAP variant; this is new. Built on the
//! synchronous `imap` crate over `native-tls`, kept deliberately
//! synchronous (rather than `async-imap`) so it drops into the same
//! blocking-thread sync engine as [`super::gmail::GmailClient`] without
//! requiring a mixed async/sync runtime — the trade documented in
//! `DESIGN.md`.
//!
//! IMAP has no analogue of Gmail's history API, so incremental sync is
//! emulated with a `<UIDVALIDITY>:<last-seen-UID>` cursor: a mailbox's
//! UIDVALIDITY changing invalidates every previously recorded UID, which
//! is treated as an expired cursor (§4.6). IMAP also has no reliable way
//! to learn which messages were permanently removed since a given UID
//! without a full re-listing, so `list_history_since` never reports
//! deletions; callers relying on deletion detection should prefer the
//! Gmail variant or a periodic full resync.

use std::net::TcpStream;
use std::sync::Mutex;

use imap::Session;
use native_tls::TlsStream;

use super::{RemoteClient, RemoteHistoryPage, RemoteLabel, RemoteMessageList, RemoteProfile};
use crate::error::{MsgVaultError, Result};

const TRASH_FOLDER: &str = "Trash";
const INBOX: &str = "INBOX";

pub struct ImapClient {
    session: Mutex<Session<TlsStream<TcpStream>>>,
    email_address: String,
}

impl ImapClient {
    pub fn connect(host: &str, port: u16, email_address: &str, password: &str) -> Result<Self> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| MsgVaultError::Remote(format!("tls setup failed: {e}")))?;

        let client = imap::connect((host, port), host, &tls)
            .map_err(|e| MsgVaultError::Remote(format!("imap connect failed: {e}")))?;

        let mut session = client
            .login(email_address, password)
            .map_err(|(e, _)| MsgVaultError::Remote(format!("imap login failed: {e}")))?;

        session
            .select(INBOX)
            .map_err(|e| MsgVaultError::Remote(format!("imap select failed: {e}")))?;

        Ok(Self {
            session: Mutex::new(session),
            email_address: email_address.to_string(),
        })
    }

    fn uidvalidity(&self) -> Result<u32> {
        let mut session = self.session.lock().unwrap();
        let mailbox = session
            .select(INBOX)
            .map_err(|e| MsgVaultError::Remote(format!("imap select failed: {e}")))?;
        mailbox
            .uid_validity
            .ok_or_else(|| MsgVaultError::Remote("server did not report UIDVALIDITY".to_string()))
    }
}

impl RemoteClient for ImapClient {
    fn list_message_ids(&self, _query: Option<&str>, _page_token: Option<&str>) -> Result<RemoteMessageList> {
        let mut session = self.session.lock().unwrap();
        let uids = session
            .uid_search("ALL")
            .map_err(|e| MsgVaultError::Remote(format!("imap search failed: {e}")))?;
        let mut ids: Vec<u32> = uids.into_iter().collect();
        ids.sort_unstable();
        Ok(RemoteMessageList {
            result_size_estimate: Some(ids.len() as u32),
            ids: ids.into_iter().map(|uid| uid.to_string()).collect(),
            next_page_token: None,
        })
    }

    fn get_raw_message(&self, id: &str) -> Result<Vec<u8>> {
        let mut session = self.session.lock().unwrap();
        let fetches = session
            .uid_fetch(id, "RFC822")
            .map_err(|e| MsgVaultError::Remote(format!("imap fetch failed: {e}")))?;
        let fetch = fetches
            .iter()
            .next()
            .ok_or(MsgVaultError::NotFound)?;
        fetch
            .body()
            .map(|b| b.to_vec())
            .ok_or_else(|| MsgVaultError::MalformedMime("IMAP fetch returned no body".to_string()))
    }

    fn get_message_label_ids(&self, _id: &str) -> Result<Vec<String>> {
        // IMAP associates a message with exactly one folder at a time
        // (barring server-specific extensions); the selected mailbox
        // name is the only "label" available without another round trip.
        Ok(vec![INBOX.to_string()])
    }

    fn list_labels(&self) -> Result<Vec<RemoteLabel>> {
        let mut session = self.session.lock().unwrap();
        let folders = session
            .list(None, Some("*"))
            .map_err(|e| MsgVaultError::Remote(format!("imap list failed: {e}")))?;
        Ok(folders
            .iter()
            .map(|f| RemoteLabel {
                id: f.name().to_string(),
                name: f.name().to_string(),
            })
            .collect())
    }

    fn get_profile(&self) -> Result<RemoteProfile> {
        let uidvalidity = self.uidvalidity()?;
        let mut session = self.session.lock().unwrap();
        let mailbox = session
            .select(INBOX)
            .map_err(|e| MsgVaultError::Remote(format!("imap select failed: {e}")))?;
        Ok(RemoteProfile {
            email_address: self.email_address.clone(),
            history_id: Some(format!("{uidvalidity}:0")),
            messages_total: Some(mailbox.exists as u64),
        })
    }

    fn list_history_since(&self, cursor: &str, _page_token: Option<&str>) -> Result<RemoteHistoryPage> {
        let (validity_str, last_uid_str) = cursor
            .split_once(':')
            .ok_or_else(|| MsgVaultError::Remote(format!("malformed IMAP cursor: {cursor}")))?;
        let cursor_validity: u32 = validity_str
            .parse()
            .map_err(|_| MsgVaultError::Remote(format!("malformed IMAP cursor: {cursor}")))?;
        let last_uid: u32 = last_uid_str
            .parse()
            .map_err(|_| MsgVaultError::Remote(format!("malformed IMAP cursor: {cursor}")))?;

        let current_validity = self.uidvalidity()?;
        if current_validity != cursor_validity {
            return Err(MsgVaultError::HistoryExpired);
        }

        let mut session = self.session.lock().unwrap();
        let range = format!("{}:*", last_uid + 1);
        let uids = session
            .uid_search(&range)
            .map_err(|e| MsgVaultError::Remote(format!("imap search failed: {e}")))?;
        let mut ids: Vec<u32> = uids.into_iter().filter(|&uid| uid > last_uid).collect();
        ids.sort_unstable();
        let new_last_uid = ids.last().copied().unwrap_or(last_uid);

        Ok(RemoteHistoryPage {
            added_message_ids: ids.into_iter().map(|uid| uid.to_string()).collect(),
            deleted_message_ids: Vec::new(),
            next_page_token: None,
            history_id: Some(format!("{current_validity}:{new_last_uid}")),
        })
    }

    fn batch_delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut session = self.session.lock().unwrap();
        let uid_set = ids.join(",");
        session
            .uid_store(&uid_set, "+FLAGS.SILENT (\\Deleted)")
            .map_err(|e| MsgVaultError::Remote(format!("imap store failed: {e}")))?;
        session
            .expunge()
            .map_err(|e| MsgVaultError::Remote(format!("imap expunge failed: {e}")))?;
        Ok(())
    }

    fn trash(&self, id: &str) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        session
            .uid_copy(id, TRASH_FOLDER)
            .map_err(|e| MsgVaultError::Remote(format!("imap copy to trash failed: {e}")))?;
        session
            .uid_store(id, "+FLAGS.SILENT (\\Deleted)")
            .map_err(|e| MsgVaultError::Remote(format!("imap store failed: {e}")))?;
        session
            .expunge()
            .map_err(|e| MsgVaultError::Remote(format!("imap expunge failed: {e}")))?;
        Ok(())
    }

    fn untrash(&self, id: &str) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        session
            .select(TRASH_FOLDER)
            .map_err(|e| MsgVaultError::Remote(format!("imap select trash failed: {e}")))?;
        session
            .uid_copy(id, INBOX)
            .map_err(|e| MsgVaultError::Remote(format!("imap copy from trash failed: {e}")))?;
        session
            .uid_store(id, "+FLAGS.SILENT (\\Deleted)")
            .map_err(|e| MsgVaultError::Remote(format!("imap store failed: {e}")))?;
        session
            .expunge()
            .map_err(|e| MsgVaultError::Remote(format!("imap expunge failed: {e}")))?;
        session
            .select(INBOX)
            .map_err(|e| MsgVaultError::Remote(format!("imap select failed: {e}")))?;
        Ok(())
    }
}
