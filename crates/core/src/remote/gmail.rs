//! Gmail REST client (C4, §4.4).
//!
//! Generalizes the teacher's `gmail/client.rs::GmailClient`: same
//! `ureq`-over-HTTPS shape and bearer-token header, but routed through
//! a shared [`Throttle`] instead of the teacher's fixed 3-attempt
//! inline retry, fetching `format=raw` bytes for [`crate::mime`] to
//! parse instead of the teacher's pre-parsed JSON payload, and
//! authenticated via the [`TokenSource`] seam instead of an inline
//! interactive OAuth flow.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{RemoteClient, RemoteHistoryPage, RemoteLabel, RemoteMessageList, RemoteProfile, TokenSource};
use crate::error::{MsgVaultError, Result};
use crate::ratelimit::{ErrorClass, Throttle};

const BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

pub struct GmailClient {
    token: Arc<dyn TokenSource>,
    throttle: Throttle,
}

impl GmailClient {
    pub fn new(token: Arc<dyn TokenSource>, qps: f64) -> Self {
        Self {
            token,
            throttle: Throttle::new(qps),
        }
    }

    fn call_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let cancel = CancellationToken::new();
        self.throttle.retry.run(&cancel, || {
            self.throttle
                .limiter
                .acquire(&cancel)
                .map_err(|_| (ErrorClass::Cancelled, MsgVaultError::Cancelled, None))?;

            let token = self
                .token
                .access_token()
                .map_err(|e| (ErrorClass::Terminal, MsgVaultError::Remote(e.to_string()), None))?;

            match ureq::get(url)
                .header("Authorization", &format!("Bearer {token}"))
                .call()
            {
                Ok(mut response) => response.body_mut().read_json::<T>().map_err(|e| {
                    (ErrorClass::Terminal, MsgVaultError::Remote(format!("bad response body: {e}")), None)
                }),
                Err(ureq::Error::StatusCode(status)) => Err(gmail_status_err(status)),
                Err(e) => Err((ErrorClass::Retryable, MsgVaultError::Remote(e.to_string()), None)),
            }
        })
    }

    fn post_empty_body(&self, url: &str, body: serde_json::Value) -> Result<()> {
        let cancel = CancellationToken::new();
        self.throttle.retry.run(&cancel, || {
            self.throttle
                .limiter
                .acquire(&cancel)
                .map_err(|_| (ErrorClass::Cancelled, MsgVaultError::Cancelled, None))?;

            let token = self
                .token
                .access_token()
                .map_err(|e| (ErrorClass::Terminal, MsgVaultError::Remote(e.to_string()), None))?;

            match ureq::post(url)
                .header("Authorization", &format!("Bearer {token}"))
                .header("Content-Type", "application/json")
                .send_json(&body)
            {
                Ok(_) => Ok(()),
                Err(ureq::Error::StatusCode(status)) => Err(gmail_status_err(status)),
                Err(e) => Err((ErrorClass::Retryable, MsgVaultError::Remote(e.to_string()), None)),
            }
        })
    }
}

/// Classify a Gmail HTTP status into `(class, err, retry_after)`. A 403
/// means the stored credential lacks a scope Gmail now requires, which
/// the caller must surface as `InsufficientScope` (§4.7) rather than a
/// generic remote error, so a re-auth flow can be triggered instead of
/// the run simply failing.
fn gmail_status_err(status: u16) -> (ErrorClass, MsgVaultError, Option<std::time::Duration>) {
    if status == 403 {
        return (ErrorClass::Terminal, MsgVaultError::InsufficientScope, None);
    }
    let class = crate::ratelimit::classify(Some(status), "");
    (class, MsgVaultError::Remote(format!("gmail http {status}")), None)
}

impl RemoteClient for GmailClient {
    fn list_message_ids(&self, query: Option<&str>, page_token: Option<&str>) -> Result<RemoteMessageList> {
        let mut url = format!("{BASE_URL}/users/me/messages?maxResults=500");
        if let Some(q) = query {
            url.push_str(&format!("&q={}", urlencoding::encode(q)));
        }
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct MessageRef {
            id: String,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            messages: Option<Vec<MessageRef>>,
            next_page_token: Option<String>,
            result_size_estimate: Option<u32>,
        }

        let response: Response = self.call_json(&url)?;
        Ok(RemoteMessageList {
            ids: response.messages.unwrap_or_default().into_iter().map(|m| m.id).collect(),
            next_page_token: response.next_page_token,
            result_size_estimate: response.result_size_estimate,
        })
    }

    fn get_raw_message(&self, id: &str) -> Result<Vec<u8>> {
        let url = format!("{BASE_URL}/users/me/messages/{id}?format=raw");

        #[derive(Deserialize)]
        struct Response {
            raw: String,
        }

        let response: Response = self.call_json(&url)?;
        URL_SAFE_NO_PAD
            .decode(response.raw)
            .map_err(|e| MsgVaultError::MalformedMime(format!("bad base64 raw payload: {e}")))
    }

    fn get_message_label_ids(&self, id: &str) -> Result<Vec<String>> {
        let url = format!("{BASE_URL}/users/me/messages/{id}?format=metadata");

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            label_ids: Option<Vec<String>>,
        }

        let response: Response = self.call_json(&url)?;
        Ok(response.label_ids.unwrap_or_default())
    }

    fn list_labels(&self) -> Result<Vec<RemoteLabel>> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Label {
            id: String,
            name: String,
        }
        #[derive(Deserialize)]
        struct Response {
            labels: Option<Vec<Label>>,
        }

        let url = format!("{BASE_URL}/users/me/labels");
        let response: Response = self.call_json(&url)?;
        Ok(response
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| RemoteLabel { id: l.id, name: l.name })
            .collect())
    }

    fn get_profile(&self) -> Result<RemoteProfile> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            email_address: String,
            history_id: Option<String>,
            messages_total: Option<u64>,
        }

        let url = format!("{BASE_URL}/users/me/profile");
        let response: Response = self.call_json(&url)?;
        Ok(RemoteProfile {
            email_address: response.email_address,
            history_id: response.history_id,
            messages_total: response.messages_total,
        })
    }

    fn list_history_since(&self, cursor: &str, page_token: Option<&str>) -> Result<RemoteHistoryPage> {
        let mut url = format!(
            "{BASE_URL}/users/me/history?startHistoryId={}&historyTypes=messageAdded&historyTypes=messageDeleted",
            urlencoding::encode(cursor)
        );
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct MessageRef {
            id: String,
        }
        #[derive(Deserialize)]
        struct MessageAdded {
            message: MessageRef,
        }
        #[derive(Deserialize)]
        struct MessageDeleted {
            message: MessageRef,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct HistoryRecord {
            #[serde(default)]
            messages_added: Vec<MessageAdded>,
            #[serde(default)]
            messages_deleted: Vec<MessageDeleted>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            history: Option<Vec<HistoryRecord>>,
            history_id: Option<String>,
            next_page_token: Option<String>,
        }

        let cancel = CancellationToken::new();
        let response = self.throttle.retry.run(&cancel, || {
            self.throttle
                .limiter
                .acquire(&cancel)
                .map_err(|_| (ErrorClass::Cancelled, MsgVaultError::Cancelled, None))?;

            let token = self
                .token
                .access_token()
                .map_err(|e| (ErrorClass::Terminal, MsgVaultError::Remote(e.to_string()), None))?;

            match ureq::get(&url)
                .header("Authorization", &format!("Bearer {token}"))
                .call()
            {
                Ok(mut resp) => resp.body_mut().read_json::<Response>().map_err(|e| {
                    (ErrorClass::Terminal, MsgVaultError::Remote(format!("bad response body: {e}")), None)
                }),
                // Gmail signals an expired/invalid history cursor with a 404.
                Err(ureq::Error::StatusCode(404)) => {
                    Err((ErrorClass::Terminal, MsgVaultError::HistoryExpired, None))
                }
                Err(ureq::Error::StatusCode(status)) => Err(gmail_status_err(status)),
                Err(e) => Err((ErrorClass::Retryable, MsgVaultError::Remote(e.to_string()), None)),
            }
        })?;

        let mut added = Vec::new();
        let mut deleted = Vec::new();
        for record in response.history.unwrap_or_default() {
            added.extend(record.messages_added.into_iter().map(|m| m.message.id));
            deleted.extend(record.messages_deleted.into_iter().map(|m| m.message.id));
        }

        Ok(RemoteHistoryPage {
            added_message_ids: added,
            deleted_message_ids: deleted,
            next_page_token: response.next_page_token,
            history_id: response.history_id,
        })
    }

    fn batch_delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let url = format!("{BASE_URL}/users/me/messages/batchDelete");
        self.post_empty_body(&url, serde_json::json!({ "ids": ids }))
    }

    fn trash(&self, id: &str) -> Result<()> {
        let url = format!("{BASE_URL}/users/me/messages/{id}/trash");
        self.post_empty_body(&url, serde_json::json!({}))
    }

    fn untrash(&self, id: &str) -> Result<()> {
        let url = format!("{BASE_URL}/users/me/messages/{id}/untrash");
        self.post_empty_body(&url, serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticToken;
    impl TokenSource for StaticToken {
        fn access_token(&self) -> Result<String> {
            Ok("test-token".to_string())
        }
    }

    #[test]
    fn client_constructs_with_token_source() {
        let client = GmailClient::new(Arc::new(StaticToken), 5.0);
        assert!(client.token.access_token().is_ok());
    }
}
