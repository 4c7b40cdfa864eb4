//! End-to-end scenarios spanning the relational store, blob store, sync
//! engines, analytics cache and query engine together, as opposed to the
//! per-module unit tests colocated with each of those.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use msgvault_core::blob::BlobStore;
use msgvault_core::cache::CacheBuilder;
use msgvault_core::deletion::DeletionEngine;
use msgvault_core::error::{MsgVaultError, Result};
use msgvault_core::models::{ExecutionMethod, ManifestStatus, SourceType};
use msgvault_core::query::{AggregateOptions, AggregateView, QueryEngine};
use msgvault_core::remote::{RemoteClient, RemoteHistoryPage, RemoteLabel, RemoteMessageList, RemoteProfile};
use msgvault_core::storage::RelationalStore;
use msgvault_core::sync::{FullSyncOptions, NullProgressSink, SyncContext, sync_full, sync_incremental};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn rfc2822(dt: DateTime<Utc>) -> String {
    dt.to_rfc2822()
}

fn plain_message(from: &str, to: &str, subject: &str, sent_at: DateTime<Utc>, body: &str) -> Vec<u8> {
    format!(
        "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nDate: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n",
        rfc2822(sent_at)
    )
    .into_bytes()
}

/// Builds a `multipart/mixed` message carrying base64 attachments.
fn message_with_attachments(
    from: &str,
    to: &str,
    subject: &str,
    sent_at: DateTime<Utc>,
    body: &str,
    attachments: &[(&str, &str, &[u8])],
) -> Vec<u8> {
    use base64::Engine;
    let boundary = "msgvault-test-boundary";
    let mut out = format!(
        "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nDate: {}\r\nContent-Type: multipart/mixed; boundary={boundary}\r\n\r\n--{boundary}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n",
        rfc2822(sent_at)
    );
    for (filename, mime_type, bytes) in attachments {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        out.push_str(&format!(
            "--{boundary}\r\nContent-Type: {mime_type}\r\nContent-Disposition: attachment; filename=\"{filename}\"\r\nContent-Transfer-Encoding: base64\r\n\r\n{encoded}\r\n"
        ));
    }
    out.push_str(&format!("--{boundary}--\r\n"));
    out.into_bytes()
}

/// A message declaring `charset=windows-1252` whose body bytes are not
/// valid UTF-8 (the "smart quote" range), exercising the §4.5 recovery
/// path end to end through the sync engine rather than `mime::parse`
/// alone.
fn windows1252_message(from: &str, to: &str, subject: &str, sent_at: DateTime<Utc>) -> Vec<u8> {
    let mut head = format!(
        "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nDate: {}\r\nContent-Type: text/plain; charset=windows-1252\r\n\r\n",
        rfc2822(sent_at)
    )
    .into_bytes();
    head.extend_from_slice(b"Quoting ");
    head.push(0x93); // left smart quote in windows-1252
    head.extend_from_slice(b"verbatim");
    head.push(0x94); // right smart quote
    head.extend_from_slice(b"\r\n");
    head
}

/// Drives [`sync_full`] against a fixed set of raw messages. `cancel_after`
/// names a message id whose fetch triggers cancellation of the run's
/// token right after the id is handed back, so that message still
/// commits but the next one in the page never starts.
struct FixtureRemote {
    raw: HashMap<String, Vec<u8>>,
    ids: Vec<String>,
    cancel: CancellationToken,
    cancel_after: Option<String>,
}

impl RemoteClient for FixtureRemote {
    fn list_message_ids(&self, _query: Option<&str>, _page_token: Option<&str>) -> Result<RemoteMessageList> {
        Ok(RemoteMessageList {
            ids: self.ids.clone(),
            next_page_token: None,
            result_size_estimate: Some(self.ids.len() as u32),
        })
    }

    fn get_raw_message(&self, id: &str) -> Result<Vec<u8>> {
        let bytes = self.raw.get(id).cloned().ok_or(MsgVaultError::NotFound)?;
        if self.cancel_after.as_deref() == Some(id) {
            self.cancel.cancel();
        }
        Ok(bytes)
    }

    fn get_message_label_ids(&self, _id: &str) -> Result<Vec<String>> {
        Ok(vec!["INBOX".to_string()])
    }

    fn list_labels(&self) -> Result<Vec<RemoteLabel>> {
        Ok(Vec::new())
    }

    fn get_profile(&self) -> Result<RemoteProfile> {
        Ok(RemoteProfile {
            email_address: "archive@example.com".to_string(),
            history_id: Some("hist-1".to_string()),
            messages_total: Some(self.ids.len() as u64),
        })
    }

    fn list_history_since(&self, _cursor: &str, _page_token: Option<&str>) -> Result<RemoteHistoryPage> {
        unimplemented!("not exercised by the full-sync fixtures")
    }

    fn batch_delete(&self, _ids: &[String]) -> Result<()> {
        Ok(())
    }

    fn trash(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn untrash(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

#[test]
fn fresh_sync_of_five_messages_populates_store_and_cache() {
    let store = RelationalStore::open_in_memory().unwrap();
    let blob_dir = tempdir().unwrap();
    let blobs = BlobStore::new(blob_dir.path()).unwrap();
    let source = store.upsert_source(SourceType::Gmail, "archive@example.com", None).unwrap();

    let base = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
    let mut raw = HashMap::new();
    raw.insert("m1".to_string(), plain_message("alice@example.com", "archive@example.com", "hi", base, "hello"));
    raw.insert(
        "m2".to_string(),
        message_with_attachments(
            "bob@example.com",
            "archive@example.com",
            "photos",
            base + chrono::Duration::hours(1),
            "see attached",
            &[
                ("a.txt", "text/plain", b"attachment one"),
                ("b.bin", "application/octet-stream", &[1u8, 2, 3, 4, 5]),
            ],
        ),
    );
    raw.insert("m3".to_string(), plain_message("carol@example.com", "archive@example.com", "re: hi", base + chrono::Duration::hours(2), "reply"));
    raw.insert("m4".to_string(), plain_message("alice@example.com", "archive@example.com", "again", base + chrono::Duration::hours(3), "one more"));
    raw.insert("m5".to_string(), plain_message("dave@example.com", "archive@example.com", "last", base + chrono::Duration::hours(4), "final"));

    let remote = FixtureRemote {
        raw,
        ids: vec!["m1".into(), "m2".into(), "m3".into(), "m4".into(), "m5".into()],
        cancel: CancellationToken::new(),
        cancel_after: None,
    };
    let cancel = CancellationToken::new();
    let ctx = SyncContext { store: &store, blobs: &blobs, remote: &remote, cancel: &cancel };
    let mut sink = NullProgressSink;

    let summary = sync_full(&ctx, source.id, &FullSyncOptions::default(), &mut sink).unwrap();
    assert_eq!(summary.added, 5);
    assert_eq!(summary.skipped, 0);
    assert!(!summary.was_resumed);
    assert_eq!(store.total_message_count().unwrap(), 5);

    let refreshed = store.get_source(source.id).unwrap().unwrap();
    assert_eq!(refreshed.sync_cursor.as_deref(), Some("hist-1"));

    let m2 = store.get_message_by_source_id(source.id, "m2").unwrap().unwrap();
    let detail = store.get_message_detail(m2.id).unwrap().unwrap();
    assert_eq!(detail.attachments.len(), 2);
    for attachment in &detail.attachments {
        let hash = attachment.content_hash.as_deref().expect("attachment blob should have stored");
        assert_eq!(hash.len(), 64);
        assert!(blob_dir.path().join(&hash[..2]).join(hash).exists());
    }

    let cache_dir = tempdir().unwrap();
    let report = CacheBuilder::new(cache_dir.path(), &store).build(true).unwrap();
    assert_eq!(report.exported_count, 5);

    let engine = QueryEngine::with_cache(&store, cache_dir.path());
    let rows = engine.aggregate(AggregateView::Senders, &AggregateOptions { limit: 10, ..Default::default() }).unwrap();
    let alice_row = rows.iter().find(|r| r.key == "alice@example.com").expect("alice sent two messages");
    assert_eq!(alice_row.count, 2);
}

/// A single provider page larger than the requested `limit` must still
/// ingest up to `limit` messages, not zero of them (regression for the
/// hard-limit check once being evaluated against ids discovered in the
/// page rather than messages actually processed).
#[test]
fn full_sync_limit_caps_messages_processed_not_page_size() {
    let store = RelationalStore::open_in_memory().unwrap();
    let blob_dir = tempdir().unwrap();
    let blobs = BlobStore::new(blob_dir.path()).unwrap();
    let source = store.upsert_source(SourceType::Gmail, "archive@example.com", None).unwrap();

    let base = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
    let mut raw = HashMap::new();
    for (i, id) in ["m1", "m2", "m3", "m4", "m5"].iter().enumerate() {
        raw.insert(
            id.to_string(),
            plain_message("sender@example.com", "archive@example.com", "hi", base + chrono::Duration::hours(i as i64), "body"),
        );
    }

    let cancel = CancellationToken::new();
    let remote = FixtureRemote {
        raw,
        ids: vec!["m1".into(), "m2".into(), "m3".into(), "m4".into(), "m5".into()],
        cancel: cancel.clone(),
        cancel_after: None,
    };
    let ctx = SyncContext { store: &store, blobs: &blobs, remote: &remote, cancel: &cancel };
    let mut sink = NullProgressSink;

    let options = FullSyncOptions { limit: Some(2), ..Default::default() };
    let summary = sync_full(&ctx, source.id, &options, &mut sink).unwrap();

    assert_eq!(summary.added, 2);
    assert_eq!(store.total_message_count().unwrap(), 2);
}

#[test]
fn resumed_sync_after_cancellation_is_idempotent() {
    let store = RelationalStore::open_in_memory().unwrap();
    let blob_dir = tempdir().unwrap();
    let blobs = BlobStore::new(blob_dir.path()).unwrap();
    let source = store.upsert_source(SourceType::Gmail, "archive@example.com", None).unwrap();

    let base = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
    let mut raw = HashMap::new();
    for (i, id) in ["m1", "m2", "m3", "m4", "m5"].iter().enumerate() {
        raw.insert(
            id.to_string(),
            plain_message("sender@example.com", "archive@example.com", "hi", base + chrono::Duration::hours(i as i64), "body"),
        );
    }

    let cancel = CancellationToken::new();
    let remote = FixtureRemote {
        raw,
        ids: vec!["m1".into(), "m2".into(), "m3".into(), "m4".into(), "m5".into()],
        cancel: cancel.clone(),
        cancel_after: Some("m3".to_string()),
    };
    let ctx = SyncContext { store: &store, blobs: &blobs, remote: &remote, cancel: &cancel };
    let mut sink = NullProgressSink;

    let first = sync_full(&ctx, source.id, &FullSyncOptions::default(), &mut sink).unwrap();
    assert_eq!(first.added, 3);
    assert!(!first.was_resumed);
    assert_eq!(store.total_message_count().unwrap(), 3);

    // A fresh cancellation token and context: resuming must pick up the
    // still-active run rather than starting a new one.
    let cancel2 = CancellationToken::new();
    let ctx2 = SyncContext { store: &store, blobs: &blobs, remote: &remote, cancel: &cancel2 };
    let second = sync_full(&ctx2, source.id, &FullSyncOptions::default(), &mut sink).unwrap();
    assert!(second.was_resumed);
    assert_eq!(second.added, 2);
    assert_eq!(second.skipped, 3);
    assert_eq!(store.total_message_count().unwrap(), 5);
}

struct ExpiredHistoryRemote;

impl RemoteClient for ExpiredHistoryRemote {
    fn list_message_ids(&self, _query: Option<&str>, _page_token: Option<&str>) -> Result<RemoteMessageList> {
        unimplemented!()
    }
    fn get_raw_message(&self, _id: &str) -> Result<Vec<u8>> {
        unimplemented!()
    }
    fn get_message_label_ids(&self, _id: &str) -> Result<Vec<String>> {
        unimplemented!()
    }
    fn list_labels(&self) -> Result<Vec<RemoteLabel>> {
        Ok(Vec::new())
    }
    fn get_profile(&self) -> Result<RemoteProfile> {
        unimplemented!()
    }
    fn list_history_since(&self, _cursor: &str, _page_token: Option<&str>) -> Result<RemoteHistoryPage> {
        Err(MsgVaultError::HistoryExpired)
    }
    fn batch_delete(&self, _ids: &[String]) -> Result<()> {
        Ok(())
    }
    fn trash(&self, _id: &str) -> Result<()> {
        Ok(())
    }
    fn untrash(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

#[test]
fn incremental_sync_with_expired_cursor_signals_fallback() {
    let store = RelationalStore::open_in_memory().unwrap();
    let blob_dir = tempdir().unwrap();
    let blobs = BlobStore::new(blob_dir.path()).unwrap();
    let source = store.upsert_source(SourceType::Gmail, "archive@example.com", None).unwrap();
    store.update_sync_cursor(source.id, Some("stale-cursor")).unwrap();

    let remote = ExpiredHistoryRemote;
    let cancel = CancellationToken::new();
    let ctx = SyncContext { store: &store, blobs: &blobs, remote: &remote, cancel: &cancel };
    let mut sink = NullProgressSink;

    let result = sync_incremental(&ctx, source.id, &mut sink);
    assert!(matches!(result, Err(MsgVaultError::HistoryExpired)));

    // The cursor itself is left untouched; the caller is expected to
    // fall back to a full sync rather than this call mutating state.
    let refreshed = store.get_source(source.id).unwrap().unwrap();
    assert_eq!(refreshed.sync_cursor.as_deref(), Some("stale-cursor"));
}

#[test]
fn incremental_sync_without_a_cursor_is_history_expired() {
    let store = RelationalStore::open_in_memory().unwrap();
    let blob_dir = tempdir().unwrap();
    let blobs = BlobStore::new(blob_dir.path()).unwrap();
    let source = store.upsert_source(SourceType::Gmail, "archive@example.com", None).unwrap();

    let remote = ExpiredHistoryRemote;
    let cancel = CancellationToken::new();
    let ctx = SyncContext { store: &store, blobs: &blobs, remote: &remote, cancel: &cancel };
    let mut sink = NullProgressSink;

    let result = sync_incremental(&ctx, source.id, &mut sink);
    assert!(matches!(result, Err(MsgVaultError::HistoryExpired)));
}

struct CountingDeleteRemote {
    calls: Mutex<Vec<usize>>,
}

impl RemoteClient for CountingDeleteRemote {
    fn list_message_ids(&self, _query: Option<&str>, _page_token: Option<&str>) -> Result<RemoteMessageList> {
        unimplemented!()
    }
    fn get_raw_message(&self, _id: &str) -> Result<Vec<u8>> {
        unimplemented!()
    }
    fn get_message_label_ids(&self, _id: &str) -> Result<Vec<String>> {
        unimplemented!()
    }
    fn list_labels(&self) -> Result<Vec<RemoteLabel>> {
        Ok(Vec::new())
    }
    fn get_profile(&self) -> Result<RemoteProfile> {
        unimplemented!()
    }
    fn list_history_since(&self, _cursor: &str, _page_token: Option<&str>) -> Result<RemoteHistoryPage> {
        unimplemented!()
    }
    fn batch_delete(&self, ids: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(ids.len());
        Ok(())
    }
    fn trash(&self, _id: &str) -> Result<()> {
        Ok(())
    }
    fn untrash(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

#[test]
fn batch_permanent_delete_of_1500_ids_chunks_into_two_batch_calls() {
    use msgvault_core::storage::NewMessage;

    let store = RelationalStore::open_in_memory().unwrap();
    let source = store.upsert_source(SourceType::Gmail, "archive@example.com", None).unwrap();
    let sent = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let ids: Vec<String> = (0..1500).map(|i| format!("m{i}")).collect();
    for id in &ids {
        store
            .upsert_message(&NewMessage {
                source_id: source.id,
                source_message_id: id.clone(),
                source_conversation_id: id.clone(),
                conversation_title: None,
                subject: Some("bulk".to_string()),
                snippet: Some(String::new()),
                sent_at: Some(sent),
                received_at: Some(sent),
                size_estimate: Some(10),
                has_attachments: Some(false),
                recipients: Vec::new(),
                labels: Vec::new(),
                body_text: None,
                body_html: None,
                raw_bytes: None,
                attachments: Vec::new(),
            })
            .unwrap();
    }

    let remote = CountingDeleteRemote { calls: Mutex::new(Vec::new()) };
    let manifests_dir = tempdir().unwrap();
    let engine = DeletionEngine::new(manifests_dir.path(), &store, &remote);
    let mut manifest = engine
        .stage(source.id, ids.clone(), "bulk cleanup".to_string(), serde_json::json!({"q": "older_than:1y"}))
        .unwrap();

    let cancel = CancellationToken::new();
    engine.execute(&mut manifest, ExecutionMethod::BatchPermanent, &cancel).unwrap();

    assert_eq!(manifest.status, ManifestStatus::Completed);
    let calls = remote.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], msgvault_core::deletion::MAX_BATCH_SIZE);
    assert_eq!(calls[1], 1500 - msgvault_core::deletion::MAX_BATCH_SIZE);
    drop(calls);

    assert_eq!(store.total_message_count().unwrap(), 0);

    let reloaded = engine.load(&manifest.id).unwrap();
    assert_eq!(reloaded.status, ManifestStatus::Completed);
    assert_eq!(reloaded.execution.unwrap().done_ids.len(), 1500);
}

#[test]
fn batch_delete_interrupted_mid_run_resumes_without_redoing_completed_chunks() {
    use msgvault_core::storage::NewMessage;

    let store = RelationalStore::open_in_memory().unwrap();
    let source = store.upsert_source(SourceType::Gmail, "archive@example.com", None).unwrap();
    let sent = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let ids: Vec<String> = (0..1500).map(|i| format!("m{i}")).collect();
    for id in &ids {
        store
            .upsert_message(&NewMessage {
                source_id: source.id,
                source_message_id: id.clone(),
                source_conversation_id: id.clone(),
                conversation_title: None,
                subject: Some("bulk".to_string()),
                snippet: Some(String::new()),
                sent_at: Some(sent),
                received_at: Some(sent),
                size_estimate: Some(10),
                has_attachments: Some(false),
                recipients: Vec::new(),
                labels: Vec::new(),
                body_text: None,
                body_html: None,
                raw_bytes: None,
                attachments: Vec::new(),
            })
            .unwrap();
    }

    let remote = CountingDeleteRemote { calls: Mutex::new(Vec::new()) };
    let manifests_dir = tempdir().unwrap();
    let engine = DeletionEngine::new(manifests_dir.path(), &store, &remote);
    let mut manifest = engine
        .stage(source.id, ids.clone(), "bulk cleanup".to_string(), serde_json::json!({}))
        .unwrap();

    // Cancel before the first chunk is even attempted: execute should
    // leave the manifest resumable in-progress with no messages deleted.
    let cancel = CancellationToken::new();
    cancel.cancel();
    engine.execute(&mut manifest, ExecutionMethod::BatchPermanent, &cancel).unwrap();
    assert_eq!(manifest.status, ManifestStatus::InProgress);
    assert_eq!(store.total_message_count().unwrap(), 1500);
    assert!(remote.calls.lock().unwrap().is_empty());

    // Resuming with a live token finishes the job from scratch (no
    // chunk had been recorded as done yet).
    let cancel2 = CancellationToken::new();
    engine.execute(&mut manifest, ExecutionMethod::BatchPermanent, &cancel2).unwrap();
    assert_eq!(manifest.status, ManifestStatus::Completed);
    assert_eq!(store.total_message_count().unwrap(), 0);
}

#[test]
fn charset_recovery_round_trips_through_full_sync_pipeline() {
    let store = RelationalStore::open_in_memory().unwrap();
    let blob_dir = tempdir().unwrap();
    let blobs = BlobStore::new(blob_dir.path()).unwrap();
    let source = store.upsert_source(SourceType::Gmail, "archive@example.com", None).unwrap();

    let sent = Utc.with_ymd_and_hms(2024, 2, 2, 12, 0, 0).unwrap();
    let mut raw = HashMap::new();
    raw.insert(
        "m1".to_string(),
        windows1252_message("quoter@example.com", "archive@example.com", "a quote", sent),
    );

    let remote = FixtureRemote {
        raw,
        ids: vec!["m1".into()],
        cancel: CancellationToken::new(),
        cancel_after: None,
    };
    let cancel = CancellationToken::new();
    let ctx = SyncContext { store: &store, blobs: &blobs, remote: &remote, cancel: &cancel };
    let mut sink = NullProgressSink;

    let summary = sync_full(&ctx, source.id, &FullSyncOptions::default(), &mut sink).unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.errors, 0);

    let message = store.get_message_by_source_id(source.id, "m1").unwrap().unwrap();
    let detail = store.get_message_detail(message.id).unwrap().unwrap();
    let body = detail.body_text.expect("body_text should have recovered");
    assert!(body.contains("verbatim"));
    assert!(body.contains('\u{201c}') || body.contains('\u{201d}'), "smart quotes should have decoded, not been replaced: {body:?}");
}

#[test]
fn cache_backfill_forces_full_rebuild_after_a_live_sync() {
    let store = RelationalStore::open_in_memory().unwrap();
    let blob_dir = tempdir().unwrap();
    let blobs = BlobStore::new(blob_dir.path()).unwrap();
    let source = store.upsert_source(SourceType::Gmail, "archive@example.com", None).unwrap();

    let base = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
    let mut raw = HashMap::new();
    raw.insert("m1".to_string(), plain_message("a@example.com", "archive@example.com", "s1", base, "b1"));
    let remote = FixtureRemote { raw, ids: vec!["m1".into()], cancel: CancellationToken::new(), cancel_after: None };
    let cancel = CancellationToken::new();
    let ctx = SyncContext { store: &store, blobs: &blobs, remote: &remote, cancel: &cancel };
    sync_full(&ctx, source.id, &FullSyncOptions::default(), &mut NullProgressSink).unwrap();

    let cache_dir = tempdir().unwrap();
    let builder = CacheBuilder::new(cache_dir.path(), &store);
    let first = builder.build(true).unwrap();
    assert_eq!(first.exported_count, 1);

    // Simulate a cache tree damaged by an out-of-band schema change: one
    // of the required subdirectories is missing.
    std::fs::remove_dir_all(cache_dir.path().join("labels")).unwrap();

    // New message arrives via a second sync before the next scheduled
    // cache build.
    let mut raw2 = HashMap::new();
    raw2.insert("m1".to_string(), plain_message("a@example.com", "archive@example.com", "s1", base, "b1"));
    raw2.insert("m2".to_string(), plain_message("a@example.com", "archive@example.com", "s2", base + chrono::Duration::days(1), "b2"));
    let remote2 = FixtureRemote { raw: raw2, ids: vec!["m1".into(), "m2".into()], cancel: CancellationToken::new(), cancel_after: None };
    let cancel2 = CancellationToken::new();
    let ctx2 = SyncContext { store: &store, blobs: &blobs, remote: &remote2, cancel: &cancel2 };
    sync_full(&ctx2, source.id, &FullSyncOptions::default(), &mut NullProgressSink).unwrap();

    let rebuilt = builder.build(false).unwrap();
    assert!(rebuilt.was_full_rebuild);
    assert_eq!(rebuilt.exported_count, 2);

    let again = builder.build(false).unwrap();
    assert!(again.skipped);
}

#[test]
fn upserting_the_same_raw_message_twice_does_not_duplicate_rows() {
    use msgvault_core::models::RecipientType;
    use msgvault_core::storage::{NewMessage, NewRecipient};

    let store = RelationalStore::open_in_memory().unwrap();
    let source = store.upsert_source(SourceType::Gmail, "archive@example.com", None).unwrap();
    let sent = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let new_message = || NewMessage {
        source_id: source.id,
        source_message_id: "m1".to_string(),
        source_conversation_id: "c1".to_string(),
        conversation_title: None,
        subject: Some("hi".to_string()),
        snippet: Some(String::new()),
        sent_at: Some(sent),
        received_at: Some(sent),
        size_estimate: Some(10),
        has_attachments: Some(false),
        recipients: vec![NewRecipient { recipient_type: RecipientType::From, email: "bob@example.com".to_string(), display_name: None }],
        labels: Vec::new(),
        body_text: None,
        body_html: None,
        raw_bytes: None,
        attachments: Vec::new(),
    };

    store.upsert_message(&new_message()).unwrap();
    store.upsert_message(&new_message()).unwrap();

    assert_eq!(store.total_message_count().unwrap(), 1);
    let message = store.get_message_by_source_id(source.id, "m1").unwrap().unwrap();
    let detail = store.get_message_detail(message.id).unwrap().unwrap();
    assert_eq!(detail.recipients.len(), 1);
}
