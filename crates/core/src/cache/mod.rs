//! Analytics cache builder (C8, §4.8).
//!
//! New relative to the teacher, which serves every read straight from
//! its `redb`/`heed` row store. Mirrors the relational store into a
//! year-partitioned `parquet` tree via `arrow`, the pairing the rest of
//! the pack reaches for whenever a columnar on-disk format is needed
//! (see `DESIGN.md`). Junction tables are written as per-run shards
//! because parquet has no in-place append; snapshot tables are
//! rewritten whole each run, as named in §4.8.

mod schema;
mod writer;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use arrow::array::{BooleanArray, Int32Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, Utc};

use crate::error::Result;
use crate::models::CacheState;
use crate::storage::RelationalStore;

const REQUIRED_SUBDIRS: &[&str] = &[
    "messages",
    "message_recipients",
    "message_labels",
    "attachments",
    "participants",
    "labels",
    "sources",
    "conversations",
];

/// Serializes concurrent `build` calls within one process (§5, §4.8):
/// multi-account schedulers that finish sync around the same time must
/// not race on the cache directory.
fn build_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub exported_count: u64,
    pub max_id: i64,
    pub skipped: bool,
    pub was_full_rebuild: bool,
}

pub struct CacheBuilder<'a> {
    root: PathBuf,
    store: &'a RelationalStore,
}

impl<'a> CacheBuilder<'a> {
    pub fn new(cache_root: impl AsRef<Path>, store: &'a RelationalStore) -> Self {
        Self {
            root: cache_root.as_ref().to_path_buf(),
            store,
        }
    }

    fn state_path(&self) -> PathBuf {
        self.root.join("_last_sync.json")
    }

    fn read_state(&self) -> CacheState {
        fs::read(self.state_path())
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_default()
    }

    fn write_state(&self, state: &CacheState) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let tmp = self.root.join("._last_sync.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, self.state_path())?;
        Ok(())
    }

    fn required_subdirs_complete(&self) -> bool {
        REQUIRED_SUBDIRS.iter().all(|d| self.root.join(d).is_dir())
    }

    fn has_prior_data(&self) -> bool {
        fs::read_dir(&self.root).map(|mut it| it.next().is_some()).unwrap_or(false)
    }

    pub fn build(&self, full_rebuild: bool) -> Result<BuildReport> {
        let _guard = build_lock().lock().unwrap();

        let state = self.read_state();
        let max_id = self.store.max_cacheable_message_id()?;

        let force_full = !self.required_subdirs_complete() && max_id > 0 && self.has_prior_data();
        let full_rebuild = full_rebuild || force_full;

        if max_id <= state.last_message_id && !full_rebuild {
            return Ok(BuildReport {
                exported_count: 0,
                max_id,
                skipped: true,
                was_full_rebuild: false,
            });
        }

        if full_rebuild {
            for dir in REQUIRED_SUBDIRS {
                let path = self.root.join(dir);
                if path.exists() {
                    fs::remove_dir_all(&path)?;
                }
                fs::create_dir_all(&path)?;
            }
        } else {
            fs::create_dir_all(&self.root)?;
        }

        let since = if full_rebuild { 0 } else { state.last_message_id };
        let exported_count = self.export_messages(since, max_id)?;
        self.export_message_recipients(since, max_id)?;
        self.export_message_labels(since, max_id)?;
        self.export_attachments(since, max_id)?;
        self.export_snapshot_tables()?;

        self.write_state(&CacheState {
            last_message_id: max_id,
            last_sync_at: Some(Utc::now()),
        })?;

        Ok(BuildReport {
            exported_count,
            max_id,
            skipped: false,
            was_full_rebuild: full_rebuild,
        })
    }

    fn export_messages(&self, since: i64, shard_id: i64) -> Result<u64> {
        let rows = self.store.export_messages_since(since)?;
        let mut by_year: std::collections::BTreeMap<i32, Vec<&crate::storage::MessageExportRow>> = Default::default();
        for row in &rows {
            by_year.entry(row.year()).or_default().push(row);
        }

        for (year, rows) in by_year {
            let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
            let source_ids: Vec<i64> = rows.iter().map(|r| r.source_id).collect();
            let conversation_ids: Vec<i64> = rows.iter().map(|r| r.conversation_id).collect();
            let subjects: Vec<&str> = rows.iter().map(|r| r.subject.as_str()).collect();
            let snippets: Vec<&str> = rows.iter().map(|r| r.snippet.as_str()).collect();
            let sent_at: Vec<i64> = rows.iter().map(|r| r.sent_at.timestamp_millis()).collect();
            let received_at: Vec<Option<i64>> = rows.iter().map(|r| r.received_at.map(|t| t.timestamp_millis())).collect();
            let sizes: Vec<i64> = rows.iter().map(|r| r.size_estimate).collect();
            let has_attachments: Vec<bool> = rows.iter().map(|r| r.has_attachments).collect();
            let deleted_at: Vec<Option<i64>> =
                rows.iter().map(|r| r.deleted_from_source_at.map(|t| t.timestamp_millis())).collect();
            let years: Vec<i32> = rows.iter().map(|_| year).collect();

            let schema = schema::messages_schema();
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(Int64Array::from(ids)),
                    Arc::new(Int64Array::from(source_ids)),
                    Arc::new(Int64Array::from(conversation_ids)),
                    Arc::new(StringArray::from(subjects)),
                    Arc::new(StringArray::from(snippets)),
                    Arc::new(Int64Array::from(sent_at)),
                    Arc::new(Int64Array::from(received_at)),
                    Arc::new(Int64Array::from(sizes)),
                    Arc::new(BooleanArray::from(has_attachments)),
                    Arc::new(Int64Array::from(deleted_at)),
                    Arc::new(Int32Array::from(years)),
                ],
            )
            .map_err(|e| crate::error::MsgVaultError::Other(anyhow::anyhow!("arrow batch build failed: {e}")))?;

            let dir = self.root.join("messages").join(format!("year={year}"));
            let path = dir.join(format!("incr_{shard_id}.parquet"));
            writer::write_parquet_file(&path, schema, batch)?;
        }

        Ok(rows.len() as u64)
    }

    fn export_message_recipients(&self, since: i64, shard_id: i64) -> Result<()> {
        let rows = self.store.export_message_recipients_since(since)?;
        if rows.is_empty() {
            return Ok(());
        }
        let message_ids: Vec<i64> = rows.iter().map(|r| r.message_id).collect();
        let participant_ids: Vec<i64> = rows.iter().map(|r| r.participant_id).collect();
        let recipient_types: Vec<&str> = rows.iter().map(|r| r.recipient_type.as_str()).collect();
        let display_names: Vec<Option<&str>> = rows.iter().map(|r| r.display_name_snapshot.as_deref()).collect();

        let schema = schema::message_recipients_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(message_ids)),
                Arc::new(Int64Array::from(participant_ids)),
                Arc::new(StringArray::from(recipient_types)),
                Arc::new(StringArray::from(display_names)),
            ],
        )
        .map_err(|e| crate::error::MsgVaultError::Other(anyhow::anyhow!("arrow batch build failed: {e}")))?;

        let path = self.root.join("message_recipients").join(format!("incr_{shard_id}.parquet"));
        writer::write_parquet_file(&path, schema, batch)
    }

    fn export_message_labels(&self, since: i64, shard_id: i64) -> Result<()> {
        let rows = self.store.export_message_labels_since(since)?;
        if rows.is_empty() {
            return Ok(());
        }
        let message_ids: Vec<i64> = rows.iter().map(|r| r.message_id).collect();
        let label_ids: Vec<i64> = rows.iter().map(|r| r.label_id).collect();

        let schema = schema::message_labels_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(message_ids)), Arc::new(Int64Array::from(label_ids))],
        )
        .map_err(|e| crate::error::MsgVaultError::Other(anyhow::anyhow!("arrow batch build failed: {e}")))?;

        let path = self.root.join("message_labels").join(format!("incr_{shard_id}.parquet"));
        writer::write_parquet_file(&path, schema, batch)
    }

    fn export_attachments(&self, since: i64, shard_id: i64) -> Result<()> {
        let rows = self.store.export_attachments_since(since)?;
        if rows.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let message_ids: Vec<i64> = rows.iter().map(|r| r.message_id).collect();
        let filenames: Vec<&str> = rows.iter().map(|r| r.filename.as_str()).collect();
        let mime_types: Vec<&str> = rows.iter().map(|r| r.mime_type.as_str()).collect();
        let sizes: Vec<i64> = rows.iter().map(|r| r.size).collect();
        let content_hashes: Vec<Option<&str>> = rows.iter().map(|r| r.content_hash.as_deref()).collect();
        let storage_paths: Vec<Option<&str>> = rows.iter().map(|r| r.storage_path.as_deref()).collect();

        let schema = schema::attachments_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Int64Array::from(message_ids)),
                Arc::new(StringArray::from(filenames)),
                Arc::new(StringArray::from(mime_types)),
                Arc::new(Int64Array::from(sizes)),
                Arc::new(StringArray::from(content_hashes)),
                Arc::new(StringArray::from(storage_paths)),
            ],
        )
        .map_err(|e| crate::error::MsgVaultError::Other(anyhow::anyhow!("arrow batch build failed: {e}")))?;

        let path = self.root.join("attachments").join(format!("incr_{shard_id}.parquet"));
        writer::write_parquet_file(&path, schema, batch)
    }

    /// `participants`/`labels`/`sources`/`conversations` are rewritten
    /// whole every run (§4.8): cheap relative to the message tables and
    /// never require append semantics.
    fn export_snapshot_tables(&self) -> Result<()> {
        let participants = self.store.export_participants()?;
        let ids: Vec<i64> = participants.iter().map(|p| p.id).collect();
        let emails: Vec<&str> = participants.iter().map(|p| p.email_address.as_str()).collect();
        let domains: Vec<&str> = participants.iter().map(|p| p.domain.as_str()).collect();
        let display_names: Vec<Option<&str>> = participants.iter().map(|p| p.display_name.as_deref()).collect();
        let schema = schema::participants_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(emails)),
                Arc::new(StringArray::from(domains)),
                Arc::new(StringArray::from(display_names)),
            ],
        )
        .map_err(|e| crate::error::MsgVaultError::Other(anyhow::anyhow!("arrow batch build failed: {e}")))?;
        writer::write_parquet_file(&self.root.join("participants").join("snapshot.parquet"), schema, batch)?;

        let labels = self.store.export_labels()?;
        let ids: Vec<i64> = labels.iter().map(|l| l.id).collect();
        let source_ids: Vec<i64> = labels.iter().map(|l| l.source_id).collect();
        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        let provider_ids: Vec<Option<&str>> = labels.iter().map(|l| l.provider_label_id.as_deref()).collect();
        let schema = schema::labels_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Int64Array::from(source_ids)),
                Arc::new(StringArray::from(names)),
                Arc::new(StringArray::from(provider_ids)),
            ],
        )
        .map_err(|e| crate::error::MsgVaultError::Other(anyhow::anyhow!("arrow batch build failed: {e}")))?;
        writer::write_parquet_file(&self.root.join("labels").join("snapshot.parquet"), schema, batch)?;

        let sources = self.store.list_sources()?;
        let ids: Vec<i64> = sources.iter().map(|s| s.id).collect();
        let source_types: Vec<&str> = sources.iter().map(|s| s.source_type.as_str()).collect();
        let identifiers: Vec<&str> = sources.iter().map(|s| s.identifier.as_str()).collect();
        let display_names: Vec<Option<&str>> = sources.iter().map(|s| s.display_name.as_deref()).collect();
        let last_sync: Vec<Option<i64>> = sources.iter().map(|s| s.last_sync_at.map(|t| t.timestamp_millis())).collect();
        let schema = schema::sources_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(source_types)),
                Arc::new(StringArray::from(identifiers)),
                Arc::new(StringArray::from(display_names)),
                Arc::new(Int64Array::from(last_sync)),
            ],
        )
        .map_err(|e| crate::error::MsgVaultError::Other(anyhow::anyhow!("arrow batch build failed: {e}")))?;
        writer::write_parquet_file(&self.root.join("sources").join("snapshot.parquet"), schema, batch)?;

        let conversations = self.store.export_conversations()?;
        let ids: Vec<i64> = conversations.iter().map(|c| c.id).collect();
        let source_ids: Vec<i64> = conversations.iter().map(|c| c.source_id).collect();
        let source_conv_ids: Vec<&str> = conversations.iter().map(|c| c.source_conversation_id.as_str()).collect();
        let titles: Vec<Option<&str>> = conversations.iter().map(|c| c.title.as_deref()).collect();
        let schema = schema::conversations_schema();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(Int64Array::from(source_ids)),
                Arc::new(StringArray::from(source_conv_ids)),
                Arc::new(StringArray::from(titles)),
            ],
        )
        .map_err(|e| crate::error::MsgVaultError::Other(anyhow::anyhow!("arrow batch build failed: {e}")))?;
        writer::write_parquet_file(&self.root.join("conversations").join("snapshot.parquet"), schema, batch)
    }
}

/// Whether `root` holds a complete cache tree the query engine can read
/// from directly (§4.9 dispatcher).
pub fn has_complete_cache_data(root: &Path) -> bool {
    REQUIRED_SUBDIRS.iter().all(|d| root.join(d).is_dir()) && root.join("_last_sync.json").exists()
}

pub use writer::{col_bool, col_i32, col_i64, col_str, read_parquet_dir};
