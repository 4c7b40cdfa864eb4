//! Query engine (C9, §4.9).
//!
//! Dispatches reads to the relational store for anything that needs
//! exact row lookups or full-text search, and to the columnar cache for
//! aggregate views once one is present and complete, falling back to
//! the relational store on any cache read error.

mod parser;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::cache;
use crate::error::Result;
use crate::models::{Message, RecipientType, Source};
use crate::storage::{AggregateRow, MessageDetail, RelationalStore, TotalStats};

pub use parser::{parse_query, parse_query_at};

/// Which breakdown an [`QueryEngine::aggregate`] call groups by (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateView {
    Senders,
    Recipients,
    Domains,
    Labels,
    Time(TimeGranularity),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeGranularity {
    Day,
    Month,
    Year,
}

impl TimeGranularity {
    fn as_sql(self) -> &'static str {
        match self {
            TimeGranularity::Day => "day",
            TimeGranularity::Month => "month",
            TimeGranularity::Year => "year",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    pub limit: u32,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

pub struct QueryEngine<'a> {
    store: &'a RelationalStore,
    cache_root: Option<PathBuf>,
}

impl<'a> QueryEngine<'a> {
    pub fn new(store: &'a RelationalStore) -> Self {
        Self { store, cache_root: None }
    }

    /// Enables the columnar path for [`Self::aggregate`] when `cache_root`
    /// holds a complete cache tree; this is checked fresh on every call
    /// rather than cached, since a cache rebuild can complete mid-session.
    pub fn with_cache(store: &'a RelationalStore, cache_root: impl AsRef<Path>) -> Self {
        Self {
            store,
            cache_root: Some(cache_root.as_ref().to_path_buf()),
        }
    }

    pub fn search(&self, query: &str, limit: u32, offset: u32) -> Result<Vec<Message>> {
        let filter = parse_query(query);
        self.store.search_messages(&filter, limit, offset)
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageDetail>> {
        self.store.get_message_detail(id)
    }

    pub fn get_message_by_source_id(&self, source_id: i64, source_message_id: &str) -> Result<Option<MessageDetail>> {
        let Some(message) = self.store.get_message_by_source_id(source_id, source_message_id)? else {
            return Ok(None);
        };
        self.store.get_message_detail(message.id)
    }

    pub fn list_accounts(&self) -> Result<Vec<Source>> {
        self.store.list_sources()
    }

    pub fn get_total_stats(&self) -> Result<TotalStats> {
        self.store.total_stats()
    }

    pub fn aggregate(&self, view: AggregateView, opts: &AggregateOptions) -> Result<Vec<AggregateRow>> {
        if let Some(root) = &self.cache_root {
            if cache::has_complete_cache_data(root) {
                match self.aggregate_columnar(root, view, opts) {
                    Ok(rows) => return Ok(rows),
                    Err(_) => {}
                }
            }
        }
        self.aggregate_relational(view, opts)
    }

    fn aggregate_relational(&self, view: AggregateView, opts: &AggregateOptions) -> Result<Vec<AggregateRow>> {
        match view {
            AggregateView::Senders => {
                self.store.aggregate_by_participant(false, Some(RecipientType::From), opts.limit, opts.after, opts.before)
            }
            AggregateView::Recipients => {
                self.store.aggregate_by_participant(false, Some(RecipientType::To), opts.limit, opts.after, opts.before)
            }
            AggregateView::Domains => self.store.aggregate_by_participant(true, None, opts.limit, opts.after, opts.before),
            AggregateView::Labels => self.store.aggregate_by_label(opts.limit, opts.after, opts.before),
            AggregateView::Time(granularity) => {
                self.store.aggregate_by_time(granularity.as_sql(), opts.limit, opts.after, opts.before)
            }
        }
    }

    /// Scans the `messages`/`message_recipients`/`message_labels` parquet
    /// shards directly instead of touching SQLite, trading exactness for
    /// avoiding contention with an in-progress sync (§4.8, §4.9).
    fn aggregate_columnar(&self, root: &Path, view: AggregateView, opts: &AggregateOptions) -> Result<Vec<AggregateRow>> {
        let after_millis = opts.after.map(|d| d.timestamp_millis());
        let before_millis = opts.before.map(|d| d.timestamp_millis());

        let message_batches = read_all_year_shards(&root.join("messages"))?;
        let mut allowed_ids: std::collections::HashSet<i64> = Default::default();
        let mut size_by_id: HashMap<i64, i64> = Default::default();
        let mut has_attach_by_id: HashMap<i64, bool> = Default::default();
        let mut time_bucket_by_id: HashMap<i64, String> = Default::default();

        for batch in &message_batches {
            let ids = cache::col_i64(batch, "id");
            let sent_at = cache::col_i64(batch, "sent_at_millis");
            let sizes = cache::col_i64(batch, "size_estimate");
            let has_attachments = cache::col_bool(batch, "has_attachments");
            for i in 0..batch.num_rows() {
                let (Some(id), Some(sent)) = (ids[i], sent_at[i]) else { continue };
                if after_millis.is_some_and(|a| sent <= a) || before_millis.is_some_and(|b| sent >= b) {
                    continue;
                }
                allowed_ids.insert(id);
                size_by_id.insert(id, sizes[i].unwrap_or(0));
                has_attach_by_id.insert(id, has_attachments[i].unwrap_or(false));
                time_bucket_by_id.insert(id, time_bucket(sent, view));
            }
        }

        let mut totals: HashMap<String, (i64, i64, i64)> = Default::default();

        match view {
            AggregateView::Time(_) => {
                for id in &allowed_ids {
                    let key = time_bucket_by_id.get(id).cloned().unwrap_or_default();
                    let entry = totals.entry(key).or_insert((0, 0, 0));
                    entry.0 += 1;
                    entry.1 += size_by_id.get(id).copied().unwrap_or(0);
                    if has_attach_by_id.get(id).copied().unwrap_or(false) {
                        entry.2 += size_by_id.get(id).copied().unwrap_or(0);
                    }
                }
            }
            AggregateView::Labels => {
                let participants = read_parquet_snapshot(&root.join("labels").join("snapshot.parquet"))?;
                let label_names = cache::col_str(&participants, "name");
                let label_ids = cache::col_i64(&participants, "id");
                let mut name_by_id: HashMap<i64, String> = Default::default();
                for i in 0..participants.num_rows() {
                    if let (Some(id), Some(name)) = (label_ids[i], label_names[i].clone()) {
                        name_by_id.insert(id, name);
                    }
                }
                for batch in read_all_flat_shards(&root.join("message_labels"))? {
                    let message_ids = cache::col_i64(&batch, "message_id");
                    let label_ids = cache::col_i64(&batch, "label_id");
                    for i in 0..batch.num_rows() {
                        let (Some(mid), Some(lid)) = (message_ids[i], label_ids[i]) else { continue };
                        if !allowed_ids.contains(&mid) {
                            continue;
                        }
                        let key = name_by_id.get(&lid).cloned().unwrap_or_default();
                        let entry = totals.entry(key).or_insert((0, 0, 0));
                        entry.0 += 1;
                        entry.1 += size_by_id.get(&mid).copied().unwrap_or(0);
                        if has_attach_by_id.get(&mid).copied().unwrap_or(false) {
                            entry.2 += size_by_id.get(&mid).copied().unwrap_or(0);
                        }
                    }
                }
            }
            AggregateView::Senders | AggregateView::Recipients | AggregateView::Domains => {
                let wanted_type = match view {
                    AggregateView::Senders => "from",
                    AggregateView::Recipients => "to",
                    _ => "",
                };
                let participants = read_parquet_snapshot(&root.join("participants").join("snapshot.parquet"))?;
                let p_ids = cache::col_i64(&participants, "id");
                let emails = cache::col_str(&participants, "email_address");
                let domains = cache::col_str(&participants, "domain");
                let mut email_by_id: HashMap<i64, String> = Default::default();
                let mut domain_by_id: HashMap<i64, String> = Default::default();
                for i in 0..participants.num_rows() {
                    if let Some(id) = p_ids[i] {
                        if let Some(e) = emails[i].clone() {
                            email_by_id.insert(id, e);
                        }
                        if let Some(d) = domains[i].clone() {
                            domain_by_id.insert(id, d);
                        }
                    }
                }
                for batch in read_all_flat_shards(&root.join("message_recipients"))? {
                    let message_ids = cache::col_i64(&batch, "message_id");
                    let participant_ids = cache::col_i64(&batch, "participant_id");
                    let recipient_types = cache::col_str(&batch, "recipient_type");
                    for i in 0..batch.num_rows() {
                        let (Some(mid), Some(pid)) = (message_ids[i], participant_ids[i]) else { continue };
                        if !allowed_ids.contains(&mid) {
                            continue;
                        }
                        // Domains counts correspondence across every
                        // recipient role (from/to/cc/bcc), matching the
                        // relational path's `aggregate_by_participant(true,
                        // None, ..)`; senders/recipients stay role-scoped.
                        if view != AggregateView::Domains {
                            let rtype = recipient_types[i].as_deref().unwrap_or_default();
                            if rtype != wanted_type {
                                continue;
                            }
                        }
                        let key = if view == AggregateView::Domains {
                            domain_by_id.get(&pid).cloned().unwrap_or_default()
                        } else {
                            email_by_id.get(&pid).cloned().unwrap_or_default()
                        };
                        let entry = totals.entry(key).or_insert((0, 0, 0));
                        entry.0 += 1;
                        entry.1 += size_by_id.get(&mid).copied().unwrap_or(0);
                        if has_attach_by_id.get(&mid).copied().unwrap_or(false) {
                            entry.2 += size_by_id.get(&mid).copied().unwrap_or(0);
                        }
                    }
                }
            }
        }

        let mut rows: Vec<AggregateRow> = totals
            .into_iter()
            .map(|(key, (count, total_size, attachment_size))| AggregateRow {
                key,
                count,
                total_size,
                attachment_size,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count));
        rows.truncate(opts.limit.max(1) as usize);
        Ok(rows)
    }
}

fn time_bucket(sent_millis: i64, view: AggregateView) -> String {
    let granularity = match view {
        AggregateView::Time(g) => g,
        _ => TimeGranularity::Day,
    };
    let dt = DateTime::<Utc>::from_timestamp_millis(sent_millis).unwrap_or_else(Utc::now);
    match granularity {
        TimeGranularity::Day => dt.format("%Y-%m-%d").to_string(),
        TimeGranularity::Month => dt.format("%Y-%m").to_string(),
        TimeGranularity::Year => dt.format("%Y").to_string(),
    }
}

fn read_all_year_shards(messages_dir: &Path) -> Result<Vec<arrow::record_batch::RecordBatch>> {
    let mut batches = Vec::new();
    if !messages_dir.exists() {
        return Ok(batches);
    }
    let mut year_dirs: Vec<_> = std::fs::read_dir(messages_dir)?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    year_dirs.sort();
    for dir in year_dirs {
        if dir.is_dir() {
            batches.extend(cache::read_parquet_dir(&dir)?);
        }
    }
    Ok(batches)
}

fn read_all_flat_shards(dir: &Path) -> Result<Vec<arrow::record_batch::RecordBatch>> {
    cache::read_parquet_dir(dir)
}

fn read_parquet_snapshot(path: &Path) -> Result<arrow::record_batch::RecordBatch> {
    let dir = path.parent().unwrap();
    let mut batches = cache::read_parquet_dir(dir)?;
    batches.pop().ok_or(crate::error::MsgVaultError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheBuilder;
    use crate::models::SourceType;
    use crate::storage::{NewMessage, NewRecipient};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn message(source_id: i64, provider_id: &str, sent_at: DateTime<Utc>, from_email: &str) -> NewMessage {
        NewMessage {
            source_id,
            source_message_id: provider_id.to_string(),
            source_conversation_id: provider_id.to_string(),
            conversation_title: None,
            subject: Some("hello".to_string()),
            snippet: Some(String::new()),
            sent_at: Some(sent_at),
            received_at: Some(sent_at),
            size_estimate: Some(1000),
            has_attachments: Some(false),
            recipients: vec![NewRecipient {
                recipient_type: RecipientType::From,
                email: from_email.to_string(),
                display_name: None,
            }],
            labels: Vec::new(),
            body_text: None,
            body_html: None,
            raw_bytes: None,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn search_uses_relational_store() {
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store.upsert_source(SourceType::Gmail, "alice@example.com", None).unwrap();
        let sent = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.upsert_message(&message(source.id, "m1", sent, "bob@example.com")).unwrap();

        let engine = QueryEngine::new(&store);
        let results = engine.search("from:bob", 10, 0).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn aggregate_falls_back_to_relational_without_cache() {
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store.upsert_source(SourceType::Gmail, "alice@example.com", None).unwrap();
        let sent = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.upsert_message(&message(source.id, "m1", sent, "bob@example.com")).unwrap();

        let engine = QueryEngine::new(&store);
        let rows = engine.aggregate(AggregateView::Senders, &AggregateOptions::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "bob@example.com");
    }

    #[test]
    fn aggregate_uses_columnar_cache_once_built() {
        let dir = tempdir().unwrap();
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store.upsert_source(SourceType::Gmail, "alice@example.com", None).unwrap();
        let sent = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        store.upsert_message(&message(source.id, "m1", sent, "carol@example.com")).unwrap();

        CacheBuilder::new(dir.path(), &store).build(true).unwrap();

        let engine = QueryEngine::with_cache(&store, dir.path());
        let rows = engine.aggregate(AggregateView::Senders, &AggregateOptions::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "carol@example.com");
    }
}
