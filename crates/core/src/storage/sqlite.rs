use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};

use super::{NewMessage, ProgressFn};
use crate::error::{MsgVaultError, Result};
use crate::models::{
    Attachment, CompressionTag, Message, MessageBody, MessageRaw, Participant, RecipientType,
    Source, SourceType, SyncRun, SyncRunKind, SyncRunStatus,
};

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        CREATE TABLE sources (
            id INTEGER PRIMARY KEY,
            source_type TEXT NOT NULL,
            identifier TEXT NOT NULL,
            display_name TEXT,
            sync_cursor TEXT,
            last_sync_at TEXT,
            UNIQUE(source_type, identifier)
        );

        CREATE TABLE conversations (
            id INTEGER PRIMARY KEY,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            source_conversation_id TEXT NOT NULL,
            title TEXT,
            UNIQUE(source_id, source_conversation_id)
        );

        CREATE TABLE participants (
            id INTEGER PRIMARY KEY,
            email_address TEXT NOT NULL UNIQUE,
            domain TEXT NOT NULL,
            display_name TEXT
        );

        CREATE TABLE messages (
            id INTEGER PRIMARY KEY,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            source_message_id TEXT NOT NULL,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            subject TEXT NOT NULL,
            snippet TEXT NOT NULL,
            sent_at TEXT,
            received_at TEXT,
            size_estimate INTEGER NOT NULL DEFAULT 0,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            deleted_from_source_at TEXT,
            UNIQUE(source_id, source_message_id)
        );

        CREATE INDEX idx_messages_conversation ON messages(conversation_id);
        CREATE INDEX idx_messages_received_at ON messages(received_at);
        CREATE INDEX idx_messages_source ON messages(source_id);

        CREATE TABLE message_bodies (
            message_id INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
            body_text BLOB,
            body_html BLOB
        );

        CREATE TABLE message_raw (
            message_id INTEGER PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
            raw_bytes BLOB NOT NULL,
            compression_tag TEXT NOT NULL
        );

        CREATE TABLE message_recipients (
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            participant_id INTEGER NOT NULL REFERENCES participants(id),
            recipient_type TEXT NOT NULL,
            display_name_snapshot TEXT,
            PRIMARY KEY (message_id, participant_id, recipient_type)
        );

        CREATE INDEX idx_recipients_participant ON message_recipients(participant_id);

        CREATE TABLE labels (
            id INTEGER PRIMARY KEY,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            provider_label_id TEXT,
            UNIQUE(source_id, name)
        );

        CREATE TABLE message_labels (
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            label_id INTEGER NOT NULL REFERENCES labels(id) ON DELETE CASCADE,
            PRIMARY KEY (message_id, label_id)
        );

        CREATE INDEX idx_message_labels_label ON message_labels(label_id);

        CREATE TABLE attachments (
            id INTEGER PRIMARY KEY,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            filename TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            size INTEGER NOT NULL,
            content_hash TEXT,
            storage_path TEXT
        );

        CREATE INDEX idx_attachments_message ON attachments(message_id);
        CREATE INDEX idx_attachments_hash ON attachments(content_hash);

        CREATE TABLE sync_runs (
            id INTEGER PRIMARY KEY,
            source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            status TEXT NOT NULL,
            cursor_before TEXT,
            cursor_current TEXT,
            messages_found INTEGER NOT NULL DEFAULT 0,
            messages_added INTEGER NOT NULL DEFAULT 0,
            messages_skipped INTEGER NOT NULL DEFAULT 0,
            bytes_transferred INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_sync_runs_source ON sync_runs(source_id, started_at DESC);

        CREATE VIRTUAL TABLE messages_fts USING fts5(
            subject,
            snippet,
            body_text,
            participants,
            labels,
            tokenize = 'porter unicode61'
        );
        "#,
    )])
}

/// SQLite-backed relational store (C2). Queryable metadata lives here;
/// attachment bytes live in the content-addressed [`crate::blob::BlobStore`].
pub struct RelationalStore {
    conn: Mutex<Connection>,
}

impl RelationalStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .map_err(|e| MsgVaultError::Config(format!("migration failed: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations()
            .to_latest(&mut conn)
            .map_err(|e| MsgVaultError::Config(format!("migration failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- sources ----------------------------------------------------

    pub fn upsert_source(
        &self,
        source_type: SourceType,
        identifier: &str,
        display_name: Option<&str>,
    ) -> Result<Source> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sources (source_type, identifier, display_name)
             VALUES (?, ?, ?)
             ON CONFLICT(source_type, identifier) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, sources.display_name)",
            params![source_type.as_str(), identifier, display_name],
        )?;
        drop(conn);
        self.get_source_by_identifier(source_type, identifier)?
            .ok_or(MsgVaultError::NotFound)
    }

    pub fn get_source(&self, id: i64) -> Result<Option<Source>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, source_type, identifier, display_name, sync_cursor, last_sync_at
                 FROM sources WHERE id = ?",
                [id],
                row_to_source,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_source_by_identifier(
        &self,
        source_type: SourceType,
        identifier: &str,
    ) -> Result<Option<Source>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, source_type, identifier, display_name, sync_cursor, last_sync_at
                 FROM sources WHERE source_type = ? AND identifier = ?",
                params![source_type.as_str(), identifier],
                row_to_source,
            )
            .optional()?;
        Ok(row)
    }

    /// Looks up a source by identifier alone, ignoring `source_type`.
    /// Convenience for callers (CLI, HTTP) that only have an email/
    /// username and no reason to expect more than one account
    /// registered under it; ambiguous only if the same identifier was
    /// registered under two different source types, in which case the
    /// first by id wins.
    pub fn get_source_by_identifier_any(&self, identifier: &str) -> Result<Option<Source>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, source_type, identifier, display_name, sync_cursor, last_sync_at
                 FROM sources WHERE identifier = ? ORDER BY id LIMIT 1",
                params![identifier],
                row_to_source,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_sources(&self) -> Result<Vec<Source>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, source_type, identifier, display_name, sync_cursor, last_sync_at
             FROM sources ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], row_to_source)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_sync_cursor(&self, source_id: i64, cursor: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sources SET sync_cursor = ?, last_sync_at = ? WHERE id = ?",
            params![cursor, Utc::now().to_rfc3339(), source_id],
        )?;
        Ok(())
    }

    // ---- conversations / participants / labels -----------------------

    fn upsert_conversation(
        conn: &Connection,
        source_id: i64,
        source_conversation_id: &str,
        title: Option<&str>,
    ) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO conversations (source_id, source_conversation_id, title)
             VALUES (?, ?, ?)
             ON CONFLICT(source_id, source_conversation_id) DO UPDATE SET
                title = COALESCE(excluded.title, conversations.title)",
            params![source_id, source_conversation_id, title],
        )?;
        conn.query_row(
            "SELECT id FROM conversations WHERE source_id = ? AND source_conversation_id = ?",
            params![source_id, source_conversation_id],
            |r| r.get(0),
        )
    }

    fn upsert_participant(conn: &Connection, email: &str, display_name: Option<&str>) -> rusqlite::Result<i64> {
        let domain = Participant::domain_of(email);
        conn.execute(
            "INSERT INTO participants (email_address, domain, display_name)
             VALUES (?, ?, ?)
             ON CONFLICT(email_address) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, participants.display_name)",
            params![email, domain, display_name],
        )?;
        conn.query_row(
            "SELECT id FROM participants WHERE email_address = ?",
            [email],
            |r| r.get(0),
        )
    }

    fn upsert_label(
        conn: &Connection,
        source_id: i64,
        name: &str,
        provider_label_id: Option<&str>,
    ) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO labels (source_id, name, provider_label_id)
             VALUES (?, ?, ?)
             ON CONFLICT(source_id, name) DO UPDATE SET
                provider_label_id = COALESCE(excluded.provider_label_id, labels.provider_label_id)",
            params![source_id, name, provider_label_id],
        )?;
        conn.query_row(
            "SELECT id FROM labels WHERE source_id = ? AND name = ?",
            params![source_id, name],
            |r| r.get(0),
        )
    }

    // ---- messages -----------------------------------------------------

    /// Upsert one message and every related row in a single transaction
    /// (§4.2). Re-syncing the same `(source_id, source_message_id)` is
    /// idempotent: recipients, labels and bodies are replaced wholesale.
    pub fn upsert_message(&self, msg: &NewMessage) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let conversation_id = Self::upsert_conversation(
            &tx,
            msg.source_id,
            &msg.source_conversation_id,
            msg.conversation_title.as_deref(),
        )?;

        // Every mutable scalar is bound once via a numbered placeholder
        // and referenced twice: plainly in VALUES (defaulted when the
        // caller doesn't know it yet, for the first-insert case) and
        // under COALESCE in DO UPDATE SET (kept as-is on re-ingest when
        // the incoming value is null, per §4.2).
        tx.execute(
            "INSERT INTO messages
                (source_id, source_message_id, conversation_id, subject, snippet,
                 sent_at, received_at, size_estimate, has_attachments)
             VALUES (?1, ?2, ?3, COALESCE(?4, ''), COALESCE(?5, ''), ?6, ?7, COALESCE(?8, 0), COALESCE(?9, 0))
             ON CONFLICT(source_id, source_message_id) DO UPDATE SET
                conversation_id = ?3,
                subject = COALESCE(?4, messages.subject),
                snippet = COALESCE(?5, messages.snippet),
                sent_at = COALESCE(?6, messages.sent_at),
                received_at = COALESCE(?7, messages.received_at),
                size_estimate = COALESCE(?8, messages.size_estimate),
                has_attachments = COALESCE(?9, messages.has_attachments)",
            params![
                msg.source_id,
                msg.source_message_id,
                conversation_id,
                msg.subject,
                msg.snippet,
                msg.sent_at.map(|d| d.to_rfc3339()),
                msg.received_at.map(|d| d.to_rfc3339()),
                msg.size_estimate,
                msg.has_attachments,
            ],
        )?;

        let (message_id, current_subject, current_snippet): (i64, String, String) = tx.query_row(
            "SELECT id, subject, snippet FROM messages WHERE source_id = ? AND source_message_id = ?",
            params![msg.source_id, msg.source_message_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;

        tx.execute(
            "DELETE FROM message_recipients WHERE message_id = ?",
            [message_id],
        )?;
        for recipient in &msg.recipients {
            let participant_id =
                Self::upsert_participant(&tx, &recipient.email, recipient.display_name.as_deref())?;
            tx.execute(
                "INSERT OR REPLACE INTO message_recipients
                    (message_id, participant_id, recipient_type, display_name_snapshot)
                 VALUES (?, ?, ?, ?)",
                params![
                    message_id,
                    participant_id,
                    recipient.recipient_type.as_str(),
                    recipient.display_name,
                ],
            )?;
        }

        tx.execute(
            "DELETE FROM message_labels WHERE message_id = ?",
            [message_id],
        )?;
        for label in &msg.labels {
            let label_id =
                Self::upsert_label(&tx, msg.source_id, &label.name, label.provider_label_id.as_deref())?;
            tx.execute(
                "INSERT OR IGNORE INTO message_labels (message_id, label_id) VALUES (?, ?)",
                params![message_id, label_id],
            )?;
        }

        if msg.body_text.is_some() || msg.body_html.is_some() {
            let body_text_compressed = msg
                .body_text
                .as_ref()
                .map(|t| zstd::encode_all(t.as_bytes(), 3))
                .transpose()?;
            let body_html_compressed = msg
                .body_html
                .as_ref()
                .map(|t| zstd::encode_all(t.as_bytes(), 3))
                .transpose()?;
            tx.execute(
                "INSERT INTO message_bodies (message_id, body_text, body_html)
                 VALUES (?, ?, ?)
                 ON CONFLICT(message_id) DO UPDATE SET
                    body_text = excluded.body_text,
                    body_html = excluded.body_html",
                params![message_id, body_text_compressed, body_html_compressed],
            )?;
        }

        if let Some(raw) = &msg.raw_bytes {
            use std::io::Write;
            let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(raw)?;
            let compressed = encoder.finish()?;
            tx.execute(
                "INSERT INTO message_raw (message_id, raw_bytes, compression_tag)
                 VALUES (?, ?, ?)
                 ON CONFLICT(message_id) DO UPDATE SET
                    raw_bytes = excluded.raw_bytes,
                    compression_tag = excluded.compression_tag",
                params![message_id, compressed, "zlib"],
            )?;
        }

        tx.execute(
            "DELETE FROM attachments WHERE message_id = ?",
            [message_id],
        )?;
        for attachment in &msg.attachments {
            tx.execute(
                "INSERT INTO attachments
                    (message_id, filename, mime_type, size, content_hash, storage_path)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    message_id,
                    attachment.filename,
                    attachment.mime_type,
                    attachment.size,
                    attachment.content_hash,
                    attachment.storage_path,
                ],
            )?;
        }

        let participants_blob = msg
            .recipients
            .iter()
            .map(|r| r.email.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let labels_blob = msg
            .labels
            .iter()
            .map(|l| l.name.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        tx.execute(
            "DELETE FROM messages_fts WHERE rowid = ?",
            [message_id],
        )?;
        tx.execute(
            "INSERT INTO messages_fts(rowid, subject, snippet, body_text, participants, labels)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                message_id,
                current_subject,
                current_snippet,
                msg.body_text.as_deref().unwrap_or(""),
                participants_blob,
                labels_blob,
            ],
        )?;

        tx.commit()?;
        Ok(message_id)
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, source_id, source_message_id, conversation_id, subject, snippet,
                    sent_at, received_at, size_estimate, has_attachments, deleted_from_source_at
             FROM messages WHERE id = ?",
            [id],
            row_to_message,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_message_by_source_id(
        &self,
        source_id: i64,
        source_message_id: &str,
    ) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, source_id, source_message_id, conversation_id, subject, snippet,
                    sent_at, received_at, size_estimate, has_attachments, deleted_from_source_at
             FROM messages WHERE source_id = ? AND source_message_id = ?",
            params![source_id, source_message_id],
            row_to_message,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_message_body(&self, id: i64) -> Result<Option<MessageBody>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Option<Vec<u8>>, Option<Vec<u8>>)> = conn
            .query_row(
                "SELECT body_text, body_html FROM message_bodies WHERE message_id = ?",
                [id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((text, html)) = row else {
            return Ok(None);
        };
        Ok(Some(MessageBody {
            body_text: text
                .map(|b| zstd::decode_all(b.as_slice()))
                .transpose()?
                .map(|b| String::from_utf8_lossy(&b).into_owned()),
            body_html: html
                .map(|b| zstd::decode_all(b.as_slice()))
                .transpose()?
                .map(|b| String::from_utf8_lossy(&b).into_owned()),
        }))
    }

    pub fn get_message_raw(&self, id: i64) -> Result<Option<MessageRaw>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Vec<u8>, String)> = conn
            .query_row(
                "SELECT raw_bytes, compression_tag FROM message_raw WHERE message_id = ?",
                [id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((compressed, tag)) = row else {
            return Ok(None);
        };
        use std::io::Read;
        let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
        let mut raw_bytes = Vec::new();
        decoder.read_to_end(&mut raw_bytes)?;
        Ok(Some(MessageRaw {
            raw_bytes,
            compression_tag: if tag == "zlib" {
                CompressionTag::Zlib
            } else {
                CompressionTag::None
            },
        }))
    }

    pub fn list_attachments(&self, message_id: i64) -> Result<Vec<Attachment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, message_id, filename, mime_type, size, content_hash, storage_path
             FROM attachments WHERE message_id = ?",
        )?;
        let rows = stmt
            .query_map([message_id], |r| {
                Ok(Attachment {
                    id: r.get(0)?,
                    message_id: r.get(1)?,
                    filename: r.get(2)?,
                    mime_type: r.get(3)?,
                    size: r.get(4)?,
                    content_hash: r.get(5)?,
                    storage_path: r.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete message rows by provider-assigned id, either hard (for
    /// batch-permanent deletion, §4.7) or as a soft tombstone.
    pub fn delete_messages_by_source_ids(
        &self,
        source_id: i64,
        provider_ids: &[String],
        hard_delete: bool,
    ) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let mut deleted = 0u64;
        for provider_id in provider_ids {
            if hard_delete {
                deleted += conn.execute(
                    "DELETE FROM messages WHERE source_id = ? AND source_message_id = ?",
                    params![source_id, provider_id],
                )? as u64;
            } else {
                deleted += conn.execute(
                    "UPDATE messages SET deleted_from_source_at = ?
                     WHERE source_id = ? AND source_message_id = ? AND deleted_from_source_at IS NULL",
                    params![Utc::now().to_rfc3339(), source_id, provider_id],
                )? as u64;
            }
        }
        Ok(deleted)
    }

    /// Uniform random sample of `n` message ids, for integrity audits (§6).
    pub fn sample_message_ids(&self, n: u32) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM messages ORDER BY RANDOM() LIMIT ?")?;
        let rows = stmt
            .query_map([n], |r| r.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- full-text search ---------------------------------------------

    pub fn search_fts(&self, query: &str, limit: u32, offset: u32) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT rowid FROM messages_fts WHERE messages_fts MATCH ?
             ORDER BY rank LIMIT ? OFFSET ?",
        )?;
        let rows = stmt
            .query_map(params![query, limit, offset], |r| r.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Whether any message lacks an FTS row, e.g. after an import that
    /// bypassed [`RelationalStore::upsert_message`]'s indexing step (§4.2).
    pub fn needs_backfill(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        let indexed: i64 = conn.query_row("SELECT COUNT(*) FROM messages_fts", [], |r| r.get(0))?;
        Ok(indexed < total)
    }

    /// Re-index every message missing an FTS row, in batches, reporting
    /// `(done, total)` after each batch. Tolerant of being retried after
    /// a partial run: already-indexed rows are skipped, not duplicated.
    pub fn backfill_fts(&self, batch_size: u32, mut progress: Box<ProgressFn<'_>>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let total: u64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        let mut done: u64 = 0;

        loop {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.subject, m.snippet, COALESCE(b.body_text, X'')
                 FROM messages m
                 LEFT JOIN message_bodies b ON b.message_id = m.id
                 WHERE m.id NOT IN (SELECT rowid FROM messages_fts)
                 LIMIT ?",
            )?;
            let batch: Vec<(i64, String, String, Option<Vec<u8>>)> = stmt
                .query_map([batch_size], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            if batch.is_empty() {
                break;
            }

            for (message_id, subject, snippet, compressed_body) in &batch {
                let body_text = compressed_body
                    .as_ref()
                    .filter(|b| !b.is_empty())
                    .and_then(|b| zstd::decode_all(b.as_slice()).ok())
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();

                let participants: String = conn.query_row(
                    "SELECT COALESCE(GROUP_CONCAT(p.email_address, ' '), '')
                     FROM message_recipients mr JOIN participants p ON p.id = mr.participant_id
                     WHERE mr.message_id = ?",
                    [message_id],
                    |r| r.get(0),
                )?;
                let labels: String = conn.query_row(
                    "SELECT COALESCE(GROUP_CONCAT(l.name, ' '), '')
                     FROM message_labels ml JOIN labels l ON l.id = ml.label_id
                     WHERE ml.message_id = ?",
                    [message_id],
                    |r| r.get(0),
                )?;

                conn.execute(
                    "INSERT INTO messages_fts(rowid, subject, snippet, body_text, participants, labels)
                     VALUES (?, ?, ?, ?, ?, ?)",
                    params![message_id, subject, snippet, body_text, participants, labels],
                )?;
                done += 1;
            }
            progress(done, total);
        }

        Ok(())
    }

    // ---- sync runs ------------------------------------------------------

    pub fn start_sync(
        &self,
        source_id: i64,
        kind: SyncRunKind,
        cursor_before: Option<&str>,
    ) -> Result<SyncRun> {
        let conn = self.conn.lock().unwrap();
        if conn
            .query_row(
                "SELECT 1 FROM sync_runs WHERE source_id = ? AND status = 'active'",
                [source_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some()
        {
            return Err(MsgVaultError::Conflict);
        }

        let started_at = Utc::now();
        conn.execute(
            "INSERT INTO sync_runs (source_id, kind, started_at, status, cursor_before)
             VALUES (?, ?, ?, 'active', ?)",
            params![source_id, kind.as_str(), started_at.to_rfc3339(), cursor_before],
        )?;
        let id = conn.last_insert_rowid();
        Ok(SyncRun {
            id,
            source_id,
            kind,
            started_at,
            completed_at: None,
            status: SyncRunStatus::Active,
            cursor_before: cursor_before.map(String::from),
            cursor_current: None,
            messages_found: 0,
            messages_added: 0,
            messages_skipped: 0,
            bytes_transferred: 0,
            errors: 0,
        })
    }

    pub fn update_sync_checkpoint(
        &self,
        run_id: i64,
        cursor_current: Option<&str>,
        found: i64,
        added: i64,
        skipped: i64,
        bytes: i64,
        errors: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_runs SET
                cursor_current = ?,
                messages_found = messages_found + ?,
                messages_added = messages_added + ?,
                messages_skipped = messages_skipped + ?,
                bytes_transferred = bytes_transferred + ?,
                errors = errors + ?
             WHERE id = ?",
            params![cursor_current, found, added, skipped, bytes, errors, run_id],
        )?;
        Ok(())
    }

    pub fn complete_sync(&self, run_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_runs SET status = 'completed', completed_at = ? WHERE id = ?",
            params![Utc::now().to_rfc3339(), run_id],
        )?;
        Ok(())
    }

    pub fn fail_sync(&self, run_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_runs SET status = 'failed', completed_at = ? WHERE id = ?",
            params![Utc::now().to_rfc3339(), run_id],
        )?;
        Ok(())
    }

    pub fn get_active_sync(&self, source_id: i64) -> Result<Option<SyncRun>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, source_id, kind, started_at, completed_at, status, cursor_before,
                    cursor_current, messages_found, messages_added, messages_skipped,
                    bytes_transferred, errors
             FROM sync_runs WHERE source_id = ? AND status = 'active'",
            [source_id],
            row_to_sync_run,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_last_successful_sync(&self, source_id: i64) -> Result<Option<SyncRun>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, source_id, kind, started_at, completed_at, status, cursor_before,
                    cursor_current, messages_found, messages_added, messages_skipped,
                    bytes_transferred, errors
             FROM sync_runs WHERE source_id = ? AND status = 'completed'
             ORDER BY started_at DESC LIMIT 1",
            [source_id],
            row_to_sync_run,
        )
        .optional()
        .map_err(Into::into)
    }

    // ---- aggregate stats -------------------------------------------------

    pub fn total_message_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?)
    }

    pub fn max_message_id(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COALESCE(MAX(id), 0) FROM messages", [], |r| r.get(0))?)
    }

    /// Greatest message id with a non-null `sent_at`; the value the
    /// cache builder compares its checkpoint against (§4.8), since
    /// rows without `sent_at` are never exported.
    pub fn max_cacheable_message_id(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM messages WHERE sent_at IS NOT NULL",
            [],
            |r| r.get(0),
        )?)
    }

    /// Whether `message_id` already has a stored raw MIME blob, used by
    /// the sync engine's metadata-only upgrade path (§4.6 step 2a).
    pub fn has_raw(&self, message_id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row("SELECT 1 FROM message_raw WHERE message_id = ?", [message_id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Remove a source and everything it owns (§3: "destroyed only by
    /// explicit `remove-account`, which cascades"). Blob files referenced
    /// by its attachments are left on disk; orphan collection is
    /// intentionally out of scope (§9, open question 1).
    pub fn remove_source(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM sources WHERE id = ?", [id])?;
        if deleted == 0 {
            return Err(MsgVaultError::NotFound);
        }
        Ok(())
    }

    /// Replace the label set attached to one message, used by
    /// incremental sync's label-mutation handling (§4.6).
    pub fn replace_message_labels(
        &self,
        source_id: i64,
        message_id: i64,
        labels: &[super::NewLabel],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM message_labels WHERE message_id = ?", [message_id])?;
        for label in labels {
            let label_id = Self::upsert_label(&tx, source_id, &label.name, label.provider_label_id.as_deref())?;
            tx.execute(
                "INSERT OR IGNORE INTO message_labels (message_id, label_id) VALUES (?, ?)",
                params![message_id, label_id],
            )?;
        }
        let labels_blob = labels.iter().map(|l| l.name.as_str()).collect::<Vec<_>>().join(" ");
        tx.execute(
            "UPDATE messages_fts SET labels = ? WHERE rowid = ?",
            params![labels_blob, message_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ---- detail / aggregate reads for the query engine (C9, §4.9) ------

    pub fn get_message_recipients(&self, message_id: i64) -> Result<Vec<super::RecipientRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT mr.participant_id, mr.recipient_type, p.email_address,
                    COALESCE(mr.display_name_snapshot, p.display_name)
             FROM message_recipients mr JOIN participants p ON p.id = mr.participant_id
             WHERE mr.message_id = ?",
        )?;
        let rows = stmt
            .query_map([message_id], |r| {
                let kind: String = r.get(1)?;
                Ok(super::RecipientRow {
                    participant_id: r.get(0)?,
                    recipient_type: RecipientType::parse(&kind).unwrap_or(RecipientType::To),
                    email: r.get(2)?,
                    display_name: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_message_labels(&self, message_id: i64) -> Result<Vec<crate::models::Label>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT l.id, l.source_id, l.name, l.provider_label_id
             FROM message_labels ml JOIN labels l ON l.id = ml.label_id
             WHERE ml.message_id = ?",
        )?;
        let rows = stmt
            .query_map([message_id], |r| {
                Ok(crate::models::Label {
                    id: r.get(0)?,
                    source_id: r.get(1)?,
                    name: r.get(2)?,
                    provider_label_id: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Full detail for one message: addresses, labels, attachments and
    /// decoded body (§4.9 `GetMessage`).
    pub fn get_message_detail(&self, id: i64) -> Result<Option<super::MessageDetail>> {
        let Some(message) = self.get_message(id)? else {
            return Ok(None);
        };
        let recipients = self.get_message_recipients(id)?;
        let labels = self.get_message_labels(id)?;
        let attachments = self.list_attachments(id)?;
        let body = self.get_message_body(id)?.unwrap_or_default();
        Ok(Some(super::MessageDetail {
            message,
            recipients,
            labels,
            attachments,
            body_text: body.body_text,
            body_html: body.body_html,
        }))
    }

    /// Search messages by structured filter and optional free-text FTS
    /// terms, newest first (§4.9 `Search`).
    pub fn search_messages(
        &self,
        filter: &super::MessageFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();

        let mut joins = String::new();
        let mut wheres: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        let address_clause = |joins: &mut String, wheres: &mut Vec<String>, args: &mut Vec<Box<dyn rusqlite::ToSql>>, kind: &str, emails: &[String]| {
            for email in emails {
                let alias = format!("addr_{}", args.len());
                joins.push_str(&format!(
                    " JOIN message_recipients {alias} ON {alias}.message_id = m.id AND {alias}.recipient_type = '{kind}'
                      JOIN participants p_{alias} ON p_{alias}.id = {alias}.participant_id"
                ));
                wheres.push(format!("p_{alias}.email_address LIKE ?"));
                args.push(Box::new(format!("%{email}%")));
            }
        };
        address_clause(&mut joins, &mut wheres, &mut args, "from", &filter.from);
        address_clause(&mut joins, &mut wheres, &mut args, "to", &filter.to);
        address_clause(&mut joins, &mut wheres, &mut args, "cc", &filter.cc);
        address_clause(&mut joins, &mut wheres, &mut args, "bcc", &filter.bcc);

        for label in &filter.label {
            let alias = format!("lbl_{}", args.len());
            joins.push_str(&format!(
                " JOIN message_labels {alias} ON {alias}.message_id = m.id
                  JOIN labels l_{alias} ON l_{alias}.id = {alias}.label_id"
            ));
            wheres.push(format!("l_{alias}.name = ?"));
            args.push(Box::new(label.clone()));
        }

        for subject in &filter.subject {
            wheres.push("m.subject LIKE ?".to_string());
            args.push(Box::new(format!("%{subject}%")));
        }
        if let Some(has) = filter.has_attachment {
            wheres.push("m.has_attachments = ?".to_string());
            args.push(Box::new(has));
        }
        if let Some(before) = filter.before {
            wheres.push("m.sent_at < ?".to_string());
            args.push(Box::new(before.to_rfc3339()));
        }
        if let Some(after) = filter.after {
            wheres.push("m.sent_at > ?".to_string());
            args.push(Box::new(after.to_rfc3339()));
        }
        if let Some(larger) = filter.larger {
            wheres.push("m.size_estimate > ?".to_string());
            args.push(Box::new(larger));
        }
        if let Some(smaller) = filter.smaller {
            wheres.push("m.size_estimate < ?".to_string());
            args.push(Box::new(smaller));
        }

        let fts_query = filter.free_text.join(" ");
        let order_by = if fts_query.is_empty() {
            "m.sent_at DESC".to_string()
        } else {
            joins.push_str(" JOIN messages_fts fts ON fts.rowid = m.id");
            wheres.push("fts MATCH ?".to_string());
            args.push(Box::new(fts_query));
            "rank".to_string()
        };

        let where_clause = if wheres.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", wheres.join(" AND "))
        };

        let sql = format!(
            "SELECT DISTINCT m.id, m.source_id, m.source_message_id, m.conversation_id, m.subject,
                    m.snippet, m.sent_at, m.received_at, m.size_estimate, m.has_attachments,
                    m.deleted_from_source_at
             FROM messages m {joins} {where_clause}
             ORDER BY {order_by} LIMIT ? OFFSET ?"
        );

        args.push(Box::new(limit));
        args.push(Box::new(offset));

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `senders`/`recipients`/`domains`/`labels` aggregate views (§4.9).
    pub fn aggregate_by_participant(
        &self,
        by_domain: bool,
        recipient_type: Option<RecipientType>,
        limit: u32,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<super::AggregateRow>> {
        let conn = self.conn.lock().unwrap();
        let key_expr = if by_domain { "p.domain" } else { "p.email_address" };
        let mut wheres = vec!["1=1".to_string()];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(kind) = recipient_type {
            wheres.push("mr.recipient_type = ?".to_string());
            args.push(Box::new(kind.as_str().to_string()));
        }
        if let Some(after) = after {
            wheres.push("m.sent_at > ?".to_string());
            args.push(Box::new(after.to_rfc3339()));
        }
        if let Some(before) = before {
            wheres.push("m.sent_at < ?".to_string());
            args.push(Box::new(before.to_rfc3339()));
        }
        let sql = format!(
            "SELECT {key_expr} AS key, COUNT(DISTINCT m.id) AS cnt, COALESCE(SUM(m.size_estimate), 0) AS sz,
                    COALESCE(SUM(CASE WHEN m.has_attachments THEN m.size_estimate ELSE 0 END), 0) AS attach_sz
             FROM message_recipients mr
             JOIN participants p ON p.id = mr.participant_id
             JOIN messages m ON m.id = mr.message_id
             WHERE {}
             GROUP BY key
             ORDER BY cnt DESC
             LIMIT ?",
            wheres.join(" AND ")
        );
        args.push(Box::new(limit));
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |r| {
                Ok(super::AggregateRow {
                    key: r.get(0)?,
                    count: r.get(1)?,
                    total_size: r.get(2)?,
                    attachment_size: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn aggregate_by_label(
        &self,
        limit: u32,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<super::AggregateRow>> {
        let conn = self.conn.lock().unwrap();
        let mut wheres = vec!["1=1".to_string()];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(after) = after {
            wheres.push("m.sent_at > ?".to_string());
            args.push(Box::new(after.to_rfc3339()));
        }
        if let Some(before) = before {
            wheres.push("m.sent_at < ?".to_string());
            args.push(Box::new(before.to_rfc3339()));
        }
        let sql = format!(
            "SELECT l.name AS key, COUNT(DISTINCT m.id), COALESCE(SUM(m.size_estimate), 0),
                    COALESCE(SUM(CASE WHEN m.has_attachments THEN m.size_estimate ELSE 0 END), 0)
             FROM message_labels ml
             JOIN labels l ON l.id = ml.label_id
             JOIN messages m ON m.id = ml.message_id
             WHERE {}
             GROUP BY key
             ORDER BY 2 DESC
             LIMIT ?",
            wheres.join(" AND ")
        );
        args.push(Box::new(limit));
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |r| {
                Ok(super::AggregateRow {
                    key: r.get(0)?,
                    count: r.get(1)?,
                    total_size: r.get(2)?,
                    attachment_size: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Time-series aggregate, bucketed by `granularity` (§4.9 `time` view).
    pub fn aggregate_by_time(
        &self,
        granularity: &str,
        limit: u32,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<super::AggregateRow>> {
        let conn = self.conn.lock().unwrap();
        let format_spec = match granularity {
            "year" => "%Y",
            "month" => "%Y-%m",
            _ => "%Y-%m-%d",
        };
        let mut wheres = vec!["m.sent_at IS NOT NULL".to_string()];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(format_spec.to_string())];
        if let Some(after) = after {
            wheres.push("m.sent_at > ?".to_string());
            args.push(Box::new(after.to_rfc3339()));
        }
        if let Some(before) = before {
            wheres.push("m.sent_at < ?".to_string());
            args.push(Box::new(before.to_rfc3339()));
        }
        let sql = format!(
            "SELECT strftime(?, m.sent_at) AS key, COUNT(*), COALESCE(SUM(m.size_estimate), 0),
                    COALESCE(SUM(CASE WHEN m.has_attachments THEN m.size_estimate ELSE 0 END), 0)
             FROM messages m
             WHERE {}
             GROUP BY key
             ORDER BY key DESC
             LIMIT ?",
            wheres.join(" AND ")
        );
        args.push(Box::new(limit));
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |r| {
                Ok(super::AggregateRow {
                    key: r.get(0)?,
                    count: r.get(1)?,
                    total_size: r.get(2)?,
                    attachment_size: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn total_stats(&self) -> Result<super::TotalStats> {
        let conn = self.conn.lock().unwrap();
        let sources: i64 = conn.query_row("SELECT COUNT(*) FROM sources", [], |r| r.get(0))?;
        let messages: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        let attachments: i64 = conn.query_row("SELECT COUNT(*) FROM attachments", [], |r| r.get(0))?;
        let total_size: i64 = conn.query_row("SELECT COALESCE(SUM(size_estimate), 0) FROM messages", [], |r| r.get(0))?;
        Ok(super::TotalStats {
            sources,
            messages,
            attachments,
            total_size,
        })
    }

    // ---- cache export reads (C8, §4.8) ---------------------------------

    pub fn export_messages_since(&self, last_id: i64) -> Result<Vec<super::MessageExportRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, source_id, conversation_id, subject, snippet, sent_at, received_at,
                    size_estimate, has_attachments, deleted_from_source_at
             FROM messages WHERE id > ? AND sent_at IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt
            .query_map([last_id], |r| {
                let sent_at: String = r.get(5)?;
                let received_at: Option<String> = r.get(6)?;
                let deleted_from_source_at: Option<String> = r.get(9)?;
                Ok(super::MessageExportRow {
                    id: r.get(0)?,
                    source_id: r.get(1)?,
                    conversation_id: r.get(2)?,
                    subject: r.get(3)?,
                    snippet: r.get(4)?,
                    sent_at: parse_rfc3339(&sent_at).unwrap_or_else(Utc::now),
                    received_at: received_at.and_then(|s| parse_rfc3339(&s)),
                    size_estimate: r.get(7)?,
                    has_attachments: r.get(8)?,
                    deleted_from_source_at: deleted_from_source_at.and_then(|s| parse_rfc3339(&s)),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn export_message_recipients_since(&self, last_id: i64) -> Result<Vec<super::RecipientExportRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT mr.message_id, mr.participant_id, mr.recipient_type, mr.display_name_snapshot
             FROM message_recipients mr JOIN messages m ON m.id = mr.message_id
             WHERE mr.message_id > ? AND m.sent_at IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([last_id], |r| {
                Ok(super::RecipientExportRow {
                    message_id: r.get(0)?,
                    participant_id: r.get(1)?,
                    recipient_type: r.get(2)?,
                    display_name_snapshot: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn export_message_labels_since(&self, last_id: i64) -> Result<Vec<super::LabelMembershipExportRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ml.message_id, ml.label_id FROM message_labels ml
             JOIN messages m ON m.id = ml.message_id
             WHERE ml.message_id > ? AND m.sent_at IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([last_id], |r| {
                Ok(super::LabelMembershipExportRow {
                    message_id: r.get(0)?,
                    label_id: r.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn export_attachments_since(&self, last_id: i64) -> Result<Vec<Attachment>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.message_id, a.filename, a.mime_type, a.size, a.content_hash, a.storage_path
             FROM attachments a JOIN messages m ON m.id = a.message_id
             WHERE a.message_id > ? AND m.sent_at IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([last_id], |r| {
                Ok(Attachment {
                    id: r.get(0)?,
                    message_id: r.get(1)?,
                    filename: r.get(2)?,
                    mime_type: r.get(3)?,
                    size: r.get(4)?,
                    content_hash: r.get(5)?,
                    storage_path: r.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn export_participants(&self) -> Result<Vec<Participant>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, email_address, domain, display_name FROM participants ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Participant {
                    id: r.get(0)?,
                    email_address: r.get(1)?,
                    domain: r.get(2)?,
                    display_name: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn export_labels(&self) -> Result<Vec<crate::models::Label>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, source_id, name, provider_label_id FROM labels ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(crate::models::Label {
                    id: r.get(0)?,
                    source_id: r.get(1)?,
                    name: r.get(2)?,
                    provider_label_id: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn export_conversations(&self) -> Result<Vec<crate::models::Conversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, source_id, source_conversation_id, title FROM conversations ORDER BY id")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(crate::models::Conversation {
                    id: r.get(0)?,
                    source_id: r.get(1)?,
                    source_conversation_id: r.get(2)?,
                    title: r.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_source(row: &rusqlite::Row) -> rusqlite::Result<Source> {
    let source_type: String = row.get(1)?;
    let last_sync_at: Option<String> = row.get(5)?;
    Ok(Source {
        id: row.get(0)?,
        source_type: SourceType::parse(&source_type).unwrap_or(SourceType::Imap),
        identifier: row.get(2)?,
        display_name: row.get(3)?,
        sync_cursor: row.get(4)?,
        last_sync_at: last_sync_at.and_then(|s| parse_rfc3339(&s)),
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let sent_at: Option<String> = row.get(6)?;
    let received_at: Option<String> = row.get(7)?;
    let deleted_from_source_at: Option<String> = row.get(10)?;
    Ok(Message {
        id: row.get(0)?,
        source_id: row.get(1)?,
        source_message_id: row.get(2)?,
        conversation_id: row.get(3)?,
        subject: row.get(4)?,
        snippet: row.get(5)?,
        sent_at: sent_at.and_then(|s| parse_rfc3339(&s)),
        received_at: received_at.and_then(|s| parse_rfc3339(&s)),
        size_estimate: row.get(8)?,
        has_attachments: row.get(9)?,
        deleted_from_source_at: deleted_from_source_at.and_then(|s| parse_rfc3339(&s)),
    })
}

fn row_to_sync_run(row: &rusqlite::Row) -> rusqlite::Result<SyncRun> {
    let kind: String = row.get(2)?;
    let started_at: String = row.get(3)?;
    let completed_at: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(SyncRun {
        id: row.get(0)?,
        source_id: row.get(1)?,
        kind: SyncRunKind::parse(&kind).unwrap_or(SyncRunKind::Full),
        started_at: parse_rfc3339(&started_at).unwrap_or_else(Utc::now),
        completed_at: completed_at.and_then(|s| parse_rfc3339(&s)),
        status: SyncRunStatus::parse(&status).unwrap_or(SyncRunStatus::Failed),
        cursor_before: row.get(6)?,
        cursor_current: row.get(7)?,
        messages_found: row.get(8)?,
        messages_added: row.get(9)?,
        messages_skipped: row.get(10)?,
        bytes_transferred: row.get(11)?,
        errors: row.get(12)?,
    })
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

// `recipient_type` is read back via joins elsewhere; expose the parse
// helper here so callers resolving raw rows don't duplicate it.
pub fn parse_recipient_type(s: &str) -> Option<RecipientType> {
    RecipientType::parse(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NewLabel, NewRecipient};

    fn new_message(source_id: i64, source_message_id: &str) -> NewMessage {
        NewMessage {
            source_id,
            source_message_id: source_message_id.to_string(),
            source_conversation_id: "conv-1".to_string(),
            conversation_title: Some("Hello thread".to_string()),
            subject: Some("Hello".to_string()),
            snippet: Some("Hello preview".to_string()),
            sent_at: Some(Utc::now()),
            received_at: Some(Utc::now()),
            size_estimate: Some(1024),
            has_attachments: Some(false),
            recipients: vec![
                NewRecipient {
                    recipient_type: RecipientType::From,
                    email: "alice@example.com".to_string(),
                    display_name: Some("Alice".to_string()),
                },
                NewRecipient {
                    recipient_type: RecipientType::To,
                    email: "bob@example.com".to_string(),
                    display_name: None,
                },
            ],
            labels: vec![NewLabel {
                name: "INBOX".to_string(),
                provider_label_id: Some("INBOX".to_string()),
            }],
            body_text: Some("Hello Bob, this is the body.".to_string()),
            body_html: None,
            raw_bytes: Some(b"From: alice@example.com\r\n\r\nbody".to_vec()),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn upsert_source_is_idempotent() {
        let store = RelationalStore::open_in_memory().unwrap();
        let s1 = store
            .upsert_source(SourceType::Gmail, "alice@example.com", Some("Alice"))
            .unwrap();
        let s2 = store
            .upsert_source(SourceType::Gmail, "alice@example.com", None)
            .unwrap();
        assert_eq!(s1.id, s2.id);
        assert_eq!(s2.display_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn upsert_message_round_trips_body_and_recipients() {
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store
            .upsert_source(SourceType::Gmail, "alice@example.com", None)
            .unwrap();

        let id = store.upsert_message(&new_message(source.id, "msg-1")).unwrap();
        let message = store.get_message(id).unwrap().unwrap();
        assert_eq!(message.subject, "Hello");

        let body = store.get_message_body(id).unwrap().unwrap();
        assert_eq!(body.body_text.as_deref(), Some("Hello Bob, this is the body."));

        let raw = store.get_message_raw(id).unwrap().unwrap();
        assert!(raw.raw_bytes.starts_with(b"From: alice@example.com"));
    }

    #[test]
    fn upsert_message_is_idempotent_on_source_message_id() {
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store
            .upsert_source(SourceType::Gmail, "alice@example.com", None)
            .unwrap();

        let id1 = store.upsert_message(&new_message(source.id, "msg-1")).unwrap();
        let id2 = store.upsert_message(&new_message(source.id, "msg-1")).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.total_message_count().unwrap(), 1);
    }

    #[test]
    fn upsert_message_preserves_sent_at_on_metadata_only_reingest() {
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store
            .upsert_source(SourceType::Gmail, "alice@example.com", None)
            .unwrap();

        let id = store.upsert_message(&new_message(source.id, "msg-1")).unwrap();
        let first = store.get_message(id).unwrap().unwrap();
        assert!(first.sent_at.is_some());

        let mut metadata_only = new_message(source.id, "msg-1");
        metadata_only.sent_at = None;
        metadata_only.received_at = None;
        let id2 = store.upsert_message(&metadata_only).unwrap();
        assert_eq!(id, id2);

        let after = store.get_message(id).unwrap().unwrap();
        assert_eq!(after.sent_at, first.sent_at);
        assert_eq!(after.received_at, first.received_at);
    }

    #[test]
    fn upsert_message_preserves_text_scalars_on_metadata_only_reingest() {
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store
            .upsert_source(SourceType::Gmail, "alice@example.com", None)
            .unwrap();

        let id = store.upsert_message(&new_message(source.id, "msg-1")).unwrap();
        let first = store.get_message(id).unwrap().unwrap();
        assert_eq!(first.subject, "Hello");
        assert_eq!(first.snippet, "Hello preview");
        assert_eq!(first.size_estimate, 1024);
        assert!(!first.has_attachments);

        let mut metadata_only = new_message(source.id, "msg-1");
        metadata_only.subject = None;
        metadata_only.snippet = None;
        metadata_only.size_estimate = None;
        metadata_only.has_attachments = None;
        let id2 = store.upsert_message(&metadata_only).unwrap();
        assert_eq!(id, id2);

        let after = store.get_message(id).unwrap().unwrap();
        assert_eq!(after.subject, first.subject);
        assert_eq!(after.snippet, first.snippet);
        assert_eq!(after.size_estimate, first.size_estimate);
        assert_eq!(after.has_attachments, first.has_attachments);

        // The FTS mirror must stay in sync with the preserved subject,
        // not regress to blank because this round's `NewMessage` didn't
        // know it.
        let results = store.search_fts("Hello", 10, 0).unwrap();
        assert_eq!(results, vec![id]);
    }

    #[test]
    fn search_fts_finds_subject_and_body_terms() {
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store
            .upsert_source(SourceType::Gmail, "alice@example.com", None)
            .unwrap();
        let id = store.upsert_message(&new_message(source.id, "msg-1")).unwrap();

        let results = store.search_fts("Bob", 10, 0).unwrap();
        assert_eq!(results, vec![id]);

        let results = store.search_fts("nonexistent-term", 10, 0).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn sync_run_lifecycle_enforces_single_flight() {
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store
            .upsert_source(SourceType::Gmail, "alice@example.com", None)
            .unwrap();

        let run = store.start_sync(source.id, SyncRunKind::Full, None).unwrap();
        assert!(store.start_sync(source.id, SyncRunKind::Full, None).is_err());

        store
            .update_sync_checkpoint(run.id, Some("cursor-2"), 10, 8, 2, 4096, 0)
            .unwrap();
        store.complete_sync(run.id).unwrap();

        assert!(store.get_active_sync(source.id).unwrap().is_none());
        let last = store.get_last_successful_sync(source.id).unwrap().unwrap();
        assert_eq!(last.messages_added, 8);

        // A new run can now start.
        store.start_sync(source.id, SyncRunKind::Incremental, Some("cursor-2")).unwrap();
    }

    #[test]
    fn needs_backfill_detects_missing_fts_rows() {
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store
            .upsert_source(SourceType::Gmail, "alice@example.com", None)
            .unwrap();
        store.upsert_message(&new_message(source.id, "msg-1")).unwrap();
        assert!(!store.needs_backfill().unwrap());

        // Simulate an import path that bypassed FTS indexing.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute("DELETE FROM messages_fts", []).unwrap();
        }
        assert!(store.needs_backfill().unwrap());

        let mut calls = Vec::new();
        store
            .backfill_fts(100, Box::new(|done, total| calls.push((done, total))))
            .unwrap();
        assert!(!store.needs_backfill().unwrap());
        assert_eq!(calls.last(), Some(&(1, 1)));
    }

    #[test]
    fn delete_messages_by_source_ids_hard_deletes() {
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store
            .upsert_source(SourceType::Gmail, "alice@example.com", None)
            .unwrap();
        store.upsert_message(&new_message(source.id, "msg-1")).unwrap();

        let deleted = store
            .delete_messages_by_source_ids(source.id, &["msg-1".to_string()], true)
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.total_message_count().unwrap(), 0);
    }
}
