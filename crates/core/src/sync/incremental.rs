//! Incremental sync (§4.6 "Incremental sync").

use std::time::Instant;

use super::{MAX_RUN_ERRORS, ProgressSink, RunCounters, SyncContext, ingest_one};
use crate::error::{MsgVaultError, Result};
use crate::models::{SyncRunKind, SyncSummary};

pub fn sync_incremental(
    ctx: &SyncContext,
    source_id: i64,
    sink: &mut dyn ProgressSink,
) -> Result<SyncSummary> {
    let start = Instant::now();
    sink.on_start(None);

    let source = ctx
        .store
        .get_source(source_id)?
        .ok_or(MsgVaultError::NotFound)?;
    let cursor = source.sync_cursor.clone().ok_or(MsgVaultError::HistoryExpired)?;

    let run = ctx.store.start_sync(source_id, SyncRunKind::Incremental, Some(&cursor))?;

    let mut totals = RunCounters::default();
    let mut page_token: Option<String> = None;
    let mut latest_cursor = cursor.clone();

    let result = (|| -> Result<()> {
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(MsgVaultError::Cancelled);
            }

            let page = ctx.remote.list_history_since(&latest_cursor, page_token.as_deref())?;
            totals.found += (page.added_message_ids.len() + page.deleted_message_ids.len()) as u64;

            for provider_id in &page.added_message_ids {
                if ctx.cancel.is_cancelled() {
                    return Err(MsgVaultError::Cancelled);
                }
                let raw = ctx.remote.get_raw_message(provider_id)?;
                let labels = ctx
                    .remote
                    .get_message_label_ids(provider_id)
                    .unwrap_or_default();
                match ingest_one(ctx, source_id, provider_id, provider_id, &raw, &labels, sink) {
                    Ok(bytes) => {
                        totals.added += 1;
                        totals.bytes += bytes;
                    }
                    Err(e) if super::is_retryable_class(&e) => {
                        totals.errors += 1;
                        sink.on_error(&e);
                        if totals.errors > MAX_RUN_ERRORS {
                            return Err(MsgVaultError::TooManyErrors(totals.errors));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            if !page.deleted_message_ids.is_empty() {
                ctx.store
                    .delete_messages_by_source_ids(source_id, &page.deleted_message_ids, false)?;
            }

            sink.on_progress(totals.found, totals.added, totals.skipped);

            if let Some(history_id) = &page.history_id {
                latest_cursor = history_id.clone();
            }

            ctx.store.update_sync_checkpoint(
                run.id,
                Some(&latest_cursor),
                0,
                totals.added as i64,
                totals.skipped as i64,
                totals.bytes as i64,
                totals.errors as i64,
            )?;

            page_token = page.next_page_token.clone();
            if page_token.is_none() {
                break;
            }
        }
        Ok(())
    })();

    let summary = SyncSummary {
        duration_ms: start.elapsed().as_millis() as u64,
        found: totals.found,
        added: totals.added,
        skipped: totals.skipped,
        bytes: totals.bytes,
        errors: totals.errors,
        was_resumed: false,
    };

    match result {
        Ok(()) => {
            ctx.store.complete_sync(run.id)?;
            ctx.store.update_sync_cursor(source_id, Some(&latest_cursor))?;
            sink.on_complete(&summary);
            Ok(summary)
        }
        Err(MsgVaultError::Cancelled) => {
            sink.on_complete(&summary);
            Ok(summary)
        }
        Err(MsgVaultError::HistoryExpired) => {
            // Caller's signal to fall back to a full sync (§4.6); no
            // partial state beyond what was already checkpointed.
            ctx.store.fail_sync(run.id)?;
            Err(MsgVaultError::HistoryExpired)
        }
        Err(e) => {
            ctx.store.fail_sync(run.id)?;
            sink.on_error(&e);
            Err(e)
        }
    }
}
