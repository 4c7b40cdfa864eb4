//! Full sync (§4.6 "Full sync").

use std::time::Instant;

use chrono::{DateTime, Utc};

use super::{CHECKPOINT_INTERVAL_SECONDS, MAX_RUN_ERRORS, ProgressSink, RunCounters, SyncContext, ingest_one};
use crate::error::{MsgVaultError, Result};
use crate::models::{SyncRunKind, SyncSummary};

/// Inputs to a full sync run (§4.6).
#[derive(Debug, Clone, Default)]
pub struct FullSyncOptions {
    /// Optional provider-query filter (Gmail search syntax).
    pub query: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    /// Ignore any existing active SyncRun and start from scratch.
    pub no_resume: bool,
    pub checkpoint_interval: u64,
}

impl FullSyncOptions {
    fn checkpoint_interval(&self) -> u64 {
        if self.checkpoint_interval == 0 {
            200
        } else {
            self.checkpoint_interval
        }
    }
}

pub fn sync_full(
    ctx: &SyncContext,
    source_id: i64,
    options: &FullSyncOptions,
    sink: &mut dyn ProgressSink,
) -> Result<SyncSummary> {
    let start = Instant::now();
    sink.on_start(options.limit);

    let existing_active = if options.no_resume {
        None
    } else {
        ctx.store.get_active_sync(source_id)?
    };

    let was_resumed = existing_active.is_some();
    let run = match existing_active {
        Some(run) => run,
        None => ctx.store.start_sync(source_id, SyncRunKind::Full, None)?,
    };

    // `totals` accumulates for the whole run (the returned summary);
    // `pending` accumulates only since the last committed checkpoint
    // and is what gets folded into `sync_runs` counters, which are
    // themselves cumulative (§4.2 `update_sync_checkpoint`).
    let mut totals = RunCounters::default();
    let mut pending = RunCounters::default();
    let mut page_token = run.cursor_current.clone().or(run.cursor_before.clone());
    let mut last_checkpoint = Instant::now();
    let mut latest_provider_cursor: Option<String> = None;

    let mut processed: u64 = 0;

    let result = (|| -> Result<()> {
        'paging: loop {
            if ctx.cancel.is_cancelled() {
                return Err(MsgVaultError::Cancelled);
            }

            let page = ctx
                .remote
                .list_message_ids(options.query.as_deref(), page_token.as_deref())?;

            for provider_id in &page.ids {
                if ctx.cancel.is_cancelled() {
                    return Err(MsgVaultError::Cancelled);
                }

                totals.found += 1;
                pending.found += 1;

                match ingest_message(ctx, source_id, provider_id, sink) {
                    Ok(IngestOutcome::Added(bytes)) => {
                        totals.added += 1;
                        totals.bytes += bytes;
                        pending.added += 1;
                        pending.bytes += bytes;
                    }
                    Ok(IngestOutcome::Skipped) => {
                        totals.skipped += 1;
                        pending.skipped += 1;
                    }
                    Err(e) if super::is_retryable_class(&e) => {
                        log::warn!("msgvault::sync: error ingesting {provider_id}: {e}");
                        totals.errors += 1;
                        pending.errors += 1;
                        sink.on_error(&e);
                        if totals.errors > MAX_RUN_ERRORS {
                            return Err(MsgVaultError::TooManyErrors(totals.errors));
                        }
                    }
                    Err(e) => return Err(e),
                }

                processed += 1;
                sink.on_progress(totals.found, totals.added, totals.skipped);

                let due_by_count = (pending.added + pending.skipped + pending.errors)
                    % options.checkpoint_interval()
                    == 0;
                let due_by_time =
                    last_checkpoint.elapsed().as_secs() >= CHECKPOINT_INTERVAL_SECONDS;
                if due_by_count || due_by_time {
                    ctx.store.update_sync_checkpoint(
                        run.id,
                        page_token.as_deref(),
                        pending.found as i64,
                        pending.added as i64,
                        pending.skipped as i64,
                        pending.bytes as i64,
                        pending.errors as i64,
                    )?;
                    pending = RunCounters::default();
                    last_checkpoint = Instant::now();
                }

                if let Some(limit) = options.limit {
                    if processed >= limit {
                        break 'paging;
                    }
                }
            }

            page_token = page.next_page_token.clone();
            if page_token.is_none() {
                break;
            }
        }
        Ok(())
    })();

    // Final checkpoint covers whatever accumulated since the last one,
    // including a cancellation mid-page: finalize the batch rather than
    // discard it (§4.6 step 5).
    ctx.store.update_sync_checkpoint(
        run.id,
        page_token.as_deref(),
        pending.found as i64,
        pending.added as i64,
        pending.skipped as i64,
        pending.bytes as i64,
        pending.errors as i64,
    )?;

    if let Ok(profile) = ctx.remote.get_profile() {
        latest_provider_cursor = profile.history_id;
    }

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
            if let Some(cursor) = latest_provider_cursor {
                ctx.store.update_sync_cursor(source_id, Some(&cursor))?;
            }
            sink.on_complete(&summary);
            Ok(summary)
        }
        Err(MsgVaultError::Cancelled) => {
            // Cancellation is not a failure: the run stays active so a
            // later call without --no-resume continues from this cursor.
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

enum IngestOutcome {
    Added(u64),
    Skipped,
}

fn ingest_message(
    ctx: &SyncContext,
    source_id: i64,
    provider_id: &str,
    sink: &mut dyn ProgressSink,
) -> Result<IngestOutcome> {
    if let Some(existing) = ctx.store.get_message_by_source_id(source_id, provider_id)? {
        if ctx.store.has_raw(existing.id)? {
            return Ok(IngestOutcome::Skipped);
        }
        // Metadata-only row: raw may now be fetchable (upgrade path).
    }

    let raw = ctx.remote.get_raw_message(provider_id)?;
    let labels = ctx
        .remote
        .get_message_label_ids(provider_id)
        .unwrap_or_default();

    let bytes = ingest_one(ctx, source_id, provider_id, provider_id, &raw, &labels, sink)?;
    Ok(IngestOutcome::Added(bytes))
}
