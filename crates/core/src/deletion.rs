//! Deletion engine (C7, §4.7).
//!
//! New relative to the teacher, which never deletes mail. Manifests
//! are files, not rows: `put`/`rename` gives the status machine the
//! same atomic-publish discipline [`crate::blob::BlobStore`] uses for
//! attachment bytes, generalized from per-blob writes to per-manifest
//! directory moves.

use std::fs;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::error::{MsgVaultError, Result};
use crate::models::{DeletionManifest, ExecutionMethod, ExecutionRecord, ManifestStatus};
use crate::ratelimit::{ErrorClass, RetryPolicy};
use crate::remote::RemoteClient;
use crate::storage::RelationalStore;

/// Provider accepts at most this many ids per `batch_delete` call
/// (§4.4).
pub const MAX_BATCH_SIZE: usize = 1000;

pub struct DeletionEngine<'a> {
    root: PathBuf,
    store: &'a RelationalStore,
    remote: &'a dyn RemoteClient,
    retry: RetryPolicy,
}

impl<'a> DeletionEngine<'a> {
    pub fn new(deletions_root: impl AsRef<Path>, store: &'a RelationalStore, remote: &'a dyn RemoteClient) -> Self {
        Self {
            root: deletions_root.as_ref().to_path_buf(),
            store,
            remote,
            retry: RetryPolicy::default(),
        }
    }

    fn status_dir(&self, status: ManifestStatus) -> PathBuf {
        self.root.join(status.dir_name())
    }

    fn manifest_path(&self, status: ManifestStatus, id: &str) -> PathBuf {
        self.status_dir(status).join(format!("{id}.json"))
    }

    /// Stages a new manifest in `pending/`, named by a timestamped slug.
    pub fn stage(
        &self,
        source_id: i64,
        provider_ids: Vec<String>,
        description: String,
        filters: serde_json::Value,
    ) -> Result<DeletionManifest> {
        let id = format!("{}-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S"), source_id);
        let manifest = DeletionManifest {
            id,
            source_id,
            status: ManifestStatus::Pending,
            provider_ids,
            description,
            filters,
            execution: None,
            created_at: chrono::Utc::now(),
        };
        self.write(&manifest)?;
        Ok(manifest)
    }

    /// Loads a manifest by id, searching every status directory.
    pub fn load(&self, id: &str) -> Result<DeletionManifest> {
        for status in [
            ManifestStatus::Pending,
            ManifestStatus::InProgress,
            ManifestStatus::Completed,
            ManifestStatus::Failed,
            ManifestStatus::Cancelled,
        ] {
            let path = self.manifest_path(status, id);
            if path.exists() {
                let bytes = fs::read(&path)?;
                return Ok(serde_json::from_slice(&bytes)?);
            }
        }
        Err(MsgVaultError::NotFound)
    }

    fn write(&self, manifest: &DeletionManifest) -> Result<()> {
        let dir = self.status_dir(manifest.status);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", manifest.id));
        let tmp = dir.join(format!(".{}.tmp", manifest.id));
        fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Atomically move a manifest's file between status directories,
    /// updating its in-memory `status` field to match.
    fn transition(&self, manifest: &mut DeletionManifest, to: ManifestStatus) -> Result<()> {
        let from_path = self.manifest_path(manifest.status, &manifest.id);
        manifest.status = to;
        let to_dir = self.status_dir(to);
        fs::create_dir_all(&to_dir)?;
        let to_path = to_dir.join(format!("{}.json", manifest.id));
        self.write(manifest)?;
        if from_path != to_path && from_path.exists() {
            let _ = fs::remove_file(&from_path);
        }
        Ok(())
    }

    /// Runs (or resumes) a manifest's execution. `requested_method` is
    /// honored only when the manifest has no prior execution record;
    /// an in-progress manifest's recorded method is sticky (§4.7).
    pub fn execute(
        &self,
        manifest: &mut DeletionManifest,
        requested_method: ExecutionMethod,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if manifest.status == ManifestStatus::Completed || manifest.status == ManifestStatus::Cancelled {
            return Ok(());
        }

        let method = match &manifest.execution {
            Some(record) => record.method,
            None => requested_method,
        };
        if manifest.execution.is_none() {
            manifest.execution = Some(ExecutionRecord::new(method));
        }
        if manifest.status == ManifestStatus::Pending {
            self.transition(manifest, ManifestStatus::InProgress)?;
        }

        let remaining: Vec<String> = {
            let record = manifest.execution.as_ref().expect("set above");
            manifest
                .provider_ids
                .iter()
                .filter(|id| !record.done_ids.contains(id) && !record.failed_ids.contains(id))
                .cloned()
                .collect()
        };

        let result = match method {
            ExecutionMethod::BatchPermanent => self.run_batch_permanent(manifest, &remaining, cancel),
            ExecutionMethod::Trash => self.run_trash(manifest, &remaining, cancel),
        };

        match result {
            Ok(()) => {
                let has_failures = manifest
                    .execution
                    .as_ref()
                    .map(|r| !r.failed_ids.is_empty())
                    .unwrap_or(false);
                self.transition(manifest, if has_failures { ManifestStatus::Failed } else { ManifestStatus::Completed })?;
                Ok(())
            }
            Err(MsgVaultError::Cancelled) => {
                // Leave in in_progress with whatever progress was
                // checkpointed (§4.7): resumable, not a failure.
                self.write(manifest)?;
                Ok(())
            }
            Err(e) => {
                self.transition(manifest, ManifestStatus::Failed)?;
                Err(e)
            }
        }
    }

    fn run_batch_permanent(
        &self,
        manifest: &mut DeletionManifest,
        remaining: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for chunk in remaining.chunks(MAX_BATCH_SIZE) {
            if cancel.is_cancelled() {
                return Err(MsgVaultError::Cancelled);
            }
            let chunk_vec = chunk.to_vec();
            match self.retry.run(cancel, || {
                self.remote.batch_delete(&chunk_vec).map_err(to_retry_err)
            }) {
                Ok(()) => {
                    self.store.delete_messages_by_source_ids(manifest.source_id, chunk, false)?;
                    let record = manifest.execution.as_mut().expect("set by caller");
                    record.done_ids.extend(chunk.iter().cloned());
                }
                Err(MsgVaultError::Cancelled) => return Err(MsgVaultError::Cancelled),
                // A scope error means the credential itself is lacking,
                // not that these particular ids are bad; bubble it out
                // so the caller can re-auth and retry, rather than
                // recording every remaining id as failed (§4.7).
                Err(MsgVaultError::InsufficientScope) => return Err(MsgVaultError::InsufficientScope),
                Err(e) => {
                    let record = manifest.execution.as_mut().expect("set by caller");
                    record.failed_ids.extend(chunk.iter().cloned());
                    log::warn!("msgvault::deletion: batch delete failed for manifest {}: {e}", manifest.id);
                }
            }
            self.write(manifest)?;
        }
        Ok(())
    }

    fn run_trash(&self, manifest: &mut DeletionManifest, remaining: &[String], cancel: &CancellationToken) -> Result<()> {
        for id in remaining {
            if cancel.is_cancelled() {
                return Err(MsgVaultError::Cancelled);
            }
            let outcome = self.retry.run(cancel, || self.remote.trash(id).map_err(to_retry_err));
            match outcome {
                Ok(()) => {
                    self.store
                        .delete_messages_by_source_ids(manifest.source_id, std::slice::from_ref(id), false)?;
                    manifest.execution.as_mut().expect("set by caller").done_ids.push(id.clone());
                }
                Err(MsgVaultError::Cancelled) => return Err(MsgVaultError::Cancelled),
                Err(MsgVaultError::InsufficientScope) => return Err(MsgVaultError::InsufficientScope),
                Err(e) => {
                    manifest.execution.as_mut().expect("set by caller").failed_ids.push(id.clone());
                    log::warn!("msgvault::deletion: trash failed for {id} in manifest {}: {e}", manifest.id);
                }
            }
            self.write(manifest)?;
        }
        Ok(())
    }

    /// Moves a pending or in-progress manifest to `cancelled/`. Does
    /// not undo deletions already executed.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let mut manifest = self.load(id)?;
        if matches!(manifest.status, ManifestStatus::Completed | ManifestStatus::Failed | ManifestStatus::Cancelled) {
            return Ok(());
        }
        self.transition(&mut manifest, ManifestStatus::Cancelled)
    }
}

fn to_retry_err(err: MsgVaultError) -> (ErrorClass, MsgVaultError, Option<std::time::Duration>) {
    match err {
        MsgVaultError::InsufficientScope => (ErrorClass::Terminal, MsgVaultError::InsufficientScope, None),
        MsgVaultError::Cancelled => (ErrorClass::Cancelled, MsgVaultError::Cancelled, None),
        MsgVaultError::RateLimited => (ErrorClass::Retryable, MsgVaultError::RateLimited, None),
        other => {
            let class = crate::ratelimit::classify(None, &other.to_string());
            (class, other, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use crate::remote::{RemoteHistoryPage, RemoteLabel, RemoteMessageList, RemoteProfile};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct StubRemote {
        fail_first_n: Mutex<u32>,
    }

    impl RemoteClient for StubRemote {
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
        fn list_history_since(&self, _cursor: &str, _page_token: Option<&str>) -> Result<RemoteHistoryPage> {
            unimplemented!()
        }
        fn get_profile(&self) -> Result<RemoteProfile> {
            unimplemented!()
        }
        fn batch_delete(&self, _ids: &[String]) -> Result<()> {
            let mut n = self.fail_first_n.lock().unwrap();
            if *n > 0 {
                *n -= 1;
                return Err(MsgVaultError::InsufficientScope);
            }
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
    fn stage_and_execute_marks_messages_deleted() {
        let dir = tempdir().unwrap();
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store.upsert_source(SourceType::Gmail, "alice@example.com", None).unwrap();
        store
            .upsert_message(&crate::storage::NewMessage {
                source_id: source.id,
                source_message_id: "m1".to_string(),
                source_conversation_id: "c1".to_string(),
                conversation_title: None,
                subject: Some("hi".to_string()),
                snippet: Some(String::new()),
                sent_at: None,
                received_at: None,
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

        let remote = StubRemote { fail_first_n: Mutex::new(0) };
        let engine = DeletionEngine::new(dir.path(), &store, &remote);
        let mut manifest = engine
            .stage(source.id, vec!["m1".to_string()], "test".to_string(), serde_json::json!({}))
            .unwrap();

        let cancel = CancellationToken::new();
        engine.execute(&mut manifest, ExecutionMethod::BatchPermanent, &cancel).unwrap();

        assert_eq!(manifest.status, ManifestStatus::Completed);
        let reloaded = engine.load(&manifest.id).unwrap();
        assert_eq!(reloaded.status, ManifestStatus::Completed);

        let msg = store.get_message_by_source_id(source.id, "m1").unwrap().unwrap();
        assert!(msg.deleted_from_source_at.is_some());
    }

    #[test]
    fn insufficient_scope_propagates_out_of_execute() {
        let dir = tempdir().unwrap();
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store.upsert_source(SourceType::Gmail, "alice@example.com", None).unwrap();
        let remote = StubRemote { fail_first_n: Mutex::new(u32::MAX) };
        let engine = DeletionEngine::new(dir.path(), &store, &remote);
        let mut manifest = engine
            .stage(source.id, vec!["m1".to_string()], "test".to_string(), serde_json::json!({}))
            .unwrap();

        let cancel = CancellationToken::new();
        let err = engine.execute(&mut manifest, ExecutionMethod::BatchPermanent, &cancel).unwrap_err();

        assert!(matches!(err, MsgVaultError::InsufficientScope));
        assert_eq!(manifest.status, ManifestStatus::Failed);
        let record = manifest.execution.unwrap();
        assert!(record.failed_ids.is_empty());
        assert!(record.done_ids.is_empty());
    }

    #[test]
    fn sticky_method_survives_resume() {
        let dir = tempdir().unwrap();
        let store = RelationalStore::open_in_memory().unwrap();
        let source = store.upsert_source(SourceType::Gmail, "alice@example.com", None).unwrap();
        let remote = StubRemote { fail_first_n: Mutex::new(0) };
        let engine = DeletionEngine::new(dir.path(), &store, &remote);
        let mut manifest = engine
            .stage(source.id, vec!["m1".to_string(), "m2".to_string()], "t".to_string(), serde_json::json!({}))
            .unwrap();

        manifest.execution = Some(ExecutionRecord::new(ExecutionMethod::Trash));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let _ = engine.execute(&mut manifest, ExecutionMethod::BatchPermanent, &cancel);

        let reloaded = engine.load(&manifest.id).unwrap();
        assert_eq!(reloaded.execution.unwrap().method, ExecutionMethod::Trash);
    }
}
