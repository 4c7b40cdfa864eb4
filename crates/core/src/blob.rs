//! Content-addressed attachment blob store (C1, §4.1).
//!
//! Generalizes the teacher's `storage/blob_file.rs` (`FileBlobStore`):
//! same two-char shard directory and write-then-rename publish
//! discipline, keyed by SHA-256 content hash instead of message id so
//! that attachment rows sharing bytes can share one file on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{MsgVaultError, Result};

/// Default cap on a single stored blob; generous enough for ordinary
/// mail attachments while bounding a single pathological entry.
pub const DEFAULT_MAX_ENTRY_BYTES: u64 = 250 * 1024 * 1024;

/// A lowercase hex SHA-256 digest, the blob store's content address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<hash[:2]>/<hash>`, relative to the blob root (§4.1).
    pub fn relative_path(&self) -> String {
        format!("{}/{}", &self.0[..2], self.0)
    }
}

/// `h` is 64 lowercase hex characters.
pub fn validate_hash(h: &str) -> bool {
    h.len() == 64 && h.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Content-addressed file storage for attachments, deduplicated by
/// SHA-256 (C1).
pub struct BlobStore {
    root: PathBuf,
    max_entry_bytes: u64,
}

impl BlobStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
        })
    }

    pub fn with_max_entry_bytes(mut self, max: u64) -> Self {
        self.max_entry_bytes = max;
        self
    }

    fn absolute_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(&hash.0[..2]).join(&hash.0)
    }

    /// Write `bytes` and return `(hash, relative_path)`. A no-op if
    /// the blob already exists. Never overwrites an existing blob.
    pub fn put(&self, bytes: &[u8]) -> Result<(ContentHash, String)> {
        if bytes.len() as u64 > self.max_entry_bytes {
            return Err(MsgVaultError::LimitExceeded);
        }

        let hash = ContentHash::of(bytes);
        let path = self.absolute_path(&hash);

        if path.exists() {
            return Ok((hash, hash.relative_path()));
        }

        let shard_dir = path.parent().expect("blob path always has a shard parent");
        fs::create_dir_all(shard_dir)?;
        set_dir_permissions(shard_dir)?;

        let tmp_path = shard_dir.join(format!(".{}.tmp", hash.as_str()));
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(bytes)?;
            tmp.sync_all()?;
        }
        set_file_permissions(&tmp_path)?;

        // The rename target may have been created by a racing `put` of
        // identical content in the meantime; that's benign (§5) — the
        // loser's rename either overwrites identical bytes or fails
        // harmlessly because the destination already matches.
        match fs::rename(&tmp_path, &path) {
            Ok(()) => {}
            Err(e) if path.exists() => {
                let _ = fs::remove_file(&tmp_path);
                let _ = e;
            }
            Err(e) => return Err(e.into()),
        }

        Ok((hash.clone(), hash.relative_path()))
    }

    pub fn open(&self, hash: &ContentHash) -> Result<fs::File> {
        Ok(fs::File::open(self.absolute_path(hash))?)
    }

    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.absolute_path(hash).exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_is_content_addressed_and_idempotent() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();

        let (hash1, path1) = store.put(b"hello world").unwrap();
        let (hash2, path2) = store.put(b"hello world").unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(path1, path2);
        assert!(store.exists(&hash1));
        assert!(validate_hash(hash1.as_str()));
    }

    #[test]
    fn put_rejects_oversized_entries() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap().with_max_entry_bytes(4);
        let result = store.put(b"too many bytes");
        assert!(matches!(result, Err(MsgVaultError::LimitExceeded)));
    }

    #[test]
    fn relative_path_is_two_char_shard() {
        let hash = ContentHash::of(b"hello world");
        let rel = hash.relative_path();
        let (shard, rest) = rel.split_once('/').unwrap();
        assert_eq!(shard.len(), 2);
        assert_eq!(rest, hash.as_str());
    }

    #[test]
    fn validate_hash_rejects_bad_input() {
        assert!(!validate_hash("not-hex"));
        assert!(!validate_hash("abc"));
        assert!(validate_hash(&"a".repeat(64)));
        assert!(!validate_hash(&"A".repeat(64)));
    }
}
