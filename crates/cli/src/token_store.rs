//! File-backed bearer token storage for [`msgvault_core::remote::TokenSource`].
//!
//! OAuth itself (the interactive browser flow, refresh-token exchange)
//! is an external helper's job; this only holds the resulting access
//! token between the helper and the sync engine, the same narrow seam
//! `TokenSource` was designed around.

use std::fs;
use std::path::{Path, PathBuf};

use msgvault_core::error::{MsgVaultError, Result};
use msgvault_core::remote::TokenSource;

pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    pub fn new(tokens_dir: &Path, account_identifier: &str) -> Self {
        Self {
            path: token_path(tokens_dir, account_identifier),
        }
    }

    /// Stores a freshly obtained token, overwriting any previous one.
    pub fn write(tokens_dir: &Path, account_identifier: &str, token: &str) -> std::io::Result<()> {
        fs::create_dir_all(tokens_dir)?;
        fs::write(token_path(tokens_dir, account_identifier), token.trim())
    }
}

fn token_path(tokens_dir: &Path, account_identifier: &str) -> PathBuf {
    tokens_dir.join(format!("{}.token", account_identifier.replace('/', "_")))
}

impl TokenSource for FileTokenSource {
    fn access_token(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .map(|s| s.trim().to_string())
            .map_err(|_| MsgVaultError::InsufficientScope)
    }
}
