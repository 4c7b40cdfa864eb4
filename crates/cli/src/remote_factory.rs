//! Builds a [`RemoteClient`] for one account on demand (scheduler + CLI).

use std::path::PathBuf;
use std::sync::Arc;

use msgvault_config::Settings;
use msgvault_core::error::{MsgVaultError, Result};
use msgvault_core::models::{Source, SourceType};
use msgvault_core::remote::gmail::GmailClient;
use msgvault_core::remote::imap::ImapClient;
use msgvault_core::remote::RemoteClient;
use msgvault_core::scheduler::RemoteClientFactory;

use crate::token_store::FileTokenSource;

pub struct AccountRemoteFactory {
    source_type: SourceType,
    identifier: String,
    tokens_dir: PathBuf,
    rate_limit_qps: f64,
}

impl AccountRemoteFactory {
    pub fn new(home: &std::path::Path, settings: &Settings, source: &Source) -> Self {
        Self {
            source_type: source.source_type,
            identifier: source.identifier.clone(),
            tokens_dir: home.join("tokens"),
            rate_limit_qps: settings.sync.rate_limit_qps,
        }
    }
}

impl RemoteClientFactory for AccountRemoteFactory {
    fn connect(&self) -> Result<Box<dyn RemoteClient>> {
        match self.source_type {
            SourceType::Gmail => {
                let token = Arc::new(FileTokenSource::new(&self.tokens_dir, &self.identifier));
                Ok(Box::new(GmailClient::new(token, self.rate_limit_qps)))
            }
            SourceType::Imap => {
                let host = std::env::var("MSGVAULT_IMAP_HOST")
                    .map_err(|_| MsgVaultError::Config("MSGVAULT_IMAP_HOST is required for IMAP accounts".into()))?;
                let port: u16 = std::env::var("MSGVAULT_IMAP_PORT")
                    .unwrap_or_else(|_| "993".to_string())
                    .parse()
                    .map_err(|_| MsgVaultError::Config("MSGVAULT_IMAP_PORT must be a valid port number".into()))?;
                let password = std::env::var("MSGVAULT_IMAP_PASSWORD")
                    .map_err(|_| MsgVaultError::Config("MSGVAULT_IMAP_PASSWORD is required for IMAP accounts".into()))?;
                let client = ImapClient::connect(&host, port, &self.identifier, &password)?;
                Ok(Box::new(client))
            }
            SourceType::Mbox | SourceType::AppleMail => Err(MsgVaultError::Config(
                "mbox/apple-mail sources are imported on demand, not scheduled against a remote client".into(),
            )),
        }
    }
}
