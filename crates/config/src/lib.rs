//! Configuration loading for msgvault.
//!
//! Resolves the msgvault home directory and loads `<home>/config.toml`
//! into a typed [`Settings`]. `MSGVAULT_HOME` overrides the default
//! home directory; an explicit `--home` flag (threaded in by callers)
//! overrides both.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// `oauth.*` — provider OAuth client credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OauthConfig {
    pub client_secrets: Option<PathBuf>,
}

/// `sync.*` — sync engine tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_rate_limit_qps")]
    pub rate_limit_qps: f64,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
}

fn default_rate_limit_qps() -> f64 {
    5.0
}

fn default_checkpoint_interval() -> u64 {
    200
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rate_limit_qps: default_rate_limit_qps(),
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

/// `server.*` — HTTP API surface (C11).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    pub api_key: Option<String>,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8420
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            api_port: default_api_port(),
            api_key: None,
        }
    }
}

/// `remote.*` — point this instance's query surface at another
/// msgvault instance instead of the local store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub allow_insecure: bool,
}

/// `data.*` — on-disk layout root.
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    pub data_dir: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self { data_dir: None }
    }
}

/// `chat.*` — LLM bridge; consumed by an external collaborator, not
/// the core engine, but still a recognized config section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatConfig {
    pub server: Option<String>,
    pub model: Option<String>,
    pub max_results: Option<u32>,
}

/// One `[[accounts]]` entry: a scheduled account sync.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Top-level `config.toml` shape.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub oauth: OauthConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            oauth: OauthConfig::default(),
            sync: SyncConfig::default(),
            server: ServerConfig::default(),
            remote: RemoteConfig::default(),
            data: DataConfig::default(),
            chat: ChatConfig::default(),
            accounts: Vec::new(),
        }
    }
}

/// Resolve the msgvault home directory: explicit override, then
/// `MSGVAULT_HOME`, then `~/.msgvault`.
pub fn resolve_home(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Ok(env_home) = std::env::var("MSGVAULT_HOME") {
        return Ok(PathBuf::from(env_home));
    }
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".msgvault"))
}

/// Ensure the home directory (and its standard subdirectories) exist.
pub fn ensure_home_dir(home: &Path) -> Result<()> {
    std::fs::create_dir_all(home)
        .with_context(|| format!("failed to create home directory: {}", home.display()))?;
    for sub in ["attachments", "analytics", "tokens", "deletions", "imports/mbox"] {
        std::fs::create_dir_all(home.join(sub))
            .with_context(|| format!("failed to create {} under home directory", sub))?;
    }
    Ok(())
}

/// Path to the config file within a home directory.
pub fn config_path(home: &Path) -> PathBuf {
    home.join("config.toml")
}

/// Load `Settings` from `<home>/config.toml`, or defaults if the file
/// does not exist.
pub fn load(home: &Path) -> Result<Settings> {
    let path = config_path(home);
    if !path.exists() {
        return Ok(Settings::default());
    }
    load_file(&path)
}

/// Load and parse a `config.toml` at an arbitrary path.
pub fn load_file(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

impl Settings {
    /// The effective data directory: `data.data_dir` if set, else the
    /// home directory itself.
    pub fn data_dir(&self, home: &Path) -> PathBuf {
        self.data
            .data_dir
            .clone()
            .unwrap_or_else(|| home.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolve_home_prefers_explicit() {
        let explicit = PathBuf::from("/tmp/explicit-home");
        let resolved = resolve_home(Some(&explicit)).unwrap();
        assert_eq!(resolved, explicit);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let settings = load(dir.path()).unwrap();
        assert_eq!(settings.server.api_port, 8420);
        assert!(settings.accounts.is_empty());
    }

    #[test]
    fn load_parses_accounts_and_overrides() {
        let dir = tempdir().unwrap();
        std::fs::write(
            config_path(dir.path()),
            r#"
            [sync]
            rate_limit_qps = 8.5

            [server]
            bind_addr = "0.0.0.0"
            api_port = 9000
            api_key = "secret"

            [[accounts]]
            email = "alice@example.com"
            schedule = "*/15 * * * *"

            [[accounts]]
            email = "bob@example.com"
            schedule = "0 * * * *"
            enabled = false
            "#,
        )
        .unwrap();

        let settings = load(dir.path()).unwrap();
        assert_eq!(settings.sync.rate_limit_qps, 8.5);
        assert_eq!(settings.server.bind_addr, "0.0.0.0");
        assert_eq!(settings.server.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.accounts.len(), 2);
        assert!(settings.accounts[0].enabled);
        assert!(!settings.accounts[1].enabled);
    }

    #[test]
    fn ensure_home_dir_creates_standard_layout() {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        ensure_home_dir(&home).unwrap();
        assert!(home.join("attachments").is_dir());
        assert!(home.join("analytics").is_dir());
        assert!(home.join("tokens").is_dir());
        assert!(home.join("deletions").is_dir());
        assert!(home.join("imports/mbox").is_dir());
    }
}
