//! msgvault CLI: `serve`, `sync`, `add-account`.
//!
//! Layered the way the teacher's binary crate wires its `MailStore`
//! together from a resolved app-support directory, generalized to a
//! configurable home directory plus a background scheduler.

mod http;
mod remote_factory;
mod token_store;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use msgvault_core::blob::BlobStore;
use msgvault_core::models::SourceType;
use msgvault_core::scheduler::Scheduler;
use msgvault_core::storage::RelationalStore;
use msgvault_core::sync::{FullSyncOptions, NullProgressSink, SyncContext};

use http::AppState;
use remote_factory::AccountRemoteFactory;

#[derive(Parser)]
#[command(name = "msgvault", about = "Offline email archival and search")]
struct Cli {
    /// Overrides the resolved home directory (else `MSGVAULT_HOME`, else `~/.msgvault`).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server and the account sync scheduler.
    Serve,
    /// Run a single ad hoc sync for one registered account and exit.
    Sync {
        email: String,
        #[arg(long)]
        full: bool,
    },
    /// Register a new account to sync.
    AddAccount {
        email: String,
        #[arg(long, default_value = "gmail")]
        source_type: String,
        #[arg(long, default_value = "0 */15 * * * *")]
        schedule: String,
    },
    /// Permanently remove a registered account and everything it owns
    /// (conversations, messages, bodies, attachments, sync runs).
    RemoveAccount { email: String },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let home = msgvault_config::resolve_home(cli.home.as_deref())?;
    msgvault_config::ensure_home_dir(&home)?;
    let settings = Arc::new(msgvault_config::load(&home)?);

    let db_path = settings.data_dir(&home).join("msgvault.db");
    let store = Arc::new(RelationalStore::open(&db_path)?);
    let blobs = Arc::new(BlobStore::new(home.join("attachments"))?);

    match cli.command {
        Command::Serve => serve(home, settings, store, blobs),
        Command::Sync { email, full } => run_one_sync(&home, &settings, &store, &blobs, &email, full),
        Command::AddAccount {
            email,
            source_type,
            schedule,
        } => add_account(&store, &email, &source_type, &schedule),
        Command::RemoveAccount { email } => remove_account(&store, &email),
    }
}

fn remove_account(store: &RelationalStore, email: &str) -> anyhow::Result<()> {
    let source = store
        .get_source_by_identifier_any(email)?
        .ok_or_else(|| anyhow::anyhow!("no account registered for {email}"))?;
    store.remove_source(source.id)?;
    println!("removed account {} (id {}) and all dependent rows", source.identifier, source.id);
    Ok(())
}

fn parse_source_type(s: &str) -> anyhow::Result<SourceType> {
    match s {
        "gmail" => Ok(SourceType::Gmail),
        "imap" => Ok(SourceType::Imap),
        "mbox" => Ok(SourceType::Mbox),
        "apple-mail" => Ok(SourceType::AppleMail),
        other => anyhow::bail!("unknown source type {other:?}"),
    }
}

fn add_account(store: &RelationalStore, email: &str, source_type: &str, schedule: &str) -> anyhow::Result<()> {
    let st = parse_source_type(source_type)?;
    // Validated eagerly so a typo surfaces before a config reload.
    let _: cron::Schedule = msgvault_core::scheduler::normalize_cron(schedule)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid cron schedule {schedule:?}: {e}"))?;
    let source = store.upsert_source(st, email, None)?;
    println!("registered account {} (id {}), schedule {}", source.identifier, source.id, schedule);
    Ok(())
}

fn run_one_sync(
    home: &std::path::Path,
    settings: &msgvault_config::Settings,
    store: &Arc<RelationalStore>,
    blobs: &Arc<BlobStore>,
    email: &str,
    full: bool,
) -> anyhow::Result<()> {
    let source = store
        .get_source_by_identifier_any(email)?
        .ok_or_else(|| anyhow::anyhow!("no account registered for {email}"))?;
    let factory = AccountRemoteFactory::new(home, settings, &source);
    let remote = factory.connect()?;
    let cancel = tokio_util::sync::CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());
    let ctx = SyncContext {
        store,
        blobs,
        remote: remote.as_ref(),
        cancel: &cancel,
    };
    let mut sink = NullProgressSink;
    let summary = if full || source.sync_cursor.is_none() {
        msgvault_core::sync::sync_full(&ctx, source.id, &FullSyncOptions::default(), &mut sink)?
    } else {
        msgvault_core::sync::sync_incremental(&ctx, source.id, &mut sink)?
    };
    println!("{summary:?}");
    Ok(())
}

/// First `SIGINT` cancels the running sync's context so it finalizes
/// its current batch and persists a checkpoint (§5); a second `SIGINT`
/// exits immediately with the signal-interrupted exit code (§6).
fn spawn_interrupt_handler(cancel: tokio_util::sync::CancellationToken) {
    std::thread::spawn(move || {
        let Ok(rt) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
            return;
        };
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    });
}

fn serve(
    home: PathBuf,
    settings: Arc<msgvault_config::Settings>,
    store: Arc<RelationalStore>,
    blobs: Arc<BlobStore>,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve_async(home, settings, store, blobs))
}

async fn serve_async(
    home: PathBuf,
    settings: Arc<msgvault_config::Settings>,
    store: Arc<RelationalStore>,
    blobs: Arc<BlobStore>,
) -> anyhow::Result<()> {
    let scheduler = Arc::new(Scheduler::new());

    for account in &settings.accounts {
        if !account.enabled {
            continue;
        }
        let Some(source) = store.get_source_by_identifier_any(&account.email)? else {
            log::warn!("msgvault: account {} in config.toml has no registered source, skipping", account.email);
            continue;
        };
        let factory = Arc::new(AccountRemoteFactory::new(&home, &settings, &source));
        if let Err(e) = scheduler.add_account(source.id, &account.schedule, store.clone(), blobs.clone(), factory) {
            log::error!("msgvault: failed to schedule {}: {e}", account.email);
        }
    }
    scheduler.start();

    let state = AppState {
        store,
        blobs,
        scheduler: scheduler.clone(),
        home,
        settings: settings.clone(),
        api_key: settings.server.api_key.clone(),
    };
    let app = http::router(state);

    let addr = format!("{}:{}", settings.server.bind_addr, settings.server.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("msgvault: listening on {addr}");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("msgvault: shutting down");
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    scheduler.stop();
    Ok(())
}
