//! shc: shadowchat command-line client
//!
//!   keygen                 - create an identity and print the registration bundle
//!   config show            - display the merged configuration
//!   connect                - log in over the realtime socket and print session events
//!   upload <file> --chat   - encrypt a file with the chat key and upload it in chunks
//!   uploads list           - show locally tracked uploads
//!   uploads resume [<id>]  - reconcile with the server and continue unfinished uploads
//!   uploads cancel <id>    - release the server reservation and forget the upload
//!   uploads sweep          - purge finished uploads past the retention window

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use shc_client::{ChatClient, ChatKeyRegistry, ClientEvent, IdentityManager, SavedLogin};
use shc_core::config::{expand_tilde, ShcConfig};
use shc_core::types::now_millis;
use shc_core::{ChatId, FileType};
use shc_crypto::{encrypt_large_file, encrypt_text, SymmetricKey};
use shc_transfer::{
    EngineConfig, HttpChunkEndpoint, NewUpload, RunOutcome, StoreBackend, TransferEngine,
    TransferEvent, TransferStore,
};
use shc_transport::{ReconnectPolicy, TransportSession, WsConnector};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "shc",
    version,
    about = "shadowchat client",
    long_about = "shc: end-to-end encrypted chat client; identity keys, realtime session and resumable uploads"
)]
struct Cli {
    /// Path to shadowchat.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SHC_CONFIG",
        default_value = "~/.config/shadowchat/shadowchat.toml"
    )]
    config: PathBuf,

    /// Log level (overrides [logging] level; RUST_LOG overrides both)
    #[arg(long, env = "SHC_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate an identity key pair and print the registration bundle as JSON
    Keygen {
        #[arg(long, short = 'u')]
        username: String,
        /// Server key mixed into the auth token
        #[arg(long, env = "SHC_SERVER_KEY")]
        server_key: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Log in and stay connected, printing session events until Ctrl-C
    Connect {
        #[command(flatten)]
        login: LoginArgs,
    },

    /// Encrypt a file for a conversation and upload it
    Upload {
        /// File to send
        file: PathBuf,
        /// Conversation id
        #[arg(long)]
        chat: ChatId,
        #[arg(long, value_enum, default_value_t = FileKind::File)]
        kind: FileKind,
        #[command(flatten)]
        login: LoginArgs,
    },

    /// Manage locally tracked uploads
    Uploads {
        #[command(subcommand)]
        action: UploadsAction,
    },
}

#[derive(clap::Args, Debug)]
struct LoginArgs {
    /// Log in with a password as this user (default: the saved login)
    #[arg(long, short = 'u')]
    username: Option<String>,
    #[arg(long, env = "SHC_SERVER_KEY", default_value = "")]
    server_key: String,
    /// Seconds to wait for login and chat keys
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum UploadsAction {
    /// List every tracked upload
    List {
        /// Only uploads for this conversation
        #[arg(long)]
        chat: Option<ChatId>,
    },
    /// Continue one upload, or every unfinished one
    Resume {
        id: Option<String>,
        /// Trust local state instead of asking the server
        #[arg(long)]
        offline: bool,
    },
    /// Cancel an upload
    Cancel { id: String },
    /// Purge completed and failed uploads older than the retention window
    Sweep,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FileKind {
    Image,
    Video,
    File,
}

impl From<FileKind> for FileType {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::Image => FileType::Image,
            FileKind::Video => FileType::Video,
            FileKind::File => FileType::File,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = ShcConfig::load_or_default(Some(&config_path))
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, &config.logging.format);

    match cli.command {
        Commands::Keygen { username, server_key } => cmd_keygen(&config, &username, &server_key).await,
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
        Commands::Connect { login } => cmd_connect(&config, &login).await,
        Commands::Upload { file, chat, kind, login } => {
            cmd_upload(&config, &file, chat, kind.into(), &login).await
        }
        Commands::Uploads { action } => match action {
            UploadsAction::List { chat } => cmd_uploads_list(&config, chat),
            UploadsAction::Resume { id, offline } => {
                cmd_uploads_resume(&config, id.as_deref(), !offline).await
            }
            UploadsAction::Cancel { id } => cmd_uploads_cancel(&config, &id).await,
            UploadsAction::Sweep => cmd_uploads_sweep(&config).await,
        },
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

/// Logs go to stderr so stdout stays parseable (`keygen` prints JSON).
fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Session helpers ───────────────────────────────────────────────────────────

fn credentials_path(config: &ShcConfig) -> PathBuf {
    expand_tilde(&config.session.credentials_file)
}

fn prompt_password(prompt: &str) -> Result<SecretString> {
    let password = rpassword::prompt_password(prompt).context("reading password")?;
    if password.is_empty() {
        bail!("empty password");
    }
    Ok(SecretString::from(password))
}

fn build_client(config: &ShcConfig) -> Result<ChatClient> {
    let url = config.server.socket_url()?;
    if url.starts_with("ws://") {
        warn!(%url, "realtime endpoint is not TLS protected");
    }
    let policy = ReconnectPolicy::from_config(&config.transport)?;
    let transport = TransportSession::new(Arc::new(WsConnector::new(url)), policy);
    let identity = Arc::new(IdentityManager::new(&config.crypto));
    Ok(ChatClient::with_credentials_file(
        transport,
        identity,
        Arc::new(ChatKeyRegistry::new()),
        credentials_path(config),
    ))
}

/// Arm the client with either the saved login or a password login. Must run
/// before `connect` so the first open already carries the login packet.
async fn authenticate(client: &ChatClient, config: &ShcConfig, args: &LoginArgs) -> Result<()> {
    let saved = SavedLogin::load(&credentials_path(config))?;
    match (args.username.as_deref(), saved) {
        (None, Some(saved)) => {
            info!(username = %saved.username, "using saved login");
            client.restore(&saved)?;
        }
        (Some(username), Some(saved)) if saved.username == username => {
            info!(username, "using saved login");
            client.restore(&saved)?;
        }
        (Some(username), _) => {
            let password = prompt_password(&format!("Password for {username}: "))?;
            client.login(username, &password, &args.server_key).await?;
        }
        (None, None) => bail!("no saved login; pass --username to log in with a password"),
    }
    Ok(())
}

/// Connect and wait until `chat_id`'s key has been unwrapped.
async fn fetch_chat_key(client: &ChatClient, chat_id: ChatId, wait: Duration) -> Result<SymmetricKey> {
    let mut events = client.subscribe();
    client.connect()?;

    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    loop {
        if let Some(key) = client.registry().get(chat_id) {
            return Ok(key);
        }
        tokio::select! {
            _ = &mut deadline => bail!("timed out waiting for the key of chat {chat_id}"),
            event = events.recv() => match event {
                Ok(ClientEvent::AuthFailed { reason }) => bail!("login failed: {reason}"),
                Ok(ClientEvent::Terminated(termination)) => {
                    bail!("connection terminated: {termination:?}")
                }
                Ok(ClientEvent::ChatKeys { failed, .. }) if failed.contains(&chat_id) => {
                    bail!("the key of chat {chat_id} could not be unwrapped")
                }
                Ok(ClientEvent::ChatKeys { .. }) if !client.registry().contains(chat_id) => {
                    bail!("chat {chat_id} is not in the conversation list")
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("client event stream closed"),
            },
        }
    }
}

// ── Transfer helpers ──────────────────────────────────────────────────────────

/// `login` is only optional for purely local work such as sweeping.
fn open_engine(
    config: &ShcConfig,
    login: Option<&SavedLogin>,
) -> Result<TransferEngine<HttpChunkEndpoint>> {
    let engine_config = EngineConfig::from(&config.transfer);
    let mut endpoint =
        HttpChunkEndpoint::new(&config.server.base_url, engine_config.request_timeout)?;
    if let Some(login) = login {
        endpoint = endpoint.with_auth(&login.username, &login.auth_token);
    }
    let store = open_store(config)?;
    Ok(TransferEngine::new(Arc::new(endpoint), store, engine_config))
}

fn open_store(config: &ShcConfig) -> Result<Arc<dyn TransferStore>> {
    let path = expand_tilde(&config.transfer.state_path);
    let store = StoreBackend::open(&path)
        .with_context(|| format!("opening upload store: {}", path.display()))?;
    info!(path = %path.display(), backend = store.kind(), "upload store opened");
    Ok(Arc::new(store))
}

fn require_saved_login(config: &ShcConfig) -> Result<SavedLogin> {
    SavedLogin::load(&credentials_path(config))?
        .context("not logged in; run `shc connect --username <name>` first")
}

/// Run one upload with a progress bar. Ctrl-C pauses it.
async fn run_with_progress(
    engine: &TransferEngine<HttpChunkEndpoint>,
    task_id: &str,
    label: &str,
) -> Result<RunOutcome> {
    let task = engine
        .task(task_id)?
        .with_context(|| format!("unknown upload: {task_id}"))?;

    let pb = make_progress_bar(u64::from(task.total_chunks), label);
    pb.set_position(task.uploaded_chunks.len() as u64);
    pb.set_message(task.file_name.clone());

    let mut events = engine.subscribe();
    let id = task_id.to_owned();
    let watcher = {
        let pb = pb.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.task_id() != id => {}
                    Ok(TransferEvent::ChunkAcknowledged { acknowledged, .. }) => {
                        pb.set_position(u64::from(acknowledged));
                    }
                    Ok(TransferEvent::ChunkFailed { index, attempt, reason, .. }) => {
                        pb.println(format!("  chunk {index} attempt {attempt} failed: {reason}"));
                    }
                    Ok(TransferEvent::PersistenceDegraded { reason, .. }) => {
                        pb.println(format!("  warning: progress not saved ({reason})"));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let run = engine.run(task_id);
    tokio::pin!(run);
    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            pb.println("interrupted, pausing upload");
            let (outcome, paused) = tokio::join!(&mut run, engine.pause_upload(task_id));
            paused?;
            outcome
        }
    };
    watcher.abort();

    let outcome = outcome?;
    match &outcome {
        RunOutcome::Completed { .. } => pb.finish_with_message("done"),
        _ => pb.abandon_with_message(describe(&outcome)),
    }
    Ok(outcome)
}

fn describe(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed { message_id } => format!("completed (message {message_id})"),
        RunOutcome::Paused { remaining } => format!("paused, {remaining} chunks left"),
        RunOutcome::Failed { reason } => format!("failed: {reason}"),
        RunOutcome::Cancelled => "cancelled".into(),
    }
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

// ── `shc keygen` ──────────────────────────────────────────────────────────────

async fn cmd_keygen(config: &ShcConfig, username: &str, server_key: &str) -> Result<()> {
    let password = prompt_password("New password: ")?;
    let confirm = prompt_password("Repeat password: ")?;
    if password.expose_secret() != confirm.expose_secret() {
        bail!("passwords do not match");
    }

    eprintln!("generating {}-bit identity key...", config.crypto.rsa_bits);
    let identity = IdentityManager::new(&config.crypto);
    let bundle = identity
        .register(username, &password, server_key)
        .await
        .context("generating identity")?;

    let json = serde_json::to_string_pretty(&bundle).context("serializing registration bundle")?;
    println!("{json}");
    Ok(())
}

// ── `shc config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &ShcConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `shc connect` ─────────────────────────────────────────────────────────────

async fn cmd_connect(config: &ShcConfig, args: &LoginArgs) -> Result<()> {
    let client = build_client(config)?;
    let mut events = client.subscribe();
    authenticate(&client, config, args).await?;
    client.connect()?;
    println!("connecting to {}", config.server.socket_url()?);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                client.transport().shutdown().await;
                println!("disconnected");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(ClientEvent::Authenticated { username, flushed }) => {
                    println!("logged in as {username} ({flushed} queued packets sent)");
                }
                Ok(ClientEvent::AuthFailed { reason }) => println!("login failed: {reason}"),
                Ok(ClientEvent::ChatKeys { added, failed }) => {
                    println!("chat keys: {} unlocked, {} unreadable", added.len(), failed.len());
                    for chat_id in failed {
                        println!("  chat {chat_id}: key could not be unwrapped");
                    }
                }
                Ok(ClientEvent::Terminated(termination)) => {
                    bail!("connection terminated: {termination:?}")
                }
                Err(RecvError::Lagged(n)) => warn!(missed = n, "event stream lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

// ── `shc upload` ──────────────────────────────────────────────────────────────

async fn cmd_upload(
    config: &ShcConfig,
    path: &Path,
    chat_id: ChatId,
    file_type: FileType,
    args: &LoginArgs,
) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let total_size = file
        .metadata()
        .await
        .with_context(|| format!("reading metadata: {}", path.display()))?
        .len();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("path has no file name")?;

    let client = build_client(config)?;
    authenticate(&client, config, args).await?;
    let key = fetch_chat_key(&client, chat_id, Duration::from_secs(args.wait_secs)).await?;
    let login = client
        .identity()
        .saved_login()
        .context("login did not complete")?;
    client.transport().shutdown().await;

    let pb = make_progress_bar(100, "encrypt");
    pb.set_message(file_name.clone());
    let envelope = encrypt_large_file(file, total_size, &key, |pct| pb.set_position(u64::from(pct)))
        .await
        .with_context(|| format!("encrypting {}", path.display()))?;
    pb.finish_with_message("done");

    let metadata = serde_json::json!({
        "name": file_name,
        "size": total_size,
        "type": file_type.as_str(),
    });
    let metadata = encrypt_text(&metadata.to_string(), &key)?;

    let engine = open_engine(config, Some(&login))?;
    let task = engine
        .init_upload(NewUpload {
            chat_id,
            file_name: file_name.clone(),
            file_type,
            metadata,
            total_size,
            payload: Bytes::from(envelope),
        })
        .await
        .context("starting upload")?;

    println!(
        "Uploading {} → chat {} ({}, {} chunks)",
        path.display(),
        chat_id,
        fmt_bytes(task.encrypted_size),
        task.total_chunks,
    );
    let outcome = run_with_progress(&engine, &task.id, "upload").await?;
    println!("  task:    {}", task.id);
    println!("  result:  {}", describe(&outcome));
    if !matches!(outcome, RunOutcome::Completed { .. }) {
        println!("  resume with: shc uploads resume {}", task.id);
    }
    Ok(())
}

// ── `shc uploads …` ───────────────────────────────────────────────────────────

fn cmd_uploads_list(config: &ShcConfig, chat: Option<ChatId>) -> Result<()> {
    let store = open_store(config)?;
    let mut tasks = match chat {
        Some(chat_id) => store.tasks_for_chat(chat_id)?,
        None => store.list_tasks()?,
    };
    if tasks.is_empty() {
        println!("no uploads");
        return Ok(());
    }
    tasks.sort_by_key(|t| t.created_at);

    println!(
        "{:<36}  {:>8}  {:<10}  {:>9}  {:>9}  FILE",
        "ID", "CHAT", "STATUS", "CHUNKS", "SIZE"
    );
    for task in tasks {
        println!(
            "{:<36}  {:>8}  {:<10}  {:>4}/{:<4}  {:>9}  {}",
            task.id,
            task.chat_id,
            task.status.as_str(),
            task.uploaded_chunks.len(),
            task.total_chunks,
            fmt_bytes(task.total_size),
            task.file_name,
        );
        if let Some(err) = &task.last_error {
            println!("{:<36}  last error: {err}", "");
        }
    }
    Ok(())
}

async fn cmd_uploads_resume(config: &ShcConfig, id: Option<&str>, check_remote: bool) -> Result<()> {
    let login = require_saved_login(config)?;
    let engine = open_engine(config, Some(&login))?;

    let ids = match id {
        Some(id) => vec![id.to_owned()],
        None => {
            let report = engine.recover(check_remote).await?;
            if report.swept > 0 {
                println!("swept {} expired uploads", report.swept);
            }
            for failed in &report.failed {
                println!("{failed}: cannot be resumed, marked failed");
            }
            report.resumable
        }
    };
    if ids.is_empty() {
        println!("nothing to resume");
        return Ok(());
    }

    for id in ids {
        let task = engine.reconcile(&id, check_remote).await?;
        if task.status.is_terminal() {
            println!("{id}: {}", task.last_error.as_deref().unwrap_or(task.status.as_str()));
            continue;
        }
        let outcome = run_with_progress(&engine, &id, "resume").await?;
        println!("{id}: {}", describe(&outcome));
    }
    Ok(())
}

async fn cmd_uploads_cancel(config: &ShcConfig, id: &str) -> Result<()> {
    let login = require_saved_login(config)?;
    let engine = open_engine(config, Some(&login))?;
    engine
        .cancel_upload(id)
        .await
        .with_context(|| format!("cancelling upload {id}"))?;
    println!("{id}: cancelled");
    Ok(())
}

async fn cmd_uploads_sweep(config: &ShcConfig) -> Result<()> {
    let engine = open_engine(config, None)?;
    let swept = engine.sweep_expired(now_millis()).await?;
    println!("swept {swept} uploads");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_upload() {
        let cli = Cli::try_parse_from([
            "shc", "-c", "/tmp/shc.toml", "upload", "photo.jpg", "--chat", "42", "--kind", "image",
        ])
        .unwrap();
        match cli.command {
            Commands::Upload { file, chat, kind, login } => {
                assert_eq!(file, PathBuf::from("photo.jpg"));
                assert_eq!(chat, 42);
                assert_eq!(FileType::from(kind), FileType::Image);
                assert!(login.username.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(1536), "1.5 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
