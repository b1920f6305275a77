//! Implementations of the `swatch` subcommands.
//!
//! Each function prints human-readable output to stdout; logs and
//! progress go to stderr.

use anyhow::{bail, Context, Result};
use schedule_watch_core::detect::Change;
use schedule_watch_core::extract::{extract_schedule_with, Labels};
use schedule_watch_core::format::render_schedule;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::bot::{self, BotApi, BotHandler};
use crate::config::{load_config, resolve_encoding, Config};
use crate::fetch::{Fetcher, FileFetcher, HttpFetcher};
use crate::guard::GuardPipeline;
use crate::moderation::{self, ModerationOutcome, NoticeStatus};
use crate::notify::{Audience, DeliveryOutcome, Notifier};
use crate::pipeline::{display_time, CycleReport, NotifyStatus, Pipeline};
use crate::progress::ProgressMode;
use crate::recipients::{FileRecipientRegistry, RecipientRegistry};
use crate::scheduler::{self, Timing};
use crate::session::InMemorySessionStore;
use crate::snapshot::{SnapshotStore, CURRENT_FILE};
use crate::transport::{TelegramTransport, Transport};

/// Starter configuration written by `swatch init`.
pub const CONFIG_TEMPLATE: &str = include_str!("../config/swatch.example.toml");

fn snapshot_store(cfg: &Config) -> SnapshotStore {
    SnapshotStore::new(&cfg.storage.snapshots_dir, cfg.storage.history_limit)
}

fn registry(cfg: &Config) -> Arc<FileRecipientRegistry> {
    Arc::new(FileRecipientRegistry::new(&cfg.storage.users_dir))
}

/// The configured transport, or `None` with a warning when no token is set.
fn transport(cfg: &Config) -> Option<Arc<TelegramTransport>> {
    match TelegramTransport::new(&cfg.transport) {
        Ok(t) => Some(Arc::new(t)),
        Err(e) => {
            tracing::warn!(error = %e, "transport not configured");
            None
        }
    }
}

fn notifier(cfg: &Config, transport: Arc<dyn Transport>, registry: Arc<dyn RecipientRegistry>) -> Notifier {
    Notifier::new(
        transport,
        registry,
        Duration::from_secs(cfg.transport.timeout_secs),
        cfg.transport.concurrency,
    )
}

fn pipeline(cfg: &Config, notifier: Option<Notifier>) -> Result<Pipeline> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&cfg.source)?);
    Ok(Pipeline::new(
        fetcher,
        snapshot_store(cfg),
        registry(cfg),
        notifier,
        cfg.labels.labels(),
    ))
}

// ============ init ============

/// Writes a starter config when none exists, then creates the data and
/// log directories it names. Safe to run repeatedly.
pub fn run_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("Config exists: {}", config_path.display());
    } else {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(config_path, CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote config: {}", config_path.display());
    }

    let cfg = load_config(config_path)?;
    for dir in [
        &cfg.storage.snapshots_dir,
        &cfg.storage.users_dir,
        &cfg.logging.dir,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        println!("Directory ready: {}", dir.display());
    }
    Ok(())
}

// ============ check ============

/// Runs one cycle now. With `dry_run` nothing is written or sent.
pub async fn run_check(cfg: &Config, dry_run: bool) -> Result<()> {
    let notifier = if dry_run {
        None
    } else {
        transport(cfg).map(|t| notifier(cfg, t, registry(cfg)))
    };
    let pipeline = pipeline(cfg, notifier)?;
    let report = if dry_run {
        pipeline.dry_run().await?
    } else {
        pipeline.run_cycle().await?
    };
    print_cycle_report(&report);
    Ok(())
}

fn print_cycle_report(report: &CycleReport) {
    let doc = &report.snapshot.document;
    println!(
        "Schedule: {} days, {} lessons",
        doc.len(),
        doc.lesson_count()
    );
    println!("Hash:     {}", report.snapshot.content_hash);
    match &report.change {
        Change::Changed {
            previous_hash: None,
            ..
        } => println!("Status:   first capture"),
        Change::Changed { changed_dates, .. } => {
            println!("Status:   changed ({})", changed_dates.join(", "))
        }
        Change::Unchanged { .. } => println!("Status:   unchanged"),
        Change::ExtractionFailed => println!("Status:   extraction failed"),
    }
    if let Some(file) = &report.history_file {
        println!("History:  {}", file);
    }
    let notification = match &report.notification {
        NotifyStatus::Skipped => "skipped".to_string(),
        NotifyStatus::NotConfigured => "not configured".to_string(),
        NotifyStatus::Suppressed => "suppressed (dry run)".to_string(),
        NotifyStatus::Failed { reason } => format!("failed: {}", reason),
        NotifyStatus::Sent(delivery) => format!(
            "sent {}, failed {}",
            delivery.delivered, delivery.failed
        ),
    };
    println!("Notify:   {}", notification);
}

// ============ parse ============

/// Extracts a saved page and prints the document as JSON.
pub async fn run_parse(file: &Path, encoding: &str, labels: &Labels) -> Result<()> {
    let fetcher = FileFetcher::new(file, resolve_encoding(encoding)?);
    let html = fetcher.fetch().await?;
    let document = extract_schedule_with(&html, labels)?;
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

// ============ run ============

/// The long-running worker: scheduler plus bot, until Ctrl-C.
pub async fn run_worker(cfg: &Config) -> Result<()> {
    let Some(transport) = transport(cfg) else {
        tracing::warn!("not configured, worker has nothing to do");
        return Ok(());
    };
    let registry = registry(cfg);
    let notifier = notifier(cfg, transport.clone(), registry.clone());
    let pipeline = Arc::new(pipeline(cfg, Some(notifier))?);

    let scheduler = scheduler::spawn(pipeline, Timing::from_config(&cfg.scheduler));

    let sessions = Arc::new(InMemorySessionStore::new());
    let guards = GuardPipeline::standard(sessions.clone(), &cfg.bot);
    tracing::debug!(guards = guards.len(), "bot guards registered");
    let handler = BotHandler::new(registry, snapshot_store(cfg), guards, sessions);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api: Arc<dyn BotApi> = transport;
    let bot_task = tokio::spawn(bot::run(api, handler, cfg.bot.poll_timeout_secs, shutdown_rx));

    tracing::info!("worker started");
    shutdown_signal().await?;
    tracing::info!("shutting down");

    shutdown_tx.send_replace(true);
    scheduler.close().await;
    bot_task.await.context("Bot task panicked")?;
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM from the dashboard's supervisor.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("Failed to listen for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    Ok(())
}

// ============ history / show ============

pub fn run_history(cfg: &Config, limit: usize) -> Result<()> {
    let entries = snapshot_store(cfg).list()?;
    if entries.is_empty() {
        println!("No history yet.");
        return Ok(());
    }
    for entry in entries.iter().take(limit) {
        println!(
            "{}  {}  {:>8} bytes",
            entry.name,
            display_time(&entry.captured_at),
            entry.size_bytes
        );
    }
    if entries.len() > limit {
        println!("... {} more", entries.len() - limit);
    }
    Ok(())
}

/// Prints a snapshot as the bot would show it, or as JSON.
pub fn run_show(cfg: &Config, name: Option<&str>, json: bool) -> Result<()> {
    let store = snapshot_store(cfg);
    let snapshot = match name {
        Some(name) => store.load(name)?,
        None => match store.current()? {
            Some(s) => s,
            None => bail!("No schedule captured yet (no {})", CURRENT_FILE),
        },
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!(
            "{}",
            render_schedule(&snapshot.document, &display_time(&snapshot.captured_at))
        );
    }
    Ok(())
}

// ============ users ============

pub async fn run_users_list(cfg: &Config) -> Result<()> {
    let users = registry(cfg).all().await?;
    if users.is_empty() {
        println!("No users.");
        return Ok(());
    }
    for user in &users {
        let mut flags = Vec::new();
        if user.subscribed {
            flags.push("subscribed".to_string());
        }
        if user.blocked {
            match &user.blocked_reason {
                Some(reason) => flags.push(format!("blocked: {}", reason)),
                None => flags.push("blocked".to_string()),
            }
        }
        if user.chat_id.is_none() {
            flags.push("no chat".to_string());
        }
        println!("{:<32} {}", user.label(), flags.join(", "));
    }
    println!("{} users", users.len());
    Ok(())
}

pub async fn run_users_ban(cfg: &Config, id: i64, reason: Option<&str>) -> Result<()> {
    let transport = transport(cfg);
    let outcome = moderation::block(
        registry(cfg).as_ref(),
        transport.as_deref().map(|t| t as &dyn Transport),
        id,
        reason,
    )
    .await?;
    print_moderation("Blocked", &outcome);
    Ok(())
}

pub async fn run_users_unban(cfg: &Config, id: i64) -> Result<()> {
    let transport = transport(cfg);
    let outcome = moderation::unblock(
        registry(cfg).as_ref(),
        transport.as_deref().map(|t| t as &dyn Transport),
        id,
    )
    .await?;
    print_moderation("Unblocked", &outcome);
    Ok(())
}

fn print_moderation(action: &str, outcome: &ModerationOutcome) {
    println!("{} {}", action, outcome.user.label());
    let notice = match &outcome.notice {
        NoticeStatus::Sent => "sent".to_string(),
        NoticeStatus::NotConfigured => "not configured".to_string(),
        NoticeStatus::NoAddress => "user has no chat".to_string(),
        NoticeStatus::Failed { reason } => format!("failed: {}", reason),
    };
    println!("Notice: {}", notice);
}

// ============ broadcast ============

pub async fn run_broadcast(
    cfg: &Config,
    message: &str,
    user: Option<i64>,
    progress: ProgressMode,
) -> Result<()> {
    if message.trim().is_empty() {
        bail!("message must not be empty");
    }
    let Some(transport) = transport(cfg) else {
        bail!("Transport token is not configured");
    };
    let registry = registry(cfg);
    let recipients = registry.all().await?;
    let audience = match user {
        Some(id) if !recipients.iter().any(|r| r.id == id) => bail!("User {} not found", id),
        Some(id) => Audience::One(id),
        None => Audience::All,
    };

    let notifier = notifier(cfg, transport, registry).with_progress(Arc::from(progress.reporter()));
    let report = notifier.broadcast(&recipients, message, audience).await;

    for detail in &report.details {
        if let DeliveryOutcome::Failed { reason } = &detail.outcome {
            println!("  {}: {}", detail.recipient_id, reason);
        }
    }
    println!("Delivered {}, failed {}", report.delivered, report.failed);
    Ok(())
}
