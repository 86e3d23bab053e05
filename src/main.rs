use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use queuewatch::config::{Config, ConfigOverrides};
use queuewatch::correlator::Correlator;
use queuewatch::model::{MessageId, QueueAction};
use queuewatch::parser::{parse_line, ParseStats};
use queuewatch::queue::QueueController;
use queuewatch::store::Storage;
use queuewatch::tailer::FileTailer;
use queuewatch::watcher::{FileWatcher, WatchEvent};
use queuewatch::AppContext;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "queuewatchd", about = "MTA operator control panel core", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config.toml
    #[arg(long, env = "QUEUEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Paths to MTA log files to watch (overrides config)
    #[arg(long, env = "QUEUEWATCH_LOG_PATHS")]
    log_paths: Vec<PathBuf>,

    /// Path to the MTA binary used for queue operations
    #[arg(long, env = "QUEUEWATCH_BINARY_PATH")]
    binary_path: Option<PathBuf>,

    /// Path to the SQLite database file
    #[arg(long, env = "QUEUEWATCH_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "QUEUEWATCH_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "QUEUEWATCH_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the core: watch logs, correlate events, and poll the queue.
    ///
    /// Runs in the foreground. When invoked with no subcommand, this is the
    /// default.
    ///
    /// Examples:
    ///   queuewatchd serve
    ///   queuewatchd
    Serve,
    /// Query and act on the queue and message history.
    ///
    /// Examples:
    ///   queuewatchd queue list
    ///   queuewatchd queue inspect 1hKj4x-0008Oi-3r
    ///   queuewatchd queue freeze 1hKj4x-0008Oi-3r
    ///   queuewatchd queue bulk-freeze 1hKj4x-0008Oi-3r 1hKj4y-0008Oi-3s
    Queue {
        /// Attribute the resulting audit entry to this operator (defaults to "unknown").
        #[arg(long, global = true)]
        actor: Option<String>,

        #[command(subcommand)]
        action: QueueAction_,
    },
    /// Backfill historical log content into the store.
    ///
    /// Reads a log file from the beginning in batches and correlates it the
    /// same way live tailing does. Exclusive with live tailing of the same
    /// file — stop `serve` (or point it at a different path) before running
    /// this against a file still being actively tailed.
    ///
    /// Examples:
    ///   queuewatchd import /var/log/exim4/mainlog.1
    Import {
        /// Log file to import
        path: PathBuf,
        /// Which log source this file represents
        #[arg(long, default_value = "main")]
        source: String,
    },
}

#[derive(Subcommand)]
enum QueueAction_ {
    /// Raw queue listing (`exim -bp`-equivalent).
    List,
    /// Show headers for one message.
    Inspect {
        message_id: String,
    },
    /// Force immediate delivery attempt for one message.
    Deliver {
        message_id: String,
    },
    /// Freeze one message.
    Freeze {
        message_id: String,
    },
    /// Thaw one message.
    Thaw {
        message_id: String,
    },
    /// Delete one message from the queue.
    Delete {
        message_id: String,
    },
    /// Freeze every listed message id, continuing past failures.
    BulkFreeze {
        message_ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _guard = setup_logging(&log_level, args.log_file.as_deref());

    let overrides = ConfigOverrides {
        log_paths: if args.log_paths.is_empty() { None } else { Some(args.log_paths.clone()) },
        binary_path: args.binary_path.clone(),
        db_path: args.db_path.clone(),
        log_level: args.log.clone(),
        ..Default::default()
    };
    let config = Config::load(args.config.as_deref(), overrides);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config).await,
        Command::Queue { actor, action } => run_queue_action(config, actor, action).await,
        Command::Import { path, source } => run_import(config, path, source).await,
    }
}

async fn run_serve(config: Config) -> Result<()> {
    info!(
        log_paths = ?config.log_paths,
        binary_path = %config.binary_path.display(),
        "starting queuewatch core"
    );

    let ctx = AppContext::build(config).await.context("failed to build application context")?;

    let mut watch_dirs: Vec<PathBuf> = ctx
        .config
        .log_paths
        .iter()
        .filter_map(|p| p.parent().map(|d| d.to_path_buf()))
        .collect();
    watch_dirs.sort();
    watch_dirs.dedup();

    let mut watcher = match FileWatcher::new(&watch_dirs) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to start file watcher");
            return Err(e.into());
        }
    };

    let parse_stats = Arc::new(ParseStats::default());
    let mut tailers: std::collections::HashMap<PathBuf, FileTailer> = std::collections::HashMap::new();
    for path in &ctx.config.log_paths {
        match FileTailer::open_at_eof(path.clone(), ctx.tail_registry.clone()).await {
            Ok(tailer) => {
                tailers.insert(path.clone(), tailer);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "could not open log file for tailing, will retry on next watch event"),
        }
    }

    let retention_ctx = ctx.clone();
    let retention_guard = ctx.shutdown.register_worker();
    let retention_task = tokio::spawn(async move {
        let _guard = retention_guard;
        let interval_secs = (retention_ctx.config.retention.cleanup_interval_hours * 3600).max(60);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        let token = retention_ctx.shutdown.cancellation_token();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let retention_config = (&retention_ctx.config.retention).into();
                    match retention_ctx.store.apply_retention(&retention_config).await {
                        Ok(result) => {
                            info!(
                                log_entries = result.log_entries,
                                delivery_attempts = result.delivery_attempts,
                                audit_entries = result.audit_entries,
                                queue_snapshots = result.queue_snapshots,
                                "retention sweep complete"
                            );
                            if let Err(e) = retention_ctx.store.vacuum().await {
                                warn!(error = %e, "space reclamation after retention sweep failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "retention sweep failed"),
                    }
                }
            }
        }
    });

    let snapshot_ctx = ctx.clone();
    let snapshot_guard = ctx.shutdown.register_worker();
    let snapshot_task = tokio::spawn(async move {
        let _guard = snapshot_guard;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(snapshot_ctx.config.snapshot_interval_seconds));
        let token = snapshot_ctx.shutdown.cancellation_token();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    match snapshot_ctx.queue.snapshot().await {
                        Ok(snapshot) => {
                            if let Err(e) = snapshot_ctx.store.insert_queue_snapshot(&snapshot).await {
                                warn!(error = %e, "failed to persist queue snapshot");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to take queue snapshot"),
                    }
                }
            }
        }
    });

    let token = ctx.shutdown.cancellation_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            ctx.shutdown.begin_shutdown();
        }
        _ = async {
            loop {
                match watcher.next_event().await {
                    Some(event) => handle_watch_event(&ctx, &mut tailers, &parse_stats, event).await,
                    None => break,
                }
            }
        } => {}
        _ = token.cancelled() => {}
    }

    ctx.shutdown.begin_shutdown();
    ctx.shutdown.wait_for_drain(std::time::Duration::from_secs(5)).await;
    snapshot_task.abort();
    retention_task.abort();
    Ok(())
}

async fn handle_watch_event(
    ctx: &AppContext,
    tailers: &mut std::collections::HashMap<PathBuf, FileTailer>,
    parse_stats: &Arc<ParseStats>,
    event: WatchEvent,
) {
    let path = match &event {
        WatchEvent::Created(p) | WatchEvent::Written(p) | WatchEvent::Removed(p) => p.clone(),
        WatchEvent::Renamed { to, .. } => to.clone(),
    };

    if !ctx.config.log_paths.contains(&path) {
        return;
    }

    match event {
        WatchEvent::Created(_) | WatchEvent::Written(_) | WatchEvent::Renamed { .. } => {
            if !tailers.contains_key(&path) {
                match FileTailer::open_at_eof(path.clone(), ctx.tail_registry.clone()).await {
                    Ok(tailer) => {
                        tailers.insert(path.clone(), tailer);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to open tailer");
                        return;
                    }
                }
            }
            let Some(tailer) = tailers.get_mut(&path) else { return };
            let lines = match tailer.read_available_lines().await {
                Ok(lines) => lines,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read tailed lines");
                    return;
                }
            };
            let log_source = queuewatch::model::LogSource::from_filename(&path.to_string_lossy());
            for line in lines {
                process_line(ctx, &line, log_source, parse_stats).await;
            }
        }
        WatchEvent::Removed(_) => {
            tailers.remove(&path);
        }
    }
}

async fn process_line(
    ctx: &AppContext,
    line: &str,
    log_source: queuewatch::model::LogSource,
    parse_stats: &Arc<ParseStats>,
) {
    let Some(event) = parse_line(line, log_source, Some(parse_stats)) else { return };

    let entry = log_entry_from_event(&event, log_source, line);
    if let Err(e) = ctx.store.create_log_entry(&entry).await {
        warn!(error = %e, "failed to persist log entry");
    }
    if let Err(e) = ctx.correlator.apply(&event).await {
        warn!(error = %e, "failed to correlate event");
    }
    ctx.events.publish(queuewatch::events::BusEvent {
        event_type: event.event_type(),
        message_id: event.message_id().cloned(),
        summary: line.to_string(),
    });
}

/// Project a parsed [`queuewatch::parser::LogEvent`] into the flattened
/// `log_entries` search row. Keeping this separate from `process_line` lets
/// `run_import` reuse the exact same projection (spec.md §8 "Historical
/// import idempotency" depends on live and imported rows looking identical).
fn log_entry_from_event(
    event: &queuewatch::parser::LogEvent,
    log_source: queuewatch::model::LogSource,
    line: &str,
) -> queuewatch::model::LogEntry {
    use queuewatch::parser::LogEvent;

    let (sender, recipients, host, smtp_code, error) = match event {
        LogEvent::Received { sender, host, .. } => (Some(sender.clone()), None, host.clone(), None, None),
        LogEvent::DeliveryAttempt { recipient, host, smtp_code, error, .. } => {
            (None, Some(recipient.clone()), host.clone(), smtp_code.clone(), error.clone())
        }
        LogEvent::Rejected { sender, recipient, smtp_code, reason, .. } => {
            (sender.clone(), recipient.clone(), None, smtp_code.clone(), Some(reason.clone()))
        }
        LogEvent::Panic { text, .. } => (None, None, None, None, Some(text.clone())),
        LogEvent::QueueOp { .. } | LogEvent::Unknown { .. } => (None, None, None, None, None),
    };

    queuewatch::model::LogEntry {
        timestamp: event.timestamp(),
        log_source,
        event_type: event.event_type(),
        message_id: event.message_id().cloned(),
        sender,
        recipients,
        host,
        smtp_code,
        error,
        raw_line: line.to_string(),
    }
}

async fn run_queue_action(config: Config, actor: Option<String>, action: QueueAction_) -> Result<()> {
    let ctx = AppContext::build(config).await?;

    match action {
        QueueAction_::List => {
            let listing = ctx.queue.list_queue().await?;
            println!("{listing}");
        }
        QueueAction_::Inspect { message_id } => {
            let mid = parse_message_id(&message_id)?;
            let details = queuewatch::inspect::inspect_message(&ctx, &mid).await?;
            println!("status: {:?}", details.message.as_ref().map(|m| m.current_status));
            if let Some(headers) = &details.headers {
                println!("--- headers ---\n{headers}");
            }
            if let Some(body) = &details.body_preview {
                println!("--- body preview{} ---\n{body}", if details.body_truncated { " (truncated)" } else { "" });
            }
            if let Some(log) = &details.mta_log {
                println!("--- mta log ---\n{log}");
            }
            println!("--- recipients ---");
            for recipient_timeline in &details.trace.timeline.recipients {
                println!("{}: {:?}", recipient_timeline.recipient.recipient_address, recipient_timeline.recipient.status);
            }
        }
        QueueAction_::Deliver { message_id } => {
            let mid = parse_message_id(&message_id)?;
            run_single_op(&ctx, actor.as_deref(), &mid, QueueAction::Deliver).await?;
        }
        QueueAction_::Freeze { message_id } => {
            let mid = parse_message_id(&message_id)?;
            run_single_op(&ctx, actor.as_deref(), &mid, QueueAction::Freeze).await?;
        }
        QueueAction_::Thaw { message_id } => {
            let mid = parse_message_id(&message_id)?;
            run_single_op(&ctx, actor.as_deref(), &mid, QueueAction::Thaw).await?;
        }
        QueueAction_::Delete { message_id } => {
            let mid = parse_message_id(&message_id)?;
            run_single_op(&ctx, actor.as_deref(), &mid, QueueAction::Delete).await?;
        }
        QueueAction_::BulkFreeze { message_ids } => {
            // Malformed ids are carried through to `operate::execute` rather
            // than filtered out here, so a bad id still gets an audited,
            // failed per-id result instead of silently vanishing from the
            // request (spec.md §8 "Bulk freeze with one bad id").
            let outcome =
                queuewatch::operate::execute(&ctx, QueueAction::Freeze, &message_ids, actor.as_deref(), None, None).await?;
            match outcome {
                queuewatch::operate::OperateOutcome::Bulk(result) => {
                    println!("total={} successful={} failed={}", result.total, result.successful, result.failed);
                }
                queuewatch::operate::OperateOutcome::Single(result) => {
                    println!("total=1 successful={} failed={}", result.success as u8, (!result.success) as u8);
                }
            }
        }
    }
    Ok(())
}

async fn run_single_op(ctx: &AppContext, actor: Option<&str>, mid: &MessageId, action: QueueAction) -> Result<()> {
    let ids = [mid.as_str().to_string()];
    let outcome = queuewatch::operate::execute(ctx, action, &ids, actor, None, None).await?;
    match outcome {
        queuewatch::operate::OperateOutcome::Single(result) => {
            result.error.map_or(Ok(()), |e| Err(anyhow::anyhow!(e)))
        }
        queuewatch::operate::OperateOutcome::Bulk(_) => unreachable!("single id always yields OperateOutcome::Single"),
    }
}

fn parse_message_id(raw: &str) -> Result<MessageId> {
    MessageId::parse(raw).ok_or_else(|| anyhow::anyhow!("invalid message id: {raw}"))
}

async fn run_import(config: Config, path: PathBuf, source: String) -> Result<()> {
    let log_source = queuewatch::model::LogSource::parse(&source)
        .ok_or_else(|| anyhow::anyhow!("unknown log source: {source}"))?;
    let store = Storage::connect(&config.db_path, config.db_max_open_conns).await?;
    let correlator = Correlator::new(store.clone());
    let parse_stats = ParseStats::default();

    let mut imported = 0usize;
    queuewatch::tailer::historical_import_batches(path, 100, |batch| {
        for line in &batch {
            let Some(event) = parse_line(line, log_source, Some(&parse_stats)) else { continue };
            let entry = log_entry_from_event(&event, log_source, line);
            // The import callback is sync; block_in_place lets us drive the
            // store/correlator futures without leaving the tokio runtime.
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    let _ = store.create_log_entry(&entry).await;
                    let _ = correlator.apply(&event).await;
                });
            });
            imported += 1;
        }
        true
    })
    .await?;

    info!(imported, misses = parse_stats.miss_count(), "historical import complete");
    Ok(())
}

fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("queuewatch.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level.to_string()))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
        None
    }
}
