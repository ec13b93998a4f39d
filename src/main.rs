use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use emergency_triage::channels::{StdinTransport, TelegramTransport, Transport};
use emergency_triage::config::TriageConfig;
use emergency_triage::llm::create_provider;
use emergency_triage::pipeline::lifecycle::undelivered_report;
use emergency_triage::pipeline::{
    AlertDispatcher, ContextCache, LlmClassifier, TriagePolicy, TriageProcessor, TriageWorker,
};
use emergency_triage::store::{FlagStore, LibSqlFlagStore};

/// Inbound messages buffered between the transport and the worker.
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Undelivered records listed at startup.
const RECOVERY_LIST_LIMIT: usize = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = TriageConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export OPENAI_API_KEY=sk-...");
        eprintln!("  export TRIAGE_ALERT_RECIPIENT=<chat id>");
        eprintln!("  export TRIAGE_MONITORED_CONVERSATIONS=<id>,<id>");
        std::process::exit(1);
    });

    let _log_guards = init_tracing(&config)?;

    eprintln!("🚨 Emergency Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Monitored conversations: {}", config.monitored_conversations.len());
    eprintln!("   Alert recipient: {}", config.alert_recipient);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn FlagStore> = Arc::new(
        LibSqlFlagStore::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    // ── Startup recovery: report alerts that never went out ────────────
    match undelivered_report(store.as_ref(), RECOVERY_LIST_LIMIT).await {
        Ok(report) if report.count == 0 => {}
        Ok(report) => {
            tracing::warn!(count = report.count, "Flagged messages with undelivered alerts");
            for record in &report.oldest {
                tracing::warn!(
                    id = %record.id,
                    conversation = %record.conversation_id,
                    category = %record.category,
                    flagged_at = %record.created_at,
                    "Undelivered alert"
                );
            }
        }
        Err(e) => tracing::error!(error = %e, "Failed to read undelivered alerts"),
    }

    // ── Pipeline ─────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let classifier = Arc::new(LlmClassifier::new(llm, config.classify_timeout));

    let transport: Arc<dyn Transport> = match &config.telegram_bot_token {
        Some(token) => Arc::new(TelegramTransport::new(token.clone())),
        None => {
            eprintln!("   Transport: stdin (conversation|sender|text per line)\n");
            Arc::new(StdinTransport::new())
        }
    };

    let dispatcher = Arc::new(AlertDispatcher::new(
        Arc::clone(&transport),
        config.alert_recipient.clone(),
        config.dispatch_timeout,
    ));
    let processor = Arc::new(TriageProcessor::new(
        classifier,
        Arc::clone(&store),
        dispatcher,
        TriagePolicy::new(config.confidence_threshold, config.enforce_threshold),
    ));

    let mut stream = transport
        .start()
        .await
        .with_context(|| format!("starting {} transport", transport.name()))?;

    let worker = TriageWorker::new(
        processor,
        Arc::new(ContextCache::new(config.context_window)),
        config.monitored_conversations.clone(),
    )
    .with_self_id(transport.self_id())
    .with_alert_recipient(config.alert_recipient.clone())
    .with_max_in_flight(config.max_in_flight)
    .with_shutdown_grace(config.shutdown_grace);

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let worker_handle = tokio::spawn(worker.run(rx));

    // ── Main loop ────────────────────────────────────────────────────────
    tracing::info!(transport = transport.name(), "Emergency triage ready and listening");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let message = tokio::select! {
            biased;
            _ = &mut ctrl_c => {
                tracing::info!("Ctrl+C received, shutting down...");
                break;
            }
            msg = stream.next() => {
                match msg {
                    Some(m) => m,
                    None => {
                        tracing::info!("Transport stream ended, shutting down...");
                        break;
                    }
                }
            }
        };

        // A full queue must not hide Ctrl+C.
        let sent = tokio::select! {
            biased;
            _ = &mut ctrl_c => {
                tracing::info!("Ctrl+C received, shutting down...");
                break;
            }
            sent = tx.send(message) => sent,
        };
        if sent.is_err() {
            tracing::error!("Triage worker stopped unexpectedly");
            break;
        }
    }

    // Closing the queue lets the worker drain and return.
    drop(tx);
    let stats = worker_handle.await.context("triage worker panicked")?;
    transport.shutdown().await?;

    eprintln!(
        "Processed {} messages ({} admitted, {} escalated, {} notified, {} failed)",
        stats.received, stats.admitted, stats.escalated, stats.notified, stats.failed
    );
    Ok(())
}

/// Console output plus `combined.log` (everything) and `error.log` (errors
/// only) under the configured log directory.
fn init_tracing(config: &TriageConfig) -> anyhow::Result<(WorkerGuard, WorkerGuard)> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let (combined, combined_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::never(&config.log_dir, "combined.log"),
    );
    let (errors, errors_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::never(&config.log_dir, "error.log"),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_writer(combined).with_ansi(false))
        .with(
            fmt::layer()
                .with_writer(errors)
                .with_ansi(false)
                .with_filter(LevelFilter::ERROR),
        )
        .try_init()
        .context("installing tracing subscriber")?;

    Ok((combined_guard, errors_guard))
}
