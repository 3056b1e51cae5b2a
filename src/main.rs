use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chat_relay::config::RelayConfig;
use chat_relay::correlation::{CorrelationStore, LibSqlCorrelationStore};
use chat_relay::pipeline::{DispatchConfig, DispatchOrchestrator};
use chat_relay::platform::{ExactMatchComparator, HttpTranslator, TelegramClient};
use chat_relay::relay::Relay;
use chat_relay::rules::RuleStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(&config);

    eprintln!("📨 Chat Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", config.config_dir.display());

    tokio::fs::create_dir_all(&config.config_dir)
        .await
        .with_context(|| format!("creating {}", config.config_dir.display()))?;

    // ── Rules ───────────────────────────────────────────────────────────
    let rules = Arc::new(RuleStore::load(config.rule_file()).await?);
    eprintln!("   Forwarders: {}", rules.list().await.len());

    // ── Correlations ────────────────────────────────────────────────────
    let correlations = Arc::new(LibSqlCorrelationStore::new_local(&config.correlation_db()).await?);
    import_legacy_correlations(&config, correlations.as_ref()).await?;

    // ── Platform ────────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramClient::new(
        config.bot_token.clone(),
        config.config_dir.join("downloads"),
        config.media_group_settle,
    ));
    let me = telegram.get_me().await.context("bot token rejected")?;
    eprintln!("   Bot: {} ({})", me.title, me.id);
    let events = telegram.start(me.id);

    let orchestrator = DispatchOrchestrator::new(
        telegram,
        correlations,
        rules,
        Some(Arc::new(HttpTranslator::new(config.translate_url.clone()))),
        DispatchConfig::from(&config),
    )
    .with_image_comparator(Arc::new(ExactMatchComparator));

    Relay::new(Arc::new(orchestrator), config.event_timeout)
        .run(events)
        .await;

    Ok(())
}

/// Stderr logging, plus a daily rolling file when a log directory is set.
fn init_tracing(config: &RelayConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chat-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

/// One-time import of the legacy JSON correlation file into an empty store.
async fn import_legacy_correlations(
    config: &RelayConfig,
    store: &dyn CorrelationStore,
) -> anyhow::Result<()> {
    let legacy = config.legacy_correlation_file();
    if !store.is_empty().await? || !tokio::fs::try_exists(&legacy).await.unwrap_or(false) {
        return Ok(());
    }

    let json = tokio::fs::read_to_string(&legacy)
        .await
        .with_context(|| format!("reading {}", legacy.display()))?;
    let imported = store.import_json(&json).await?;
    tokio::fs::rename(&legacy, legacy.with_extension("json.imported")).await?;
    tracing::info!(imported, file = %legacy.display(), "Legacy correlations imported");
    Ok(())
}
