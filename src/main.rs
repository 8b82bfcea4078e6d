use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};

use copybot::config::AppConfig;
use copybot::db::{self, listen_for_changes, PgRelationshipStore, RelationshipStore};
use copybot::exchange::{spawn_dispatcher, ExchangeClient, HttpTransport, MarketInfoCache, ReqwestTransport};
use copybot::execution::{run_copy_engine, CopyEngine};
use copybot::ingestion::FeedSubscriber;
use copybot::metrics::init_metrics;
use copybot::models::Fill;
use copybot::services::{reconcile_subscriptions, run_subscription_sync};
use copybot::vault::EnvelopeVault;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing(config.log_json);

    // Pick rustls' ring backend before any TLS connection is made.
    let _ = rustls::crypto::ring::default_provider().install_default();

    init_metrics(config.metrics_listen_addr.as_deref())?;

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url).await?;
    tracing::info!("Database connected");

    let store: Arc<dyn RelationshipStore> = Arc::new(PgRelationshipStore::new(pool.clone()));

    // --- Execution layer: dispatcher → client → copy engine ---
    let transport: Arc<dyn HttpTransport> =
        Arc::new(ReqwestTransport::new(config.exchange_rest_url.clone(), config.http_timeout())?);
    let (dispatcher, dispatcher_task) = spawn_dispatcher(transport, config.dispatcher_config());
    let client = ExchangeClient::new(dispatcher).with_expiry_window(config.signature_expiry_window_ms);
    let markets = Arc::new(MarketInfoCache::new(config.default_lot_size));

    let engine = Arc::new(CopyEngine::new(
        Arc::clone(&store),
        Arc::new(EnvelopeVault),
        client,
        markets,
        config.copy_engine_config(),
    ));

    if config.dry_run {
        tracing::warn!("DRY_RUN enabled — copy orders will be logged, not submitted");
    }

    // --- Ingestion: feed subscriber → fill channel ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fill_tx, fill_rx) = mpsc::channel::<Fill>(config.fill_channel_capacity);
    let subscriber = FeedSubscriber::new(config.feed_config(), fill_tx);
    let feed = subscriber.handle();

    // Seed the subscription set so the first connect replays it.
    if let Err(e) = reconcile_subscriptions(store.as_ref(), &feed).await {
        tracing::error!(error = %e, "Initial subscription reconcile failed");
    }

    let trigger = Arc::new(Notify::new());
    let listener_task = tokio::spawn({
        let trigger = Arc::clone(&trigger);
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = listen_for_changes(pool, trigger, shutdown).await {
                tracing::error!(error = %e, "Relationship change listener stopped");
            }
        }
    });
    let sync_task = tokio::spawn(run_subscription_sync(
        Arc::clone(&store),
        feed,
        config.reconcile_interval_secs,
        trigger,
        shutdown_rx.clone(),
    ));
    let engine_task = tokio::spawn(run_copy_engine(engine, fill_rx));
    let mut feed_task = tokio::spawn(subscriber.run(shutdown_rx));

    tracing::info!(
        ws_url = %config.exchange_ws_url,
        rest_url = %config.exchange_rest_url,
        "Copy engine running"
    );

    let finished = tokio::select! {
        res = &mut feed_task => Some(res),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            None
        }
    };

    let _ = shutdown_tx.send(true);
    let feed_result = match finished {
        Some(res) => res,
        None => feed_task.await,
    };

    // The feed owned the only fill sender; the engine drains and returns.
    engine_task.await?;
    sync_task.await?;
    listener_task.await?;
    dispatcher_task.await?;

    match feed_result? {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Feed subscriber failed permanently");
            Err(e.into())
        }
    }
}

fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
