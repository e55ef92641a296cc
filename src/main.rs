use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use stk_api::config::AppConfig;
use stk_api::database::{
    connect_postgres, connect_redis, PgTransactionStore, RedisEventBus, RedisRequestCache,
};
use stk_api::middleware::auth::AuthApi;
use stk_api::routes::build_router;
use stk_api::services::credentials::Credentials;
use stk_api::services::mpesa_service::MpesaService;
use stk_api::services::stk_service::StkService;
use stk_api::state::AppState;
use stk_api::workers::{
    ProcessListener, Reconciler, ReconcilerConfig, TokenRefreshConfig, TokenRefresher,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    tracing::info!(config = %config.get_config_info(), "App config loaded");

    let pool = connect_postgres(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    let (redis_client, redis_conn) = connect_redis(&config.redis_url)
        .await
        .context("failed to connect to redis")?;

    let api = Arc::new(MpesaService::new(config.get_mpesa_urls())?);
    let credentials = Arc::new(Credentials::new(
        &config.mpesa_consumer_key,
        &config.mpesa_consumer_secret,
    ));
    let auth = Arc::new(AuthApi::new(config.jwt_secret.clone(), config.admin_groups.clone()));

    let stk = StkService::new(
        Arc::new(PgTransactionStore::new(pool)),
        Arc::new(RedisRequestCache::new(redis_conn.clone())),
        Arc::new(RedisEventBus::new(redis_client, redis_conn)),
        api.clone(),
        credentials.clone(),
        config.mpesa_settings(),
        auth,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    let refresher = TokenRefresher::new(
        credentials,
        api,
        TokenRefreshConfig::with_interval_secs(config.token_refresh_secs),
    );
    let rx = shutdown_rx.clone();
    workers.push(tokio::spawn(async move { refresher.run(rx).await }));

    if config.allow_query_status {
        let reconciler = Reconciler::new(
            stk.clone(),
            ReconcilerConfig {
                interval: Duration::from_secs(config.reconcile_interval_secs),
                stale_after: Duration::from_secs(config.reconcile_stale_mins * 60),
                concurrency: config.reconcile_concurrency,
                system_id_prefix: config.system_id_prefix.clone(),
                ..ReconcilerConfig::default()
            },
        );
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { reconciler.run(rx).await }));
    } else {
        tracing::info!("Status queries disabled, reconciler not started");
    }

    if let Some(channel) = config.publish_process_channel.clone() {
        let listener = ProcessListener::new(stk.clone(), channel);
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            if let Err(e) = listener.run(rx).await {
                tracing::error!(error = %e, "Process listener exited");
            }
        }));
    }

    let app = build_router(AppState::new(stk));
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid HOST/PORT")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    tracing::info!("🚀 Server starting on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "worker task failed");
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
}
