use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

use notify_service::broker::event::RoutingKey;
use notify_service::broker::BrokerManager;
use notify_service::config::Config;
use notify_service::error::AppError;
use notify_service::routes::build_router;
use notify_service::services::membership::PostgresMembership;
use notify_service::services::store::PostgresDeliveryStore;
use notify_service::services::{DeliveryStore, FanoutCoordinator, MembershipResolver};
use notify_service::websocket::SessionRegistry;
use notify_service::{db, logging, AppState};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();

    let config = Arc::new(Config::from_env()?);

    let pool = db::init_pool(&config.database_url).await?;
    db::run_migrations(&pool).await.map_err(sqlx::Error::from)?;

    // A broker that is down at boot is not fatal: /health reports it down
    // and the consumer loops keep retrying until it answers.
    let broker = Arc::new(BrokerManager::new(&config.redis_url, &config.consumer_group)?);
    if let Err(e) = broker.connect().await {
        tracing::error!(error = %e, "broker unreachable at startup, consumers will keep retrying");
    }

    let registry = SessionRegistry::new();
    let store: Arc<dyn DeliveryStore> = Arc::new(PostgresDeliveryStore::new(pool.clone()));
    let membership: Arc<dyn MembershipResolver> = Arc::new(PostgresMembership::new(pool));
    let coordinator = Arc::new(FanoutCoordinator::new(
        store.clone(),
        membership.clone(),
        registry.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumers = Vec::new();
    for routing_key in RoutingKey::ENABLED {
        consumers.push(tokio::spawn(broker.clone().consume(
            *routing_key,
            coordinator.clone(),
            shutdown_rx.clone(),
        )));
    }

    let state = AppState {
        registry: registry.clone(),
        broker,
        store,
        membership,
        config: config.clone(),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::StartServer(e.to_string()))?;
    tracing::info!(%addr, "notify-service listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal(registry, shutdown_tx))
        .await
        .map_err(|e| AppError::StartServer(e.to_string()))?;

    for consumer in consumers {
        let _ = consumer.await;
    }
    tracing::info!("notify-service stopped");
    Ok(())
}

/// Ordered teardown: close live sessions first so no push races a dying
/// socket, then stop the consumers, then let the HTTP server drain.
async fn shutdown_signal(registry: SessionRegistry, shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
    registry.shutdown().await;
    let _ = shutdown_tx.send(true);
}
