/**
 * CONVERGE KERNEL - Point d'entrée du service de réconciliation
 *
 * RÔLE : Orchestration des modules : config, store, coordinateur, MQTT, HTTP.
 * Bootstrap complet avec logging structuré et arrêt propre sur Ctrl-C.
 *
 * ARCHITECTURE : Inventaire MQTT → coordinateur → playbooks MQTT, plus l'API REST
 * sur le même store SQLite.
 */

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use converge_kernel::config::load_config;
use converge_kernel::dispatch::Coordinator;
use converge_kernel::health::HealthTracker;
use converge_kernel::http::{self, AppState};
use converge_kernel::inventory::InventoryConsumer;
use converge_kernel::mqtt::{self, MqttPlaybookSender};
use converge_kernel::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("converge_kernel=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = load_config().await;
    let unknown = cfg.unknown_default_fields();
    if !unknown.is_empty() {
        warn!(?unknown, "default_state contains fields outside the schema, they are ignored");
    }

    let store = Store::open(&cfg.database.path)
        .with_context(|| format!("failed to open database {}", cfg.database.path))?;
    info!(path = %cfg.database.path, "store ready");

    let health_tracker = HealthTracker::new();

    // Client MQTT partagé : listener + envoi des playbooks
    let (client, eventloop) = mqtt::create_mqtt_client(&cfg.mqtt);
    let sender = Arc::new(MqttPlaybookSender::new(client.clone()));

    let coordinator = Coordinator::new(
        store.clone(),
        sender,
        cfg.dispatch.retry_policy(),
        cfg.default_state.clone(),
        health_tracker.clone(),
    );
    let consumer = InventoryConsumer::new(coordinator.clone(), health_tracker.clone());

    let (ack_tx, ack_rx) = mpsc::channel(256);
    let ack_loop = coordinator.spawn_ack_loop(ack_rx);
    let sweeper = coordinator.spawn_sweeper(cfg.dispatch.sweep_interval());
    let listener_task = mqtt::spawn_mqtt_listener(
        client.clone(),
        eventloop,
        cfg.mqtt.clone(),
        consumer,
        ack_tx,
        health_tracker.clone(),
    );

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        store,
        coordinator,
        health_tracker,
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    sweeper.abort();
    listener_task.abort();
    ack_loop.abort();
    if let Err(e) = client.disconnect().await {
        warn!(error = %e, "MQTT disconnect failed");
    }
    Ok(())
}
