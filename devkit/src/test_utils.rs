/*!
Test Harness pour le kernel Converge

Assemble un environnement complet sans dépendance externe :
- Store SQLite dans un répertoire temporaire (fichier réel, WAL compris)
- Coordinateur branché sur un `RecordingSender`
- Consommateur d'inventaire et générateur d'événements numérotés
*/

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use converge_kernel::dispatch::{Coordinator, RetryPolicy};
use converge_kernel::health::HealthTracker;
use converge_kernel::http::AppState;
use converge_kernel::inventory::{EventOutcome, InventoryConsumer};
use converge_kernel::models::{DispatchRecord, StateMap};
use converge_kernel::store::Store;

use crate::event_builders::{ack_payload, EventBuilder};
use crate::sender_stub::RecordingSender;

/// Harness de test complet du pipeline
pub struct TestHarness {
    dir: TempDir,
    pub store: Store,
    pub sender: RecordingSender,
    pub health: HealthTracker,
    pub coordinator: Coordinator,
    pub consumer: InventoryConsumer,
    pub events: EventBuilder,
}

impl TestHarness {
    /// 3 tentatives, timeout d'ack 60s, backoff 10s plafonné à 60s
    pub fn test_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            ack_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(60),
        }
    }

    /// Profil par défaut : tout activé
    pub fn all_enabled() -> StateMap {
        ["insights", "remediations", "compliance"]
            .iter()
            .map(|f| (f.to_string(), true))
            .collect()
    }

    pub fn new() -> Result<Self> {
        Self::with_config(Self::test_policy(), Self::all_enabled())
    }

    pub fn with_config(policy: RetryPolicy, default_state: StateMap) -> Result<Self> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let store = Store::open(dir.path().join("converge.db"))?;
        let sender = RecordingSender::new();
        let health = HealthTracker::new();
        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(sender.clone()),
            policy,
            default_state,
            health.clone(),
        );
        let consumer = InventoryConsumer::new(coordinator.clone(), health.clone());

        Ok(Self {
            dir,
            store,
            sender,
            health,
            coordinator,
            consumer,
            events: EventBuilder::new(),
        })
    }

    /// Chemin de la base, pour ouvrir un second store (autre "process")
    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("converge.db")
    }

    pub async fn host_created(&mut self, host_id: &str, org_id: &str) -> Result<EventOutcome> {
        let payload = self.events.created(host_id, org_id);
        Ok(self.consumer.handle(&payload).await?)
    }

    pub async fn host_updated(&mut self, host_id: &str, org_id: &str) -> Result<EventOutcome> {
        let payload = self.events.updated(host_id, org_id);
        Ok(self.consumer.handle(&payload).await?)
    }

    pub async fn host_deleted(&mut self, host_id: &str, org_id: &str) -> Result<EventOutcome> {
        let payload = self.events.deleted(host_id, org_id);
        Ok(self.consumer.handle(&payload).await?)
    }

    /// Fait passer un ack brut par le même chemin que la boucle d'acks
    pub async fn ack(&self, correlation_id: Uuid, outcome: &str) -> Result<bool> {
        let payload = ack_payload(correlation_id, outcome);
        match self.coordinator.parse_ack(&payload) {
            Some(ack) => Ok(self.coordinator.handle_ack(&ack).await?),
            None => anyhow::bail!("ack payload rejected: {outcome}"),
        }
    }

    pub fn open_dispatch(&self, host_id: &str) -> Result<Option<DispatchRecord>> {
        Ok(self.store.open_dispatch(host_id)?)
    }

    /// Dispatch ouvert obligatoire, pour enchaîner les assertions
    pub fn expect_open(&self, host_id: &str) -> Result<DispatchRecord> {
        self.open_dispatch(host_id)?
            .ok_or_else(|| anyhow::anyhow!("no open dispatch for host {host_id}"))
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            health_tracker: self.health.clone(),
        }
    }
}

/// Logs des tests, filtrés par RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn harness_dispatches_on_created_event() {
        let mut harness = TestHarness::new().unwrap();
        let outcome = harness.host_created("host-1", "org-1").await.unwrap();
        assert_eq!(outcome, EventOutcome::Processed);

        let record = harness.expect_open("host-1").unwrap();
        assert_eq!(harness.sender.count(), 1);
        assert!(harness.ack(record.correlation_id, "success").await.unwrap());
        assert!(harness.open_dispatch("host-1").unwrap().is_none());
    }
}
