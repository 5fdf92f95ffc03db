//! Consommateur des événements d'inventaire (converge/inventory/events@v1).
//!
//! Livraison au-moins-une-fois et sans ordre garanti : chaque événement est
//! dédupliqué sur (host_id, kind, event_id). Le marqueur est posé après les
//! effets. Une erreur de `handle` est retentée localement avec backoff
//! (`handle_with_retry`) ; au-delà, l'événement est compté comme abandonné et
//! acquitté au broker pour libérer la fenêtre QoS 1 de l'abonnement partagé.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::dispatch::Coordinator;
use crate::error::{Error, Result};
use crate::health::HealthTracker;
use crate::models::{now_millis, EventKey, EventKind, Host, InventoryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Processed,
    Duplicate,
    Malformed,
    /// Erreurs répétées : rendu au broker sans effet garanti
    Abandoned,
}

#[derive(Clone)]
pub struct InventoryConsumer {
    coordinator: Coordinator,
    health: HealthTracker,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl InventoryConsumer {
    pub fn new(coordinator: Coordinator, health: HealthTracker) -> Self {
        Self { coordinator, health }
    }

    pub async fn handle(&self, payload: &[u8]) -> Result<EventOutcome> {
        let event = match serde_json::from_slice::<InventoryEvent>(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "malformed inventory event dropped");
                self.health.event_malformed();
                return Ok(EventOutcome::Malformed);
            }
        };

        let (Some(host_id), Some(org_id)) = (non_blank(event.host_id), non_blank(event.org_id))
        else {
            warn!(event_id = event.event_id, kind = event.kind.as_str(), "inventory event without host_id/org_id dropped");
            self.health.event_malformed();
            return Ok(EventOutcome::Malformed);
        };
        let account_id = event.account_id.unwrap_or_default();

        let key = EventKey { host_id: host_id.clone(), kind: event.kind, event_id: event.event_id };
        let store = self.coordinator.store();
        if store.event_seen(&key)? {
            debug!(%host_id, event_id = event.event_id, "duplicate inventory event");
            self.health.event_duplicate();
            return Ok(EventOutcome::Duplicate);
        }

        match event.kind {
            EventKind::Created | EventKind::Updated => {
                store.upsert_host(&Host {
                    host_id: host_id.clone(),
                    org_id: org_id.clone(),
                    account_id: account_id.clone(),
                    updated_at: now_millis(),
                })?;
                match self.coordinator.trigger(&host_id, &org_id, &account_id).await {
                    Ok(outcome) => {
                        info!(%host_id, %org_id, kind = event.kind.as_str(), outcome = outcome.kind(), "inventory event handled");
                    }
                    // erreurs non rejouables : on marque l'événement pour ne pas boucler
                    Err(e @ (Error::Schema(_) | Error::Render(_) | Error::Validation(_))) => {
                        error!(%host_id, error = %e, "dispatch trigger failed");
                    }
                    Err(e) => return Err(e),
                }
            }
            EventKind::Deleted => {
                let removed = store.remove_host(&host_id)?;
                let cancelled = self.coordinator.cancel_retries(&host_id)?;
                info!(%host_id, %org_id, removed, cancelled, "host deleted from inventory");
            }
        }

        store.mark_event(&key)?;
        self.health.event_processed();
        Ok(EventOutcome::Processed)
    }

    /// `handle` avec au plus `attempts` essais, backoff doublé à partir de `backoff`
    pub async fn handle_with_retry(&self, payload: &[u8], attempts: u32, backoff: Duration) -> EventOutcome {
        let attempts = attempts.max(1);
        let mut delay = backoff;
        for attempt in 1..=attempts {
            match self.handle(payload).await {
                Ok(outcome) => return outcome,
                Err(e) if attempt < attempts => {
                    warn!(attempt, retry_in_ms = delay.as_millis() as u64, error = %e, "inventory event processing failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    error!(attempts, error = %e, "inventory event abandoned after repeated failures");
                }
            }
        }
        self.health.event_abandoned();
        EventOutcome::Abandoned
    }
}
