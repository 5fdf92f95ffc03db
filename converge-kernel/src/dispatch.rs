/**
 * COORDINATEUR DE DISPATCH - Décide quand et à qui envoyer un playbook
 *
 * RÔLE :
 * Pour un couple (hôte, version de profil) : diff entre le dernier état acquitté
 * et l'état effectif du profil courant, génération du playbook, envoi, puis suivi
 * de l'issue (ack, nack, timeout) avec retry/backoff ou échec terminal.
 *
 * CYCLE DE VIE D'UN RECORD :
 *   pending ──ack success──► acked
 *      │ nack / timeout / envoi transitoire
 *      ▼
 *   failed|timed_out + retry_at ──retry_due──► pending (nouvelle correlation)
 *      │ tentatives épuisées, envoi permanent, hôte disparu
 *      ▼
 *   failed|timed_out terminal
 *
 * Un seul record ouvert par hôte (index unique partiel) : un trigger concurrent
 * est fusionné (Coalesced) au lieu de produire un second envoi. Le retry re-diffe
 * contre le profil courant, l'ack de succès aussi.
 */

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::diff::diff;
use crate::error::Result;
use crate::health::HealthTracker;
use crate::models::{
    baseline_state, now_millis, AckMessage, AckOutcome, DispatchRecord, DispatchStatus, StateMap,
};
use crate::playbook::{self, Playbook, PlaybookTarget};
use crate::store::Store;

/// Records traités par passage du sweeper
const SWEEP_BATCH: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Tentatives au total, envoi initial compris
    pub max_attempts: u32,
    pub ack_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            ack_timeout: Duration::from_secs(300),
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(1800),
        }
    }
}

impl RetryPolicy {
    /// Délai avant la tentative suivant l'échec n° `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }
}

/// Destinataire d'un envoi
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchTarget {
    pub host_id: String,
    pub org_id: String,
    pub profile_id: Uuid,
    pub correlation_id: Uuid,
}

/// Référence opaque rendue par le transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Broker injoignable, file pleine... : retenté avec backoff
    #[error("transient send failure: {0}")]
    Transient(String),
    /// Destinataire ou payload refusé : échec terminal
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

/// Client de dispatch sortant
#[async_trait]
pub trait PlaybookSender: Send + Sync {
    async fn send(
        &self,
        target: &DispatchTarget,
        playbook: &Playbook,
    ) -> core::result::Result<DispatchHandle, SendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Record créé ; l'envoi est parti ou un retry est planifié
    Dispatched { dispatch_id: Uuid, profile_id: Uuid },
    /// Un dispatch est déjà ouvert pour cet hôte
    Coalesced,
    /// Rien à changer sur l'hôte
    UpToDate,
    Failed { reason: String },
}

impl DispatchOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchOutcome::Dispatched { .. } => "dispatched",
            DispatchOutcome::Coalesced => "coalesced",
            DispatchOutcome::UpToDate => "up_to_date",
            DispatchOutcome::Failed { .. } => "failed",
        }
    }
}

enum SendResult {
    Sent,
    RetryScheduled,
    Failed(String),
}

#[derive(Clone)]
pub struct Coordinator {
    store: Store,
    sender: Arc<dyn PlaybookSender>,
    policy: RetryPolicy,
    default_state: Arc<StateMap>,
    health: HealthTracker,
}

impl Coordinator {
    pub fn new(
        store: Store,
        sender: Arc<dyn PlaybookSender>,
        policy: RetryPolicy,
        default_state: StateMap,
        health: HealthTracker,
    ) -> Self {
        Self {
            store,
            sender,
            policy,
            default_state: Arc::new(default_state),
            health,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn default_state(&self) -> &StateMap {
        &self.default_state
    }

    /// Réconcilie un hôte avec le profil courant de son organisation
    pub async fn trigger(
        &self,
        host_id: &str,
        org_id: &str,
        account_id: &str,
    ) -> Result<DispatchOutcome> {
        let owned = self
            .store
            .get_host(host_id)?
            .is_some_and(|host| host.org_id == org_id);
        if !owned {
            return self.fail_unknown_host(host_id, org_id);
        }

        if let Some(open) = self.store.open_dispatch(host_id)? {
            debug!(host_id, dispatch_id = %open.dispatch_id, "dispatch already open, coalescing");
            return Ok(DispatchOutcome::Coalesced);
        }

        let profile = self
            .store
            .get_or_insert_current(org_id, account_id, &self.default_state)?;
        let base = self.acked_state(host_id)?;
        let target_state = profile.effective_state();
        let changes = diff(&base, &target_state);
        if changes.is_empty() {
            info!(host_id, profile_id = %profile.profile_id, "host already up to date");
            return Ok(DispatchOutcome::UpToDate);
        }

        let playbook = playbook::generate(
            &changes,
            PlaybookTarget {
                org_id: org_id.to_string(),
                profile_id: profile.profile_id,
                host_id: Some(host_id.to_string()),
            },
        )?;

        let now = now_millis();
        let record = DispatchRecord {
            dispatch_id: Uuid::new_v4(),
            host_id: host_id.to_string(),
            org_id: org_id.to_string(),
            profile_id: Some(profile.profile_id),
            state: target_state,
            status: DispatchStatus::Pending,
            attempts: 1,
            correlation_id: Uuid::new_v4(),
            handle: None,
            last_error: None,
            created_at: now,
            sent_at: Some(now),
            acked_at: None,
            retry_at: None,
            updated_at: now,
        };
        if !self.store.insert_dispatch(&record)? {
            debug!(host_id, "concurrent dispatch won the open slot, coalescing");
            return Ok(DispatchOutcome::Coalesced);
        }

        match self.send_attempt(&record, &playbook).await? {
            SendResult::Sent | SendResult::RetryScheduled => Ok(DispatchOutcome::Dispatched {
                dispatch_id: record.dispatch_id,
                profile_id: profile.profile_id,
            }),
            SendResult::Failed(reason) => Ok(DispatchOutcome::Failed { reason }),
        }
    }

    /// Traite un accusé de réception. Retourne true s'il correspondait à un dispatch pending.
    ///
    /// Après un succès, l'état acquitté est comparé au profil courant : un trigger
    /// fusionné pendant l'envoi est rejoué ici.
    pub async fn handle_ack(&self, ack: &AckMessage) -> Result<bool> {
        let now = now_millis();
        match ack.outcome {
            AckOutcome::Success => {
                let Some(record) = self.store.pending_by_correlation(ack.correlation_id)? else {
                    self.ignore_ack(ack);
                    return Ok(false);
                };
                if !self.store.mark_acked(ack.correlation_id, now)? {
                    self.ignore_ack(ack);
                    return Ok(false);
                }
                self.health.dispatch_acked();
                info!(correlation_id = %ack.correlation_id, host_id = %record.host_id, "dispatch acknowledged");
                self.reconcile_after_ack(&record).await?;
                Ok(true)
            }
            AckOutcome::Failure => match self.store.pending_by_correlation(ack.correlation_id)? {
                Some(record) => {
                    let reason = ack
                        .message
                        .clone()
                        .unwrap_or_else(|| "host reported failure".to_string());
                    self.fail_attempt(&record, DispatchStatus::Failed, &reason, now)?;
                    Ok(true)
                }
                None => {
                    self.ignore_ack(ack);
                    Ok(false)
                }
            },
            // le timeout tranchera
            AckOutcome::Unknown => {
                debug!(correlation_id = %ack.correlation_id, "ack with unknown outcome");
                Ok(false)
            }
        }
    }

    /// Décode un ack brut ; un payload invalide est journalisé et écarté
    pub fn parse_ack(&self, payload: &[u8]) -> Option<AckMessage> {
        match serde_json::from_slice::<AckMessage>(payload) {
            Ok(ack) => Some(ack),
            Err(e) => {
                warn!(error = %e, "malformed ack payload dropped");
                self.health.ack_ignored();
                None
            }
        }
    }

    /// Passe en échec les dispatches pending sans ack depuis `ack_timeout`
    pub fn sweep_timeouts(&self, now: OffsetDateTime) -> Result<usize> {
        let deadline = now - self.policy.ack_timeout;
        let mut swept = 0;
        for record in self.store.expired_pending(deadline, SWEEP_BATCH)? {
            if self.fail_attempt(&record, DispatchStatus::TimedOut, "no acknowledgement before timeout", now)? {
                swept += 1;
            }
        }
        if swept > 0 {
            info!(count = swept, "timed out pending dispatches");
        }
        Ok(swept)
    }

    /// Relance les records dont le retry est échu, re-diffés contre le profil courant
    pub async fn retry_due(&self, now: OffsetDateTime) -> Result<usize> {
        let due = self.store.due_retries(now, SWEEP_BATCH)?;
        if !due.is_empty() {
            debug!(count = due.len(), "processing due retries");
        }

        let mut resent = 0;
        for record in due {
            match self.retry_one(&record, now).await {
                Ok(true) => resent += 1,
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    warn!(dispatch_id = %record.dispatch_id, error = %e, "retry deferred");
                }
                Err(e) => {
                    error!(dispatch_id = %record.dispatch_id, host_id = %record.host_id, error = %e, "retry failed");
                    match self.store.fail_retry(record.dispatch_id, &e.to_string(), now) {
                        Ok(true) => self.health.dispatch_failed(),
                        Ok(false) => {}
                        Err(e) => error!(dispatch_id = %record.dispatch_id, error = %e, "failed to close retry"),
                    }
                }
            }
        }
        Ok(resent)
    }

    /// Annule les retries planifiés d'un hôte supprimé de l'inventaire
    pub fn cancel_retries(&self, host_id: &str) -> Result<usize> {
        let cancelled = self.store.cancel_retries(host_id)?;
        if cancelled > 0 {
            info!(host_id, count = cancelled, "cancelled scheduled retries");
        }
        Ok(cancelled)
    }

    /// Tâche périodique : timeouts puis retries
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        info!(interval_secs = interval.as_secs(), "starting dispatch sweeper");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = now_millis();
                if let Err(e) = coordinator.sweep_timeouts(now) {
                    error!(error = %e, "timeout sweep failed");
                }
                if let Err(e) = coordinator.retry_due(now).await {
                    error!(error = %e, "retry pass failed");
                }
            }
        })
    }

    /// Consomme les acks bruts transmis par le listener MQTT
    pub fn spawn_ack_loop(&self, mut rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        let coordinator = self.clone();

        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let Some(ack) = coordinator.parse_ack(&payload) else {
                    continue;
                };
                if let Err(e) = coordinator.handle_ack(&ack).await {
                    error!(correlation_id = %ack.correlation_id, error = %e, "failed to apply ack");
                }
            }
            debug!("ack channel closed");
        })
    }

    async fn reconcile_after_ack(&self, record: &DispatchRecord) -> Result<()> {
        let host = self
            .store
            .get_host(&record.host_id)?
            .filter(|host| host.org_id == record.org_id);
        let Some(host) = host else {
            return Ok(());
        };
        let Some(profile) = self.store.current_profile(&record.org_id)? else {
            return Ok(());
        };
        if diff(&record.state, &profile.effective_state()).is_empty() {
            return Ok(());
        }

        info!(
            host_id = %record.host_id,
            profile_id = %profile.profile_id,
            "profile changed while dispatch was in flight, reconciling again"
        );
        let outcome = self
            .trigger(&host.host_id, &host.org_id, &host.account_id)
            .await?;
        debug!(host_id = %record.host_id, outcome = outcome.kind(), "follow-up dispatch");
        Ok(())
    }

    fn acked_state(&self, host_id: &str) -> Result<StateMap> {
        Ok(self
            .store
            .last_acked_state(host_id)?
            .unwrap_or_else(baseline_state))
    }

    fn fail_unknown_host(&self, host_id: &str, org_id: &str) -> Result<DispatchOutcome> {
        let reason = format!("host {host_id} not found in inventory for org {org_id}");
        let now = now_millis();
        let record = DispatchRecord {
            dispatch_id: Uuid::new_v4(),
            host_id: host_id.to_string(),
            org_id: org_id.to_string(),
            profile_id: None,
            state: StateMap::new(),
            status: DispatchStatus::Failed,
            attempts: 0,
            correlation_id: Uuid::new_v4(),
            handle: None,
            last_error: Some(reason.clone()),
            created_at: now,
            sent_at: None,
            acked_at: None,
            retry_at: None,
            updated_at: now,
        };
        self.store.insert_dispatch(&record)?;
        self.health.dispatch_failed();
        warn!(host_id, org_id, "dispatch failed: host not found");
        Ok(DispatchOutcome::Failed { reason })
    }

    async fn send_attempt(&self, record: &DispatchRecord, playbook: &Playbook) -> Result<SendResult> {
        let target = DispatchTarget {
            host_id: record.host_id.clone(),
            org_id: record.org_id.clone(),
            profile_id: playbook.target.profile_id,
            correlation_id: record.correlation_id,
        };

        match self.sender.send(&target, playbook).await {
            Ok(handle) => {
                self.store.set_handle(record.correlation_id, &handle.0)?;
                self.health.dispatch_sent();
                info!(
                    host_id = %record.host_id,
                    dispatch_id = %record.dispatch_id,
                    correlation_id = %record.correlation_id,
                    attempt = record.attempts,
                    tasks = playbook.tasks.len(),
                    "playbook dispatched"
                );
                Ok(SendResult::Sent)
            }
            Err(SendError::Transient(reason)) => {
                self.fail_attempt(record, DispatchStatus::Failed, &reason, now_millis())?;
                if record.attempts < self.policy.max_attempts {
                    Ok(SendResult::RetryScheduled)
                } else {
                    Ok(SendResult::Failed(reason))
                }
            }
            Err(SendError::Permanent(reason)) => {
                self.store.record_failure(
                    record.correlation_id,
                    DispatchStatus::Failed,
                    &reason,
                    None,
                    now_millis(),
                )?;
                self.health.dispatch_failed();
                error!(host_id = %record.host_id, dispatch_id = %record.dispatch_id, %reason, "dispatch failed permanently");
                Ok(SendResult::Failed(reason))
            }
        }
    }

    /// Chemin d'échec commun (nack, timeout, envoi transitoire) : retry planifié
    /// tant qu'il reste des tentatives, sinon échec terminal.
    /// false si le record n'était plus pending (ack ou sweep concurrent).
    fn fail_attempt(
        &self,
        record: &DispatchRecord,
        status: DispatchStatus,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        if record.attempts < self.policy.max_attempts {
            let delay = self.policy.backoff(record.attempts);
            let retry_at = now + delay;
            let updated =
                self.store
                    .record_failure(record.correlation_id, status, reason, Some(retry_at), now)?;
            if updated {
                self.health.dispatch_retried();
                warn!(
                    host_id = %record.host_id,
                    dispatch_id = %record.dispatch_id,
                    attempt = record.attempts,
                    status = status.as_str(),
                    retry_in_secs = delay.as_secs(),
                    %reason,
                    "dispatch attempt failed, retry scheduled"
                );
            }
            Ok(updated)
        } else {
            let updated = self
                .store
                .record_failure(record.correlation_id, status, reason, None, now)?;
            if updated {
                self.health.dispatch_failed();
                error!(
                    host_id = %record.host_id,
                    dispatch_id = %record.dispatch_id,
                    attempts = record.attempts,
                    status = status.as_str(),
                    %reason,
                    "dispatch failed, retries exhausted"
                );
            }
            Ok(updated)
        }
    }

    async fn retry_one(&self, record: &DispatchRecord, now: OffsetDateTime) -> Result<bool> {
        let host = self
            .store
            .get_host(&record.host_id)?
            .filter(|host| host.org_id == record.org_id);
        let Some(host) = host else {
            if self
                .store
                .fail_retry(record.dispatch_id, "host no longer in inventory", now)?
            {
                self.health.dispatch_failed();
                warn!(host_id = %record.host_id, dispatch_id = %record.dispatch_id, "retry abandoned: host gone");
            }
            return Ok(false);
        };

        let profile =
            self.store
                .get_or_insert_current(&record.org_id, &host.account_id, &self.default_state)?;
        let target_state = profile.effective_state();
        let changes = diff(&self.acked_state(&record.host_id)?, &target_state);
        if changes.is_empty() {
            if self.store.discard_retry(record.dispatch_id)? {
                info!(host_id = %record.host_id, dispatch_id = %record.dispatch_id, "host converged, retry discarded");
            }
            return Ok(false);
        }

        let playbook = playbook::generate(
            &changes,
            PlaybookTarget {
                org_id: record.org_id.clone(),
                profile_id: profile.profile_id,
                host_id: Some(record.host_id.clone()),
            },
        )?;
        let correlation_id = Uuid::new_v4();
        if !self.store.claim_retry(
            record.dispatch_id,
            correlation_id,
            profile.profile_id,
            &target_state,
            now,
        )? {
            debug!(dispatch_id = %record.dispatch_id, "retry already claimed");
            return Ok(false);
        }

        let claimed = DispatchRecord {
            profile_id: Some(profile.profile_id),
            state: target_state,
            status: DispatchStatus::Pending,
            attempts: record.attempts + 1,
            correlation_id,
            handle: None,
            sent_at: Some(now),
            retry_at: None,
            updated_at: now,
            ..record.clone()
        };
        self.send_attempt(&claimed, &playbook).await?;
        Ok(true)
    }

    fn ignore_ack(&self, ack: &AckMessage) {
        self.health.ack_ignored();
        debug!(correlation_id = %ack.correlation_id, "ack matches no pending dispatch, ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            ack_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        assert_eq!(policy.backoff(4), Duration::from_secs(80));
        assert_eq!(policy.backoff(5), Duration::from_secs(100));
        assert_eq!(policy.backoff(64), Duration::from_secs(100));
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let json = serde_json::to_value(DispatchOutcome::UpToDate).unwrap();
        assert_eq!(json, serde_json::json!({ "outcome": "up_to_date" }));
        assert_eq!(DispatchOutcome::Coalesced.kind(), "coalesced");
    }
}
