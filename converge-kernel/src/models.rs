use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::schema;

/// Toggles nommés d'un profil ("insights" -> true, ...)
pub type StateMap = BTreeMap<String, bool>;

/// Horloge tronquée à la milliseconde, la précision stockée en base
pub fn now_millis() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_millisecond(now.millisecond()).unwrap_or(now)
}

/// State map où chaque champ du schéma vaut sa baseline (hôte jamais configuré)
pub fn baseline_state() -> StateMap {
    schema::FIELDS
        .iter()
        .map(|f| (f.name.to_string(), f.baseline))
        .collect()
}

/// Version immuable de la configuration désirée d'une organisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(rename = "id")]
    pub profile_id: Uuid,
    pub org_id: String,
    #[serde(rename = "account")]
    pub account_id: String,
    /// Séquence par organisation, la plus haute est la version courante
    pub version: u32,
    pub active: bool,
    pub state: StateMap,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Profile {
    pub fn new(org_id: &str, account_id: &str, state: StateMap) -> Self {
        Self {
            profile_id: Uuid::new_v4(),
            org_id: org_id.to_string(),
            account_id: account_id.to_string(),
            version: 1,
            active: true,
            state,
            created_at: now_millis(),
        }
    }

    /// Copie-sur-écriture : nouvel ID, version suivante, même contenu
    pub fn next_version(&self) -> Self {
        Self {
            profile_id: Uuid::new_v4(),
            org_id: self.org_id.clone(),
            account_id: self.account_id.clone(),
            version: self.version + 1,
            active: self.active,
            state: self.state.clone(),
            created_at: now_millis(),
        }
    }

    /// État réellement visé : le kill switch `active=false` ramène tout à la baseline
    pub fn effective_state(&self) -> StateMap {
        if self.active {
            let mut state = baseline_state();
            for (key, value) in &self.state {
                if schema::is_known(key) {
                    state.insert(key.clone(), *value);
                }
            }
            state
        } else {
            baseline_state()
        }
    }

    /// Égalité de contenu (ignore identité, version et horodatage)
    pub fn same_content(&self, other: &Profile) -> bool {
        self.active == other.active && crate::diff::diff(&self.state, &other.state).is_empty()
    }
}

/// Surcharges partielles soumises par POST /profiles
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileOverrides {
    pub active: Option<bool>,
    #[serde(default)]
    pub state: StateMap,
}

/// Hôte connu de l'inventaire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub host_id: String,
    pub org_id: String,
    pub account_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        }
    }
}

/// Message entrant sur converge/inventory/events@v1.
/// host_id/org_id restent optionnels ici pour que le consommateur détecte
/// lui-même les événements incomplets au lieu d'échouer au parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEvent {
    pub event_id: u64,
    pub kind: EventKind,
    pub host_id: Option<String>,
    pub org_id: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Clé du marqueur de déduplication durable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKey {
    pub host_id: String,
    pub kind: EventKind,
    pub event_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Acked,
    Failed,
    TimedOut,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Acked => "acked",
            DispatchStatus::Failed => "failed",
            DispatchStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DispatchStatus::Pending),
            "acked" => Some(DispatchStatus::Acked),
            "failed" => Some(DispatchStatus::Failed),
            "timed_out" => Some(DispatchStatus::TimedOut),
            _ => None,
        }
    }
}

/// Une tentative de livraison d'un playbook à un hôte.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub dispatch_id: Uuid,
    pub host_id: String,
    pub org_id: String,
    /// None quand l'échec est survenu avant la lecture du profil
    pub profile_id: Option<Uuid>,
    /// État cible envoyé à l'hôte
    pub state: StateMap,
    pub status: DispatchStatus,
    pub attempts: u32,
    /// Renouvelé à chaque tentative : un ack tardif ne valide pas la suivante
    pub correlation_id: Uuid,
    pub handle: Option<String>,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub sent_at: Option<OffsetDateTime>,
    pub acked_at: Option<OffsetDateTime>,
    /// Présent tant que le record attend un retry
    pub retry_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

impl DispatchRecord {
    /// Ouvert = pending, ou en échec avec un retry planifié
    pub fn is_open(&self) -> bool {
        self.status == DispatchStatus::Pending || self.retry_at.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckOutcome {
    Success,
    Failure,
    Unknown,
}

/// Accusé de réception publié par l'agent hôte sur converge/dispatch/ack@v1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    pub correlation_id: Uuid,
    pub outcome: AckOutcome,
    #[serde(default)]
    pub message: Option<String>,
}
