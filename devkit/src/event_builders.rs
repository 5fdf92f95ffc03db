/*!
Builders de messages au format des topics Converge

- `converge/inventory/events@v1` : événements created/updated/deleted numérotés
- `converge/dispatch/ack@v1` : accusés de réception des hôtes
*/

use serde_json::{json, Value};
use uuid::Uuid;

/// Générateur d'événements d'inventaire avec `event_id` croissant
#[derive(Debug)]
pub struct EventBuilder {
    next_id: u64,
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBuilder {
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    /// Événement complet, prêt à être modifié avant sérialisation
    pub fn event(&mut self, kind: &str, host_id: &str, org_id: &str) -> EventInstance {
        let event_id = self.next_id;
        self.next_id += 1;
        EventInstance {
            data: json!({
                "event_id": event_id,
                "kind": kind,
                "host_id": host_id,
                "org_id": org_id,
                "account_id": format!("acct-{org_id}"),
                "timestamp": "2024-05-01T12:00:00Z",
            }),
        }
    }

    pub fn created(&mut self, host_id: &str, org_id: &str) -> Vec<u8> {
        self.event("created", host_id, org_id).to_bytes()
    }

    pub fn updated(&mut self, host_id: &str, org_id: &str) -> Vec<u8> {
        self.event("updated", host_id, org_id).to_bytes()
    }

    pub fn deleted(&mut self, host_id: &str, org_id: &str) -> Vec<u8> {
        self.event("deleted", host_id, org_id).to_bytes()
    }
}

#[derive(Debug, Clone)]
pub struct EventInstance {
    data: Value,
}

impl EventInstance {
    pub fn set_field<S: Into<String>>(mut self, field: S, value: Value) -> Self {
        if let Value::Object(ref mut map) = self.data {
            map.insert(field.into(), value);
        }
        self
    }

    pub fn remove_field(mut self, field: &str) -> Self {
        if let Value::Object(ref mut map) = self.data {
            map.remove(field);
        }
        self
    }

    pub fn event_id(&self) -> u64 {
        self.data["event_id"].as_u64().unwrap_or_default()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.to_string().into_bytes()
    }
}

/// Ack d'hôte ; `outcome` vaut "success", "failure" ou "unknown"
pub fn ack_payload(correlation_id: Uuid, outcome: &str) -> Vec<u8> {
    json!({ "correlation_id": correlation_id, "outcome": outcome })
        .to_string()
        .into_bytes()
}
