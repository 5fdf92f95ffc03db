//! Marqueurs durables des événements d'inventaire déjà traités.

use rusqlite::params;

use super::{to_millis, Store};
use crate::error::Result;
use crate::models::{now_millis, EventKey};

impl Store {
    pub fn event_seen(&self, key: &EventKey) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_events WHERE host_id = ?1 AND kind = ?2 AND event_id = ?3",
            params![key.host_id, key.kind.as_str(), key.event_id as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Pose le marqueur ; false s'il existait déjà
    pub fn mark_event(&self, key: &EventKey) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO processed_events (host_id, kind, event_id, processed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![key.host_id, key.kind.as_str(), key.event_id as i64, to_millis(now_millis())],
        )?;
        Ok(inserted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;

    #[test]
    fn marker_is_keyed_by_host_kind_and_id() {
        let store = Store::open_in_memory().unwrap();
        let key = EventKey { host_id: "h1".into(), kind: EventKind::Created, event_id: 7 };

        assert!(!store.event_seen(&key).unwrap());
        assert!(store.mark_event(&key).unwrap());
        assert!(store.event_seen(&key).unwrap());
        assert!(!store.mark_event(&key).unwrap());

        let updated = EventKey { kind: EventKind::Updated, ..key.clone() };
        assert!(!store.event_seen(&updated).unwrap());
        let later = EventKey { event_id: 8, ..key };
        assert!(!store.event_seen(&later).unwrap());
    }
}
