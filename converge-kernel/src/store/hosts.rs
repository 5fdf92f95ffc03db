//! Registre des hôtes connus, alimenté par les événements d'inventaire.

use rusqlite::{params, OptionalExtension};

use super::{from_millis, to_millis, Store};
use crate::error::Result;
use crate::models::Host;

impl Store {
    pub fn upsert_host(&self, host: &Host) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO hosts (host_id, org_id, account_id, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (host_id) DO UPDATE SET
                 org_id = excluded.org_id,
                 account_id = excluded.account_id,
                 updated_at = excluded.updated_at",
            params![host.host_id, host.org_id, host.account_id, to_millis(host.updated_at)],
        )?;
        Ok(())
    }

    pub fn get_host(&self, host_id: &str) -> Result<Option<Host>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT host_id, org_id, account_id, updated_at FROM hosts WHERE host_id = ?1",
                params![host_id],
                |row| {
                    Ok(Host {
                        host_id: row.get(0)?,
                        org_id: row.get(1)?,
                        account_id: row.get(2)?,
                        updated_at: from_millis(row.get(3)?),
                    })
                },
            )
            .optional()?)
    }

    /// Retourne false si l'hôte était déjà inconnu
    pub fn remove_host(&self, host_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM hosts WHERE host_id = ?1", params![host_id])?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now_millis;

    fn host(org: &str) -> Host {
        Host {
            host_id: "host-a".into(),
            org_id: org.into(),
            account_id: "acct".into(),
            updated_at: now_millis(),
        }
    }

    #[test]
    fn upsert_replaces_owner() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_host(&host("org-1")).unwrap();
        store.upsert_host(&host("org-2")).unwrap();
        assert_eq!(store.get_host("host-a").unwrap().unwrap().org_id, "org-2");
    }

    #[test]
    fn remove_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_host(&host("org-1")).unwrap();
        assert!(store.remove_host("host-a").unwrap());
        assert!(!store.remove_host("host-a").unwrap());
        assert!(store.get_host("host-a").unwrap().is_none());
    }
}
