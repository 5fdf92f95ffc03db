//! Records de dispatch.
//!
//! Toutes les transitions sont des `UPDATE ... WHERE` conditionnels sur l'état
//! attendu : le nombre de lignes touchées dit qui a gagné quand plusieurs
//! workers (sweeper, boucle d'acks, consommateur) visent le même record.

use rusqlite::{params, ErrorCode, OptionalExtension, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{from_millis, parse_state, parse_uuid, to_millis, Store};
use crate::error::Result;
use crate::models::{DispatchRecord, DispatchStatus, StateMap};

const COLUMNS: &str = "dispatch_id, host_id, org_id, profile_id, state, status, attempts, \
                       correlation_id, handle, last_error, created_at, sent_at, acked_at, \
                       retry_at, updated_at";

const OPEN: &str = "(status = 'pending' OR retry_at IS NOT NULL)";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DispatchRecord> {
    let dispatch_id: String = row.get(0)?;
    let profile_id: Option<String> = row.get(3)?;
    let state: String = row.get(4)?;
    let status: String = row.get(5)?;
    let correlation_id: String = row.get(7)?;
    Ok(DispatchRecord {
        dispatch_id: parse_uuid(0, &dispatch_id)?,
        host_id: row.get(1)?,
        org_id: row.get(2)?,
        profile_id: profile_id.as_deref().map(|p| parse_uuid(3, p)).transpose()?,
        state: parse_state(4, &state)?,
        status: DispatchStatus::parse(&status).unwrap_or(DispatchStatus::Failed),
        attempts: row.get(6)?,
        correlation_id: parse_uuid(7, &correlation_id)?,
        handle: row.get(8)?,
        last_error: row.get(9)?,
        created_at: from_millis(row.get(10)?),
        sent_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
        acked_at: row.get::<_, Option<i64>>(12)?.map(from_millis),
        retry_at: row.get::<_, Option<i64>>(13)?.map(from_millis),
        updated_at: from_millis(row.get(14)?),
    })
}

impl Store {
    /// Insère un record ; false si l'hôte a déjà un dispatch ouvert
    /// (violation de l'index unique partiel `dispatches_one_open_per_host`).
    pub fn insert_dispatch(&self, record: &DispatchRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let result = conn.execute(
            &format!("INSERT INTO dispatches ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
            params![
                record.dispatch_id.to_string(),
                record.host_id,
                record.org_id,
                record.profile_id.map(|p| p.to_string()),
                serde_json::to_string(&record.state)?,
                record.status.as_str(),
                record.attempts,
                record.correlation_id.to_string(),
                record.handle,
                record.last_error,
                to_millis(record.created_at),
                record.sent_at.map(to_millis),
                record.acked_at.map(to_millis),
                record.retry_at.map(to_millis),
                to_millis(record.updated_at),
            ],
        );
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_dispatch(&self, dispatch_id: Uuid) -> Result<Option<DispatchRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {COLUMNS} FROM dispatches WHERE dispatch_id = ?1");
        Ok(conn
            .query_row(&sql, params![dispatch_id.to_string()], record_from_row)
            .optional()?)
    }

    /// Le dispatch non terminal d'un hôte, s'il existe
    pub fn open_dispatch(&self, host_id: &str) -> Result<Option<DispatchRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {COLUMNS} FROM dispatches WHERE host_id = ?1 AND {OPEN}");
        Ok(conn.query_row(&sql, params![host_id], record_from_row).optional()?)
    }

    pub fn dispatches_for_host(&self, host_id: &str) -> Result<Vec<DispatchRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM dispatches WHERE host_id = ?1 ORDER BY created_at, rowid"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![host_id], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// État confirmé par le dernier ack de l'hôte
    pub fn last_acked_state(&self, host_id: &str) -> Result<Option<StateMap>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM dispatches WHERE host_id = ?1 AND status = 'acked'
                 ORDER BY acked_at DESC, rowid DESC LIMIT 1",
                params![host_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(state) => Ok(Some(serde_json::from_str::<StateMap>(&state)?)),
            None => Ok(None),
        }
    }

    pub fn pending_by_correlation(&self, correlation_id: Uuid) -> Result<Option<DispatchRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM dispatches WHERE correlation_id = ?1 AND status = 'pending'"
        );
        Ok(conn
            .query_row(&sql, params![correlation_id.to_string()], record_from_row)
            .optional()?)
    }

    pub fn set_handle(&self, correlation_id: Uuid, handle: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE dispatches SET handle = ?2 WHERE correlation_id = ?1 AND status = 'pending'",
            params![correlation_id.to_string(), handle],
        )?;
        Ok(updated > 0)
    }

    pub fn mark_acked(&self, correlation_id: Uuid, now: OffsetDateTime) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE dispatches SET status = 'acked', acked_at = ?2, updated_at = ?2
             WHERE correlation_id = ?1 AND status = 'pending'",
            params![correlation_id.to_string(), to_millis(now)],
        )?;
        Ok(updated > 0)
    }

    /// Sort un dispatch de `pending` vers `status`.
    /// `retry_at = Some` le garde ouvert (retry planifié), `None` le rend terminal.
    pub fn record_failure(
        &self,
        correlation_id: Uuid,
        status: DispatchStatus,
        error: &str,
        retry_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE dispatches SET status = ?2, last_error = ?3, retry_at = ?4, updated_at = ?5
             WHERE correlation_id = ?1 AND status = 'pending'",
            params![
                correlation_id.to_string(),
                status.as_str(),
                error,
                retry_at.map(to_millis),
                to_millis(now),
            ],
        )?;
        Ok(updated > 0)
    }

    /// Dispatches pending envoyés au plus tard à `deadline`
    pub fn expired_pending(&self, deadline: OffsetDateTime, limit: u32) -> Result<Vec<DispatchRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM dispatches
             WHERE status = 'pending' AND sent_at IS NOT NULL AND sent_at <= ?1
             ORDER BY sent_at LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![to_millis(deadline), limit], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn due_retries(&self, now: OffsetDateTime, limit: u32) -> Result<Vec<DispatchRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM dispatches
             WHERE retry_at IS NOT NULL AND retry_at <= ?1
             ORDER BY retry_at LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![to_millis(now), limit], record_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Repasse un record en attente de retry à `pending` pour une nouvelle tentative.
    /// false si un autre worker l'a déjà réclamé ou annulé.
    pub fn claim_retry(
        &self,
        dispatch_id: Uuid,
        correlation_id: Uuid,
        profile_id: Uuid,
        state: &StateMap,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE dispatches SET
                 status = 'pending', retry_at = NULL, attempts = attempts + 1,
                 correlation_id = ?2, profile_id = ?3, state = ?4, handle = NULL,
                 sent_at = ?5, updated_at = ?5
             WHERE dispatch_id = ?1 AND retry_at IS NOT NULL AND retry_at <= ?5",
            params![
                dispatch_id.to_string(),
                correlation_id.to_string(),
                profile_id.to_string(),
                serde_json::to_string(state)?,
                to_millis(now),
            ],
        )?;
        Ok(updated > 0)
    }

    /// Clôt un retry en échec définitif (hôte disparu, profil introuvable...)
    pub fn fail_retry(&self, dispatch_id: Uuid, error: &str, now: OffsetDateTime) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE dispatches SET status = 'failed', retry_at = NULL, last_error = ?2, updated_at = ?3
             WHERE dispatch_id = ?1 AND retry_at IS NOT NULL",
            params![dispatch_id.to_string(), error, to_millis(now)],
        )?;
        Ok(updated > 0)
    }

    /// Supprime un retry devenu inutile (l'hôte est déjà dans l'état voulu)
    pub fn discard_retry(&self, dispatch_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM dispatches WHERE dispatch_id = ?1 AND retry_at IS NOT NULL",
            params![dispatch_id.to_string()],
        )?;
        Ok(deleted > 0)
    }

    /// Annule les retries planifiés d'un hôte ; un pending déjà envoyé n'est pas touché
    pub fn cancel_retries(&self, host_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM dispatches WHERE host_id = ?1 AND retry_at IS NOT NULL AND status != 'pending'",
            params![host_id],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{baseline_state, now_millis};
    use time::Duration;

    fn pending(host: &str) -> DispatchRecord {
        let now = now_millis();
        DispatchRecord {
            dispatch_id: Uuid::new_v4(),
            host_id: host.into(),
            org_id: "org-1".into(),
            profile_id: Some(Uuid::new_v4()),
            state: baseline_state(),
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
        }
    }

    #[test]
    fn one_open_dispatch_per_host() {
        let store = Store::open_in_memory().unwrap();
        let first = pending("h1");
        assert!(store.insert_dispatch(&first).unwrap());
        assert!(!store.insert_dispatch(&pending("h1")).unwrap());
        assert!(store.insert_dispatch(&pending("h2")).unwrap());

        assert_eq!(store.open_dispatch("h1").unwrap(), Some(first.clone()));

        // une fois acquitté, l'hôte peut recevoir un nouveau dispatch
        assert!(store.mark_acked(first.correlation_id, now_millis()).unwrap());
        assert!(store.insert_dispatch(&pending("h1")).unwrap());
    }

    #[test]
    fn scheduled_retry_keeps_record_open() {
        let store = Store::open_in_memory().unwrap();
        let record = pending("h1");
        store.insert_dispatch(&record).unwrap();

        let now = now_millis();
        let retry_at = now + Duration::seconds(30);
        assert!(store
            .record_failure(record.correlation_id, DispatchStatus::TimedOut, "timeout", Some(retry_at), now)
            .unwrap());

        let open = store.open_dispatch("h1").unwrap().unwrap();
        assert_eq!(open.status, DispatchStatus::TimedOut);
        assert!(open.is_open());
        assert!(!store.insert_dispatch(&pending("h1")).unwrap());

        assert!(store.due_retries(now, 10).unwrap().is_empty());
        assert_eq!(store.due_retries(retry_at, 10).unwrap().len(), 1);
    }

    #[test]
    fn claim_retry_is_exclusive() {
        let store = Store::open_in_memory().unwrap();
        let record = pending("h1");
        store.insert_dispatch(&record).unwrap();
        let now = now_millis();
        store
            .record_failure(record.correlation_id, DispatchStatus::Failed, "nack", Some(now), now)
            .unwrap();

        let profile = Uuid::new_v4();
        let corr = Uuid::new_v4();
        assert!(store.claim_retry(record.dispatch_id, corr, profile, &baseline_state(), now).unwrap());
        assert!(!store
            .claim_retry(record.dispatch_id, Uuid::new_v4(), profile, &baseline_state(), now)
            .unwrap());

        let claimed = store.get_dispatch(record.dispatch_id).unwrap().unwrap();
        assert_eq!(claimed.status, DispatchStatus::Pending);
        assert_eq!(claimed.attempts, 2);
        assert_eq!(claimed.correlation_id, corr);
        assert_eq!(claimed.profile_id, Some(profile));
        assert!(store.pending_by_correlation(record.correlation_id).unwrap().is_none());
    }

    #[test]
    fn late_ack_does_not_touch_failed_record() {
        let store = Store::open_in_memory().unwrap();
        let record = pending("h1");
        store.insert_dispatch(&record).unwrap();
        let now = now_millis();
        store
            .record_failure(record.correlation_id, DispatchStatus::Failed, "exhausted", None, now)
            .unwrap();
        assert!(!store.mark_acked(record.correlation_id, now).unwrap());
        assert!(store.open_dispatch("h1").unwrap().is_none());
    }

    #[test]
    fn last_acked_state_tracks_latest_ack() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.last_acked_state("h1").unwrap().is_none());

        let mut record = pending("h1");
        record.state.insert("insights".into(), true);
        store.insert_dispatch(&record).unwrap();
        store.mark_acked(record.correlation_id, now_millis()).unwrap();

        assert_eq!(store.last_acked_state("h1").unwrap(), Some(record.state));
    }

    #[test]
    fn expired_pending_uses_sent_at() {
        let store = Store::open_in_memory().unwrap();
        let record = pending("h1");
        store.insert_dispatch(&record).unwrap();
        let sent = record.sent_at.unwrap();

        assert!(store.expired_pending(sent - Duration::seconds(1), 10).unwrap().is_empty());
        assert_eq!(store.expired_pending(sent, 10).unwrap().len(), 1);
    }

    #[test]
    fn cancel_retries_spares_pending() {
        let store = Store::open_in_memory().unwrap();
        let record = pending("h1");
        store.insert_dispatch(&record).unwrap();
        assert_eq!(store.cancel_retries("h1").unwrap(), 0);

        let now = now_millis();
        store
            .record_failure(record.correlation_id, DispatchStatus::Failed, "nack", Some(now), now)
            .unwrap();
        assert_eq!(store.cancel_retries("h1").unwrap(), 1);
        assert!(store.dispatches_for_host("h1").unwrap().is_empty());
    }
}
