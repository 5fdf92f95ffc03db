/**
 * STORE CONVERGE - Persistance relationnelle (SQLite) partagée par HTTP et consommateur
 *
 * RÔLE :
 * Profils immuables, registre d'hôtes, marqueurs de déduplication et records de dispatch.
 *
 * FONCTIONNEMENT :
 * - Une connexion par instance, derrière `Shared<Connection>` (sérialise le process)
 * - Les invariants inter-process reposent sur des contraintes SQL, pas sur le verrou :
 *   UNIQUE(org_id, version) pour la création du profil courant,
 *   index unique partiel pour "un seul dispatch ouvert par hôte"
 * - WAL + busy_timeout pour plusieurs workers sur le même fichier
 *
 * Les horodatages sont stockés en millisecondes Unix.
 */

mod dispatches;
mod events;
mod hosts;
mod profiles;

pub use profiles::{ProfileQuery, SortField, SortOrder, UpdateOutcome};

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::StateMap;

pub type Shared<T> = Arc<Mutex<T>>;

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    profile_id  TEXT PRIMARY KEY,
    org_id      TEXT NOT NULL,
    account_id  TEXT NOT NULL DEFAULT '',
    version     INTEGER NOT NULL,
    active      INTEGER NOT NULL,
    state       TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    UNIQUE (org_id, version)
);

CREATE TABLE IF NOT EXISTS hosts (
    host_id     TEXT PRIMARY KEY,
    org_id      TEXT NOT NULL,
    account_id  TEXT NOT NULL DEFAULT '',
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS processed_events (
    host_id       TEXT NOT NULL,
    kind          TEXT NOT NULL,
    event_id      INTEGER NOT NULL,
    processed_at  INTEGER NOT NULL,
    PRIMARY KEY (host_id, kind, event_id)
);

CREATE TABLE IF NOT EXISTS dispatches (
    dispatch_id     TEXT PRIMARY KEY,
    host_id         TEXT NOT NULL,
    org_id          TEXT NOT NULL,
    profile_id      TEXT,
    state           TEXT NOT NULL,
    status          TEXT NOT NULL,
    attempts        INTEGER NOT NULL,
    correlation_id  TEXT NOT NULL UNIQUE,
    handle          TEXT,
    last_error      TEXT,
    created_at      INTEGER NOT NULL,
    sent_at         INTEGER,
    acked_at        INTEGER,
    retry_at        INTEGER,
    updated_at      INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS dispatches_one_open_per_host
    ON dispatches (host_id)
    WHERE status = 'pending' OR retry_at IS NOT NULL;

CREATE INDEX IF NOT EXISTS dispatches_by_status ON dispatches (status, sent_at);
CREATE INDEX IF NOT EXISTS dispatches_by_host ON dispatches (host_id, status, acked_at);
"#;

/// Handle clonable vers la base Converge.
#[derive(Clone)]
pub struct Store {
    conn: Shared<Connection>,
}

impl Store {
    /// Ouvre (ou crée) la base au chemin donné et applique le schéma.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::TransientDependency(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn)
    }

    /// Base éphémère, pour les tests et les outils.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

pub(crate) fn to_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_state(idx: usize, raw: &str) -> rusqlite::Result<StateMap> {
    serde_json::from_str(raw).map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn millis_round_trip_keeps_millisecond_precision() {
        let t = crate::models::now_millis();
        assert_eq!(from_millis(to_millis(t)), t);
    }

    #[test]
    fn open_creates_parent_dirs_and_is_reopenable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("converge.db");
        Store::open(&path).unwrap();
        // le schéma est idempotent
        Store::open(&path).unwrap();
        assert!(path.exists());
    }
}
