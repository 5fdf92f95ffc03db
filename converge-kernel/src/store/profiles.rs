//! Profils : versions immuables par organisation, la plus haute est la courante.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{from_millis, parse_state, parse_uuid, to_millis, Store};
use crate::error::{Error, Result};
use crate::models::{Profile, ProfileOverrides, StateMap};
use crate::schema;

const COLUMNS: &str = "profile_id, org_id, account_id, version, active, state, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreatedAt,
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Tri + pagination pour GET /profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileQuery {
    pub sort_field: SortField,
    pub sort_order: SortOrder,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl Default for ProfileQuery {
    fn default() -> Self {
        Self {
            sort_field: SortField::CreatedAt,
            sort_order: SortOrder::Desc,
            limit: None,
            offset: 0,
        }
    }
}

impl ProfileQuery {
    /// Parse `champ[:asc|:desc]`, ex. "created_at:desc"
    pub fn with_sort(mut self, spec: &str) -> Result<Self> {
        let (field, order) = spec.split_once(':').unwrap_or((spec, "asc"));
        self.sort_field = match field {
            "created_at" => SortField::CreatedAt,
            "version" => SortField::Version,
            other => return Err(Error::Validation(format!("cannot sort by '{other}'"))),
        };
        self.sort_order = match order {
            "asc" => SortOrder::Asc,
            "desc" => SortOrder::Desc,
            other => return Err(Error::Validation(format!("invalid sort order '{other}'"))),
        };
        Ok(self)
    }

    fn order_by(&self) -> &'static str {
        match (self.sort_field, self.sort_order) {
            (SortField::CreatedAt, SortOrder::Asc) => "created_at ASC, version ASC",
            (SortField::CreatedAt, SortOrder::Desc) => "created_at DESC, version DESC",
            (SortField::Version, SortOrder::Asc) => "version ASC",
            (SortField::Version, SortOrder::Desc) => "version DESC",
        }
    }
}

/// Résultat d'une mise à jour du profil courant
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Created(Profile),
    Unchanged(Profile),
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    let id: String = row.get(0)?;
    let state: String = row.get(5)?;
    Ok(Profile {
        profile_id: parse_uuid(0, &id)?,
        org_id: row.get(1)?,
        account_id: row.get(2)?,
        version: row.get(3)?,
        active: row.get(4)?,
        state: parse_state(5, &state)?,
        created_at: from_millis(row.get(6)?),
    })
}

fn current(conn: &Connection, org_id: &str) -> Result<Option<Profile>> {
    let sql = format!("SELECT {COLUMNS} FROM profiles WHERE org_id = ?1 ORDER BY version DESC LIMIT 1");
    Ok(conn
        .query_row(&sql, params![org_id], profile_from_row)
        .optional()?)
}

fn validate(profile: &Profile) -> Result<()> {
    if profile.org_id.trim().is_empty() {
        return Err(Error::Validation("profile has no org_id".into()));
    }
    if profile.profile_id.is_nil() {
        return Err(Error::Validation("profile has no id".into()));
    }
    if profile.version == 0 {
        return Err(Error::Validation("profile version must start at 1".into()));
    }
    Ok(())
}

impl Store {
    pub fn count_profiles(&self, org_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM profiles WHERE org_id = ?1",
            params![org_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Profil courant sans création implicite
    pub fn current_profile(&self, org_id: &str) -> Result<Option<Profile>> {
        current(&self.conn.lock(), org_id)
    }

    /// Profil courant, en créant le profil par défaut si l'organisation n'en a aucun.
    ///
    /// L'insertion passe par `ON CONFLICT (org_id, version) DO NOTHING` : deux
    /// workers qui arrivent en même temps sur une org vide écrivent la même
    /// version 1, un seul l'emporte et les deux relisent la même ligne.
    pub fn get_or_insert_current(
        &self,
        org_id: &str,
        account_id: &str,
        default_state: &StateMap,
    ) -> Result<Profile> {
        let conn = self.conn.lock();
        if let Some(profile) = current(&conn, org_id)? {
            return Ok(profile);
        }

        let profile = Profile::new(org_id, account_id, default_state.clone());
        validate(&profile)?;
        let inserted = conn.execute(
            "INSERT INTO profiles (profile_id, org_id, account_id, version, active, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (org_id, version) DO NOTHING",
            params![
                profile.profile_id.to_string(),
                profile.org_id,
                profile.account_id,
                profile.version,
                profile.active,
                serde_json::to_string(&profile.state)?,
                to_millis(profile.created_at),
            ],
        )?;
        if inserted == 1 {
            info!(org_id, profile_id = %profile.profile_id, "created default profile");
        } else {
            debug!(org_id, "default profile created concurrently by another worker");
        }

        current(&conn, org_id)?
            .ok_or_else(|| Error::NotFound(format!("no current profile for org {org_id}")))
    }

    pub fn get_profile(&self, profile_id: Uuid) -> Result<Profile> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {COLUMNS} FROM profiles WHERE profile_id = ?1");
        conn.query_row(&sql, params![profile_id.to_string()], profile_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("profile {profile_id}")))
    }

    /// Persiste une nouvelle version ; `Conflict` si la version ou l'ID est déjà pris.
    pub fn insert_profile(&self, profile: &Profile) -> Result<()> {
        validate(profile)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO profiles (profile_id, org_id, account_id, version, active, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                profile.profile_id.to_string(),
                profile.org_id,
                profile.account_id,
                profile.version,
                profile.active,
                serde_json::to_string(&profile.state)?,
                to_millis(profile.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_profiles(&self, org_id: &str, query: &ProfileQuery) -> Result<Vec<Profile>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {COLUMNS} FROM profiles WHERE org_id = ?1 ORDER BY {} LIMIT ?2 OFFSET ?3",
            query.order_by()
        );
        // LIMIT négatif = pas de limite pour SQLite
        let limit = query.limit.map_or(-1, i64::from);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![org_id, limit, i64::from(query.offset)], profile_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Copie-sur-écriture du profil courant avec les surcharges demandées.
    /// Rien n'est écrit quand le résultat est identique au profil courant.
    pub fn update_current(
        &self,
        org_id: &str,
        account_id: &str,
        overrides: &ProfileOverrides,
        default_state: &StateMap,
    ) -> Result<UpdateOutcome> {
        if let Some(unknown) = overrides.state.keys().find(|k| !schema::is_known(k)) {
            return Err(Error::Validation(format!("unknown profile field '{unknown}'")));
        }

        let current = self.get_or_insert_current(org_id, account_id, default_state)?;
        let mut next = current.next_version();
        if let Some(active) = overrides.active {
            next.active = active;
        }
        for (field, value) in &overrides.state {
            next.state.insert(field.clone(), *value);
        }

        if next.same_content(&current) {
            return Ok(UpdateOutcome::Unchanged(current));
        }

        self.insert_profile(&next)?;
        info!(
            org_id,
            profile_id = %next.profile_id,
            version = next.version,
            "created profile version"
        );
        Ok(UpdateOutcome::Created(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::baseline_state;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn default_state() -> StateMap {
        [("insights", true), ("remediations", false), ("compliance", true)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn first_access_creates_default_profile() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.count_profiles("org-1").unwrap(), 0);

        let profile = store.get_or_insert_current("org-1", "acct-1", &default_state()).unwrap();
        assert_eq!(profile.state, default_state());
        assert_eq!(profile.version, 1);
        assert!(profile.active);
        assert_eq!(store.count_profiles("org-1").unwrap(), 1);

        let again = store.get_or_insert_current("org-1", "acct-1", &default_state()).unwrap();
        assert_eq!(again, profile);
        assert_eq!(store.count_profiles("org-1").unwrap(), 1);
    }

    #[test]
    fn concurrent_first_access_creates_one_profile() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("converge.db");
        Store::open(&path).unwrap();

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    // une connexion par thread : seule la contrainte SQL protège
                    let store = Store::open(&path).unwrap();
                    barrier.wait();
                    store.get_or_insert_current("org-race", "", &default_state()).unwrap()
                })
            })
            .collect();

        let ids: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().profile_id)
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(Store::open(&path).unwrap().count_profiles("org-race").unwrap(), 1);
    }

    #[test]
    fn get_profile_reports_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(store.get_profile(Uuid::new_v4()), Err(Error::NotFound(_))));
    }

    #[test]
    fn insert_validates_identity() {
        let store = Store::open_in_memory().unwrap();
        let mut profile = Profile::new("  ", "acct", baseline_state());
        assert!(matches!(store.insert_profile(&profile), Err(Error::Validation(_))));

        profile.org_id = "org-1".into();
        profile.profile_id = Uuid::nil();
        assert!(matches!(store.insert_profile(&profile), Err(Error::Validation(_))));
    }

    #[test]
    fn duplicate_version_is_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        let current = store.get_or_insert_current("org-1", "", &default_state()).unwrap();

        store.insert_profile(&current.next_version()).unwrap();
        // un second writer parti de la même base prend la même version
        let racing = current.next_version();
        assert!(matches!(store.insert_profile(&racing), Err(Error::Conflict(_))));
    }

    #[test]
    fn current_is_highest_version() {
        let store = Store::open_in_memory().unwrap();
        let v1 = store.get_or_insert_current("org-1", "", &default_state()).unwrap();
        let v2 = v1.next_version();
        store.insert_profile(&v2).unwrap();
        assert_eq!(store.current_profile("org-1").unwrap(), Some(v2));
        assert_eq!(store.current_profile("org-2").unwrap(), None);
    }

    #[test]
    fn list_sorts_and_paginates() {
        let store = Store::open_in_memory().unwrap();
        let mut latest = store.get_or_insert_current("org-1", "", &default_state()).unwrap();
        for _ in 0..3 {
            latest = latest.next_version();
            store.insert_profile(&latest).unwrap();
        }
        store.get_or_insert_current("org-other", "", &default_state()).unwrap();

        let all = store.list_profiles("org-1", &ProfileQuery::default()).unwrap();
        assert_eq!(all.iter().map(|p| p.version).collect::<Vec<_>>(), vec![4, 3, 2, 1]);

        let query = ProfileQuery { limit: Some(2), offset: 1, ..ProfileQuery::default() }
            .with_sort("version:asc")
            .unwrap();
        let page = store.list_profiles("org-1", &query).unwrap();
        assert_eq!(page.iter().map(|p| p.version).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn sort_spec_is_validated() {
        let q = ProfileQuery::default().with_sort("version").unwrap();
        assert_eq!((q.sort_field, q.sort_order), (SortField::Version, SortOrder::Asc));
        assert!(matches!(ProfileQuery::default().with_sort("state:desc"), Err(Error::Validation(_))));
        assert!(matches!(ProfileQuery::default().with_sort("version:up"), Err(Error::Validation(_))));
    }

    #[test]
    fn update_creates_new_version_with_override() {
        let store = Store::open_in_memory().unwrap();
        let before = store.get_or_insert_current("org-1", "acct", &default_state()).unwrap();

        let mut overrides = ProfileOverrides::default();
        overrides.state.insert("remediations".into(), true);
        let UpdateOutcome::Created(after) =
            store.update_current("org-1", "acct", &overrides, &default_state()).unwrap()
        else {
            panic!("expected a new version");
        };

        assert_eq!(after.version, before.version + 1);
        assert_eq!(after.state.get("remediations"), Some(&true));
        assert_eq!(after.state.get("insights"), before.state.get("insights"));
        assert_eq!(store.count_profiles("org-1").unwrap(), 2);
    }

    #[test]
    fn identical_update_is_unchanged() {
        let store = Store::open_in_memory().unwrap();
        let before = store.get_or_insert_current("org-1", "", &default_state()).unwrap();

        let overrides = ProfileOverrides {
            active: Some(true),
            state: default_state(),
        };
        let outcome = store.update_current("org-1", "", &overrides, &default_state()).unwrap();
        assert_eq!(outcome, UpdateOutcome::Unchanged(before));
        assert_eq!(store.count_profiles("org-1").unwrap(), 1);
    }

    #[test]
    fn update_rejects_unknown_fields() {
        let store = Store::open_in_memory().unwrap();
        let mut overrides = ProfileOverrides::default();
        overrides.state.insert("telemetry".into(), true);
        assert!(matches!(
            store.update_current("org-1", "", &overrides, &default_state()),
            Err(Error::Validation(_))
        ));
        assert_eq!(store.count_profiles("org-1").unwrap(), 0);
    }
}
