/**
 * ERREURS CONVERGE - Taxonomie commune au pipeline profil → diff → playbook → dispatch
 *
 * RÔLE : Un seul enum partagé par le store, le coordinateur et l'API HTTP.
 * Chaque variante correspond à une politique : rejet (4xx), retry (transient),
 * alerte (schema) ou simple signal de contrôle (diff vide).
 */

use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Entrée appelant invalide, jamais retentée
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Course à la création, relire puis réessayer
    #[error("conflict: {0}")]
    Conflict(String),
    /// Store ou transport indisponible, retenté avec backoff
    #[error("dependency unavailable: {0}")]
    TransientDependency(String),
    /// Champ de diff sans template de tâche : schéma et générateur désynchronisés
    #[error("schema mismatch: no task template for field '{0}'")]
    Schema(String),
    /// Rien à dispatcher
    #[error("diff is empty, nothing to dispatch")]
    EmptyDiff,
    #[error("storage error: {0}")]
    Storage(rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("playbook render error: {0}")]
    Render(#[from] serde_yaml::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => Error::Conflict(err.to_string()),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Error::TransientDependency(err.to_string())
            }
            _ => Error::Storage(err),
        }
    }
}

impl Error {
    /// Vrai si l'opération peut être retentée telle quelle plus tard
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientDependency(_) | Error::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_violation_maps_to_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            Some("UNIQUE constraint failed: profiles.org_id, profiles.version".into()),
        );
        assert!(matches!(Error::from(err), Error::Conflict(_)));
    }

    #[test]
    fn busy_maps_to_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let mapped = Error::from(err);
        assert!(matches!(mapped, Error::TransientDependency(_)));
        assert!(mapped.is_transient());
    }

    #[test]
    fn other_sqlite_errors_stay_storage() {
        let mapped = Error::from(rusqlite::Error::InvalidQuery);
        assert!(matches!(mapped, Error::Storage(_)));
        assert!(!mapped.is_transient());
    }
}
