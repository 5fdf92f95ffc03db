/**
 * API REST CONVERGE - Lecture/mise à jour du profil courant et playbooks à la demande
 *
 * RÔLE :
 * Second point d'entrée du pipeline, à côté du consommateur d'inventaire.
 * Mêmes store, générateur et coordinateur que le chemin événementiel.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, middleware d'identité avant tout traitement métier
 * - L'organisation vient exclusivement de l'en-tête `x-rh-identity`
 * - Erreurs du domaine converties en statuts HTTP par `ApiError`
 *
 * SÉCURITÉ :
 * - En-tête d'identité obligatoire sur toutes routes sauf /health*
 * - Un profil d'une autre organisation répond 404, jamais 403
 */

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::diff;
use crate::dispatch::{Coordinator, DispatchOutcome};
use crate::error::Error;
use crate::health::{HealthTracker, KernelHealth};
use crate::identity::{Identity, IDENTITY_HEADER};
use crate::models::{Profile, ProfileOverrides};
use crate::playbook::{self, PlaybookTarget, CONTENT_TYPE};
use crate::store::{ProfileQuery, Store, UpdateOutcome};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub coordinator: Coordinator,
    pub health_tracker: HealthTracker,
}

/// Erreur du domaine portée jusqu'à la réponse HTTP
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::EmptyDiff => return StatusCode::NO_CONTENT.into_response(),
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::TransientDependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            other => {
                error!(error = %other, "request failed");
                let body = ErrorBody { error: "internal server error".into() };
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
            }
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn require_identity(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    // Health check toujours accessible
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let header = req
        .headers()
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let identity = Identity::decode(header).map_err(|e| {
        warn!(error = %e, "rejected request with invalid identity");
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/health/system", get(get_system_health))
        .route("/profiles", get(list_profiles).post(update_profile))
        .route("/profiles/{id}", get(get_profile))
        .route("/playbook", get(get_playbook))
        .route("/hosts/{host_id}/dispatch", post(dispatch_host))
        .with_state(app_state)
        .layer(middleware::from_fn(require_identity))
}

// GET /health/system
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health())
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    sort_by: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Serialize)]
struct ProfileList {
    count: usize,
    limit: Option<u32>,
    offset: u32,
    total: u64,
    results: Vec<Profile>,
}

// GET /profiles (historique des versions de l'organisation)
async fn list_profiles(
    State(app): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<ProfileList>> {
    let mut query = ProfileQuery {
        limit: params.limit,
        offset: params.offset.unwrap_or(0),
        ..ProfileQuery::default()
    };
    if let Some(sort_by) = params.sort_by.as_deref() {
        query = query.with_sort(sort_by)?;
    }

    let mut total = app.store.count_profiles(&identity.org_id)?;
    if total == 0 {
        app.store.get_or_insert_current(
            &identity.org_id,
            &identity.account_number,
            app.coordinator.default_state(),
        )?;
        total = app.store.count_profiles(&identity.org_id)?;
    }

    let results = app.store.list_profiles(&identity.org_id, &query)?;
    Ok(Json(ProfileList {
        count: results.len(),
        limit: query.limit,
        offset: query.offset,
        total,
        results,
    }))
}

// GET /profiles/{id} (`current` ou UUID)
async fn get_profile(
    State(app): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<Json<Profile>> {
    Ok(Json(resolve_profile(&app, &identity, &id)?))
}

// POST /profiles (nouvelle version par copie-sur-écriture)
async fn update_profile(
    State(app): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(overrides): Json<ProfileOverrides>,
) -> ApiResult<Response> {
    let outcome = app.store.update_current(
        &identity.org_id,
        &identity.account_number,
        &overrides,
        app.coordinator.default_state(),
    )?;
    Ok(match outcome {
        UpdateOutcome::Created(profile) => (StatusCode::CREATED, Json(profile)).into_response(),
        UpdateOutcome::Unchanged(_) => StatusCode::NOT_MODIFIED.into_response(),
    })
}

#[derive(Debug, Deserialize)]
struct PlaybookParams {
    profile_id: Option<String>,
}

// GET /playbook?profile_id= (état complet du profil, une tâche par champ)
async fn get_playbook(
    State(app): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<PlaybookParams>,
) -> ApiResult<Response> {
    let id = params
        .profile_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| Error::Validation("profile_id query parameter is required".into()))?;
    let profile = resolve_profile(&app, &identity, &id)?;
    let changes = diff::full_state(&profile.effective_state());
    let playbook = playbook::generate(
        &changes,
        PlaybookTarget {
            org_id: profile.org_id.clone(),
            profile_id: profile.profile_id,
            host_id: None,
        },
    )?;
    let yaml = playbook.render()?;
    Ok(([(header::CONTENT_TYPE, CONTENT_TYPE)], yaml).into_response())
}

// POST /hosts/{host_id}/dispatch (réconciliation à la demande)
async fn dispatch_host(
    State(app): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(host_id): Path<String>,
) -> ApiResult<(StatusCode, Json<DispatchOutcome>)> {
    let outcome = app
        .coordinator
        .trigger(&host_id, &identity.org_id, &identity.account_number)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

/// Profil désigné par `id` (UUID ou "current"), limité à l'organisation appelante
fn resolve_profile(app: &AppState, identity: &Identity, id: &str) -> Result<Profile, Error> {
    match id {
        "current" => app.store.get_or_insert_current(
            &identity.org_id,
            &identity.account_number,
            app.coordinator.default_state(),
        ),
        raw => {
            let profile_id = Uuid::parse_str(raw)
                .map_err(|_| Error::Validation(format!("invalid profile id '{raw}'")))?;
            let profile = app.store.get_profile(profile_id)?;
            if profile.org_id != identity.org_id {
                return Err(Error::NotFound(format!("profile {profile_id}")));
            }
            Ok(profile)
        }
    }
}
