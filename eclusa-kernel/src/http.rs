/**
 * API REST ECLUSA - Lecture des occurrences et statistiques du dashboard
 *
 * RÔLE :
 * Exposer l'état du kernel aux opérateurs : occurrences actives, historique,
 * statistiques par secteur, définitions et connexions PLC. Seule écriture :
 * la résolution manuelle d'une occurrence.
 *
 * FONCTIONNEMENT :
 * - Routes sous /api/v1, réponses JSON { success, data, total }
 * - Filtres historique : sector, kind, status, limit (100 par défaut), offset
 * - Les filtres sector/kind sont traduits en ids via la carte des définitions
 * - Les appels au store (rusqlite, bloquant) passent par spawn_blocking
 * - CORS ouvert : le dashboard web appelle l'API depuis le navigateur
 *
 * SÉCURITÉ :
 * - Si ECLUSA_API_KEY est défini, header x-api-key exigé partout sauf /health
 * - Sans clé configurée l'API est ouverte (réseau d'exploitation isolé)
 */

use crate::decoder::active_bits;
use crate::kernel::Kernel;
use crate::mapping::{DefinitionMap, SectorSummary};
use crate::models::{FaultDefinition, Occurrence, OccurrenceStatus};
use crate::server::ConnectionInfo;
use crate::stats::{self, DashboardStats, SectorStats};
use crate::store::{FaultStore, LockInfo, OccurrenceQuery, StoreError};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub kernel: Kernel,
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    /// Clé lue dans ECLUSA_API_KEY (vide = pas d'authentification)
    pub fn from_env(kernel: Kernel) -> Self {
        let api_key = std::env::var("ECLUSA_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(Arc::from);
        Self { kernel, api_key }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self { success: true, data, total: None })
    }
}

impl<T> ApiResponse<Vec<T>> {
    fn list(data: Vec<T>) -> Json<Self> {
        let total = data.len();
        Json(Self { success: true, data, total: Some(total) })
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Store(StoreError),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Store(e) => {
                tracing::error!(error = %e, "store query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "store unavailable".to_string())
            }
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "success": false, "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Exécute un appel au store sur le pool bloquant
async fn with_store<T, F>(app: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&dyn FaultStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(&app.kernel.store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| ApiError::Internal(format!("store task failed: {e}")))?
        .map_err(ApiError::from)
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path == "/health" || path.ends_with("/health") {
        return Ok(next.run(req).await);
    }
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        tracing::warn!(path, "rejected request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(get_health))
        .route("/occurrences/active", get(get_active_occurrences))
        .route("/occurrences/history", get(get_history))
        .route("/occurrences/{id}/resolve", post(resolve_occurrence))
        .route("/statistics/dashboard", get(get_dashboard))
        .route("/statistics/sectors", get(get_sector_statistics))
        .route("/definitions", get(get_definitions))
        .route("/sectors", get(get_sectors))
        .route("/locks", get(get_locks))
        .route("/connections", get(get_connections))
        .route("/words", get(get_words));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .nest("/api/v1", api)
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        // après l'auth : les preflight OPTIONS sont servis sans clé
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(app_state)
}

/// Occurrence enrichie de sa définition
#[derive(Debug, Serialize)]
pub struct OccurrenceView {
    #[serde(flatten)]
    pub occurrence: Occurrence,
    pub definition: Option<FaultDefinition>,
    pub duration_seconds: i64,
}

fn to_views(kernel: &Kernel, occurrences: Vec<Occurrence>) -> Vec<OccurrenceView> {
    let now = OffsetDateTime::now_utc();
    occurrences
        .into_iter()
        .map(|occurrence| OccurrenceView {
            definition: kernel.definitions.by_id(occurrence.definition_id).cloned(),
            duration_seconds: occurrence.duration(now).whole_seconds().max(0),
            occurrence,
        })
        .collect()
}

// GET /api/v1/health
async fn get_health(State(app): State<AppState>) -> Json<ApiResponse<crate::health::KernelHealth>> {
    ApiResponse::ok(app.kernel.health())
}

// GET /api/v1/occurrences/active
async fn get_active_occurrences(State(app): State<AppState>) -> ApiResult<Vec<OccurrenceView>> {
    let rows = with_store(&app, |store| store.occurrences(&OccurrenceQuery::active())).await?;
    Ok(ApiResponse::list(to_views(&app.kernel, rows)))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub sector: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl HistoryParams {
    fn to_query(&self, kernel: &Kernel) -> Result<OccurrenceQuery, ApiError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<OccurrenceStatus>)
            .transpose()
            .map_err(ApiError::BadRequest)?;

        let definition_ids = if self.sector.is_some() || self.kind.is_some() {
            let selected = select_definitions(&kernel.definitions, self.sector.as_deref(), self.kind.as_deref());
            Some(selected.into_iter().map(|d| d.id).collect())
        } else {
            None
        };

        let defaults = OccurrenceQuery::default();
        Ok(OccurrenceQuery {
            status,
            definition_ids,
            limit: self.limit.or(defaults.limit),
            offset: self.offset,
        })
    }
}

/// Définitions d'un secteur et/ou d'un type
fn select_definitions<'a>(
    definitions: &'a DefinitionMap,
    sector: Option<&'a str>,
    kind: Option<&'a str>,
) -> Vec<&'a FaultDefinition> {
    match (sector, kind) {
        (Some(sector), kind) => definitions.by_sector(sector).filter(|d| kind.map_or(true, |k| d.kind == k)).collect(),
        (None, Some(kind)) => definitions.by_kind(kind).collect(),
        (None, None) => definitions.iter().collect(),
    }
}

// GET /api/v1/occurrences/history?sector=&kind=&status=&limit=
async fn get_history(State(app): State<AppState>, Query(params): Query<HistoryParams>) -> ApiResult<Vec<OccurrenceView>> {
    let query = params.to_query(&app.kernel)?;
    let rows = with_store(&app, move |store| store.occurrences(&query)).await?;
    Ok(ApiResponse::list(to_views(&app.kernel, rows)))
}

// POST /api/v1/occurrences/{id}/resolve
async fn resolve_occurrence(State(app): State<AppState>, Path(id): Path<i64>) -> ApiResult<serde_json::Value> {
    let now = OffsetDateTime::now_utc();
    if with_store(&app, move |store| store.resolve_occurrence(id, now)).await? {
        tracing::info!(occurrence_id = id, "occurrence resolved manually");
        Ok(ApiResponse::ok(serde_json::json!({ "id": id, "status": "RESOLVED" })))
    } else {
        Err(ApiError::NotFound(format!("no active occurrence {id}")))
    }
}

// GET /api/v1/statistics/dashboard
async fn get_dashboard(State(app): State<AppState>) -> ApiResult<DashboardStats> {
    let rows = with_store(&app, |store| store.occurrences(&OccurrenceQuery::all())).await?;
    Ok(ApiResponse::ok(stats::dashboard(&rows, &app.kernel.definitions, OffsetDateTime::now_utc())))
}

// GET /api/v1/statistics/sectors
async fn get_sector_statistics(State(app): State<AppState>) -> ApiResult<Vec<SectorStats>> {
    let rows = with_store(&app, |store| store.occurrences(&OccurrenceQuery::all())).await?;
    Ok(ApiResponse::list(stats::sector_stats(&rows, &app.kernel.definitions)))
}

#[derive(Debug, Default, Deserialize)]
pub struct DefinitionParams {
    pub sector: Option<String>,
    pub kind: Option<String>,
}

// GET /api/v1/definitions?sector=&kind=
async fn get_definitions(
    State(app): State<AppState>,
    Query(params): Query<DefinitionParams>,
) -> Json<ApiResponse<Vec<FaultDefinition>>> {
    let defs = select_definitions(&app.kernel.definitions, params.sector.as_deref(), params.kind.as_deref())
        .into_iter()
        .cloned()
        .collect();
    ApiResponse::list(defs)
}

// GET /api/v1/sectors
async fn get_sectors(State(app): State<AppState>) -> Json<ApiResponse<Vec<SectorSummary>>> {
    ApiResponse::list(app.kernel.definitions.sectors())
}

// GET /api/v1/locks
async fn get_locks(State(app): State<AppState>) -> ApiResult<Vec<LockInfo>> {
    let locks = with_store(&app, |store| store.locks()).await?;
    Ok(ApiResponse::list(locks))
}

// GET /api/v1/connections
async fn get_connections(State(app): State<AppState>) -> Json<ApiResponse<Vec<ConnectionInfo>>> {
    ApiResponse::list(app.kernel.server.connections())
}

#[derive(Debug, Serialize)]
pub struct WordView {
    pub address: u32,
    pub value: u16,
    pub hex: String,
    pub active_bits: Vec<u8>,
}

// GET /api/v1/words (dernières valeurs vues par le détecteur)
async fn get_words(State(app): State<AppState>) -> Json<ApiResponse<Vec<WordView>>> {
    let words = app
        .kernel
        .pipeline
        .detector()
        .snapshot()
        .into_iter()
        .map(|(address, value)| WordView {
            address,
            value,
            hex: format!("0x{value:04X}"),
            active_bits: active_bits(value).collect(),
        })
        .collect();
    ApiResponse::list(words)
}
