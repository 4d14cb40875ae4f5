//! matrixsync API server: read-only views over the indexed registration and
//! matrix data.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use eyre::Result;
use matrixsync_core::{AppError, Settings, telemetry};
use matrixsync_query::QueryService;
use matrixsync_storage::{self as storage, PgStore};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};

/// Shared application state.
struct AppState {
    query: QueryService,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init("api");
    let settings = Settings::from_env()?;

    tracing::info!("Starting matrixsync API server");

    let pool = storage::connect(&settings.database_url).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database ready");

    let state = Arc::new(AppState {
        query: QueryService::new(Arc::new(PgStore::new(pool)), settings.home_stats_ttl()),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.api_port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/users", get(list_users))
        .route("/api/users/:id", get(get_user))
        .route("/api/users/:id/generations", get(get_generations))
        .route("/api/home/stats", get(get_home_stats))
        .route("/api/home/stats/invalidate", post(invalidate_home_stats))
        .route("/health", get(health))
        .with_state(state)
}

// ─── Query Params ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserSearchParams {
    wallet_address: Option<String>,
    full_name: Option<String>,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HomeStatsParams {
    #[serde(default, alias = "refreshCache")]
    refresh: bool,
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: T,
}

#[derive(Serialize)]
struct GenerationsResponse {
    levels: Vec<matrixsync_query::GenerationLevel>,
}

type ApiError = (StatusCode, Json<ApiResponse<String>>);

fn json_ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data,
    })
}

fn json_err(status: StatusCode, msg: &str) -> ApiError {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: msg.to_string(),
        }),
    )
}

/// Store failures are logged in full and reported generically.
fn internal(e: AppError) -> ApiError {
    tracing::error!(error = %e, "Query failed");
    json_err(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

/// GET /api/users: paginated search by wallet and/or name.
async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserSearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state
        .query
        .list_users(params.wallet_address, params.full_name, params.page, params.limit)
        .await
        .map_err(internal)?;
    Ok(json_ok(page))
}

/// GET /api/users/:id: user with slots and received transactions.
async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.query.user_dashboard(user_id).await.map_err(internal)? {
        Some(dashboard) => Ok(json_ok(dashboard)),
        None => Err(json_err(StatusCode::NOT_FOUND, "User not found")),
    }
}

/// GET /api/users/:id/generations: up to ten referral generations.
async fn get_generations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let levels = state.query.generation_levels(user_id).await.map_err(internal)?;
    Ok(json_ok(GenerationsResponse { levels }))
}

/// GET /api/home/stats: cached totals; `?refresh=true` bypasses the cache.
async fn get_home_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HomeStatsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.query.home_stats(params.refresh).await.map_err(internal)?;
    Ok(json_ok(stats))
}

/// POST /api/home/stats/invalidate: drop the cached home stats.
async fn invalidate_home_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.query.invalidate_home_stats().await;
    json_ok("Cache cleared")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use matrixsync_storage::models::NewUser;
    use matrixsync_storage::{AggregateStore, MemoryStore};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for (id, parent) in [(1, None), (2, Some(1)), (3, Some(2))] {
            store
                .register_user(
                    &NewUser {
                        user_id: id,
                        wallet_address: format!("0x{id:040x}"),
                        full_name: format!("user {id}"),
                        referred_by: parent,
                        referrer_address: None,
                        registration_time: 0,
                    },
                    &[],
                )
                .await
                .unwrap();
        }
        let state = Arc::new(AppState {
            query: QueryService::new(store.clone(), Duration::from_secs(300)),
        });
        (router(state), store)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn lists_users_with_paging_fields() {
        let (app, _) = app().await;
        let (status, body) = get_json(app, "/api/users?fullName=USER&limit=2&page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["totalUsers"], 3);
        assert_eq!(body["data"]["totalPages"], 2);
        assert_eq!(body["data"]["currentPage"], 2);
        assert_eq!(body["data"]["users"][0]["userId"], 3);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let (app, _) = app().await;
        let (status, body) = get_json(app, "/api/users/42").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn generations_are_wrapped_in_levels() {
        let (app, _) = app().await;
        let (status, body) = get_json(app, "/api/users/1/generations").await;
        assert_eq!(status, StatusCode::OK);
        let levels = body["data"]["levels"].as_array().unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[1]["users"][0]["userId"], 3);
    }

    #[tokio::test]
    async fn store_errors_are_generic() {
        let (app, store) = app().await;
        store.set_unavailable(true);
        let (status, body) = get_json(app, "/api/home/stats?refresh=true").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, serde_json::json!({ "success": false, "data": "Internal server error" }));
    }
}
