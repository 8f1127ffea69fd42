use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use scenesmith_store::SessionFilter;
use scenesmith_types::Role;

use crate::error::ApiError;
use crate::state::AppState;

/// Background sweep interval for the stale-run reaper. Independent of
/// `stale_session_threshold`, which controls how old a session must be
/// before the reaper acts on it.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/generate", post(generate))
        .route("/session/:id", get(get_session))
        .route("/session/:id/cancel", post(cancel_session))
        .route("/sessions", get(list_sessions))
        .route("/download/:id/:kind", get(download))
        .route("/stats", get(stats))
        .route("/config", get(get_config))
        .route("/events", get(events))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

/// Binds, spawns the stale-run reaper, and serves until `ctrl_c` or the
/// process receives SIGTERM, draining in-flight requests before returning.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let reaper_state = state.clone();
    let reaper = tokio::spawn(async move { run_reaper(reaper_state).await });

    let app = router(state);
    info!(%addr, "scenesmith-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    reaper.abort();
    Ok(())
}

/// Cancels any session that hasn't progressed within
/// `config.stale_session_threshold`, mirroring the Session Controller's
/// disk-recovery staleness rule (spec.md §4.1) for sessions that are stuck
/// in memory rather than crash-recovered from disk.
async fn run_reaper(state: AppState) {
    let threshold = chrono::Duration::from_std(state.config.stale_session_threshold).unwrap_or(chrono::Duration::seconds(1800));
    loop {
        tokio::time::sleep(REAPER_INTERVAL).await;
        let sessions = state.controller.list(SessionFilter::default()).await;
        let now = chrono::Utc::now();
        for session in sessions {
            if session.is_stale(threshold, now) {
                warn!(session_id = %session.id, "reaping stale session");
                state.cancellation.cancel(session.id);
                let _ = state.controller.cancel(session.id).await;
            }
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "healthy": true }))
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    roles: Option<Vec<Role>>,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    session_id: Uuid,
}

async fn generate(State(state): State<AppState>, Json(req): Json<GenerateRequest>) -> Result<impl IntoResponse, ApiError> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }
    let roles = req.roles.unwrap_or_else(|| Role::ALL.to_vec());
    let session = state.controller.create_session(req.prompt.clone(), roles.clone(), state.config.max_iterations).await?;

    let engine = state.engine.clone();
    let session_id = session.id;
    tokio::spawn(async move {
        if let Err(err) = engine.run(session_id, req.prompt, roles).await {
            info!(%session_id, %err, "session finished with an error");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(GenerateResponse { session_id })))
}

#[derive(Debug, Serialize)]
struct DownloadAvailability {
    blend: bool,
    scripts: bool,
    render: bool,
}

#[derive(Debug, Serialize)]
struct DownloadUrls {
    blend: String,
    scripts: String,
    render: String,
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let session = state.controller.status(id).await.ok_or_else(|| ApiError::not_found("session not found"))?;
    let has_render = state.store.latest_render_iteration(id).await.is_some();
    let download_available = DownloadAvailability {
        blend: state.store.has_blend_file(id).await,
        scripts: session.iteration > 0,
        render: has_render,
    };
    let download_urls = DownloadUrls {
        blend: format!("/download/{id}/blend"),
        scripts: format!("/download/{id}/scripts"),
        render: format!("/download/{id}/render"),
    };
    Ok(Json(json!({
        "session": session,
        "download_urls": download_urls,
        "download_available": download_available,
    })))
}

async fn cancel_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    state.controller.status(id).await.ok_or_else(|| ApiError::not_found("session not found"))?;
    state.cancellation.cancel(id);
    state.controller.cancel(id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize, Default)]
struct ListSessionsQuery {
    status: Option<String>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    until: Option<chrono::DateTime<chrono::Utc>>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

async fn list_sessions(State(state): State<AppState>, Query(query): Query<ListSessionsQuery>) -> impl IntoResponse {
    let filter = SessionFilter {
        status: query.status,
        since: query.since,
        until: query.until,
        limit: query.limit,
        offset: query.offset,
    };
    let sessions = state.controller.list(filter).await;
    Json(json!({ "total": sessions.len(), "sessions": sessions }))
}

async fn download(State(state): State<AppState>, Path((id, kind)): Path<(Uuid, String)>) -> Result<impl IntoResponse, ApiError> {
    let session = state.controller.status(id).await.ok_or_else(|| ApiError::not_found("session not found"))?;
    let (path, content_type) = match kind.as_str() {
        "blend" => {
            let path = state.store.blend_file_path(id).await.ok_or_else(|| ApiError::not_found("no .blend file for this session"))?;
            (path, "application/octet-stream")
        }
        "scripts" => {
            if session.iteration == 0 {
                return Err(ApiError::not_found("no combined script has been assembled yet"));
            }
            (state.store.combined_script_path(id, session.iteration), "text/x-python")
        }
        "render" => {
            let iteration = state.store.latest_render_iteration(id).await.ok_or_else(|| ApiError::not_found("no render available"))?;
            (state.store.render_path(id, iteration), "image/png")
        }
        other => return Err(ApiError::bad_request(format!("unknown download kind `{other}`, expected blend|scripts|render"))),
    };
    let bytes = state.store.read_artifact(&path).await.map_err(|_| ApiError::not_found("artifact missing on disk"))?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    workers: HashMap<String, serde_json::Value>,
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.stats_snapshot().await;
    let workers = snapshot
        .into_iter()
        .map(|(role, stats)| {
            (
                role.as_str().to_string(),
                json!({
                    "messages_received": stats.messages_received,
                    "tasks_completed": stats.tasks_completed,
                    "tasks_failed": stats.tasks_failed,
                    "average_processing_ms": stats.average_processing_ms(),
                    "success_rate": stats.success_rate(),
                }),
            )
        })
        .collect();
    Json(StatsResponse { workers })
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.to_effective_json())
}

#[derive(Debug, Deserialize, Default)]
struct EventFilterQuery {
    session_id: Option<Uuid>,
}

async fn events(State(state): State<AppState>, Query(filter): Query<EventFilterQuery>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.controller.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| {
        let event = msg.ok()?;
        if let Some(session_id) = filter.session_id {
            if event.session_id != session_id {
                return None;
            }
        }
        let data = serde_json::to_string(&event).unwrap_or_default();
        Some(Ok(Event::default().data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use scenesmith_bus::Bus;
    use scenesmith_context::ContextRegistry;
    use scenesmith_executor::Executor;
    use scenesmith_store::{ArtifactStore, SessionController};
    use scenesmith_types::{CancellationRegistry, Config};
    use scenesmith_workflow::WorkflowEngine;
    use tower::ServiceExt;

    use super::*;

    fn test_config() -> Config {
        Config {
            blender_path: "blender".to_string(),
            output_dir: "/tmp".to_string(),
            max_iterations: 2,
            render_engine: "CYCLES".to_string(),
            render_samples: 16,
            render_resolution_x: 320,
            render_resolution_y: 240,
            animation_enabled: false,
            animation_frames: 1,
            animation_fps: 24,
            reviewer_enabled: false,
            executor_concurrency: 1,
            inbox_capacity: 8,
            stage_timeout: Duration::from_millis(50),
            executor_timeout: Duration::from_millis(50),
            stale_session_threshold: Duration::from_secs(1800),
        }
    }

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let controller = Arc::new(SessionController::new(store.clone()));
        let context = ContextRegistry::new();
        let executor = Arc::new(Executor::new(1));
        let bus = Bus::new(8);
        let cancellation = CancellationRegistry::new();
        let config = Arc::new(test_config());
        let engine = Arc::new(WorkflowEngine::new(
            bus.clone(),
            store.clone(),
            controller.clone(),
            context.clone(),
            executor.clone(),
            cancellation.clone(),
            config.clone(),
        ));
        let state = AppState::new(store, controller, context, executor, bus, cancellation, config, engine);
        (state, dir)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (state, _dir) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "healthy": true }));
    }

    #[tokio::test]
    async fn generate_rejects_empty_prompt() {
        let (state, _dir) = test_state().await;
        let app = router(state);
        let request = Request::builder()
            .method("POST")
            .uri("/generate")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "prompt": "   " }).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn generate_then_get_session_round_trips() {
        let (state, _dir) = test_state().await;
        let app = router(state);
        let request = Request::builder()
            .method("POST")
            .uri("/generate")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "prompt": "a red cube", "roles": ["concept"] }).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(Request::builder().uri(format!("/session/{session_id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["session"]["id"], session_id);
        assert_eq!(body["download_available"]["blend"], false);
    }

    #[tokio::test]
    async fn get_session_404s_for_unknown_id() {
        let (state, _dir) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri(format!("/session/{}", Uuid::new_v4())).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_404s_when_no_script_has_been_assembled_yet() {
        let (state, _dir) = test_state().await;
        let session = state.controller.create_session("a red cube", vec![], 1).await.unwrap();
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri(format!("/download/{}/scripts", session.id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_sessions_reports_every_created_session() {
        let (state, _dir) = test_state().await;
        state.controller.create_session("a", vec![], 1).await.unwrap();
        state.controller.create_session("b", vec![], 1).await.unwrap();
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 2);
    }

    #[tokio::test]
    async fn config_endpoint_echoes_effective_config() {
        let (state, _dir) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["blender_path"], "blender");
    }

    #[tokio::test]
    async fn stats_endpoint_starts_empty() {
        let (state, _dir) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["workers"], json!({}));
    }

    #[tokio::test]
    async fn cancel_unknown_session_404s() {
        let (state, _dir) = test_state().await;
        let app = router(state);
        let response = app
            .oneshot(Request::builder().method("POST").uri(format!("/session/{}/cancel", Uuid::new_v4())).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
