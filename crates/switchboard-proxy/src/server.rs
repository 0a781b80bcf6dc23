//! The `axum` router: translates HTTP requests into
//! `switchboard_runtime::ProxyManager` calls and their results back into
//! HTTP responses. Generalized from the teacher's `gglib-proxy::server`
//! (which built a similar OpenAI/Ollama-shaped router directly against a
//! single backend) to route through `ProxyManager::route` instead, which
//! already knows about aliases, groups and swapping.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use switchboard_core::CoreError;
use switchboard_runtime::{ProxyBody, ProxyManager, ProxyRequest, ProxyResponse};

use crate::models::{extract_model_name, ErrorResponse, ModelsResponse};

#[derive(Clone)]
struct AppState {
    manager: Arc<ProxyManager>,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(route_request))
        .route("/v1/completions", post(route_request))
        .route("/v1/embeddings", post(route_request))
        .route("/v1/events", get(events_stream))
        .route("/api/models/unload", post(unload_all))
        .route("/api/models/unload/{model}", post(unload_one))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state)
}

/// Serve the switchboard HTTP surface on `listener` until `shutdown` fires.
/// Returns once the listener has stopped accepting new connections;
/// callers drain in-flight requests separately via
/// `ProxyManager::shutdown`.
pub async fn serve(
    listener: TcpListener,
    manager: Arc<ProxyManager>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app = build_router(AppState { manager });

    info!(%addr, "switchboard-proxy listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Rejects requests with a missing or unrecognized bearer token whenever
/// the active config carries at least one `required_api_keys` entry. An
/// empty list means the proxy is unauthenticated.
async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let required = state.manager.required_api_keys();
    if required.is_empty() {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(key) if required.iter().any(|k| k == key) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: crate::models::ErrorDetail {
                    message: "missing or invalid API key".to_string(),
                    r#type: "unauthorized",
                },
            }),
        )
            .into_response(),
    }
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(ModelsResponse::from_catalog(state.manager.catalog()))
}

/// Shared handler for every inbound-completion-shaped route: all three
/// only differ in which path they forward, and `ProxyRequest` already
/// carries that.
async fn route_request(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let model_name = match extract_model_name(&body) {
        Ok(name) => name,
        Err(e) => return error_response(e),
    };

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let req = ProxyRequest {
        method,
        path_and_query,
        headers,
        body,
    };

    match state.manager.route(&model_name, req).await {
        Ok(response) => into_axum_response(response),
        Err(e) => error_response(e),
    }
}

async fn unload_all(State(state): State<AppState>) -> impl IntoResponse {
    state.manager.unload_all().await;
    StatusCode::OK
}

async fn unload_one(State(state): State<AppState>, Path(model): Path<String>) -> Response {
    match state.manager.unload_one(&model).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /v1/events`: a live feed of `Event::StateChanged`/`Event::Log`,
/// grounded on the teacher's `gglib-axum::sse::SseBroadcaster`.
async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.manager.subscribe_events();
    let stream = BroadcastStream::new(rx).filter_map(|result| async move {
        let event = result.ok()?;
        let json = serde_json::to_string(&event).ok()?;
        Some(Ok(SseEvent::default().data(json)))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("ping"))
}

fn into_axum_response(resp: ProxyResponse) -> Response {
    let mut builder = Response::builder().status(resp.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &resp.headers {
            if name.as_str().eq_ignore_ascii_case("content-length") {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
    }
    let body = match resp.body {
        ProxyBody::Buffered(bytes) => Body::from(bytes),
        ProxyBody::Streamed(stream) => Body::from_stream(stream),
    };
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(err: CoreError) -> Response {
    let status = err
        .suggested_status_code()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::from(&err))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::collections::HashMap;
    use switchboard_core::{Config, GroupConfig, ModelConfig};
    use tower::ServiceExt;

    fn model(name: &str, upstream: &str) -> ModelConfig {
        ModelConfig {
            name: name.into(),
            command: "true".into(),
            stop_command: None,
            upstream_url: upstream.into(),
            check_endpoint: "/health".into(),
            env: HashMap::new(),
            unload_after_seconds: 0,
            concurrency_limit: None,
            use_model_name: None,
            aliases: vec![],
            unlisted: false,
            graceful_stop_timeout_secs: 1,
            health_check_interval_ms: 20,
        }
    }

    fn config_with(models: Vec<ModelConfig>, required_api_keys: Vec<String>) -> Config {
        Config {
            health_check_timeout_secs: 5,
            start_port: None,
            groups: models
                .iter()
                .map(|m| GroupConfig {
                    id: format!("{}-group", m.name),
                    swap: false,
                    exclusive: false,
                    persistent: false,
                    members: vec![m.name.clone()],
                })
                .collect(),
            models,
            required_api_keys,
        }
    }

    fn app_for(config: Config) -> Router {
        build_router(AppState {
            manager: ProxyManager::new(config),
        })
    }

    #[tokio::test]
    async fn list_models_omits_unlisted_and_includes_aliases() {
        let mut visible = model("m1", "http://127.0.0.1:1");
        visible.aliases = vec!["alias1".into()];
        let mut hidden = model("m2", "http://127.0.0.1:1");
        hidden.unlisted = true;

        let app = app_for(config_with(vec![visible, hidden], vec![]));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let ids: Vec<&str> = parsed["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["m1"]);
        assert_eq!(parsed["data"][0]["aliases"][0], "alias1");
    }

    #[tokio::test]
    async fn auth_gate_rejects_missing_token_when_keys_required() {
        let app = app_for(config_with(vec![], vec!["secret".into()]));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_gate_accepts_matching_bearer_token() {
        let app = app_for(config_with(vec![], vec!["secret".into()]));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unload_one_reports_not_found_for_unknown_model() {
        let app = app_for(config_with(vec![], vec![]));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/models/unload/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn error_response_maps_not_found_to_404() {
        let response = error_response(CoreError::ModelNotFound("m".into()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
