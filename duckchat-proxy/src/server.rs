use std::convert::Infallible;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::{Json, State, rejection::JsonRejection},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
    routing::{get, post},
    serve::Listener,
};
use bytes::Bytes;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::ProxyError;
use crate::openai::{ChatCompletionRequest, ChatCompletionResponse, ModelList, convert_request};
use crate::relay::relay;
use crate::tls::{TlsListener, build_tls_acceptor};
use crate::{AppState, Config};

const DONE_RECORD: &str = "data: [DONE]\n\n";

fn extract_api_key(headers: &HeaderMap) -> Result<String, ProxyError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ProxyError::Unauthorized("Missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| ProxyError::Unauthorized("Invalid Authorization header".to_string()))?;

    auth_header
        .strip_prefix("Bearer ")
        .map(|key| key.trim().to_string())
        .ok_or_else(|| {
            ProxyError::Unauthorized("Authorization header must start with 'Bearer '".to_string())
        })
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(());
    };
    if extract_api_key(headers)? != expected {
        return Err(ProxyError::Unauthorized("Invalid API key".to_string()));
    }
    Ok(())
}

async fn handle_chat_completion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ProxyError> {
    authorize(&state, &headers)?;
    let Json(request) = payload.map_err(|e| ProxyError::BadRequest(e.body_text()))?;

    let upstream_request = convert_request(&request)?;
    let model = upstream_request.model.clone();
    let response = state.open_chat(&upstream_request).await?;

    if request.stream {
        Ok(streaming_response(response, model))
    } else {
        let mut unused: Vec<String> = Vec::new();
        let text = relay(response.bytes_stream(), &mut unused, &model, false).await?;
        Ok(Json(ChatCompletionResponse::from_text(text, &model)).into_response())
    }
}

fn streaming_response(response: reqwest::Response, model: String) -> Response {
    let (tx, mut rx) = mpsc::channel::<String>(100);

    tokio::spawn(async move {
        let mut tx = tx;
        match relay(response.bytes_stream(), &mut tx, &model, true).await {
            Ok(text) => {
                tracing::debug!("Relayed {} characters", text.len());
                let _ = tx.send(DONE_RECORD.to_string()).await;
            }
            Err(err) => {
                tracing::error!("Error during streaming: {}", err);
                if let Ok(envelope) = serde_json::to_string(&err.envelope()) {
                    let _ = tx.send(format!("data: {}\n\n", envelope)).await;
                }
            }
        }
    });

    let body = async_stream::stream! {
        while let Some(record) = rx.recv().await {
            yield Ok::<Bytes, Infallible>(Bytes::from(record));
        }
    };

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    authorize(&state, &headers)?;
    Ok(Json(ModelList::supported()).into_response())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completion))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves, then tear
/// down the browser session.
pub async fn serve<L, F>(listener: L, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    L: Listener,
    L::Addr: Debug,
    F: Future<Output = ()> + Send + 'static,
{
    let served = axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error");

    state.shutdown().await;
    served
}

pub async fn run_server(config: &Config) -> Result<()> {
    let tls = match config.tls_files()? {
        Some((cert, key)) => Some(build_tls_acceptor(&cert, &key)?),
        None => None,
    };
    let state = Arc::new(
        AppState::from_config(config).context("Failed to initialise proxy state")?,
    );
    if state.api_key.is_none() {
        tracing::warn!("No API key configured, the proxy accepts every client");
    }

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    match tls {
        Some(acceptor) => {
            tracing::info!("Starting OpenAI-compatible server on https://{}", addr);
            let listener = TlsListener::new(listener, acceptor).context("Failed to start TLS")?;
            serve(listener, state, shutdown_signal()).await?;
        }
        None => {
            tracing::info!("Starting OpenAI-compatible server on http://{}", addr);
            serve(listener, state, shutdown_signal()).await?;
        }
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received, closing down");
}
