use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderValue, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{self, ApiKey};
use crate::cancellation::Controller;
use crate::catalog::ScriptCatalog;
use crate::config::ServerConfig;
use crate::connections::{start_heartbeat, ConnectionManager, DeliveryMode, Outbound};
use crate::dispatch::Dispatcher;
use crate::history::RunHistory;
use crate::messages::{EnvResponse, LogLevel, ResponseEnvelope, ResponseStatus, RunRecord, RunSummary, VersionResponse};
use crate::providers::ProviderCatalog;
use crate::registry::RunRegistry;
use crate::runner::ScriptRunner;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const WRITER_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<RunRegistry>,
    default_mode: DeliveryMode,
    shutdown: Controller,
    api_key: ApiKey,
}

impl AppState {
    pub async fn from_config(
        config: &ServerConfig,
        runner: Arc<dyn ScriptRunner>,
        providers: ProviderCatalog,
    ) -> Result<Self> {
        let history = match &config.history_file {
            Some(path) => RunHistory::open(path.clone(), config.history_capacity).await?,
            None => RunHistory::in_memory(config.history_capacity),
        };
        let registry = Arc::new(
            RunRegistry::new(runner, Arc::new(ConnectionManager::new()))
                .with_policy(config.policy)
                .with_cancel_on_idle(config.cancel_on_idle)
                .with_history(Arc::new(history)),
        );
        let shutdown = Controller::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            providers,
            ScriptCatalog::new(&config.scripts_dir),
            config.summary(),
            shutdown.clone(),
        ));
        Ok(Self {
            dispatcher,
            registry,
            default_mode: config.mode,
            shutdown,
            api_key: ApiKey::new(config.api_key.as_deref()),
        })
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Aborting this stops the server.
    pub fn shutdown(&self) -> &Controller {
        &self.shutdown
    }
}

pub fn build_router(state: AppState, cors_origin: Option<&str>) -> Result<Router> {
    let cors = match cors_origin {
        Some(origin) => {
            let origin = origin
                .parse::<HeaderValue>()
                .with_context(|| format!("invalid CORS origin: {origin}"))?;
            CorsLayer::new().allow_origin(origin).allow_methods(Any).allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    };
    Ok(Router::new()
        .route("/", get(ws_handler))
        .route("/api/version", get(get_version))
        .route("/api/env", get(get_env))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .layer(middleware::from_fn_with_state(state.api_key.clone(), auth::require_api_key))
        .layer(cors)
        .with_state(state))
}

pub async fn serve(config: ServerConfig, runner: Arc<dyn ScriptRunner>) -> Result<()> {
    let bind = config.bind_addr();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let state = AppState::from_config(&config, runner, ProviderCatalog::from_env()).await?;

    let ctrl_c = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.abort("interrupted");
        }
    });
    run(listener, state, config).await
}

/// Serve on an already bound listener until the shutdown controller fires.
pub async fn run(listener: TcpListener, state: AppState, config: ServerConfig) -> Result<()> {
    let router = build_router(state.clone(), config.cors_origin.as_deref())?;
    let heartbeat = start_heartbeat(Arc::clone(state.registry.connections()), config.heartbeat);
    let addr = listener.local_addr()?;
    info!(%addr, mode = ?config.mode, policy = ?config.policy, auth = config.auth_required(), "runwire listening");

    let token = state.shutdown.token();
    let registry = Arc::clone(&state.registry);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let reason = token.cancelled().await;
            info!(reason = %reason, "shutting down");
            registry.shutdown(&reason, SHUTDOWN_GRACE).await;
            registry.log(LogLevel::Warn, &format!("server shutting down: {reason}"));
            registry.connections().shutdown_all();
        })
        .await?;
    heartbeat.abort();
    info!("server stopped");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    mode: Option<DeliveryMode>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    let mode = params.mode.unwrap_or(state.default_mode);
    let max = state.registry.codec().max_frame_bytes();
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| handle_socket(socket, state, mode))
}

async fn handle_socket(socket: WebSocket, state: AppState, mode: DeliveryMode) {
    let conn_id = Uuid::new_v4().to_string();
    let mut outbound = state.registry.attach(&conn_id, mode);
    let (mut sink, mut stream) = socket.split();

    let writer_id = conn_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            let msg = match item {
                Outbound::Frame(text) => Message::Text(text.into()),
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = sink.send(msg).await {
                debug!(conn_id = %writer_id, error = %e, "socket write failed");
                break;
            }
        }
    });

    let shutdown = state.shutdown.token();
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => respond(&state, &conn_id, text.as_str()).await,
            Some(Ok(Message::Binary(bytes))) => respond(&state, &conn_id, &String::from_utf8_lossy(&bytes)).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn_id = %conn_id, error = %e, "socket read failed");
                break;
            }
        }
    }

    // Dropping the connection's sender lets the writer flush and stop.
    state.registry.detach(&conn_id);
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn respond(state: &AppState, conn_id: &str, raw: &str) {
    let envelope = state.dispatcher.dispatch(raw, Some(conn_id)).await;
    let codec = state.registry.codec();
    let frame = match codec.encode(&envelope) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(conn_id, kind = %envelope.kind, id = %envelope.id, error = %e, "response not encodable");
            let fallback = ResponseEnvelope {
                kind: envelope.kind,
                id: envelope.id,
                response: serde_json::to_value(ResponseStatus::failed(e.to_string()))
                    .unwrap_or_else(|_| serde_json::json!({ "ok": false })),
            };
            match codec.encode(&fallback) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        }
    };
    state.registry.connections().send_to(conn_id, &[frame]);
}

async fn get_version() -> Json<VersionResponse> {
    Json(VersionResponse::current())
}

async fn get_env(State(st): State<AppState>) -> Json<EnvResponse> {
    Json(EnvResponse {
        status: ResponseStatus::ok(),
        providers: st.dispatcher.providers().resolve_all(),
        configuration: st.dispatcher.configuration().clone(),
    })
}

#[derive(Serialize)]
struct RunsResponse {
    active: Vec<RunSummary>,
    recent: Vec<RunSummary>,
}

async fn list_runs(State(st): State<AppState>) -> Json<RunsResponse> {
    Json(RunsResponse { active: st.registry.list(), recent: st.registry.history().list() })
}

async fn get_run(State(st): State<AppState>, Path(id): Path<String>) -> Result<Json<RunRecord>, ApiErr> {
    st.registry.record(&id).map(Json).ok_or_else(|| ApiErr::run_not_found(&id))
}

#[derive(Debug)]
pub struct ApiErr {
    status: StatusCode,
    code: String,
    message: String,
    suggestion: Option<String>,
}

impl ApiErr {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized".to_string(),
            message: "Missing or invalid API key".to_string(),
            suggestion: Some("Pass the key in the x-api-key header, as a Bearer token or as ?api-key=.".to_string()),
        }
    }

    pub fn run_not_found(run_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "run_not_found".to_string(),
            message: format!("No active or recorded run: {run_id}"),
            suggestion: None,
        }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> axum::response::Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            suggestion: Option<String>,
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code,
                suggestion: self.suggestion,
            }),
        )
            .into_response()
    }
}
