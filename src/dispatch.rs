//! Request dispatch: one inbound text frame in, exactly one correlated
//! response out.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cancellation::Controller;
use crate::catalog::ScriptCatalog;
use crate::messages::{
    ConfigSummary, EnvResponse, ModelConfigurationResponse, Request, ResponseEnvelope,
    ResponseStatus, RunListResponse, VersionResponse,
};
use crate::providers::{ProviderCatalog, ProviderError};
use crate::registry::RunRegistry;

pub const UNKNOWN_REQUEST_ID: &str = "unknown-request";
/// Echoed as `type` when the frame has no usable one.
pub const UNKNOWN_REQUEST_TYPE: &str = "error";
pub const KILL_REASON: &str = "server killed";
pub const DEFAULT_ABORT_REASON: &str = "user";

const KILL_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("message is missing a string 'type'")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload { kind: String, source: serde_json::Error },
    #[error("no chat '{0}' is waiting for chunks")]
    UnknownChat(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidJson(_) => "invalid_json",
            ProtocolError::NotAnObject | ProtocolError::MissingType => "invalid_frame",
            ProtocolError::UnknownMessageType(_) => "unknown_message_type",
            ProtocolError::InvalidPayload { .. } => "invalid_payload",
            ProtocolError::UnknownChat(_) => "unknown_chat",
            ProtocolError::Provider(_) => "provider_not_configured",
            ProtocolError::Encode(_) => "internal_error",
        }
    }
}

/// The correlation id of a frame, as far as one can be read. Numeric ids are
/// echoed as strings.
pub fn best_effort_request_id(value: &Value) -> Option<String> {
    match value.as_object()?.get("id")? {
        Value::String(id) => Some(id.trim().to_string()).filter(|id| !id.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

struct Parsed {
    kind: String,
    id: String,
    request: Result<Request, ProtocolError>,
}

fn parse(raw: &str) -> Parsed {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            return Parsed {
                kind: UNKNOWN_REQUEST_TYPE.to_string(),
                id: UNKNOWN_REQUEST_ID.to_string(),
                request: Err(ProtocolError::InvalidJson(e)),
            }
        }
    };
    let id = best_effort_request_id(&value).unwrap_or_else(|| UNKNOWN_REQUEST_ID.to_string());
    let Some(object) = value.as_object() else {
        return Parsed { kind: UNKNOWN_REQUEST_TYPE.to_string(), id, request: Err(ProtocolError::NotAnObject) };
    };
    let Some(kind) = object.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Parsed { kind: UNKNOWN_REQUEST_TYPE.to_string(), id, request: Err(ProtocolError::MissingType) };
    };
    if !Request::KINDS.contains(&kind.as_str()) {
        let request = Err(ProtocolError::UnknownMessageType(kind.clone()));
        return Parsed { kind, id, request };
    }
    let request = serde_json::from_value::<Request>(value)
        .map_err(|source| ProtocolError::InvalidPayload { kind: kind.clone(), source });
    Parsed { kind, id, request }
}

fn to_response<T: Serialize>(payload: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(payload).map_err(ProtocolError::Encode)
}

pub struct Dispatcher {
    registry: Arc<RunRegistry>,
    providers: ProviderCatalog,
    catalog: ScriptCatalog,
    configuration: ConfigSummary,
    shutdown: Controller,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RunRegistry>,
        providers: ProviderCatalog,
        catalog: ScriptCatalog,
        configuration: ConfigSummary,
        shutdown: Controller,
    ) -> Self {
        Self { registry, providers, catalog, configuration, shutdown }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn providers(&self) -> &ProviderCatalog {
        &self.providers
    }

    pub fn configuration(&self) -> &ConfigSummary {
        &self.configuration
    }

    /// Handler failures never escape: they become `{ok:false, error}` under
    /// the best-effort id.
    pub async fn dispatch(&self, raw: &str, origin: Option<&str>) -> ResponseEnvelope {
        let Parsed { kind, id, request } = parse(raw);
        let result = match request {
            Ok(request) => {
                debug!(kind = %kind, id = %id, conn_id = ?origin, "dispatching request");
                self.handle(request, origin).await
            }
            Err(e) => Err(e),
        };
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(kind = %kind, id = %id, conn_id = ?origin, code = e.code(), error = %e, "request failed");
                let status = ResponseStatus::failed(e.to_string());
                serde_json::to_value(status).unwrap_or_else(|_| serde_json::json!({ "ok": false }))
            }
        };
        ResponseEnvelope { kind, id, response }
    }

    async fn handle(&self, request: Request, origin: Option<&str>) -> Result<Value, ProtocolError> {
        match request {
            Request::ServerVersion => to_response(&VersionResponse::current()),
            Request::ServerEnv => to_response(&EnvResponse {
                status: ResponseStatus::ok(),
                providers: self.providers.resolve_all(),
                configuration: self.configuration.clone(),
            }),
            Request::ServerKill => {
                info!(conn_id = ?origin, "kill requested");
                let shutdown = self.shutdown.clone();
                // Leave the acknowledgement time to reach the writer task.
                tokio::spawn(async move {
                    tokio::time::sleep(KILL_DELAY).await;
                    shutdown.abort(KILL_REASON);
                });
                to_response(&ResponseStatus::ok())
            }
            Request::ModelConfiguration(req) => {
                let info = self.providers.model_configuration(&req.model, req.token)?;
                to_response(&ModelConfigurationResponse { status: ResponseStatus::ok(), info: Some(info) })
            }
            Request::RunList => to_response(&RunListResponse {
                status: ResponseStatus::ok(),
                project: self.catalog.project().await,
                runs: self.registry.list(),
            }),
            Request::RunStart(req) => to_response(&self.registry.start_run(req, origin)),
            Request::RunAbort(req) => {
                let reason = req.reason.as_deref().unwrap_or(DEFAULT_ABORT_REASON);
                to_response(&self.registry.abort_run(&req.run_id, reason))
            }
            Request::ChatChunk(chunk) => {
                let chat_id = chunk.chat_id.clone();
                if self.registry.chat().handle_chunk(chunk) {
                    to_response(&ResponseStatus::ok())
                } else {
                    Err(ProtocolError::UnknownChat(chat_id))
                }
            }
        }
    }
}
