//! Wire protocol.
//!
//! Every frame is a JSON object tagged by `type`. Requests carry a caller
//! assigned `id`; responses echo `type` and `id` and add a `response` payload.
//! Server pushed events (`run.progress`, `run.end`, `chat.*`, `log`) carry no
//! `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::Project;
use crate::connections::DeliveryMode;
use crate::providers::{LanguageModelConfiguration, ResolvedProvider};
use crate::registry::RunPolicy;

pub const SERVER_VERSION: &str = "server.version";
pub const SERVER_ENV: &str = "server.env";
pub const SERVER_KILL: &str = "server.kill";
pub const MODEL_CONFIGURATION: &str = "model.configuration";
pub const RUN_LIST: &str = "run.list";
pub const RUN_START: &str = "run.start";
pub const RUN_ABORT: &str = "run.abort";
pub const CHAT_CHUNK: &str = "chat.chunk";

pub const RUN_PROGRESS: &str = "run.progress";
pub const RUN_END: &str = "run.end";
pub const CHAT_START: &str = "chat.start";
pub const CHAT_CANCEL: &str = "chat.cancel";
pub const LOG: &str = "log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "server.version")]
    ServerVersion,
    #[serde(rename = "server.env")]
    ServerEnv,
    #[serde(rename = "server.kill")]
    ServerKill,
    #[serde(rename = "model.configuration")]
    ModelConfiguration(ModelConfigurationRequest),
    #[serde(rename = "run.list")]
    RunList,
    #[serde(rename = "run.start")]
    RunStart(RunStartRequest),
    #[serde(rename = "run.abort")]
    RunAbort(RunAbortRequest),
    #[serde(rename = "chat.chunk")]
    ChatChunk(ChatChunk),
}

impl Request {
    pub const KINDS: &'static [&'static str] = &[
        SERVER_VERSION,
        SERVER_ENV,
        SERVER_KILL,
        MODEL_CONFIGURATION,
        RUN_LIST,
        RUN_START,
        RUN_ABORT,
        CHAT_CHUNK,
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Request::ServerVersion => SERVER_VERSION,
            Request::ServerEnv => SERVER_ENV,
            Request::ServerKill => SERVER_KILL,
            Request::ModelConfiguration(_) => MODEL_CONFIGURATION,
            Request::RunList => RUN_LIST,
            Request::RunStart(_) => RUN_START,
            Request::RunAbort(_) => RUN_ABORT,
            Request::ChatChunk(_) => CHAT_CHUNK,
        }
    }

    /// Serialize with the correlation id spliced into the tagged object.
    pub fn to_frame_value(&self, id: &str) -> serde_json::Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(object) = &mut value {
            object.insert("id".to_string(), Value::String(id.to_string()));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigurationRequest {
    pub model: String,
    #[serde(default)]
    pub token: bool,
}

/// Everything a [`crate::runner::ScriptRunner`] needs to execute one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStartRequest {
    pub run_id: String,
    pub script: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

pub type RunRequest = RunStartRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAbortRequest {
    pub run_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatChunk {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl ChatChunk {
    pub fn is_final(&self) -> bool {
        self.finish_reason.is_some() || self.error.is_some()
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SerializedError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), stack: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl ResponseStatus {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { ok: false, error: Some(SerializedError::new(message)) }
    }
}

/// A correlated reply as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub response: Value,
}

impl ResponseEnvelope {
    pub fn status(&self) -> ResponseStatus {
        serde_json::from_value(self.response.clone())
            .unwrap_or_else(|_| ResponseStatus::failed("response carries no status"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionResponse {
    #[serde(flatten)]
    pub status: ResponseStatus,
    pub version: String,
    pub platform: String,
    pub arch: String,
    pub pid: u32,
}

impl VersionResponse {
    pub fn current() -> Self {
        Self {
            status: ResponseStatus::ok(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
        }
    }
}

/// Server settings that are safe to hand to any connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub host: String,
    pub port: u16,
    pub mode: DeliveryMode,
    pub policy: RunPolicy,
    pub auth_required: bool,
    pub cancel_on_idle: bool,
    pub scripts_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvResponse {
    #[serde(flatten)]
    pub status: ResponseStatus,
    pub providers: Vec<ResolvedProvider>,
    pub configuration: ConfigSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigurationResponse {
    #[serde(flatten)]
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<LanguageModelConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunListResponse {
    #[serde(flatten)]
    pub status: ResponseStatus,
    pub project: Project,
    #[serde(default)]
    pub runs: Vec<RunSummary>,
}

/// Reply to `run.start` and `run.abort`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAck {
    #[serde(flatten)]
    pub status: ResponseStatus,
    pub run_id: String,
}

impl RunAck {
    pub fn ok(run_id: impl Into<String>) -> Self {
        Self { status: ResponseStatus::ok(), run_id: run_id.into() }
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Running | RunStatus::Success => 0,
            RunStatus::Error => 1,
            RunStatus::Cancelled => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub script: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Full view of a run, live or finished, as served over HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub script: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
    pub trace: String,
    pub output: String,
}

// ---------------------------------------------------------------------------
// Pushed events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "run.progress")]
    RunProgress(RunProgress),
    #[serde(rename = "run.end")]
    RunEnd(RunEnd),
    #[serde(rename = "chat.start")]
    ChatStart(ChatStart),
    #[serde(rename = "chat.cancel")]
    ChatCancel(ChatCancel),
    #[serde(rename = "log")]
    Log(LogMessage),
}

impl ServerEvent {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            ServerEvent::RunProgress(p) => Some(&p.run_id),
            ServerEvent::RunEnd(e) => Some(&e.run_id),
            ServerEvent::Log(log) => log.run_id.as_deref(),
            ServerEvent::ChatStart(_) | ServerEvent::ChatCancel(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inner: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEnd {
    pub run_id: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl RunEnd {
    pub fn status(&self) -> Option<RunStatus> {
        self.result.as_ref().map(|r| r.status)
    }

    /// Ids and status only; the full payload stays available over HTTP.
    pub fn compact(&self) -> Self {
        Self {
            run_id: self.run_id.clone(),
            exit_code: self.exit_code,
            result: self.result.as_ref().map(|r| RunResult {
                status: r.status,
                status_text: r.status_text.clone(),
                error: None,
                text: None,
                data: None,
            }),
            trace: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStart {
    pub chat_id: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCancel {
    pub chat_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A line for the client's console. Run-scoped lines carry the run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl LogMessage {
    /// Re-emit through `tracing` at the matching level.
    pub fn emit(&self) {
        let run_id = self.run_id.as_deref().unwrap_or_default();
        match self.level {
            LogLevel::Debug => tracing::debug!(run_id, "{}", self.message),
            LogLevel::Info => tracing::info!(run_id, "{}", self.message),
            LogLevel::Warn => tracing::warn!(run_id, "{}", self.message),
            LogLevel::Error => tracing::error!(run_id, "{}", self.message),
        }
    }
}

/// Anything a client can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Response(ResponseEnvelope),
    Event(ServerEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_parse_from_tagged_objects_with_ids() {
        let start: Request = serde_json::from_value(json!({
            "type": "run.start",
            "id": "7",
            "runId": "r1",
            "script": "poem",
            "files": ["a.md"],
        }))
        .unwrap();
        match start {
            Request::RunStart(req) => {
                assert_eq!(req.run_id, "r1");
                assert_eq!(req.files, vec!["a.md".to_string()]);
                assert!(req.options.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        let version: Request =
            serde_json::from_value(json!({"type": "server.version", "id": "1"})).unwrap();
        assert_eq!(version, Request::ServerVersion);
    }

    #[test]
    fn every_request_kind_is_listed() {
        let samples = [
            Request::ServerVersion,
            Request::ServerEnv,
            Request::ServerKill,
            Request::RunList,
            Request::RunAbort(RunAbortRequest { run_id: "r".into(), reason: None }),
        ];
        for sample in samples {
            assert!(Request::KINDS.contains(&sample.kind()));
            let value = sample.to_frame_value("3").unwrap();
            assert_eq!(value["type"], sample.kind());
            assert_eq!(value["id"], "3");
        }
    }

    #[test]
    fn progress_omits_empty_fields() {
        let progress = RunProgress {
            run_id: "r1".into(),
            output: Some("hi".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(ServerEvent::RunProgress(progress)).unwrap();
        assert_eq!(value, json!({"type": "run.progress", "runId": "r1", "output": "hi"}));
    }

    #[test]
    fn log_events_use_lowercase_levels() {
        let log = ServerEvent::Log(LogMessage {
            level: LogLevel::Warn,
            message: "disk almost full".into(),
            run_id: None,
        });
        let value = serde_json::to_value(&log).unwrap();
        assert_eq!(value, json!({"type": "log", "level": "warn", "message": "disk almost full"}));

        let scoped: ServerEvent =
            serde_json::from_value(json!({"type": "log", "level": "debug", "message": "m", "runId": "r1"})).unwrap();
        assert_eq!(scoped.run_id(), Some("r1"));
    }

    #[test]
    fn compact_run_end_keeps_ids_and_status() {
        let end = RunEnd {
            run_id: "r1".into(),
            exit_code: 1,
            result: Some(RunResult {
                status: RunStatus::Error,
                status_text: Some("boom".into()),
                error: Some(SerializedError::new("boom")),
                text: Some("x".repeat(64)),
                data: None,
            }),
            trace: Some("trace".into()),
        };
        let compact = end.compact();
        assert_eq!(compact.run_id, "r1");
        assert_eq!(compact.exit_code, 1);
        assert_eq!(compact.status(), Some(RunStatus::Error));
        assert!(compact.trace.is_none());
        assert!(compact.result.unwrap().text.is_none());
    }
}
