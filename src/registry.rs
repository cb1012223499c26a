//! Run registry.
//!
//! One mutex guards the run table and the last-result slot. Every operation
//! that changes which runs exist or what observers have seen runs under it:
//! start, abort, append, attach and completion. Fan-out happens while the lock
//! is held, which is what keeps replay-on-attach free of gaps and duplicates.
//! Pushes are non-blocking queue sends, so nothing under the lock awaits.
//!
//! Lock order: registry, then per-run state, then connections.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cancellation::{CancelledError, Controller, Token};
use crate::chat::{ChatRelay, ChatStream};
use crate::connections::{ConnId, ConnectionManager, DeliveryMode, Outbound};
use crate::frame::FrameCodec;
use crate::history::{RunHistory, DEFAULT_HISTORY_CAPACITY};
use crate::messages::{
    ChatMessage, LogLevel, LogMessage, ResponseStatus, RunAck, RunEnd, RunProgress, RunRecord,
    RunRequest, RunResult, RunStatus, RunSummary, SerializedError, ServerEvent,
};
use crate::runner::{JobError, RunOutcome, ScriptRunner};

pub const SUPERSEDED: &str = "superseded";
pub const IDLE: &str = "idle";

/// How many runs may be live at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunPolicy {
    /// Starting a run supersedes every active run.
    #[default]
    Single,
    /// Runs coexist; only a run with the same id is superseded.
    Concurrent,
}

#[derive(Default)]
struct Buffers {
    trace: String,
    output: String,
}

struct RunState {
    run_id: String,
    seq: u64,
    script: String,
    started_at: DateTime<Utc>,
    controller: Controller,
    buffers: Mutex<Buffers>,
    observers: Mutex<HashSet<ConnId>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RunState {
    fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            script: self.script.clone(),
            status: RunStatus::Running,
            started_at: self.started_at,
        }
    }
}

struct LastResult {
    seq: u64,
    end: RunEnd,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<String, Arc<RunState>>,
    last_result: Option<LastResult>,
}

impl Inner {
    fn holds(&self, run: &Arc<RunState>) -> bool {
        self.runs.get(&run.run_id).is_some_and(|current| Arc::ptr_eq(current, run))
    }
}

pub struct RunRegistry {
    inner: Mutex<Inner>,
    connections: Arc<ConnectionManager>,
    runner: Arc<dyn ScriptRunner>,
    chat: Arc<ChatRelay>,
    history: Arc<RunHistory>,
    codec: FrameCodec,
    policy: RunPolicy,
    cancel_on_idle: bool,
    next_seq: AtomicU64,
}

impl RunRegistry {
    pub fn new(runner: Arc<dyn ScriptRunner>, connections: Arc<ConnectionManager>) -> Self {
        let codec = FrameCodec::default();
        Self {
            inner: Mutex::new(Inner::default()),
            chat: Arc::new(ChatRelay::new(Arc::clone(&connections), codec)),
            connections,
            runner,
            history: Arc::new(RunHistory::in_memory(DEFAULT_HISTORY_CAPACITY)),
            codec,
            policy: RunPolicy::default(),
            cancel_on_idle: false,
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn with_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel_on_idle(mut self, cancel_on_idle: bool) -> Self {
        self.cancel_on_idle = cancel_on_idle;
        self
    }

    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self.chat = Arc::new(ChatRelay::new(Arc::clone(&self.connections), codec));
        self
    }

    pub fn with_history(mut self, history: Arc<RunHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn chat(&self) -> &Arc<ChatRelay> {
        &self.chat
    }

    pub fn history(&self) -> &Arc<RunHistory> {
        &self.history
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    pub fn policy(&self) -> RunPolicy {
        self.policy
    }

    pub fn cancel_on_idle(&self) -> bool {
        self.cancel_on_idle
    }

    /// Supersede conflicting runs, register the new one and spawn its job.
    /// Returns as soon as the job is spawned.
    pub fn start_run(self: &Arc<Self>, mut request: RunRequest, origin: Option<&str>) -> RunAck {
        let run_id = request.run_id.trim().to_string();
        if run_id.is_empty() {
            return RunAck { status: ResponseStatus::failed("runId must not be empty"), run_id };
        }
        request.run_id = run_id.clone();

        let controller = Controller::new();
        let token = controller.token();
        let run = Arc::new(RunState {
            run_id: run_id.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            script: request.script.clone(),
            started_at: Utc::now(),
            controller,
            buffers: Mutex::new(Buffers::default()),
            observers: Mutex::new(origin.map(str::to_string).into_iter().collect()),
            task: Mutex::new(None),
        });
        let ctx = RunContext { registry: Arc::clone(self), run: Arc::clone(&run), token };

        let mut inner = self.inner.lock();
        let superseded: Vec<Arc<RunState>> = match self.policy {
            RunPolicy::Single => inner.runs.drain().map(|(_, r)| r).collect(),
            RunPolicy::Concurrent => inner.runs.remove(&run_id).into_iter().collect(),
        };
        // Abort is requested, not awaited. A superseded job may still be
        // unwinding while the new one starts; its appends are dropped because
        // the table no longer holds it, and its run.end is still sent once.
        for old in &superseded {
            info!(run_id = %old.run_id, superseded_by = %run_id, "superseding run");
            old.controller.abort(SUPERSEDED);
        }
        inner.runs.insert(run_id.clone(), Arc::clone(&run));

        let registry = Arc::clone(self);
        let job_run = Arc::clone(&run);
        let handle = tokio::spawn(async move { registry.execute(job_run, request, ctx).await });
        *run.task.lock() = Some(handle);
        drop(inner);

        info!(run_id = %run_id, script = %run.script, origin = ?origin, "run started");
        RunAck::ok(run_id)
    }

    /// Idempotent: unknown ids are acknowledged too.
    pub fn abort_run(&self, run_id: &str, reason: &str) -> RunAck {
        let removed = self.inner.lock().runs.remove(run_id);
        match removed {
            Some(run) => {
                run.controller.abort(reason);
                info!(run_id, reason, "run aborted");
            }
            None => debug!(run_id, "abort for inactive run ignored"),
        }
        RunAck::ok(run_id)
    }

    pub fn abort_all(&self, reason: &str) -> usize {
        let runs: Vec<_> = self.inner.lock().runs.drain().map(|(_, r)| r).collect();
        for run in &runs {
            run.controller.abort(reason);
            info!(run_id = %run.run_id, reason, "run aborted");
        }
        runs.len()
    }

    /// Active runs, oldest first.
    pub fn list(&self) -> Vec<RunSummary> {
        let inner = self.inner.lock();
        let mut runs: Vec<&Arc<RunState>> = inner.runs.values().collect();
        runs.sort_by_key(|r| r.seq);
        runs.into_iter().map(|r| r.summary()).collect()
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.inner.lock().runs.contains_key(run_id)
    }

    /// A live snapshot for active runs, otherwise the history entry.
    pub fn record(&self, run_id: &str) -> Option<RunRecord> {
        let active = self.inner.lock().runs.get(run_id).cloned();
        if let Some(run) = active {
            let buffers = run.buffers.lock();
            return Some(RunRecord {
                run_id: run.run_id.clone(),
                script: run.script.clone(),
                status: RunStatus::Running,
                started_at: run.started_at,
                finished_at: None,
                exit_code: None,
                result: None,
                trace: buffers.trace.clone(),
                output: buffers.output.clone(),
            });
        }
        self.history.get(run_id)
    }

    pub fn last_result(&self) -> Option<RunEnd> {
        self.inner.lock().last_result.as_ref().map(|l| l.end.clone())
    }

    /// Register a connection and replay what it missed. Runs under the
    /// registry lock so no append can land between the replay and the
    /// subscription.
    pub fn attach(&self, conn_id: &str, mode: DeliveryMode) -> mpsc::UnboundedReceiver<Outbound> {
        let inner = self.inner.lock();
        let rx = self.connections.add(conn_id.to_string(), mode);

        let mut active: Vec<&Arc<RunState>> = inner.runs.values().collect();
        active.sort_by_key(|r| r.seq);
        for run in &active {
            run.observers.lock().insert(conn_id.to_string());
            let progress = {
                let buffers = run.buffers.lock();
                RunProgress {
                    run_id: run.run_id.clone(),
                    trace: non_empty(&buffers.trace),
                    output: non_empty(&buffers.output),
                    inner: false,
                }
            };
            match self.codec.encode_progress(&progress) {
                Ok(frames) => {
                    self.connections.send_to(conn_id, &frames);
                }
                Err(e) => warn!(conn_id, run_id = %run.run_id, error = %e, "replay encoding failed"),
            }
        }
        if active.is_empty() {
            if let Some(last) = &inner.last_result {
                match self.codec.encode_end(&last.end) {
                    Ok(frame) => {
                        self.connections.send_to(conn_id, &[frame]);
                    }
                    Err(e) => warn!(conn_id, error = %e, "last result encoding failed"),
                }
            }
        }
        info!(conn_id, ?mode, replayed = active.len(), "connection attached");
        rx
    }

    pub fn detach(&self, conn_id: &str) {
        let remaining = {
            let inner = self.inner.lock();
            for run in inner.runs.values() {
                run.observers.lock().remove(conn_id);
            }
            self.connections.remove(conn_id)
        };
        info!(conn_id, remaining, "connection detached");
        if remaining == 0 && self.cancel_on_idle {
            let aborted = self.abort_all(IDLE);
            if aborted > 0 {
                info!(aborted, "no observers left, runs cancelled");
            }
        }
    }

    /// Abort everything and give jobs `grace` to report their end.
    pub async fn shutdown(&self, reason: &str, grace: Duration) {
        let runs: Vec<_> = self.inner.lock().runs.drain().map(|(_, r)| r).collect();
        let handles: Vec<_> = runs
            .iter()
            .filter_map(|run| {
                run.controller.abort(reason);
                run.task.lock().take()
            })
            .collect();
        info!(runs = handles.len(), reason, "shutting down runs");
        for handle in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("job still running after shutdown grace period");
            }
        }
    }

    /// Push a `log` line to every connection. Returns the number reached.
    pub fn log(&self, level: LogLevel, message: &str) -> usize {
        let log = LogMessage { level, message: message.to_string(), run_id: None };
        log.emit();
        match self.codec.encode(&ServerEvent::Log(log)) {
            Ok(frame) => self.connections.broadcast(&[frame]),
            Err(e) => {
                warn!(error = %e, "failed to encode log");
                0
            }
        }
    }

    async fn execute(self: Arc<Self>, run: Arc<RunState>, request: RunRequest, ctx: RunContext) {
        let job = self.runner.run(request, ctx);
        let outcome = match AssertUnwindSafe(job).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(run_id = %run.run_id, message = %message, "job panicked");
                Err(JobError::failed(format!("job panicked: {message}")))
            }
        };
        self.finish(&run, outcome).await;
    }

    async fn finish(&self, run: &Arc<RunState>, outcome: Result<RunOutcome, JobError>) {
        let (trace, output) = {
            let buffers = run.buffers.lock();
            (buffers.trace.clone(), buffers.output.clone())
        };
        let result = match outcome {
            _ if run.controller.is_aborted() => RunResult {
                status: RunStatus::Cancelled,
                status_text: run.controller.reason(),
                error: None,
                text: non_empty(&output),
                data: None,
            },
            Ok(outcome) => RunResult {
                status: RunStatus::Success,
                status_text: None,
                error: None,
                text: outcome.text.or_else(|| non_empty(&output)),
                data: outcome.data,
            },
            Err(JobError::Cancelled(CancelledError { reason })) => RunResult {
                status: RunStatus::Cancelled,
                status_text: Some(reason),
                error: None,
                text: non_empty(&output),
                data: None,
            },
            Err(JobError::Failed { message, stack }) => RunResult {
                status: RunStatus::Error,
                status_text: Some(message.clone()),
                error: Some(SerializedError { message, stack }),
                text: non_empty(&output),
                data: None,
            },
        };
        let status = result.status;
        let end = RunEnd {
            run_id: run.run_id.clone(),
            exit_code: status.exit_code(),
            result: Some(result.clone()),
            trace: non_empty(&trace),
        };
        let record = RunRecord {
            run_id: run.run_id.clone(),
            script: run.script.clone(),
            status,
            started_at: run.started_at,
            finished_at: Some(Utc::now()),
            exit_code: Some(end.exit_code),
            result: Some(result),
            trace,
            output,
        };
        self.history.record(record.clone());

        {
            let mut inner = self.inner.lock();
            if inner.holds(run) {
                inner.runs.remove(&run.run_id);
            }
            let newer = inner.last_result.as_ref().is_some_and(|last| last.seq > run.seq);
            if !newer {
                inner.last_result = Some(LastResult { seq: run.seq, end: end.clone() });
            }
            match self.codec.encode_end(&end) {
                Ok(frame) => {
                    let observers = run.observers.lock();
                    self.connections.deliver(std::slice::from_ref(&frame), &observers);
                }
                Err(e) => warn!(run_id = %run.run_id, error = %e, "failed to encode run.end"),
            }
        }
        info!(run_id = %run.run_id, ?status, exit_code = end.exit_code, "run finished");

        if let Err(e) = self.history.persist(&record).await {
            warn!(run_id = %run.run_id, error = %e, "failed to persist run history");
        }
    }

    fn append(&self, run: &Arc<RunState>, trace: Option<&str>, output: Option<&str>, inner_output: bool) {
        let inner = self.inner.lock();
        if !inner.holds(run) {
            trace!(run_id = %run.run_id, "dropping write from inactive run");
            return;
        }
        {
            let mut buffers = run.buffers.lock();
            if let Some(text) = trace {
                buffers.trace.push_str(text);
            }
            if let (Some(text), false) = (output, inner_output) {
                buffers.output.push_str(text);
            }
        }
        let progress = RunProgress {
            run_id: run.run_id.clone(),
            trace: trace.map(str::to_string),
            output: output.map(str::to_string),
            inner: inner_output,
        };
        match self.codec.encode_progress(&progress) {
            Ok(frames) => {
                let observers = run.observers.lock();
                self.connections.deliver(&frames, &observers);
            }
            Err(e) => warn!(run_id = %run.run_id, error = %e, "failed to encode run.progress"),
        }
        drop(inner);
    }

    /// Same delivery rules as progress: dropped once the run is no longer held.
    fn log_for(&self, run: &Arc<RunState>, level: LogLevel, message: &str) {
        let log = LogMessage { level, message: message.to_string(), run_id: Some(run.run_id.clone()) };
        log.emit();
        let inner = self.inner.lock();
        if !inner.holds(run) {
            return;
        }
        match self.codec.encode(&ServerEvent::Log(log)) {
            Ok(frame) => {
                let observers = run.observers.lock();
                self.connections.deliver(std::slice::from_ref(&frame), &observers);
            }
            Err(e) => warn!(run_id = %run.run_id, error = %e, "failed to encode log"),
        }
        drop(inner);
    }
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A job's handle on its own run.
#[derive(Clone)]
pub struct RunContext {
    registry: Arc<RunRegistry>,
    run: Arc<RunState>,
    token: Token,
}

impl RunContext {
    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check(&self) -> Result<(), CancelledError> {
        self.token.check()
    }

    pub fn append_trace(&self, text: &str) {
        if !text.is_empty() {
            self.registry.append(&self.run, Some(text), None, false);
        }
    }

    pub fn append_output(&self, text: &str) {
        if !text.is_empty() {
            self.registry.append(&self.run, None, Some(text), false);
        }
    }

    /// Output of a nested prompt: streamed to observers but kept out of the
    /// run's own output.
    pub fn append_inner_output(&self, text: &str) {
        if !text.is_empty() {
            self.registry.append(&self.run, None, Some(text), true);
        }
    }

    /// A console line for observers of this run; not part of the trace.
    pub fn log(&self, level: LogLevel, message: &str) {
        self.registry.log_for(&self.run, level, message);
    }

    /// Delegate a chat completion to whichever client serves `model`.
    pub fn chat(&self, model: &str, messages: Vec<ChatMessage>) -> Result<ChatStream, CancelledError> {
        self.check()?;
        Ok(self.registry.chat.start(model, messages))
    }
}
