use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::cancellation::CancelledError;
use crate::messages::{LogLevel, RunRequest};
use crate::registry::RunContext;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    /// Final text; defaults to the accumulated output when absent.
    pub text: Option<String>,
    pub data: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
    #[error("{message}")]
    Failed { message: String, stack: Option<String> },
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed { message: message.into(), stack: None }
    }
}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        JobError::failed(e.to_string())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        JobError::Failed { message: e.to_string(), stack: Some(format!("{e:?}")) }
    }
}

/// Executes one run. Implementations must check `ctx.token()` at every
/// suspend point and return [`JobError::Cancelled`] once it fires.
pub trait ScriptRunner: Send + Sync + 'static {
    fn run(&self, request: RunRequest, ctx: RunContext) -> BoxFuture<'static, Result<RunOutcome, JobError>>;
}

impl<F, Fut> ScriptRunner for F
where
    F: Fn(RunRequest, RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RunOutcome, JobError>> + Send + 'static,
{
    fn run(&self, request: RunRequest, ctx: RunContext) -> BoxFuture<'static, Result<RunOutcome, JobError>> {
        Box::pin(self(request, ctx))
    }
}

/// Walks the requested files, echoing each one. Used when no interpreter is
/// configured.
#[derive(Debug, Clone)]
pub struct EchoRunner {
    pub step_delay: Duration,
}

impl Default for EchoRunner {
    fn default() -> Self {
        Self { step_delay: Duration::from_millis(200) }
    }
}

impl ScriptRunner for EchoRunner {
    fn run(&self, request: RunRequest, ctx: RunContext) -> BoxFuture<'static, Result<RunOutcome, JobError>> {
        let delay = self.step_delay;
        Box::pin(async move {
            ctx.append_trace(&format!("# {}\n\n", request.script));
            if !request.options.is_empty() {
                ctx.append_trace(&format!("options: {}\n", Value::Object(request.options.clone())));
            }
            for file in &request.files {
                tokio::select! {
                    reason = ctx.token().cancelled() => return Err(CancelledError::new(reason).into()),
                    _ = tokio::time::sleep(delay) => {}
                }
                ctx.append_trace(&format!("- {file}\n"));
                ctx.append_output(&format!("{file}\n"));
            }
            ctx.check()?;
            Ok(RunOutcome { text: None, data: Some(json!({ "files": request.files.len() })) })
        })
    }
}

/// Runs `program [args..] <script> [files..]` as a child process.
/// stdout feeds the output stream, stderr the trace.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), working_dir: None }
    }

    fn command(&self, request: &RunRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&request.script)
            .args(&request.files)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl ScriptRunner for ProcessRunner {
    fn run(&self, request: RunRequest, ctx: RunContext) -> BoxFuture<'static, Result<RunOutcome, JobError>> {
        let mut cmd = self.command(&request);
        let program = self.program.clone();
        Box::pin(async move {
            ctx.check()?;
            let mut child = cmd
                .spawn()
                .map_err(|e| JobError::failed(format!("failed to spawn {program}: {e}")))?;
            let pid = child.id().map_or_else(|| "?".to_string(), |pid| pid.to_string());
            ctx.log(LogLevel::Debug, &format!("spawned {program} (pid {pid})"));

            let stdout = child.stdout.take().ok_or_else(|| JobError::failed("child stdout unavailable"))?;
            let stderr = child.stderr.take().ok_or_else(|| JobError::failed("child stderr unavailable"))?;
            let mut stdout = BufReader::new(stdout);
            let mut stderr = BufReader::new(stderr);
            let (mut out_line, mut err_line) = (Vec::new(), Vec::new());
            let (mut out_open, mut err_open) = (true, true);

            // Partial reads stay in the line buffer across select iterations.
            while out_open || err_open {
                tokio::select! {
                    reason = ctx.token().cancelled() => {
                        let _ = child.kill().await;
                        return Err(CancelledError::new(reason).into());
                    }
                    read = stdout.read_until(b'\n', &mut out_line), if out_open => {
                        if read? == 0 {
                            out_open = false;
                        } else {
                            ctx.append_output(&String::from_utf8_lossy(&out_line));
                            out_line.clear();
                        }
                    }
                    read = stderr.read_until(b'\n', &mut err_line), if err_open => {
                        if read? == 0 {
                            err_open = false;
                        } else {
                            ctx.append_trace(&String::from_utf8_lossy(&err_line));
                            err_line.clear();
                        }
                    }
                }
            }

            let status = tokio::select! {
                reason = ctx.token().cancelled() => {
                    let _ = child.kill().await;
                    return Err(CancelledError::new(reason).into());
                }
                status = child.wait() => status?,
            };
            if !status.success() {
                return Err(JobError::failed(format!("{program} exited with {status}")));
            }
            Ok(RunOutcome { text: None, data: Some(json!({ "exitStatus": status.code() })) })
        })
    }
}
