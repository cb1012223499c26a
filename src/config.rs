use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::connections::DeliveryMode;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::messages::ConfigSummary;
use crate::registry::RunPolicy;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8003;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Command line. Every flag falls back to its environment variable, then to
/// the YAML file given by `--config`, then to the built-in default.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "runwire", version, about = "Run orchestration server")]
pub struct Cli {
    /// YAML file with defaults for any of the options below
    #[arg(long, env = "RUNWIRE_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long, env = "RUNWIRE_HOST")]
    pub host: Option<String>,
    #[arg(short, long, env = "RUNWIRE_PORT")]
    pub port: Option<u16>,
    /// Shared secret required on every request
    #[arg(long, env = "RUNWIRE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    /// Allowed CORS origin; any origin when unset
    #[arg(long, env = "RUNWIRE_CORS_ORIGIN")]
    pub cors_origin: Option<String>,
    /// Default delivery mode for connections that do not pass `?mode=`
    #[arg(long, value_enum, env = "RUNWIRE_MODE")]
    pub mode: Option<DeliveryMode>,
    #[arg(long, value_enum, env = "RUNWIRE_POLICY")]
    pub policy: Option<RunPolicy>,
    /// Abort every run when the last connection goes away
    #[arg(long, env = "RUNWIRE_CANCEL_ON_IDLE")]
    pub cancel_on_idle: Option<bool>,
    #[arg(long, env = "RUNWIRE_SCRIPTS_DIR")]
    pub scripts_dir: Option<PathBuf>,
    /// Interpreter invoked as `<runner> [runner-arg..] <script> [files..]`;
    /// the built-in echo runner when unset
    #[arg(long, env = "RUNWIRE_RUNNER")]
    pub runner: Option<String>,
    #[arg(long = "runner-arg", allow_hyphen_values = true)]
    pub runner_args: Vec<String>,
    /// JSONL log of finished runs
    #[arg(long, env = "RUNWIRE_HISTORY_FILE")]
    pub history_file: Option<PathBuf>,
    #[arg(long, env = "RUNWIRE_HISTORY_CAPACITY")]
    pub history_capacity: Option<usize>,
    #[arg(long, env = "RUNWIRE_HEARTBEAT_SECS")]
    pub heartbeat_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub cors_origin: Option<String>,
    pub mode: Option<DeliveryMode>,
    pub policy: Option<RunPolicy>,
    pub cancel_on_idle: Option<bool>,
    pub scripts_dir: Option<PathBuf>,
    pub runner: Option<String>,
    pub runner_args: Option<Vec<String>>,
    pub history_file: Option<PathBuf>,
    pub history_capacity: Option<usize>,
    pub heartbeat_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub cors_origin: Option<String>,
    pub mode: DeliveryMode,
    pub policy: RunPolicy,
    pub cancel_on_idle: bool,
    pub scripts_dir: PathBuf,
    pub runner: Option<String>,
    pub runner_args: Vec<String>,
    pub history_file: Option<PathBuf>,
    pub history_capacity: usize,
    pub heartbeat: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            api_key: None,
            cors_origin: None,
            mode: DeliveryMode::default(),
            policy: RunPolicy::default(),
            cancel_on_idle: false,
            scripts_dir: PathBuf::from("."),
            runner: None,
            runner_args: Vec::new(),
            history_file: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            heartbeat: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
        }
    }
}

impl ServerConfig {
    pub async fn load(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let txt = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                serde_yaml::from_str::<FileConfig>(&txt)
                    .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?
            }
            None => FileConfig::default(),
        };
        Ok(Self::merge(cli, file))
    }

    pub fn merge(cli: Cli, file: FileConfig) -> Self {
        let d = Self::default();
        let runner_args = if cli.runner_args.is_empty() { file.runner_args.unwrap_or_default() } else { cli.runner_args };
        Self {
            host: cli.host.or(file.host).unwrap_or(d.host),
            port: cli.port.or(file.port).unwrap_or(d.port),
            api_key: cli.api_key.or(file.api_key).filter(|k| !k.trim().is_empty()),
            cors_origin: cli.cors_origin.or(file.cors_origin),
            mode: cli.mode.or(file.mode).unwrap_or(d.mode),
            policy: cli.policy.or(file.policy).unwrap_or(d.policy),
            cancel_on_idle: cli.cancel_on_idle.or(file.cancel_on_idle).unwrap_or(d.cancel_on_idle),
            scripts_dir: cli.scripts_dir.or(file.scripts_dir).unwrap_or(d.scripts_dir),
            runner: cli.runner.or(file.runner).filter(|r| !r.trim().is_empty()),
            runner_args,
            history_file: cli.history_file.or(file.history_file),
            history_capacity: cli.history_capacity.or(file.history_capacity).unwrap_or(d.history_capacity),
            heartbeat: cli.heartbeat_secs.or(file.heartbeat_secs).map(Duration::from_secs).unwrap_or(d.heartbeat),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn auth_required(&self) -> bool {
        self.api_key.is_some()
    }

    /// Safe to send to clients: no secrets.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            host: self.host.clone(),
            port: self.port,
            mode: self.mode,
            policy: self.policy,
            auth_required: self.auth_required(),
            cancel_on_idle: self.cancel_on_idle,
            scripts_dir: self.scripts_dir.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let cli = Cli::try_parse_from(["runwire", "--port", "9000", "--mode", "unicast", "--runner-arg", "-e"]).unwrap();
        let file: FileConfig = serde_yaml::from_str(
            "port: 7000\nhost: 0.0.0.0\npolicy: concurrent\nrunner: node\nrunner_args: [--flag]\n",
        )
        .unwrap();
        let cfg = ServerConfig::merge(cli, file);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.mode, DeliveryMode::Unicast);
        assert_eq!(cfg.policy, RunPolicy::Concurrent);
        assert_eq!(cfg.runner.as_deref(), Some("node"));
        assert_eq!(cfg.runner_args, vec!["-e".to_string()]);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = ServerConfig::merge(Cli::default(), FileConfig::default());
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(!cfg.auth_required());
    }

    #[test]
    fn summary_never_carries_the_secret() {
        let cli = Cli { api_key: Some("hunter2".into()), ..Cli::default() };
        let cfg = ServerConfig::merge(cli, FileConfig::default());
        let summary = serde_json::to_string(&cfg.summary()).unwrap();
        assert!(summary.contains("\"authRequired\":true"));
        assert!(!summary.contains("hunter2"));
    }

    #[tokio::test]
    async fn load_reads_the_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runwire.yaml");
        tokio::fs::write(&path, "cancel_on_idle: true\nhistory_capacity: 4\n").await.unwrap();
        let cli = Cli { config: Some(path), ..Cli::default() };
        let cfg = ServerConfig::load(cli).await.unwrap();
        assert!(cfg.cancel_on_idle);
        assert_eq!(cfg.history_capacity, 4);

        let missing = Cli { config: Some(dir.path().join("nope.yaml")), ..Cli::default() };
        assert!(ServerConfig::load(missing).await.is_err());
    }
}
