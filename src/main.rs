use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use runwire::config::{Cli, ServerConfig};
use runwire::runner::{EchoRunner, ProcessRunner, ScriptRunner};
use runwire::server;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::load(Cli::parse()).await?;

    let runner: Arc<dyn ScriptRunner> = match &config.runner {
        Some(program) => {
            tracing::info!(program = %program, args = ?config.runner_args, "using process runner");
            let mut runner = ProcessRunner::new(program);
            runner.args = config.runner_args.clone();
            runner.working_dir = Some(config.scripts_dir.clone());
            Arc::new(runner)
        }
        None => Arc::new(EchoRunner::default()),
    };

    server::serve(config, runner).await
}
