pub mod auth;
pub mod backoff;
pub mod cancellation;
pub mod catalog;
pub mod chat;
pub mod client;
pub mod config;
pub mod connections;
pub mod dispatch;
pub mod frame;
pub mod history;
pub mod messages;
pub mod providers;
pub mod registry;
pub mod runner;
pub mod server;

pub use cancellation::{CancelledError, Controller, Token};
pub use client::{Client, ClientError, ClientOptions};
pub use config::{Cli, ServerConfig};
pub use connections::{ConnectionManager, DeliveryMode};
pub use frame::{FrameCodec, FrameError};
pub use registry::{RunContext, RunPolicy, RunRegistry};
pub use runner::{EchoRunner, JobError, ProcessRunner, RunOutcome, ScriptRunner};
