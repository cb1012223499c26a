#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use runwire::backoff::ReconnectPolicy;
use runwire::client::{Client, ClientOptions};
use runwire::config::ServerConfig;
use runwire::messages::{RunEnd, ServerEvent, ServerMessage};
use runwire::providers::ProviderCatalog;
use runwire::runner::{EchoRunner, ScriptRunner};
use runwire::server::{self, AppState};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    pub fn client(&self) -> Client {
        Client::connect(self.ws_url(), client_options())
    }

    pub fn client_at(&self, query: &str) -> Client {
        Client::connect(format!("{}?{query}", self.ws_url()), client_options())
    }
}

pub fn client_options() -> ClientOptions {
    ClientOptions { reconnect: ReconnectPolicy::constant(Duration::from_millis(50)), ..Default::default() }
}

/// Echo runner with a configurable pause before each file.
pub fn echo(step: Duration) -> Arc<dyn ScriptRunner> {
    Arc::new(EchoRunner { step_delay: step })
}

pub async fn spawn_server(runner: Arc<dyn ScriptRunner>, config: ServerConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let providers = ProviderCatalog::from_vars([("OPENAI_API_KEY", "sk-test")]);
    let state = AppState::from_config(&config, runner, providers).await.unwrap();
    let handle = tokio::spawn(server::run(listener, state.clone(), config));
    TestServer { addr, state, handle }
}

pub async fn connected(client: &Client) {
    client.wait_until_connected(WAIT).await.unwrap();
}

pub async fn next_end(events: &mut BroadcastStream<ServerMessage>, run_id: &str) -> RunEnd {
    let wait = async {
        while let Some(message) = events.next().await {
            if let Ok(ServerMessage::Event(ServerEvent::RunEnd(end))) = message {
                if end.run_id == run_id {
                    return end;
                }
            }
        }
        panic!("event stream closed before run.end for {run_id}");
    };
    tokio::time::timeout(WAIT, wait).await.expect("run.end in time")
}

/// First event for which `pick` returns `Some`.
pub async fn next_matching<T>(
    events: &mut BroadcastStream<ServerMessage>,
    mut pick: impl FnMut(ServerEvent) -> Option<T>,
) -> T {
    let wait = async {
        while let Some(message) = events.next().await {
            if let Ok(ServerMessage::Event(event)) = message {
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        }
        panic!("event stream closed");
    };
    tokio::time::timeout(WAIT, wait).await.expect("event in time")
}
