mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use runwire::client::{Client, ClientError};
use runwire::config::ServerConfig;
use runwire::messages::{
    ChatChunk, ChatMessage, LogLevel, Request, RunRequest, RunStartRequest, RunStatus, ServerEvent,
};
use runwire::registry::RunContext;
use runwire::runner::{JobError, RunOutcome};

use common::{connected, echo, next_end, next_matching, spawn_server, WAIT};

fn start(run_id: &str, files: &[&str]) -> RunStartRequest {
    RunStartRequest {
        run_id: run_id.to_string(),
        script: "poem".to_string(),
        files: files.iter().map(|f| f.to_string()).collect(),
        options: Map::new(),
    }
}

#[tokio::test]
async fn run_streams_progress_then_ends() {
    let server = spawn_server(echo(Duration::from_millis(10)), ServerConfig::default()).await;
    let client = server.client();
    let mut events = client.events();
    connected(&client).await;

    let ack = client.start_run(start("r1", &["a", "b"])).await.unwrap();
    assert!(ack.status.ok);
    assert_eq!(ack.run_id, "r1");

    let end = next_end(&mut events, "r1").await;
    assert_eq!(end.exit_code, 0);
    let result = end.result.unwrap();
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.text.as_deref(), Some("a\nb\n"));

    let buffers = client.run_buffers("r1").unwrap();
    assert_eq!(buffers.output, "a\nb\n");
    assert!(buffers.trace.starts_with("# poem"));

    let record = client.fetch_run("r1").await.unwrap();
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.output, "a\nb\n");
}

#[tokio::test]
async fn abort_ends_the_run_as_cancelled() {
    let server = spawn_server(echo(Duration::from_secs(30)), ServerConfig::default()).await;
    let client = server.client();
    let mut events = client.events();
    connected(&client).await;

    client.start_run(start("r2", &["slow"])).await.unwrap();
    let listed = client.list_runs().await.unwrap();
    assert_eq!(listed.runs.len(), 1);
    assert_eq!(listed.runs[0].status, RunStatus::Running);

    let ack = client.abort_run("r2", None).await.unwrap();
    assert!(ack.status.ok);

    let end = next_end(&mut events, "r2").await;
    assert_eq!(end.exit_code, 2);
    let result = end.result.unwrap();
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.status_text.as_deref(), Some("user"));

    // Unknown ids are acknowledged as well.
    assert!(client.abort_run("r2", Some("again")).await.unwrap().status.ok);
}

#[tokio::test]
async fn broadcast_connections_see_the_same_stream() {
    let server = spawn_server(echo(Duration::from_millis(10)), ServerConfig::default()).await;
    let a = server.client();
    let b = server.client();
    let mut a_events = a.events();
    let mut b_events = b.events();
    connected(&a).await;
    connected(&b).await;

    a.start_run(start("shared", &["x", "y", "z"])).await.unwrap();
    let a_end = next_end(&mut a_events, "shared").await;
    let b_end = next_end(&mut b_events, "shared").await;
    assert_eq!(a_end, b_end);
    assert_eq!(a.run_buffers("shared"), b.run_buffers("shared"));
}

#[tokio::test]
async fn unicast_connections_only_see_their_own_runs() {
    let server = spawn_server(echo(Duration::from_millis(10)), ServerConfig::default()).await;
    let owner = server.client_at("mode=unicast");
    let other = server.client_at("mode=unicast");
    let mut events = owner.events();
    connected(&owner).await;
    connected(&other).await;

    owner.start_run(start("mine", &["a"])).await.unwrap();
    next_end(&mut events, "mine").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(owner.run_buffers("mine").is_some());
    assert!(other.run_buffers("mine").is_none());
}

#[tokio::test]
async fn late_connection_receives_the_last_result() {
    let server = spawn_server(echo(Duration::from_millis(1)), ServerConfig::default()).await;
    let first = server.client();
    let mut events = first.events();
    connected(&first).await;
    first.start_run(start("done", &["a"])).await.unwrap();
    next_end(&mut events, "done").await;

    let late = server.client();
    let mut late_events = late.events();
    let replayed = next_end(&mut late_events, "done").await;
    assert_eq!(replayed.result.unwrap().status, RunStatus::Success);
}

#[tokio::test]
async fn version_and_env_round_trip() {
    let server = spawn_server(echo(Duration::from_millis(1)), ServerConfig::default()).await;
    let client = server.client();
    connected(&client).await;

    let version = client.version().await.unwrap();
    assert!(version.status.ok);
    assert_eq!(version.version, env!("CARGO_PKG_VERSION"));

    let env = client.env().await.unwrap();
    assert!(!env.configuration.auth_required);
    assert!(env.providers.iter().any(|p| p.provider == "openai" && p.error.is_none()));

    let err = client.model_configuration("nope:model", false).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote { .. }));
}

#[tokio::test]
async fn kill_stops_the_server() {
    let server = spawn_server(echo(Duration::from_secs(30)), ServerConfig::default()).await;
    let client = server.client();
    let mut events = client.events();
    connected(&client).await;
    client.start_run(start("doomed", &["a"])).await.unwrap();

    let ack = client.kill().await.unwrap();
    assert!(ack.ok);

    let end = next_end(&mut events, "doomed").await;
    assert_eq!(end.result.unwrap().status_text.as_deref(), Some("server killed"));
    let notice = next_matching(&mut events, |event| match event {
        ServerEvent::Log(log) if log.run_id.is_none() => Some(log),
        _ => None,
    })
    .await;
    assert_eq!(notice.level, LogLevel::Warn);
    assert!(notice.message.contains("server killed"));

    let stopped = tokio::time::timeout(WAIT, server.handle).await.expect("server exits");
    stopped.unwrap().unwrap();
    assert!(!server.state.registry().is_active("doomed"));
    client.stop();
}

#[tokio::test]
async fn pending_requests_fail_when_the_socket_drops() {
    // A server that reads one request and hangs up without answering.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = socket.next().await;
        let _ = socket.close(None).await;
        let _ = socket.flush().await;
    });

    let client = Client::connect(format!("ws://{addr}/"), common::client_options());
    connected(&client).await;
    let err = tokio::time::timeout(WAIT, client.version()).await.expect("rejected in time").unwrap_err();
    assert!(matches!(err, ClientError::Disconnected(_)), "{err:?}");
    assert_eq!(client.pending_requests(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.reconnect_attempts() >= 1);
    client.stop();
    assert!(matches!(client.version().await, Err(ClientError::Stopped)));
}

#[tokio::test]
async fn reconnect_replays_buffers_without_duplicating_them() {
    let server = spawn_server(echo(Duration::from_millis(200)), ServerConfig::default()).await;
    let client = server.client();
    let mut events = client.events();
    connected(&client).await;
    client.start_run(start("r1", &["a", "b", "c", "d"])).await.unwrap();

    let before = tokio::time::timeout(WAIT, async {
        loop {
            match client.run_buffers("r1") {
                Some(buffers) if buffers.output.contains("b\n") => return buffers.output,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    })
    .await
    .expect("two files echoed");
    assert!(before.starts_with("a\nb\n"));

    // Drop every socket mid-run; the client reconnects and gets a replay.
    server.state.registry().connections().shutdown_all();

    let end = next_end(&mut events, "r1").await;
    assert_eq!(end.result.unwrap().text.as_deref(), Some("a\nb\nc\nd\n"));
    assert_eq!(client.run_buffers("r1").unwrap().output, "a\nb\nc\nd\n");
}

async fn ask_for_completion(_req: RunRequest, ctx: RunContext) -> Result<RunOutcome, JobError> {
    let stream = ctx.chat("local:echo", vec![ChatMessage::user("say hello")])?;
    let reply = stream.collect_text(ctx.token()).await?;
    ctx.append_output(&reply.text);
    Ok(RunOutcome::default())
}

#[tokio::test]
async fn job_chat_is_answered_by_a_client() {
    let server = spawn_server(Arc::new(ask_for_completion), ServerConfig::default()).await;
    let client = server.client();
    let mut events = client.events();
    connected(&client).await;
    client.start_run(start("chat", &[])).await.unwrap();

    let chat = next_matching(&mut events, |event| match event {
        ServerEvent::ChatStart(start) => Some(start),
        _ => None,
    })
    .await;
    assert_eq!(chat.model, "local:echo");
    assert_eq!(chat.messages, vec![ChatMessage::user("say hello")]);

    let first = ChatChunk { chat_id: chat.chat_id.clone(), chunk: Some("hel".into()), ..Default::default() };
    assert!(client.send_chat_chunk(first).await.unwrap().ok);
    let last = ChatChunk {
        chat_id: chat.chat_id.clone(),
        chunk: Some("lo".into()),
        finish_reason: Some("stop".into()),
        ..Default::default()
    };
    assert!(client.send_chat_chunk(last).await.unwrap().ok);

    let end = next_end(&mut events, "chat").await;
    assert_eq!(end.result.unwrap().text.as_deref(), Some("hello"));

    // The chat is gone once finished.
    let late = ChatChunk { chat_id: chat.chat_id, chunk: Some("!".into()), ..Default::default() };
    assert!(matches!(client.send_chat_chunk(late).await, Err(ClientError::Remote { .. })));
}

#[tokio::test]
async fn aborting_a_run_cancels_its_chat() {
    let server = spawn_server(Arc::new(ask_for_completion), ServerConfig::default()).await;
    let client = server.client();
    let mut events = client.events();
    connected(&client).await;
    client.start_run(start("chat", &[])).await.unwrap();

    let chat_id = next_matching(&mut events, |event| match event {
        ServerEvent::ChatStart(start) => Some(start.chat_id),
        _ => None,
    })
    .await;
    let partial = ChatChunk { chat_id: chat_id.clone(), chunk: Some("hel".into()), ..Default::default() };
    assert!(client.send_chat_chunk(partial).await.unwrap().ok);

    client.abort_run("chat", None).await.unwrap();
    let cancelled = next_matching(&mut events, |event| match event {
        ServerEvent::ChatCancel(cancel) => Some(cancel.chat_id),
        _ => None,
    })
    .await;
    assert_eq!(cancelled, chat_id);

    let end = next_end(&mut events, "chat").await;
    assert_eq!(end.result.unwrap().status, RunStatus::Cancelled);
    let stale = ChatChunk { chat_id, finish_reason: Some("stop".into()), ..Default::default() };
    assert!(client.send_chat_chunk(stale).await.is_err());
}

/// A bare socket server. It reports every request as `(type, id)` and every
/// close frame as `("close", "")`. The first `hang_up_after` requests go
/// unanswered and then the first connection is dropped; later requests get
/// `{ok: true}`.
async fn scripted_server(hang_up_after: usize) -> (SocketAddr, mpsc::UnboundedReceiver<(String, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut unanswered = hang_up_after;
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else { continue };
            while let Some(Ok(message)) = socket.next().await {
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => {
                        let _ = seen.send(("close".to_string(), String::new()));
                        break;
                    }
                    _ => continue,
                };
                let value: Value = serde_json::from_str(&text).unwrap();
                let kind = value["type"].as_str().unwrap_or_default().to_string();
                let id = value["id"].as_str().unwrap_or_default().to_string();
                let _ = seen.send((kind.clone(), id.clone()));
                if unanswered > 0 {
                    unanswered -= 1;
                    if unanswered == 0 {
                        let _ = socket.close(None).await;
                        break;
                    }
                    continue;
                }
                let reply = json!({ "type": kind, "id": id, "response": { "ok": true } });
                if socket.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
            }
        }
    });
    (addr, rx)
}

async fn next_seen(seen: &mut mpsc::UnboundedReceiver<(String, String)>) -> (String, String) {
    tokio::time::timeout(WAIT, seen.recv()).await.expect("request seen").expect("server running")
}

#[tokio::test]
async fn every_pending_request_is_rejected_once_then_a_new_one_succeeds() {
    let (addr, mut seen) = scripted_server(3).await;
    let client = Client::connect(format!("ws://{addr}/"), common::client_options());
    connected(&client).await;

    let (a, b, c) = tokio::join!(
        client.queue(&Request::ServerVersion),
        client.queue(&Request::ServerEnv),
        client.queue(&Request::RunList),
    );
    for result in [a, b, c] {
        assert!(matches!(result, Err(ClientError::Disconnected(_))), "{result:?}");
    }
    assert_eq!(client.pending_requests(), 0);
    for _ in 0..3 {
        next_seen(&mut seen).await;
    }

    connected(&client).await;
    let envelope = client.queue(&Request::ServerVersion).await.unwrap();
    assert!(envelope.status().ok);
    assert_eq!(envelope.id, "4");
    assert_eq!(client.reconnect_attempts(), 0);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn requests_sent_before_connect_are_flushed_in_order() {
    let (addr, mut seen) = scripted_server(0).await;
    let client = Client::connect(format!("ws://{addr}/"), common::client_options());

    let (a, b, c) = tokio::join!(
        client.queue(&Request::ServerVersion),
        client.queue(&Request::ServerEnv),
        client.queue(&Request::RunList),
    );
    assert_eq!([a.unwrap().id, b.unwrap().id, c.unwrap().id], ["1", "2", "3"]);

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(next_seen(&mut seen).await);
    }
    assert_eq!(
        order,
        vec![
            ("server.version".to_string(), "1".to_string()),
            ("server.env".to_string(), "2".to_string()),
            ("run.list".to_string(), "3".to_string()),
        ]
    );
}

#[tokio::test]
async fn stop_sends_a_close_frame() {
    let (addr, mut seen) = scripted_server(0).await;
    let client = Client::connect(format!("ws://{addr}/"), common::client_options());
    connected(&client).await;
    assert!(client.queue(&Request::ServerVersion).await.unwrap().status().ok);
    next_seen(&mut seen).await;

    client.stop();
    assert_eq!(next_seen(&mut seen).await, ("close".to_string(), String::new()));
}
