use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tailcast_resolver::{
    LogPathResolver, ProcessLogPaths, ResolveError, StaticResolver, StreamSelector,
};
use tailcast_server::{Broadcaster, ServerConfig};
use tailcast_tail::{FileTailTracker, TailConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Static table that counts lookups and can be told to fail
struct TestResolver {
    table: StaticResolver,
    calls: AtomicUsize,
    broken: bool,
}

#[async_trait]
impl LogPathResolver for TestResolver {
    async fn resolve(&self, selector: &StreamSelector) -> Result<PathBuf, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(ResolveError::Spawn(io::Error::other("pm2 unavailable")));
        }
        self.table.resolve(selector).await
    }
}

struct Harness {
    broadcaster: Broadcaster,
    resolver: Arc<TestResolver>,
    addr: SocketAddr,
    server: JoinHandle<anyhow::Result<()>>,
    dir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(broken: bool) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut table = StaticResolver::default();
        table.insert(
            "web",
            ProcessLogPaths::new(dir.path().join("web.out"), dir.path().join("web.err")),
        );
        let resolver = Arc::new(TestResolver {
            table,
            calls: AtomicUsize::new(0),
            broken,
        });

        let tracker = FileTailTracker::new(TailConfig {
            debounce: Duration::from_millis(20),
            rescan_interval: Some(Duration::from_millis(200)),
            max_read_bytes: 1024 * 1024,
        });
        let config = ServerConfig {
            heartbeat_interval: None,
            ..ServerConfig::default()
        };
        let broadcaster = Broadcaster::new(tracker, resolver.clone(), config);

        let listener = Broadcaster::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { broadcaster.serve(listener).await })
        };

        Self {
            broadcaster,
            resolver,
            addr,
            server,
            dir,
        }
    }

    fn stdout_path(&self) -> PathBuf {
        self.dir.path().join("web.out")
    }

    async fn connect(&self, query: &str) -> Client {
        let url = format!("ws://{}/ws/logs{}", self.addr, query);
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("connect");
        ws
    }

    async fn subscribe(&self) -> Client {
        let mut ws = self.connect("?appName=web&logType=stdout").await;
        let connected = next_json(&mut ws).await;
        assert_eq!(connected["type"], "connected");
        ws
    }

    fn resolver_calls(&self) -> usize {
        self.resolver.calls.load(Ordering::SeqCst)
    }

    async fn wait_until(&self, mut condition: impl FnMut(&Broadcaster) -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition(&self.broadcaster) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }
}

fn append(path: &Path, content: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open for append");
    file.write_all(content.as_bytes()).expect("append");
    file.flush().expect("flush");
}

async fn next_message(ws: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn next_json(ws: &mut Client) -> serde_json::Value {
    match next_message(ws).await {
        Message::Text(text) => serde_json::from_str(&text).expect("valid json"),
        other => panic!("expected text message, got {:?}", other),
    }
}

async fn expect_close(ws: &mut Client, code: CloseCode) -> String {
    match next_message(ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, code);
            frame.reason.to_string()
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

async fn assert_silent(ws: &mut Client, window: Duration) {
    if let Ok(Some(Ok(message))) = tokio::time::timeout(window, ws.next()).await {
        panic!("unexpected message: {:?}", message);
    }
}

#[tokio::test]
async fn test_missing_parameters_rejected_before_resolving() {
    let harness = Harness::start().await;

    for query in ["", "?appName=web", "?logType=stdout"] {
        let mut ws = harness.connect(query).await;
        let reason = expect_close(&mut ws, CloseCode::Policy).await;
        assert!(reason.contains("appName"));
    }
    assert_eq!(harness.resolver_calls(), 0);
}

#[tokio::test]
async fn test_invalid_log_type_rejected_before_resolving() {
    let harness = Harness::start().await;

    let mut ws = harness.connect("?appName=web&logType=combined").await;
    let reason = expect_close(&mut ws, CloseCode::Policy).await;
    assert!(reason.contains("stdout or stderr"));
    assert_eq!(harness.resolver_calls(), 0);
}

#[tokio::test]
async fn test_unknown_process_rejected() {
    let harness = Harness::start().await;

    let mut ws = harness.connect("?appName=api&logType=stdout").await;
    expect_close(&mut ws, CloseCode::Policy).await;
    assert_eq!(harness.resolver_calls(), 1);
    assert_eq!(harness.broadcaster.connection_count(), 0);
}

#[tokio::test]
async fn test_resolver_failure_is_internal_error() {
    let harness = Harness::start_with(true).await;

    let mut ws = harness.connect("?appName=web&logType=stdout").await;
    expect_close(&mut ws, CloseCode::Error).await;
    assert!(harness.broadcaster.tracker().watched_paths().is_empty());
}

#[tokio::test]
async fn test_other_paths_are_not_upgraded() {
    let harness = Harness::start().await;

    let url = format!("ws://{}/elsewhere?appName=web&logType=stdout", harness.addr);
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
}

#[tokio::test]
async fn test_ping_gets_single_pong() {
    let harness = Harness::start().await;
    let mut ws = harness.subscribe().await;

    ws.send(Message::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "pong");
    assert_silent(&mut ws, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_malformed_messages_keep_connection_open() {
    let harness = Harness::start().await;
    let mut ws = harness.subscribe().await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"subscribe"}"#.to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();

    assert_eq!(next_json(&mut ws).await["type"], "pong");
    assert_eq!(harness.broadcaster.connection_count(), 1);
}

#[tokio::test]
async fn test_existing_content_is_never_replayed() {
    let harness = Harness::start().await;
    let path = harness.stdout_path();
    append(&path, &format!("{}\n", "o".repeat(99)));

    let mut ws = harness.subscribe().await;
    append(&path, "new bytes\n");

    let message = next_json(&mut ws).await;
    assert_eq!(message["type"], "log");
    assert_eq!(message["data"], "new bytes");
}

#[tokio::test]
async fn test_waits_for_file_creation() {
    let harness = Harness::start().await;
    let path = harness.stdout_path();
    assert!(!path.exists());

    let mut ws = harness.subscribe().await;
    assert_silent(&mut ws, Duration::from_millis(200)).await;

    append(&path, "hello\n");
    let message = next_json(&mut ws).await;
    assert_eq!(message["type"], "log");
    assert_eq!(message["data"], "hello");
}

#[tokio::test]
async fn test_lines_are_converted_and_joined() {
    let harness = Harness::start().await;
    let path = harness.stdout_path();
    append(&path, "");

    let mut ws = harness.subscribe().await;
    append(&path, "\x1b[31m<b>failed</b>\x1b[0m\n\nnext\n");

    let message = next_json(&mut ws).await;
    assert_eq!(
        message["data"],
        "<span style=\"color:#A00\">&lt;b&gt;failed&lt;/b&gt;</span><br/>next"
    );
}

#[tokio::test]
async fn test_disconnect_stops_watch() {
    let harness = Harness::start().await;
    let path = harness.stdout_path();
    append(&path, "");

    let mut ws = harness.subscribe().await;
    assert!(harness.broadcaster.tracker().is_watching(&path));

    let connections = harness.broadcaster.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].selector.to_string(), "web/stdout");
    assert!(connections[0].id.as_str().starts_with("web_stdout_"));

    ws.close(None).await.unwrap();
    harness
        .wait_until(|b| b.connection_count() == 0 && !b.tracker().is_watching(&path))
        .await;
}

#[tokio::test]
async fn test_dropped_socket_stops_watch() {
    let harness = Harness::start().await;
    let path = harness.stdout_path();

    let ws = harness.subscribe().await;
    assert!(harness.broadcaster.tracker().is_watching(&path));

    drop(ws);
    harness
        .wait_until(|b| b.connection_count() == 0 && !b.tracker().is_watching(&path))
        .await;
}

#[tokio::test]
async fn test_each_subscriber_gets_its_own_copy() {
    let harness = Harness::start().await;
    let path = harness.stdout_path();
    append(&path, "");

    let mut first = harness.subscribe().await;
    let mut second = harness.subscribe().await;
    assert_eq!(harness.broadcaster.tracker().subscriber_count(&path), 1 + 1);

    append(&path, "shared\n");
    assert_eq!(next_json(&mut first).await["data"], "shared");
    assert_eq!(next_json(&mut second).await["data"], "shared");

    first.close(None).await.unwrap();
    harness
        .wait_until(|b| b.tracker().subscriber_count(&path) == 1)
        .await;
    assert!(harness.broadcaster.tracker().is_watching(&path));

    append(&path, "still here\n");
    assert_eq!(next_json(&mut second).await["data"], "still here");
}

#[tokio::test]
async fn test_shutdown_all_closes_everything() {
    let harness = Harness::start().await;
    let path = harness.stdout_path();
    append(&path, "");

    let mut ws = harness.subscribe().await;
    assert!(!harness.broadcaster.is_shut_down());
    harness.broadcaster.shutdown_all();
    assert!(harness.broadcaster.is_shut_down());

    expect_close(&mut ws, CloseCode::Away).await;
    assert!(harness.broadcaster.wait_closed(WAIT).await);
    assert_eq!(harness.broadcaster.connection_count(), 0);
    assert!(!harness.broadcaster.tracker().is_watching(&path));

    let served = tokio::time::timeout(WAIT, harness.server)
        .await
        .expect("acceptor did not stop")
        .expect("server task panicked");
    assert!(served.is_ok());
    assert!(TcpStream::connect(harness.addr).await.is_err());
}
