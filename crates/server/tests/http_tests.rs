//! End-to-end HTTP tests
//!
//! Starts the full application on an ephemeral port against a fake host and
//! talks to it over real TCP connections:
//! - Device list endpoint
//! - Bind/unbind round trips and the broadcast they trigger
//! - Rejection of malformed input before any command runs
//! - Push stream snapshot, heartbeat and fan-out
//! - Graceful shutdown
//!
//! Run with: `cargo test -p server --test http_tests`

mod support;

use common::Shutdown;
use common::test_utils::with_timeout;
use server::App;
use server::config::ServerConfig;
use server::network::SubscriberHub;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use support::{FakeHost, HOSTILE_BUSIDS, registry_for};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    addr: SocketAddr,
    hub: Arc<SubscriberHub>,
    shutdown: Shutdown,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start(host: &FakeHost) -> Running {
    let mut config = ServerConfig::default();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    config.server.heartbeat_secs = 1;
    config.server.poll_interval_secs = 60;

    let (registry, _store) = registry_for(host);
    let shutdown = Shutdown::new();
    let app = App::build(&config, registry, shutdown.clone()).await.unwrap();
    let addr = app.local_addr().unwrap();
    let hub = Arc::clone(app.hub());
    let task = tokio::spawn(app.run());

    Running {
        addr,
        hub,
        shutdown,
        task,
    }
}

struct Reply {
    status: u16,
    head: String,
    body: String,
}

async fn send(addr: SocketAddr, raw: &str) -> Reply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut bytes = Vec::new();
    with_timeout(IO_TIMEOUT, stream.read_to_end(&mut bytes))
        .await
        .expect("response timed out")
        .unwrap();

    let text = String::from_utf8(bytes).unwrap();
    let (head, body) = text.split_once("\r\n\r\n").expect("no header terminator");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("no status code");
    Reply {
        status,
        head: head.to_string(),
        body: body.to_string(),
    }
}

async fn get(addr: SocketAddr, path: &str) -> Reply {
    send(addr, &format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path)).await
}

async fn post(addr: SocketAddr, path: &str, body: &str) -> Reply {
    send(
        addr,
        &format!(
            "POST {} HTTP/1.1\r\nHost: test\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            path,
            body.len(),
            body
        ),
    )
    .await
}

/// Client side of a push stream
struct StreamClient {
    stream: TcpStream,
    buf: String,
}

impl StreamClient {
    async fn open(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /events HTTP/1.1\r\nHost: test\r\nAccept: text/event-stream\r\n\r\n")
            .await
            .unwrap();

        let mut client = Self {
            stream,
            buf: String::new(),
        };
        let head = client.read_until("\r\n\r\n").await.expect("stream closed before headers");
        assert!(head.starts_with("HTTP/1.1 200 OK"), "{}", head);
        assert!(head.contains("Content-Type: text/event-stream"));
        client
    }

    /// Next complete frame, or `None` once the server closed the stream
    async fn next_frame(&mut self) -> Option<String> {
        self.read_until("\n\n").await
    }

    /// Next `data:` frame, skipping heartbeats
    async fn next_data(&mut self) -> Option<String> {
        loop {
            let frame = self.next_frame().await?;
            if !frame.starts_with(':') {
                return Some(frame);
            }
        }
    }

    async fn read_until(&mut self, terminator: &str) -> Option<String> {
        loop {
            if let Some(pos) = self.buf.find(terminator) {
                let end = pos + terminator.len();
                let item = self.buf[..end].to_string();
                self.buf.drain(..end);
                return Some(item);
            }

            let mut chunk = [0u8; 4096];
            let n = with_timeout(IO_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("stream read timed out")
                .unwrap();
            if n == 0 {
                return None;
            }
            self.buf.push_str(std::str::from_utf8(&chunk[..n]).unwrap());
        }
    }
}

async fn wait_for_subscribers(hub: &SubscriberHub, count: usize) {
    with_timeout(IO_TIMEOUT, async {
        while hub.len().await != count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscriber count never settled");
}

// ============================================================================
// Device list
// ============================================================================

#[tokio::test]
async fn test_device_list() {
    let host = FakeHost::new(&[("1-1", "Foo Corp Widget"), ("1-2", "")]);
    let app = start(&host).await;

    let reply = get(app.addr, "/api/devices").await;
    assert_eq!(reply.status, 200);
    assert!(reply.head.contains("Content-Type: application/json"));
    assert_eq!(
        reply.body,
        r#"[{"busid":"1-1","info":"Foo Corp Widget","bound":false},{"busid":"1-2","info":"","bound":false}]"#
    );

    app.shutdown.trigger();
}

#[tokio::test]
async fn test_index_page_served() {
    let host = FakeHost::new(&[]);
    let app = start(&host).await;

    let reply = get(app.addr, "/").await;
    assert_eq!(reply.status, 200);
    assert!(reply.head.contains("Content-Type: text/html"));
    assert!(reply.body.contains("/events"));

    app.shutdown.trigger();
}

#[tokio::test]
async fn test_unknown_route_and_wrong_method() {
    let host = FakeHost::new(&[]);
    let app = start(&host).await;

    let reply = get(app.addr, "/nope").await;
    assert_eq!(reply.status, 404);
    assert_eq!(reply.body, r#"{"status":"failed","error":"Not Found"}"#);

    let reply = get(app.addr, "/bind").await;
    assert_eq!(reply.status, 405);
    assert!(reply.head.contains("Allow: "));
    assert!(reply.body.contains(r#""status":"failed""#));

    app.shutdown.trigger();
}

// ============================================================================
// Bind / unbind
// ============================================================================

#[tokio::test]
async fn test_bind_broadcasts_to_stream() {
    let host = FakeHost::new(&[("1-1", "Foo Corp Widget"), ("1-2", "")]);
    let app = start(&host).await;

    let mut client = StreamClient::open(app.addr).await;
    let initial = client.next_frame().await.unwrap();
    assert!(initial.starts_with("data: ["));
    assert!(initial.contains(r#""busid":"1-1","info":"Foo Corp Widget","bound":false"#));

    let reply = post(app.addr, "/bind", r#"{"busid":"1-1"}"#).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, r#"{"status":"success"}"#);

    let update = client.next_data().await.unwrap();
    assert!(update.contains(r#""busid":"1-1","info":"Foo Corp Widget","bound":true"#));
    assert!(update.contains(r#""busid":"1-2","info":"","bound":false"#));

    let reply = get(app.addr, "/api/devices").await;
    assert!(reply.body.contains(r#""busid":"1-1","info":"Foo Corp Widget","bound":true"#));

    let reply = post(app.addr, "/unbind", r#"{"busid":"1-1"}"#).await;
    assert_eq!(reply.status, 200);
    let update = client.next_data().await.unwrap();
    assert!(update.contains(r#""busid":"1-1","info":"Foo Corp Widget","bound":false"#));

    app.shutdown.trigger();
}

#[tokio::test]
async fn test_tool_failure_is_500() {
    let host = FakeHost::new(&[("1-1", "Widget")]);
    let app = start(&host).await;

    let reply = post(app.addr, "/unbind", r#"{"busid":"1-1"}"#).await;
    assert_eq!(reply.status, 500);
    assert_eq!(
        reply.body,
        r#"{"status":"failed","error":"device is not bound to usbip-host driver"}"#
    );

    app.shutdown.trigger();
}

#[tokio::test]
async fn test_malformed_busid_rejected_without_spawn() {
    let host = FakeHost::new(&[("1-1", "Widget")]);
    let app = start(&host).await;

    for busid in HOSTILE_BUSIDS {
        let body = serde_json::json!({ "busid": busid }).to_string();
        let reply = post(app.addr, "/bind", &body).await;
        assert_eq!(reply.status, 400, "busid {:?}", busid);
        assert!(reply.body.contains(r#""status":"failed""#));
    }

    assert!(host.mutations().is_empty(), "spawned: {:?}", host.mutations());
    app.shutdown.trigger();
}

#[tokio::test]
async fn test_bad_body_rejected() {
    let host = FakeHost::new(&[("1-1", "Widget")]);
    let app = start(&host).await;

    for body in ["", "not json", r#"{"bus":"1-1"}"#, r#"{"busid":11}"#] {
        let reply = post(app.addr, "/bind", body).await;
        assert_eq!(reply.status, 400, "body {:?}", body);
    }

    assert!(host.mutations().is_empty());
    app.shutdown.trigger();
}

// ============================================================================
// Push stream
// ============================================================================

#[tokio::test]
async fn test_stream_snapshot_then_heartbeat() {
    let host = FakeHost::new(&[("1-1", "Foo Corp Widget")]);
    let app = start(&host).await;

    let mut client = StreamClient::open(app.addr).await;
    assert_eq!(
        client.next_frame().await.unwrap(),
        "data: [{\"busid\":\"1-1\",\"info\":\"Foo Corp Widget\",\"bound\":false}]\n\n"
    );
    assert_eq!(client.next_frame().await.unwrap(), ": heartbeat\n\n");

    app.shutdown.trigger();
}

#[tokio::test]
async fn test_fan_out_skips_closed_subscriber() {
    let host = FakeHost::new(&[("1-1", "Widget")]);
    let app = start(&host).await;

    let mut first = StreamClient::open(app.addr).await;
    let mut second = StreamClient::open(app.addr).await;
    first.next_frame().await.unwrap();
    second.next_frame().await.unwrap();
    wait_for_subscribers(&app.hub, 2).await;

    drop(second);
    wait_for_subscribers(&app.hub, 1).await;

    let reply = post(app.addr, "/bind", r#"{"busid":"1-1"}"#).await;
    assert_eq!(reply.status, 200);
    let update = first.next_data().await.unwrap();
    assert!(update.contains(r#""bound":true"#));

    app.shutdown.trigger();
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_closes_streams_and_stops() {
    let host = FakeHost::new(&[("1-1", "Widget")]);
    let app = start(&host).await;

    let mut client = StreamClient::open(app.addr).await;
    client.next_frame().await.unwrap();

    app.shutdown.trigger();

    let result = with_timeout(Duration::from_secs(10), app.task)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());

    // Remaining frames, if any, are followed by end of stream
    while let Some(frame) = client.next_frame().await {
        assert!(frame.starts_with(':') || frame.starts_with("data: "));
    }
}
