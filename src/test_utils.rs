//! Fake Unity servers and scripted transports shared by the connection tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::bridge_config::BridgeConfig;
use crate::unity_framing::{read_frame, write_frame};
use crate::unity_liveness::LivenessReply;
use crate::unity_messages::{BridgeError, CommandEnvelope, ConnectionFailureKind, PING_COMMAND};
use crate::unity_transport::UnityTransport;

/// Command type, or `func` of a call, that the fake servers answer with a remote error
pub const FAILING_COMMAND: &str = "explode";

pub fn init_test_logging() {
    crate::logging::init_logging();
}

/// Configuration over `port_start..=port_end` with delays and timeouts short enough for tests
pub fn fast_config(port_start: u16, port_end: u16, smart_port_discovery: bool) -> BridgeConfig {
    BridgeConfig {
        unity_port_start: port_start,
        unity_port_end: port_end,
        smart_port_discovery,
        connection_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_secs(2),
        ping_timeout: Duration::from_millis(500),
        port_scan_timeout: Duration::from_millis(200),
        connection_retry_delay: Duration::from_millis(10),
        retry_delay: Duration::from_millis(10),
        ..BridgeConfig::default()
    }
}

/// Reply the fake servers give to a command envelope
fn answer(envelope: &CommandEnvelope) -> Value {
    let failing_func = envelope.cmd.get("func").and_then(Value::as_str) == Some(FAILING_COMMAND);
    if envelope.command_type == FAILING_COMMAND || failing_func {
        json!({"status": "error", "error": "Function not found"})
    } else {
        json!({
            "status": "success",
            "result": {"type": envelope.command_type, "echo": envelope.cmd}
        })
    }
}

/// Unity stand-in speaking length-prefixed frames over TCP
pub struct FakeUnityServer {
    port: u16,
    accept_task: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    commands: Arc<AtomicUsize>,
}

impl FakeUnityServer {
    /// Binds 127.0.0.1 on an OS-assigned port
    pub async fn start() -> Self {
        Self::start_on(0)
            .await
            .expect("Failed to bind fake Unity server")
    }

    /// Binds 127.0.0.1 on `port`, returning None if it is already in use
    pub async fn start_on(port: u16) -> Option<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.ok()?;
        let port = listener.local_addr().ok()?.port();
        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let commands = Arc::new(AtomicUsize::new(0));

        let tracked = connections.clone();
        let counter = commands.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handle = tokio::spawn(Self::serve(stream, counter.clone()));
                tracked.lock().unwrap().push(handle);
            }
        });

        Some(Self {
            port,
            accept_task,
            connections,
            commands,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of non-ping commands received so far
    pub fn command_count(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }

    async fn serve(mut stream: TcpStream, commands: Arc<AtomicUsize>) {
        while let Ok(request) = read_frame(&mut stream).await {
            let reply = if request == PING_COMMAND.as_bytes() {
                b"pong".to_vec()
            } else {
                commands.fetch_add(1, Ordering::SeqCst);
                match serde_json::from_slice::<CommandEnvelope>(&request) {
                    Ok(envelope) => serde_json::to_vec(&answer(&envelope)).unwrap(),
                    Err(_) => b"not json".to_vec(),
                }
            };
            if write_frame(&mut stream, &reply).await.is_err() {
                break;
            }
        }
    }

    /// Stops accepting and closes every open connection
    pub async fn shutdown(self) {
        self.accept_task.abort();
        let _ = self.accept_task.await;
        let handles: Vec<JoinHandle<()>> = self.connections.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Unity stand-in speaking JSON over HTTP
pub struct FakeHttpUnity {
    port: u16,
    task: JoinHandle<()>,
}

impl FakeHttpUnity {
    pub async fn start() -> Self {
        async fn command(Json(envelope): Json<CommandEnvelope>) -> (StatusCode, Json<Value>) {
            if envelope.command_type == "http_failure" {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"detail": "boom"})),
                );
            }
            (StatusCode::OK, Json(answer(&envelope)))
        }

        let app = Router::new().route("/", get(|| async { "pong" }).post(command));
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("Failed to bind fake HTTP server");
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { port, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for FakeHttpUnity {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// TCP listener that is not Unity: it writes fixed bytes to every client, then
/// waits for the client to hang up
pub struct RawReplyListener {
    port: u16,
    task: JoinHandle<()>,
}

impl RawReplyListener {
    pub async fn start(reply: Vec<u8>) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("Failed to bind raw listener");
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let reply = reply.clone();
                tokio::spawn(async move {
                    if !reply.is_empty() && stream.write_all(&reply).await.is_err() {
                        return;
                    }
                    let mut sink = [0u8; 256];
                    while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                });
            }
        });
        Self { port, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for RawReplyListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Length prefix followed by `payload`, built by hand
pub fn raw_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame
}

/// Wraps a transport and records every port scan and open with its outcome
#[derive(Debug, Clone)]
pub struct RecordingTransport<T> {
    inner: T,
    scans: Arc<Mutex<Vec<(u16, bool)>>>,
    opens: Arc<Mutex<Vec<(u16, bool)>>>,
}

impl<T: UnityTransport> RecordingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            scans: Arc::default(),
            opens: Arc::default(),
        }
    }

    pub fn scans(&self) -> Vec<(u16, bool)> {
        self.scans.lock().unwrap().clone()
    }

    pub fn opens(&self) -> Vec<(u16, bool)> {
        self.opens.lock().unwrap().clone()
    }
}

impl<T: UnityTransport> UnityTransport for RecordingTransport<T> {
    type Session = T::Session;

    async fn probe(&self, host: &str, port: u16) -> bool {
        let alive = self.inner.probe(host, port).await;
        self.scans.lock().unwrap().push((port, alive));
        alive
    }

    async fn open(&self, host: &str, port: u16) -> Result<T::Session, BridgeError> {
        let session = self.inner.open(host, port).await;
        self.opens.lock().unwrap().push((port, session.is_ok()));
        session
    }

    async fn is_alive(&self, session: &T::Session) -> bool {
        self.inner.is_alive(session).await
    }

    async fn ping(&self, session: &mut T::Session) -> Result<LivenessReply, BridgeError> {
        self.inner.ping(session).await
    }

    async fn request(
        &self,
        session: &mut T::Session,
        envelope: &CommandEnvelope,
    ) -> Result<Vec<u8>, BridgeError> {
        self.inner.request(session, envelope).await
    }
}

/// How the scripted transport answers the next request on a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedReply {
    Success,
    RemoteError,
    Garbage,
    Timeout,
    Closed,
}

#[derive(Debug, Default)]
pub struct Script {
    pub live_ports: HashSet<u16>,
    /// Live ports that accept sessions but never answer a ping
    pub silent_ports: HashSet<u16>,
    pub replies: HashMap<u16, VecDeque<ScriptedReply>>,
    pub probes: Vec<u16>,
    pub opens: Vec<u16>,
    pub requests: Vec<u16>,
    pub pings: Vec<u16>,
}

/// In-memory transport whose ports and replies are set by the test.
/// Requests without a queued reply succeed with `{"port": <port>}`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

#[derive(Debug)]
pub struct ScriptedSession {
    port: u16,
}

impl ScriptedTransport {
    pub fn with_live_ports(ports: &[u16]) -> Self {
        let transport = Self::default();
        transport.script().live_ports.extend(ports.iter().copied());
        transport
    }

    pub fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn queue(&self, port: u16, replies: &[ScriptedReply]) {
        self.script()
            .replies
            .entry(port)
            .or_default()
            .extend(replies.iter().copied());
    }

    pub fn silence(&self, port: u16) {
        self.script().silent_ports.insert(port);
    }

    pub fn kill(&self, port: u16) {
        self.script().live_ports.remove(&port);
    }

    pub fn opens(&self) -> Vec<u16> {
        self.script().opens.clone()
    }

    pub fn requests(&self) -> Vec<u16> {
        self.script().requests.clone()
    }
}

impl UnityTransport for ScriptedTransport {
    type Session = ScriptedSession;

    async fn probe(&self, _host: &str, port: u16) -> bool {
        let mut script = self.script();
        script.probes.push(port);
        script.live_ports.contains(&port)
    }

    async fn open(&self, _host: &str, port: u16) -> Result<ScriptedSession, BridgeError> {
        let mut script = self.script();
        script.opens.push(port);
        if script.live_ports.contains(&port) {
            Ok(ScriptedSession { port })
        } else {
            Err(BridgeError::connection(
                ConnectionFailureKind::Refused,
                format!("Connection refused on port {}", port),
            ))
        }
    }

    async fn is_alive(&self, session: &ScriptedSession) -> bool {
        self.script().live_ports.contains(&session.port)
    }

    async fn ping(&self, session: &mut ScriptedSession) -> Result<LivenessReply, BridgeError> {
        let mut script = self.script();
        script.pings.push(session.port);
        if script.silent_ports.contains(&session.port) {
            Err(BridgeError::timeout("Ping timed out after 0.5s"))
        } else if script.live_ports.contains(&session.port) {
            Ok(LivenessReply::Pong)
        } else {
            Err(BridgeError::TransportClosed {
                expected: 4,
                received: 0,
            })
        }
    }

    async fn request(
        &self,
        session: &mut ScriptedSession,
        _envelope: &CommandEnvelope,
    ) -> Result<Vec<u8>, BridgeError> {
        let port = session.port;
        let mut script = self.script();
        script.requests.push(port);
        let reply = script
            .replies
            .get_mut(&port)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(ScriptedReply::Success);

        match reply {
            ScriptedReply::Success => {
                Ok(serde_json::to_vec(&json!({"status": "success", "result": {"port": port}})).unwrap())
            }
            ScriptedReply::RemoteError => Ok(serde_json::to_vec(
                &json!({"status": "error", "error": "Function not found"}),
            )
            .unwrap()),
            ScriptedReply::Garbage => Ok(b"<html>not unity</html>".to_vec()),
            ScriptedReply::Timeout => Err(BridgeError::timeout("Unity command timed out after 2.0s")),
            ScriptedReply::Closed => Err(BridgeError::TransportClosed {
                expected: 4,
                received: 0,
            }),
        }
    }
}
