//! Transports that carry commands to a Unity Editor.
//!
//! Discovery, retry and failure bookkeeping are written once against
//! [`UnityTransport`]; the two implementations only know how to probe a port,
//! open a session on it and exchange one request/response pair.

use futures::FutureExt;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::bridge_config::{BridgeConfig, TransportKind};
use crate::unity_framing::{read_frame, read_frame_with_limit, write_frame};
use crate::unity_liveness::LivenessReply;
use crate::unity_messages::{BridgeError, CommandEnvelope, ConnectionFailureKind, PING_COMMAND};
use crate::{debug_log, warn_log};

/// Largest reply accepted from a discovery probe
const PROBE_REPLY_LIMIT: usize = 1024;

/// A way of reaching a Unity Editor on a given port
pub trait UnityTransport: Send + Sync {
    /// Live handle owned by a connection while a port is active
    type Session: Send + Sync;

    /// Whether a compatible Unity server answers a liveness ping on `port`.
    /// Any resource opened for the probe is released before returning.
    fn probe(&self, host: &str, port: u16) -> impl Future<Output = bool> + Send;

    /// Establishes a session on `port`
    fn open(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Session, BridgeError>> + Send;

    /// Whether an existing session still looks usable
    fn is_alive(&self, session: &Self::Session) -> impl Future<Output = bool> + Send;

    /// Sends a lightweight liveness ping over the session
    fn ping(
        &self,
        session: &mut Self::Session,
    ) -> impl Future<Output = Result<LivenessReply, BridgeError>> + Send;

    /// Sends one command and returns the raw reply body
    fn request(
        &self,
        session: &mut Self::Session,
        envelope: &CommandEnvelope,
    ) -> impl Future<Output = Result<Vec<u8>, BridgeError>> + Send;
}

/// Runs `future` with a deadline, mapping expiry to a timeout connection error
async fn with_timeout<F, T>(duration: Duration, what: &str, future: F) -> Result<T, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::timeout(format!(
            "{} timed out after {:.1}s",
            what,
            duration.as_secs_f64()
        ))),
    }
}

/// Length-prefixed JSON frames over a persistent TCP connection
#[derive(Debug, Clone)]
pub struct FramedSocketTransport {
    connection_timeout: Duration,
    send_timeout: Duration,
    ping_timeout: Duration,
    port_scan_timeout: Duration,
}

/// Open TCP session to a Unity Editor
#[derive(Debug)]
pub struct SocketSession {
    stream: TcpStream,
}

impl FramedSocketTransport {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            connection_timeout: config.connection_timeout,
            send_timeout: config.send_timeout,
            ping_timeout: config.ping_timeout,
            port_scan_timeout: config.port_scan_timeout,
        }
    }

    async fn connect(host: &str, port: u16, limit: Duration) -> Result<TcpStream, BridgeError> {
        let stream = with_timeout(limit, "Connect", async {
            TcpStream::connect((host, port))
                .await
                .map_err(|e| BridgeError::from_io(&format!("Connect to {}:{}", host, port), &e))
        })
        .await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug_log!("Failed to disable Nagle on {}:{}: {}", host, port, e);
        }
        Ok(stream)
    }

    async fn exchange_ping(
        stream: &mut TcpStream,
        limit: usize,
    ) -> Result<LivenessReply, BridgeError> {
        write_frame(stream, PING_COMMAND.as_bytes()).await?;
        let reply = read_frame_with_limit(stream, limit).await?;
        Ok(LivenessReply::classify(&reply))
    }
}

impl UnityTransport for FramedSocketTransport {
    type Session = SocketSession;

    async fn probe(&self, host: &str, port: u16) -> bool {
        let mut stream = match Self::connect(host, port, self.port_scan_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                debug_log!("Cannot connect to port {}: {}", port, e);
                return false;
            }
        };

        let reply = with_timeout(
            self.ping_timeout,
            "Probe ping",
            Self::exchange_ping(&mut stream, PROBE_REPLY_LIMIT),
        )
        .await;

        match reply {
            Ok(reply) if reply.is_alive() => true,
            Ok(reply) => {
                debug_log!("Port {} answered with a non-Unity reply: {:?}", port, reply);
                false
            }
            Err(e) => {
                debug_log!("Error receiving ping response from port {}: {}", port, e);
                false
            }
        }
    }

    async fn open(&self, host: &str, port: u16) -> Result<SocketSession, BridgeError> {
        let stream = Self::connect(host, port, self.connection_timeout).await?;
        Ok(SocketSession { stream })
    }

    async fn is_alive(&self, session: &SocketSession) -> bool {
        match session.stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) => {
                debug_log!("Socket reports pending error: {}", e);
                return false;
            }
            Err(_) => return false,
        }

        // A ready peek of zero bytes means the peer closed its side
        let mut buf = [0u8; 1];
        match session.stream.peek(&mut buf).now_or_never() {
            Some(Ok(0)) => false,
            Some(Ok(_)) => {
                warn_log!("Unsolicited data waiting on Unity socket");
                true
            }
            Some(Err(_)) => false,
            None => true,
        }
    }

    async fn ping(&self, session: &mut SocketSession) -> Result<LivenessReply, BridgeError> {
        with_timeout(
            self.ping_timeout,
            "Ping",
            Self::exchange_ping(&mut session.stream, crate::unity_framing::MAX_FRAME_SIZE),
        )
        .await
    }

    async fn request(
        &self,
        session: &mut SocketSession,
        envelope: &CommandEnvelope,
    ) -> Result<Vec<u8>, BridgeError> {
        let payload = envelope.to_bytes()?;
        let stream = &mut session.stream;
        with_timeout(self.send_timeout, "Unity command", async move {
            write_frame(stream, &payload).await?;
            read_frame(stream).await
        })
        .await
    }
}

/// JSON over HTTP: `GET /` answers liveness pings and `POST /` runs commands
#[derive(Debug, Clone)]
pub struct PollingHttpTransport {
    client: reqwest::Client,
    send_timeout: Duration,
    ping_timeout: Duration,
}

/// Port of a Unity HTTP server that answered a probe
#[derive(Debug, Clone)]
pub struct HttpSession {
    url: String,
}

impl PollingHttpTransport {
    pub fn new(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Unity-MCP-Client/1.0")
            .connect_timeout(config.connection_timeout)
            .build()
            .map_err(|e| {
                BridgeError::connection(
                    ConnectionFailureKind::Io,
                    format!("Failed to build HTTP client: {}", e),
                )
            })?;

        Ok(Self {
            client,
            send_timeout: config.send_timeout,
            ping_timeout: config.ping_timeout,
        })
    }

    fn url(host: &str, port: u16) -> String {
        format!("http://{}:{}/", host, port)
    }

    /// Maps a reqwest failure onto the bridge error taxonomy
    fn classify(error: reqwest::Error, what: &str) -> BridgeError {
        let kind = if error.is_timeout() {
            ConnectionFailureKind::Timeout
        } else if error.is_connect() {
            ConnectionFailureKind::Refused
        } else {
            ConnectionFailureKind::Io
        };
        BridgeError::connection(kind, format!("{}: {}", what, error))
    }

    async fn get_liveness(&self, url: &str) -> Result<LivenessReply, BridgeError> {
        let response = self
            .client
            .get(url)
            .timeout(self.ping_timeout)
            .send()
            .await
            .map_err(|e| Self::classify(e, "Ping"))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(BridgeError::connection(
                ConnectionFailureKind::NoServer,
                format!("Ping failed with status code {}", status.as_u16()),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Self::classify(e, "Ping body"))?;
        Ok(LivenessReply::classify(&body))
    }
}

impl UnityTransport for PollingHttpTransport {
    type Session = HttpSession;

    async fn probe(&self, host: &str, port: u16) -> bool {
        let url = Self::url(host, port);
        match self.get_liveness(&url).await {
            Ok(reply) => reply.is_alive(),
            Err(e) => {
                debug_log!("Ping to {} failed: {}", url, e);
                false
            }
        }
    }

    async fn open(&self, host: &str, port: u16) -> Result<HttpSession, BridgeError> {
        let url = Self::url(host, port);
        let reply = self.get_liveness(&url).await?;
        if reply.is_alive() {
            Ok(HttpSession { url })
        } else {
            Err(BridgeError::connection(
                ConnectionFailureKind::NoServer,
                format!("{} is not a Unity MCP server", url),
            ))
        }
    }

    async fn is_alive(&self, session: &HttpSession) -> bool {
        matches!(self.get_liveness(&session.url).await, Ok(reply) if reply.is_alive())
    }

    async fn ping(&self, session: &mut HttpSession) -> Result<LivenessReply, BridgeError> {
        self.get_liveness(&session.url).await
    }

    async fn request(
        &self,
        session: &mut HttpSession,
        envelope: &CommandEnvelope,
    ) -> Result<Vec<u8>, BridgeError> {
        let response = self
            .client
            .post(&session.url)
            .json(envelope)
            .timeout(self.send_timeout * 2)
            .send()
            .await
            .map_err(|e| Self::classify(e, "Unity command"))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::classify(e, "Unity command body"))?;

        if status != reqwest::StatusCode::OK {
            return Err(BridgeError::Protocol {
                message: format!("HTTP request failed with status code {}", status.as_u16()),
                preview: crate::unity_messages::preview(&body),
            });
        }
        Ok(body.to_vec())
    }
}

/// Transport selected by configuration
#[derive(Debug, Clone)]
pub enum BridgeTransport {
    Socket(FramedSocketTransport),
    Http(PollingHttpTransport),
}

/// Session of whichever transport is configured
#[derive(Debug)]
pub enum BridgeSession {
    Socket(SocketSession),
    Http(HttpSession),
}

impl BridgeTransport {
    pub fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        Ok(match config.unity_transport {
            TransportKind::Socket => BridgeTransport::Socket(FramedSocketTransport::new(config)),
            TransportKind::Http => BridgeTransport::Http(PollingHttpTransport::new(config)?),
        })
    }
}

fn session_mismatch() -> BridgeError {
    BridgeError::connection(
        ConnectionFailureKind::Io,
        "Session does not belong to this transport",
    )
}

impl UnityTransport for BridgeTransport {
    type Session = BridgeSession;

    async fn probe(&self, host: &str, port: u16) -> bool {
        match self {
            BridgeTransport::Socket(t) => t.probe(host, port).await,
            BridgeTransport::Http(t) => t.probe(host, port).await,
        }
    }

    async fn open(&self, host: &str, port: u16) -> Result<BridgeSession, BridgeError> {
        match self {
            BridgeTransport::Socket(t) => t.open(host, port).await.map(BridgeSession::Socket),
            BridgeTransport::Http(t) => t.open(host, port).await.map(BridgeSession::Http),
        }
    }

    async fn is_alive(&self, session: &BridgeSession) -> bool {
        match (self, session) {
            (BridgeTransport::Socket(t), BridgeSession::Socket(s)) => t.is_alive(s).await,
            (BridgeTransport::Http(t), BridgeSession::Http(s)) => t.is_alive(s).await,
            _ => false,
        }
    }

    async fn ping(&self, session: &mut BridgeSession) -> Result<LivenessReply, BridgeError> {
        match (self, session) {
            (BridgeTransport::Socket(t), BridgeSession::Socket(s)) => t.ping(s).await,
            (BridgeTransport::Http(t), BridgeSession::Http(s)) => t.ping(s).await,
            _ => Err(session_mismatch()),
        }
    }

    async fn request(
        &self,
        session: &mut BridgeSession,
        envelope: &CommandEnvelope,
    ) -> Result<Vec<u8>, BridgeError> {
        match (self, session) {
            (BridgeTransport::Socket(t), BridgeSession::Socket(s)) => t.request(s, envelope).await,
            (BridgeTransport::Http(t), BridgeSession::Http(s)) => t.request(s, envelope).await,
            _ => Err(session_mismatch()),
        }
    }
}
