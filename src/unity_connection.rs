use std::sync::Arc;
use std::time::Instant;

use crate::bridge_config::BridgeConfig;
use crate::unity_port_pool::PortPool;
use crate::unity_transport::UnityTransport;
use crate::{debug_log, error_log, info_log, warn_log};

/// Port and session of the transport currently in use
#[derive(Debug)]
pub(crate) struct ActiveSession<S> {
    pub(crate) port: u16,
    pub(crate) session: S,
}

/// One logical session to a Unity Editor.
///
/// Owns at most one live transport session. Discovery walks the configured port
/// range through the [`PortPool`], and the command methods (see `unity_dispatcher`)
/// reconnect through a different port when the transport fails.
pub struct UnityConnection<T: UnityTransport> {
    pub(crate) transport: T,
    pub(crate) config: Arc<BridgeConfig>,
    pub(crate) active: Option<ActiveSession<T::Session>>,
    pub(crate) port_pool: PortPool,
    /// Last port discovery attempted or a session ran on, kept after the session is dropped
    pub(crate) last_port: Option<u16>,
    connection_attempts: u64,
    last_successful_connect: Option<Instant>,
}

impl<T: UnityTransport> UnityConnection<T> {
    /// Creates a disconnected connection with an empty failure record
    pub fn new(transport: T, config: Arc<BridgeConfig>) -> Self {
        let port_pool = PortPool::new(
            config.unity_port_start,
            config.unity_port_end,
            config.port_failure_timeout,
            config.max_failed_ports,
        );
        Self::with_port_pool(transport, config, port_pool)
    }

    /// Creates a disconnected connection that continues an existing failure record
    pub fn with_port_pool(transport: T, config: Arc<BridgeConfig>, port_pool: PortPool) -> Self {
        Self {
            transport,
            config,
            active: None,
            port_pool,
            last_port: None,
            connection_attempts: 0,
            last_successful_connect: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.config.unity_host
    }

    /// Port of the live session, if any
    pub fn active_port(&self) -> Option<u16> {
        self.active.as_ref().map(|active| active.port)
    }

    /// Port of the live session, or else the last port attempted
    pub fn last_port(&self) -> Option<u16> {
        self.active_port().or(self.last_port)
    }

    pub fn has_session(&self) -> bool {
        self.active.is_some()
    }

    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts
    }

    pub fn last_successful_connect(&self) -> Option<Instant> {
        self.last_successful_connect
    }

    pub fn port_pool(&self) -> &PortPool {
        &self.port_pool
    }

    pub fn port_pool_mut(&mut self) -> &mut PortPool {
        &mut self.port_pool
    }

    /// Consumes the connection, keeping only its failure record
    pub fn into_port_pool(mut self) -> PortPool {
        self.disconnect();
        self.port_pool
    }

    /// Whether a session exists and the transport still considers it usable
    pub async fn is_alive(&self) -> bool {
        match &self.active {
            Some(active) => self.transport.is_alive(&active.session).await,
            None => false,
        }
    }

    /// Drops the live session, if any
    pub fn disconnect(&mut self) {
        if let Some(active) = self.active.take() {
            debug_log!("Closing Unity session on port {}", active.port);
            self.last_port = Some(active.port);
        }
    }

    /// Records a failure for the active port and drops its session
    pub fn fail_active_port(&mut self) {
        if let Some(port) = self.active_port() {
            info_log!("Marking port {} as failed", port);
            self.port_pool.mark_failed(port);
        }
        self.disconnect();
    }

    /// Finds a Unity Editor in the configured port range and opens a session on it.
    ///
    /// An existing session is reused unless `force_reconnect` is set or it no longer
    /// passes the transport's liveness check. Returns false if no port could be used;
    /// the caller decides whether to retry.
    pub async fn discover(&mut self, force_reconnect: bool) -> bool {
        if let Some(active) = &self.active {
            if !force_reconnect {
                if self.transport.is_alive(&active.session).await {
                    debug_log!("Reusing existing connection on port {}", active.port);
                    return true;
                }
                warn_log!(
                    "Existing connection on port {} is dead, reconnecting...",
                    active.port
                );
                self.fail_active_port();
            } else {
                self.disconnect();
            }
        }

        self.connection_attempts += 1;
        info_log!("Starting connection attempt #{}", self.connection_attempts);

        self.port_pool.cleanup_expired();
        let candidates = self.port_pool.candidates();
        info_log!(
            "Trying {} available ports, failed ports: {}",
            candidates.len(),
            self.port_pool.failure_summary()
        );

        let ordered = if self.config.smart_port_discovery {
            self.order_by_probe(candidates).await
        } else {
            info_log!(
                "Using sequential port connection on {} available ports",
                candidates.len()
            );
            candidates
        };

        for port in ordered {
            if self.try_open(port).await {
                return true;
            }
        }

        error_log!(
            "Failed to connect to Unity on any port in range {}-{}",
            self.config.unity_port_start,
            self.config.unity_port_end
        );
        false
    }

    /// Probes every candidate concurrently and puts the ports that answered first.
    /// Ports that did not answer are still attempted afterwards in ascending order.
    async fn order_by_probe(&self, candidates: Vec<u16>) -> Vec<u16> {
        debug_log!("Scanning for active Unity MCP servers on available ports...");
        let host = self.host();
        let probes = candidates
            .iter()
            .map(|port| self.transport.probe(host, *port));
        let results = futures::future::join_all(probes).await;

        let (confirmed, remaining): (Vec<(u16, bool)>, Vec<(u16, bool)>) = candidates
            .into_iter()
            .zip(results)
            .partition(|(_, alive)| *alive);

        if confirmed.is_empty() {
            info_log!("No Unity MCP server answered a probe, trying all available ports");
        } else {
            info_log!(
                "Found Unity MCP servers on ports: {:?}",
                confirmed.iter().map(|(port, _)| *port).collect::<Vec<_>>()
            );
        }

        confirmed
            .into_iter()
            .chain(remaining)
            .map(|(port, _)| port)
            .collect()
    }

    async fn try_open(&mut self, port: u16) -> bool {
        debug_log!("Attempting to connect to Unity at {}:{}", self.host(), port);
        self.last_port = Some(port);
        match self.transport.open(&self.config.unity_host, port).await {
            Ok(session) => {
                self.port_pool.mark_succeeded(port);
                self.active = Some(ActiveSession { port, session });
                self.last_successful_connect = Some(Instant::now());
                info_log!(
                    "Successfully connected to Unity at {}:{}",
                    self.config.unity_host,
                    port
                );
                true
            }
            Err(e) => {
                debug_log!("Failed to connect to Unity on port {}: {}", port, e);
                self.port_pool.mark_failed(port);
                false
            }
        }
    }
}

#[cfg(test)]
#[path = "unity_connection_tests.rs"]
mod unity_connection_tests;
