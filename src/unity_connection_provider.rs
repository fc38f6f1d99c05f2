use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::time::sleep;

use crate::bridge_config::BridgeConfig;
use crate::unity_connection::UnityConnection;
use crate::unity_messages::{BridgeError, ConnectionFailureKind, PING_COMMAND};
use crate::unity_port_pool::PortPool;
use crate::unity_transport::UnityTransport;
use crate::{error_log, info_log, warn_log};

/// Number of times a fresh connection is attempted before giving up
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Exclusive access to the shared connection. Other callers wait until it is dropped.
pub type ConnectionLease<'a, T> = MappedMutexGuard<'a, UnityConnection<T>>;

/// Hands out one validated [`UnityConnection`] for the whole process.
///
/// The host creates a single provider and shares it; tests create as many
/// independent providers as they need. The cached connection is re-validated
/// with a ping on every [`acquire`](Self::acquire) and rebuilt when it fails.
pub struct UnityConnectionProvider<T: UnityTransport + Clone> {
    transport: T,
    config: Arc<BridgeConfig>,
    slot: Mutex<ProviderSlot<T>>,
}

struct ProviderSlot<T: UnityTransport> {
    connection: Option<UnityConnection<T>>,
    /// Failure record carried over from a discarded connection
    port_pool: Option<PortPool>,
    /// Last port attempted by a discarded connection
    last_port: Option<u16>,
}

impl<T: UnityTransport + Clone> UnityConnectionProvider<T> {
    pub fn new(transport: T, config: BridgeConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            slot: Mutex::new(ProviderSlot {
                connection: None,
                port_pool: None,
                last_port: None,
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Returns the live connection, creating or rebuilding it if needed.
    ///
    /// The lease holds the provider lock, so commands from concurrent callers are
    /// serialized over the single transport.
    pub async fn acquire(&self) -> Result<ConnectionLease<'_, T>, BridgeError> {
        let mut slot = self.slot.lock().await;

        if slot.connection.is_some() && !Self::revalidate(&mut slot).await {
            if let Some(mut stale) = slot.connection.take() {
                stale.fail_active_port();
                slot.last_port = stale.last_port();
                slot.port_pool = Some(stale.into_port_pool());
            }
        }

        if slot.connection.is_none() {
            let connection = self.establish(&mut slot).await?;
            slot.connection = Some(connection);
        }

        MutexGuard::try_map(slot, |slot| slot.connection.as_mut()).map_err(|_| {
            BridgeError::connection(ConnectionFailureKind::NoServer, "Unity connection unavailable")
        })
    }

    /// Ends a lease early. Dropping the lease has the same effect.
    pub fn release(&self, lease: ConnectionLease<'_, T>) {
        drop(lease);
    }

    /// Discards the cached connection; the next `acquire` rediscovers Unity.
    /// The failure record is kept.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(connection) = slot.connection.take() {
            info_log!("Invalidating Unity connection on port {:?}", connection.active_port());
            slot.last_port = connection.last_port();
            slot.port_pool = Some(connection.into_port_pool());
        }
    }

    /// Closes the connection and forgets all state
    pub async fn disconnect(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(mut connection) = slot.connection.take() {
            connection.disconnect();
            info_log!("Unity connection closed");
        }
        slot.port_pool = None;
        slot.last_port = None;
    }

    /// Sends a command over the shared connection
    pub async fn send_command(&self, command_type: &str, params: Value) -> Result<Value, BridgeError> {
        let mut connection = self.acquire().await?;
        connection.send_command(command_type, params).await
    }

    /// Sends a command over the shared connection with retry and port switching
    pub async fn send_command_with_retry(
        &self,
        command_type: &str,
        params: Value,
        max_retries: u32,
    ) -> Result<Value, BridgeError> {
        let mut connection = self.acquire().await?;
        connection
            .send_command_with_retry(command_type, params, max_retries)
            .await
    }

    /// Active port and failure summary, without triggering discovery
    pub async fn status(&self) -> (Option<u16>, String) {
        let slot = self.slot.lock().await;
        match (&slot.connection, &slot.port_pool) {
            (Some(connection), _) => (
                connection.active_port(),
                connection.port_pool().failure_summary(),
            ),
            (None, Some(pool)) => (None, pool.failure_summary()),
            (None, None) => (None, "{}".to_string()),
        }
    }

    /// Message shown to the agent when a command fails: the command, the last port
    /// attempted and how long ago recent ports failed.
    pub async fn describe_failure(&self, command_type: &str, error: &BridgeError) -> String {
        let slot = self.slot.lock().await;
        let (port, summary) = match (&slot.connection, &slot.port_pool) {
            (Some(connection), _) => (
                connection.last_port(),
                connection.port_pool().failure_summary(),
            ),
            (None, Some(pool)) => (slot.last_port, pool.failure_summary()),
            (None, None) => (slot.last_port, "{}".to_string()),
        };
        let port = port.map_or_else(|| "none".to_string(), |p| p.to_string());
        format!(
            "Command '{}' failed (last port: {}, recent failed ports: {}): {}",
            command_type, port, summary, error
        )
    }

    /// Pings the cached connection. True if it can be reused as-is.
    async fn revalidate(slot: &mut ProviderSlot<T>) -> bool {
        let Some(connection) = slot.connection.as_mut() else {
            return false;
        };

        if !connection.is_alive().await {
            warn_log!(
                "Existing connection on port {:?} is not alive",
                connection.last_port()
            );
            return false;
        }

        let port = connection.active_port();
        match connection.send_command(PING_COMMAND, Value::Null).await {
            Ok(_) => true,
            Err(e) => {
                warn_log!(
                    "Existing connection validation failed on port {:?}: {}",
                    port,
                    e
                );
                false
            }
        }
    }

    /// Builds a new connection, discovering a port and validating it with a ping
    async fn establish(&self, slot: &mut ProviderSlot<T>) -> Result<UnityConnection<T>, BridgeError> {
        let mut port_pool = slot.port_pool.take();
        let mut last_error: Option<BridgeError> = None;

        for attempt in 1..=CONNECT_ATTEMPTS {
            info_log!(
                "Creating new Unity connection (attempt {}/{})",
                attempt,
                CONNECT_ATTEMPTS
            );
            let mut connection = match port_pool.take() {
                Some(pool) => {
                    UnityConnection::with_port_pool(self.transport.clone(), self.config.clone(), pool)
                }
                None => UnityConnection::new(self.transport.clone(), self.config.clone()),
            };

            if !connection.discover(false).await {
                warn_log!(
                    "Connection attempt {} failed (recent failed ports: {})",
                    attempt,
                    connection.port_pool().failure_summary()
                );
                slot.last_port = connection.last_port().or(slot.last_port);
                port_pool = Some(connection.into_port_pool());
                if attempt < CONNECT_ATTEMPTS {
                    sleep(self.config.connection_retry_delay).await;
                }
                continue;
            }

            match connection.send_command(PING_COMMAND, Value::Null).await {
                Ok(_) => {
                    info_log!(
                        "Successfully established new Unity connection on port {:?}",
                        connection.active_port()
                    );
                    return Ok(connection);
                }
                Err(e) => {
                    // A failed ping does not always mean the transport is unusable
                    if connection.is_alive().await {
                        warn_log!(
                            "Ping verification failed on port {:?} but the transport is alive, using it anyway: {}",
                            connection.active_port(),
                            e
                        );
                        return Ok(connection);
                    }
                    error_log!("Connection attempt {} failed: {}", attempt, e);
                    connection.fail_active_port();
                    slot.last_port = connection.last_port().or(slot.last_port);
                    port_pool = Some(connection.into_port_pool());
                    last_error = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        sleep(self.config.connection_retry_delay).await;
                    }
                }
            }
        }

        let summary = port_pool
            .as_ref()
            .map_or_else(|| "{}".to_string(), PortPool::failure_summary);
        slot.port_pool = port_pool;

        let reason = last_error.map_or_else(
            || "Ensure the Unity Editor and MCP Bridge are running.".to_string(),
            |e| e.to_string(),
        );
        Err(BridgeError::connection(
            ConnectionFailureKind::NoServer,
            format!(
                "Could not establish Unity connection after {} attempts (recent failed ports: {}): {}",
                CONNECT_ATTEMPTS, summary, reason
            ),
        ))
    }
}

#[cfg(test)]
#[path = "unity_connection_provider_tests.rs"]
mod unity_connection_provider_tests;
