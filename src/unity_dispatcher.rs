use serde_json::Value;
use tokio::time::sleep;

use crate::unity_connection::UnityConnection;
use crate::unity_messages::{
    BridgeError, CommandEnvelope, ConnectionFailureKind, PING_COMMAND, ResponseEnvelope,
};
use crate::unity_transport::UnityTransport;
use crate::{debug_log, error_log, info_log, warn_log};

impl<T: UnityTransport> UnityConnection<T> {
    /// Sends a command to Unity and returns its result.
    ///
    /// Connects first if there is no live session. `ping` takes the lightweight
    /// liveness path. A transport failure marks the active port failed and drops
    /// the session before the error is returned.
    pub async fn send_command(
        &mut self,
        command_type: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        if self.active.is_none() && !self.discover(false).await {
            return Err(BridgeError::connection(
                ConnectionFailureKind::NoServer,
                format!(
                    "Not connected to Unity. Recent failed ports: {}",
                    self.port_pool.failure_summary()
                ),
            ));
        }

        if command_type == PING_COMMAND {
            return self.send_ping().await;
        }

        let envelope = CommandEnvelope::new(command_type, params);
        let reply = self.exchange(&envelope).await?;
        let response = ResponseEnvelope::parse(&reply).inspect_err(|e| {
            if let BridgeError::Protocol { message, preview } = e {
                error_log!("{}", message);
                error_log!("Partial response: {}", preview);
            }
        })?;

        response.into_result().inspect_err(|e| {
            error_log!("{}", e);
        })
    }

    /// Sends a command, retrying up to `max_retries` more times.
    ///
    /// Connection failures mark the port failed and force discovery of another
    /// port before the next attempt. Application failures are retried on the same
    /// session after a short delay. When every attempt fails the last error is
    /// returned unchanged.
    pub async fn send_command_with_retry(
        &mut self,
        command_type: &str,
        params: Value,
        max_retries: u32,
    ) -> Result<Value, BridgeError> {
        let mut attempt: u32 = 0;
        loop {
            let error = match self.send_command(command_type, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            warn_log!("Command attempt {} failed: {}", attempt + 1, error);
            if attempt >= max_retries {
                return Err(error);
            }
            attempt += 1;

            if error.is_connection_class() {
                self.fail_active_port();
                info_log!("Attempting to connect to a different port (attempt {})", attempt);
                if !self.discover(true).await {
                    warn_log!("Could not reconnect to any available port");
                    sleep(self.config.connection_retry_delay).await;
                }
            } else {
                sleep(self.config.retry_delay).await;
            }
        }
    }

    async fn send_ping(&mut self) -> Result<Value, BridgeError> {
        let Some(active) = self.active.as_mut() else {
            return Err(BridgeError::connection(
                ConnectionFailureKind::Closed,
                "No active Unity session",
            ));
        };

        debug_log!("Sending ping to verify connection on port {}", active.port);
        match self.transport.ping(&mut active.session).await {
            Ok(reply) => {
                if !reply.is_alive() {
                    warn_log!("Unexpected ping response: {:?}", reply);
                }
                Ok(reply.to_ping_result())
            }
            Err(e) => {
                error_log!("Ping error: {}", e);
                if e.is_connection_class() {
                    self.fail_active_port();
                }
                Err(e)
            }
        }
    }

    /// Sends the envelope over the active session and waits for the raw reply
    async fn exchange(&mut self, envelope: &CommandEnvelope) -> Result<Vec<u8>, BridgeError> {
        let Some(active) = self.active.as_mut() else {
            return Err(BridgeError::connection(
                ConnectionFailureKind::Closed,
                "No active Unity session",
            ));
        };
        let port = active.port;

        if let Ok(size) = serde_json::to_vec(&envelope.cmd).map(|bytes| bytes.len()) {
            if size > self.config.buffer_warning_size {
                warn_log!(
                    "Large command detected ({} bytes). This might cause issues.",
                    size
                );
            }
            info_log!(
                "Sending command: {} with data size: {} bytes",
                envelope.command_type,
                size
            );
        }

        match self.transport.request(&mut active.session, envelope).await {
            Ok(reply) => {
                debug_log!("Received complete response ({} bytes)", reply.len());
                Ok(reply)
            }
            Err(e) => {
                error_log!("Communication error with Unity on port {}: {}", port, e);
                if e.is_connection_class() {
                    self.fail_active_port();
                }
                Err(e)
            }
        }
    }
}
