//! Unity Bridge MCP Server
//!
//! A Model Context Protocol (MCP) server that forwards function calls to a Unity Editor.
//! This crate provides the connection layer to the Editor's bridge: length-prefixed framing,
//! port discovery with failure tracking, command dispatch with retry, and a shared
//! connection provider.

pub mod bridge_config;
pub mod logging;
pub mod mcp_server;
pub mod unity_connection;
pub mod unity_connection_provider;
pub mod unity_dispatcher;
pub mod unity_framing;
pub mod unity_liveness;
pub mod unity_messages;
pub mod unity_port_pool;
pub mod unity_transport;

#[cfg(test)]
mod test_utils;

pub use bridge_config::{BridgeConfig, ConfigError, TransportKind};
pub use mcp_server::UnityBridgeMcpServer;
pub use unity_connection::UnityConnection;
pub use unity_connection_provider::{ConnectionLease, UnityConnectionProvider};
pub use unity_messages::{BridgeError, CommandEnvelope, ConnectionFailureKind, ResponseEnvelope};
pub use unity_port_pool::PortPool;
pub use unity_transport::{
    BridgeTransport, FramedSocketTransport, PollingHttpTransport, UnityTransport,
};
