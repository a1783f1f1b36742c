//! Centralized configuration for the call bridge.
//!
//! This module provides configuration constants for endpoint identity, the
//! local transport and logging.

use std::path::PathBuf;
use std::time::Duration;

/// Fixed endpoint identity. There is no discovery: client and server agree on
/// this pair at compile time.
pub struct EndpointConfig;

impl EndpointConfig {
    /// Machine-local transport (Unix domain sockets, loopback TCP elsewhere).
    pub const PROTOCOL_SEQUENCE: &'static str = "ncalrpc";
    /// Same-process transport.
    pub const INPROC_PROTOCOL_SEQUENCE: &'static str = "inproc";
    pub const ENDPOINT: &'static str = "playground_server";
    pub const MAX_ENDPOINT_LEN: usize = 64;
    /// Overrides the exported library's binding, e.g. `inproc:[playground_server]`.
    pub const BINDING_ENV: &'static str = "CALLBRIDGE_BINDING";
}

/// Transport-level limits and timeouts.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const MAX_CONNECTIONS: usize = 64;
    pub const SOCKET_DIR_ENV: &'static str = "CALLBRIDGE_SOCKET_DIR";
    pub const SOCKET_SUFFIX: &'static str = ".sock";
}

/// Logging defaults for binaries and the exported library.
pub struct LoggingConfig;

impl LoggingConfig {
    pub const FILTER_ENV: &'static str = "CALLBRIDGE_LOG";
    pub const DEFAULT_DIRECTIVE: &'static str = "info";
}

/// Directory that holds local transport sockets.
///
/// Resolution order: `CALLBRIDGE_SOCKET_DIR`, the per-user runtime directory,
/// then the system temp directory.
pub fn socket_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(TransportConfig::SOCKET_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}
