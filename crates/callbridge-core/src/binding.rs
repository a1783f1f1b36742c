//! Endpoint descriptors and session handles.
//!
//! A client binds to a service by composing a string binding of the form
//! `"<protseq>:[<endpoint>]"` from an [`EndpointDescriptor`], resolving it, and
//! receiving a [`SessionHandle`]. Binding performs no I/O: a service that is not
//! listening yet is only noticed when a call is made.

use crate::config::EndpointConfig;
use crate::error::{BridgeError, Result};
use crate::status::StatusCode;
use crate::transport::{Transport, TransportKind, TransportRuntime};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Where a service is reachable: a transport kind and an endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointDescriptor {
    kind: TransportKind,
    endpoint: String,
}

impl EndpointDescriptor {
    /// Validate a protocol sequence and endpoint name.
    pub fn new(protseq: &str, endpoint: &str) -> Result<Self> {
        let kind = TransportKind::from_protseq(protseq).ok_or_else(|| {
            BridgeError::connection(
                compose(protseq, endpoint),
                StatusCode::RPC_S_PROTSEQ_NOT_SUPPORTED,
                format!("unknown protocol sequence {:?}", protseq),
            )
        })?;
        validate_endpoint(protseq, endpoint)?;

        Ok(Self {
            kind,
            endpoint: endpoint.to_string(),
        })
    }

    /// Machine-local descriptor for `endpoint`.
    pub fn local(endpoint: &str) -> Result<Self> {
        Self::new(EndpointConfig::PROTOCOL_SEQUENCE, endpoint)
    }

    /// Same-process descriptor for `endpoint`.
    pub fn inproc(endpoint: &str) -> Result<Self> {
        Self::new(EndpointConfig::INPROC_PROTOCOL_SEQUENCE, endpoint)
    }

    /// Parse a string binding such as `ncalrpc:[playground_server]`.
    pub fn parse(binding: &str) -> Result<Self> {
        let malformed = || {
            BridgeError::connection(
                binding,
                StatusCode::RPC_S_INVALID_STRING_BINDING,
                "expected <protseq>:[<endpoint>]",
            )
        };

        let (protseq, rest) = binding.split_once(':').ok_or_else(malformed)?;
        let endpoint = rest
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .ok_or_else(malformed)?;

        Self::new(protseq, endpoint)
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The composed `"<protseq>:[<endpoint>]"` form.
    pub fn string_binding(&self) -> String {
        compose(self.kind.protseq(), &self.endpoint)
    }
}

impl Default for EndpointDescriptor {
    fn default() -> Self {
        Self {
            kind: TransportKind::LocalSocket,
            endpoint: EndpointConfig::ENDPOINT.to_string(),
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[{}]", self.kind.protseq(), self.endpoint)
    }
}

fn compose(protseq: &str, endpoint: &str) -> String {
    format!("{}:[{}]", protseq, endpoint)
}

fn validate_endpoint(protseq: &str, endpoint: &str) -> Result<()> {
    let invalid = |message: String| {
        BridgeError::connection(
            compose(protseq, endpoint),
            StatusCode::RPC_S_INVALID_ENDPOINT_FORMAT,
            message,
        )
    };

    if endpoint.is_empty() {
        return Err(invalid("endpoint name is empty".to_string()));
    }
    if endpoint.len() > EndpointConfig::MAX_ENDPOINT_LEN {
        return Err(invalid(format!(
            "endpoint name exceeds {} characters",
            EndpointConfig::MAX_ENDPOINT_LEN
        )));
    }
    if let Some(c) = endpoint
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(invalid(format!("invalid character {:?} in endpoint name", c)));
    }
    if endpoint.starts_with('.') {
        return Err(invalid("endpoint name cannot start with '.'".to_string()));
    }
    Ok(())
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A live binding to one endpoint.
///
/// Single owner. Released when dropped or passed to [`disconnect`].
pub struct SessionHandle {
    id: u64,
    descriptor: EndpointDescriptor,
    transport: Arc<dyn Transport>,
}

impl SessionHandle {
    /// Process-unique id, for diagnostics.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        debug!("Released session {} to {}", self.id, self.descriptor);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Bind to the service named by `descriptor`.
///
/// Fails only when no handle can be constructed. Whether anything is
/// listening is discovered by the first call.
pub fn connect(runtime: &TransportRuntime, descriptor: &EndpointDescriptor) -> Result<SessionHandle> {
    let binding = descriptor.string_binding();
    let resolved = EndpointDescriptor::parse(&binding)?;
    let transport = runtime.client(&resolved)?;

    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    debug!("Opened session {} to {}", id, binding);
    Ok(SessionHandle {
        id,
        descriptor: resolved,
        transport,
    })
}

/// Release a session handle.
pub fn disconnect(session: SessionHandle) {
    drop(session);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_descriptor() {
        let descriptor = EndpointDescriptor::default();
        assert_eq!(descriptor.kind(), TransportKind::LocalSocket);
        assert_eq!(descriptor.string_binding(), "ncalrpc:[playground_server]");
    }

    #[test]
    fn test_parse_string_binding() {
        let descriptor = EndpointDescriptor::parse("inproc:[svc-1.test]").unwrap();
        assert_eq!(descriptor.kind(), TransportKind::InProcess);
        assert_eq!(descriptor.endpoint(), "svc-1.test");
        assert_eq!(descriptor.to_string(), "inproc:[svc-1.test]");
    }

    #[test]
    fn test_malformed_bindings() {
        for binding in ["ncalrpc", "ncalrpc:svc", "ncalrpc:[svc", ":[svc]"] {
            let err = EndpointDescriptor::parse(binding).unwrap_err();
            assert!(
                matches!(err, BridgeError::Connection { .. }),
                "{} should not parse",
                binding
            );
        }
        assert_eq!(
            EndpointDescriptor::parse("ncalrpc:svc").unwrap_err().status(),
            StatusCode::RPC_S_INVALID_STRING_BINDING
        );
    }

    #[test]
    fn test_endpoint_validation() {
        let cases = [
            ("", StatusCode::RPC_S_INVALID_ENDPOINT_FORMAT),
            ("a/b", StatusCode::RPC_S_INVALID_ENDPOINT_FORMAT),
            ("..", StatusCode::RPC_S_INVALID_ENDPOINT_FORMAT),
            ("with space", StatusCode::RPC_S_INVALID_ENDPOINT_FORMAT),
        ];
        for (endpoint, status) in cases {
            assert_eq!(
                EndpointDescriptor::local(endpoint).unwrap_err().status(),
                status
            );
        }

        let long = "x".repeat(EndpointConfig::MAX_ENDPOINT_LEN + 1);
        assert!(EndpointDescriptor::local(&long).is_err());
    }

    #[test]
    fn test_unknown_protseq() {
        let err = EndpointDescriptor::new("ncacn_ip_tcp", "svc").unwrap_err();
        assert_eq!(err.status(), StatusCode::RPC_S_PROTSEQ_NOT_SUPPORTED);
    }

    #[test]
    fn test_connect_does_not_require_listener() {
        let runtime = TransportRuntime::new();
        let descriptor = EndpointDescriptor::inproc("nobody-home").unwrap();

        let first = connect(&runtime, &descriptor).unwrap();
        let second = connect(&runtime, &descriptor).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.descriptor(), &descriptor);

        disconnect(first);
        drop(second);
    }
}
