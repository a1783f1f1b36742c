//! Call transports.
//!
//! The bridge talks to transports through the byte-oriented [`Transport`]
//! trait: send an operation name and request bytes, receive a status code and
//! an optional transport-owned reply buffer. Two transports exist:
//!
//! - **inproc**: the service lives in the same process, typically inside a
//!   separately-managed runtime. Calls are handed to the dispatcher on a tokio
//!   task.
//! - **ncalrpc**: machine-local calls over a Unix domain socket (loopback TCP
//!   on other platforms), framed as length-prefixed JSON (see [`protocol`]).
//!
//! [`TransportRuntime`] owns the transport allocator and the in-process
//! endpoint table. Client bindings and service hosts receive it explicitly
//! rather than reaching for process-wide state.

pub mod inproc;
pub mod local_socket;
pub mod protocol;

use crate::binding::EndpointDescriptor;
use crate::buffer::{HeapAllocator, SharedAllocator, TransportBuffer};
use crate::config::{self, EndpointConfig};
use crate::error::Result;
use crate::fault::TransportFault;
use crate::service::Dispatcher;
use crate::status::StatusCode;
use inproc::{InprocRegistry, InprocTransport};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Kind of transport named by a protocol sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Machine-local transport (`ncalrpc`).
    LocalSocket,
    /// Same-process transport (`inproc`).
    InProcess,
}

impl TransportKind {
    pub fn protseq(&self) -> &'static str {
        match self {
            TransportKind::LocalSocket => EndpointConfig::PROTOCOL_SEQUENCE,
            TransportKind::InProcess => EndpointConfig::INPROC_PROTOCOL_SEQUENCE,
        }
    }

    pub fn from_protseq(protseq: &str) -> Option<Self> {
        match protseq {
            EndpointConfig::PROTOCOL_SEQUENCE => Some(TransportKind::LocalSocket),
            EndpointConfig::INPROC_PROTOCOL_SEQUENCE => Some(TransportKind::InProcess),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protseq())
    }
}

/// What a transport delivers back for one call.
///
/// A non-success status never carries an output buffer.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    output: Option<TransportBuffer>,
}

impl Response {
    pub fn success(output: Option<TransportBuffer>) -> Self {
        Self {
            status: StatusCode::SUCCESS,
            output,
        }
    }

    pub fn failure(status: StatusCode) -> Self {
        Self {
            status,
            output: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn into_parts(self) -> (StatusCode, Option<TransportBuffer>) {
        (self.status, self.output)
    }
}

/// A mechanism that carries one call to a service and brings back its reply.
///
/// Object safe (`Arc<dyn Transport>`). Failures outside the operation's own
/// status channel are reported as [`TransportFault`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send `request` to `operation` and wait for the reply.
    ///
    /// The reply buffer, if any, is owned by the transport allocator.
    async fn call(
        &self,
        operation: &str,
        request: &[u8],
    ) -> std::result::Result<Response, TransportFault>;
}

/// Transport runtime shared by client bindings and service hosts.
#[derive(Clone)]
pub struct TransportRuntime {
    allocator: SharedAllocator,
    inproc: InprocRegistry,
    socket_dir: PathBuf,
}

impl TransportRuntime {
    /// Runtime with the heap transport allocator and the configured socket
    /// directory.
    pub fn new() -> Self {
        Self {
            allocator: HeapAllocator::shared_transport(),
            inproc: InprocRegistry::default(),
            socket_dir: config::socket_dir(),
        }
    }

    /// Replace the transport allocate/free pair.
    pub fn with_allocator(mut self, allocator: SharedAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// Place local sockets in `dir`.
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Filesystem path of a local endpoint.
    pub fn socket_path(&self, endpoint: &str) -> PathBuf {
        self.socket_dir.join(format!(
            "{}{}",
            endpoint,
            config::TransportConfig::SOCKET_SUFFIX
        ))
    }

    /// Build the client side of a binding. Performs no I/O.
    pub(crate) fn client(&self, descriptor: &EndpointDescriptor) -> Result<Arc<dyn Transport>> {
        match descriptor.kind() {
            TransportKind::InProcess => Ok(Arc::new(InprocTransport::new(
                self.inproc.clone(),
                descriptor.endpoint(),
                self.allocator.clone(),
            ))),
            TransportKind::LocalSocket => Ok(Arc::new(local_socket::SocketTransport::new(
                self.socket_path(descriptor.endpoint()),
                descriptor.endpoint(),
                self.allocator.clone(),
            ))),
        }
    }

    /// Register `dispatcher` at the descriptor's endpoint and start listening.
    ///
    /// Returns as soon as the endpoint accepts calls; listening continues in
    /// the background until the registration is dropped.
    pub(crate) async fn listen(
        &self,
        descriptor: &EndpointDescriptor,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Registration> {
        let inner = match descriptor.kind() {
            TransportKind::InProcess => {
                self.inproc.register(descriptor.endpoint(), dispatcher)?;
                RegistrationInner::InProcess(self.inproc.clone())
            }
            TransportKind::LocalSocket => {
                let path = self.socket_path(descriptor.endpoint());
                RegistrationInner::LocalSocket(local_socket::SocketServer::start(path, dispatcher).await?)
            }
        };

        info!("Listening on {}", descriptor);
        Ok(Registration {
            endpoint: descriptor.endpoint().to_string(),
            inner: Some(inner),
        })
    }
}

impl Default for TransportRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransportRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRuntime")
            .field("allocator", &self.allocator.domain())
            .field("socket_dir", &self.socket_dir)
            .finish()
    }
}

enum RegistrationInner {
    InProcess(InprocRegistry),
    LocalSocket(local_socket::SocketServerHandle),
}

/// A live endpoint registration. Dropping it unregisters the endpoint.
pub struct Registration {
    endpoint: String,
    inner: Option<RegistrationInner>,
}

impl Registration {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop accepting calls at this endpoint.
    ///
    /// Calls already being dispatched are not interrupted.
    pub fn unregister(mut self) {
        self.release();
    }

    fn release(&mut self) {
        match self.inner.take() {
            Some(RegistrationInner::InProcess(registry)) => {
                registry.unregister(&self.endpoint);
                info!("Unregistered endpoint {}", self.endpoint);
            }
            Some(RegistrationInner::LocalSocket(mut handle)) => {
                handle.shutdown();
                info!("Unregistered endpoint {}", self.endpoint);
            }
            None => {}
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("endpoint", &self.endpoint)
            .field("active", &self.inner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protseq_round_trip() {
        for kind in [TransportKind::LocalSocket, TransportKind::InProcess] {
            assert_eq!(TransportKind::from_protseq(kind.protseq()), Some(kind));
        }
        assert_eq!(TransportKind::from_protseq("ncacn_ip_tcp"), None);
    }

    #[test]
    fn test_socket_path_uses_configured_dir() {
        let runtime = TransportRuntime::new().with_socket_dir("/tmp/callbridge-test");
        assert_eq!(
            runtime.socket_path("svc"),
            PathBuf::from("/tmp/callbridge-test/svc.sock")
        );
    }

    #[test]
    fn test_response_failure_has_no_output() {
        let (status, output) = Response::failure(StatusCode::INTERNAL_ERROR).into_parts();
        assert_eq!(status, StatusCode::INTERNAL_ERROR);
        assert!(output.is_none());
    }
}
