//! Machine-local transport.
//!
//! The server owns the endpoint file `<socket_dir>/<endpoint>.sock`, accepts
//! connections, and dispatches framed JSON-RPC calls (see
//! [`super::protocol`]). The client opens one connection per call.
//!
//! On Unix the endpoint file is a Unix domain socket. Elsewhere the server
//! listens on an OS-assigned loopback TCP port and the endpoint file holds
//! the port number.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task; callbacks run on the blocking pool via the dispatcher.

use super::protocol::{
    decode_payload, read_frame, write_frame, CallRequest, CallResponse,
};
use super::{Response, Transport, TransportKind};
use crate::buffer::SharedAllocator;
use crate::config::TransportConfig;
use crate::error::{BridgeError, Result};
use crate::fault::{self, TransportFault};
use crate::service::Dispatcher;
use crate::status::StatusCode;
use platform::{Listener, Stream};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

#[cfg(unix)]
mod platform {
    use std::io;
    use std::os::unix::fs::FileTypeExt;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    pub type Stream = UnixStream;

    pub struct Listener(UnixListener);

    impl Listener {
        pub async fn bind(path: &Path) -> io::Result<Self> {
            UnixListener::bind(path).map(Listener)
        }

        pub async fn accept(&self) -> io::Result<Stream> {
            self.0.accept().await.map(|(stream, _)| stream)
        }
    }

    pub async fn connect(path: &Path) -> io::Result<Stream> {
        UnixStream::connect(path).await
    }

    /// Whether `path` is something a server of ours could have left behind.
    pub fn is_endpoint_file(path: &Path) -> io::Result<bool> {
        Ok(std::fs::symlink_metadata(path)?.file_type().is_socket())
    }
}

#[cfg(not(unix))]
mod platform {
    use std::io;
    use std::net::Ipv4Addr;
    use std::path::Path;
    use tokio::net::{TcpListener, TcpStream};

    pub type Stream = TcpStream;

    pub struct Listener(TcpListener);

    impl Listener {
        pub async fn bind(path: &Path) -> io::Result<Self> {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
            let port = listener.local_addr()?.port();
            std::fs::write(path, port.to_string())?;
            Ok(Listener(listener))
        }

        pub async fn accept(&self) -> io::Result<Stream> {
            self.0.accept().await.map(|(stream, _)| stream)
        }
    }

    pub async fn connect(path: &Path) -> io::Result<Stream> {
        let port = read_port(path)?;
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await
    }

    pub fn is_endpoint_file(path: &Path) -> io::Result<bool> {
        match read_port(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_port(path: &Path) -> io::Result<u16> {
        std::fs::read_to_string(path)?
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Client side of an `ncalrpc` binding.
pub struct SocketTransport {
    path: PathBuf,
    endpoint: String,
    allocator: SharedAllocator,
    next_id: AtomicU64,
}

impl SocketTransport {
    /// Performs no I/O; the socket is opened per call.
    pub fn new(path: PathBuf, endpoint: &str, allocator: SharedAllocator) -> Self {
        Self {
            path,
            endpoint: endpoint.to_string(),
            allocator,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> std::result::Result<Stream, TransportFault> {
        let unavailable = || TransportFault::ServerUnavailable {
            endpoint: self.endpoint.clone(),
        };

        tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, platform::connect(&self.path))
            .await
            .map_err(|_| unavailable())?
            .map_err(|e| {
                debug!("Connect to {} failed: {}", self.path.display(), e);
                unavailable()
            })
    }
}

impl fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketTransport")
            .field("path", &self.path)
            .field("endpoint", &self.endpoint)
            .field("allocator", &self.allocator.domain())
            .finish()
    }
}

#[async_trait::async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalSocket
    }

    async fn call(
        &self,
        operation: &str,
        request: &[u8],
    ) -> std::result::Result<Response, TransportFault> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = CallRequest::new(operation, request, id);
        let request_bytes = serde_json::to_vec(&request).map_err(|e| TransportFault::Protocol {
            message: format!("cannot encode request: {}", e),
        })?;

        let mut stream = self.open().await?;
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, &request_bytes).await?;
        let response_bytes = read_frame(&mut reader)
            .await?
            .ok_or_else(|| TransportFault::CallFailed {
                message: "connection closed before reply".to_string(),
            })?;

        let response: CallResponse =
            serde_json::from_slice(&response_bytes).map_err(|e| TransportFault::Protocol {
                message: format!("cannot parse reply: {}", e),
            })?;

        if response.id.is_some_and(|reply_id| reply_id != id) {
            return Err(TransportFault::Protocol {
                message: format!("reply id {:?} does not match request {}", response.id, id),
            });
        }

        if let Some(err) = response.error {
            return Err(TransportFault::from_status(
                StatusCode::from_raw(err.code),
                err.message,
            ));
        }

        let reply = response.result.ok_or_else(|| TransportFault::Protocol {
            message: "reply has neither result nor error".to_string(),
        })?;
        let status = StatusCode::from_raw(reply.status);
        if !status.is_success() {
            return Ok(Response::failure(status));
        }

        let output = match reply.payload {
            Some(hex_payload) => Some(decode_payload(&hex_payload, &self.allocator)?),
            None => None,
        };
        Ok(Response::success(output))
    }
}

/// Handle to a running socket server. Dropping shuts it down.
pub struct SocketServerHandle {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SocketServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting connections and remove the socket file.
    ///
    /// Open connections finish the call they are serving, then close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            if let Err(e) = std::fs::remove_file(&self.path) {
                debug!("Socket {} not removed: {}", self.path.display(), e);
            }
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for SocketServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Local socket server for one endpoint.
pub struct SocketServer;

impl SocketServer {
    /// Bind `path` and serve `dispatcher` in background tasks.
    ///
    /// Fails with `RPC_S_DUPLICATE_ENDPOINT` when another server is already
    /// answering at `path`. A stale endpoint file is replaced; any other file
    /// at `path` is left alone and the registration fails.
    pub async fn start(path: PathBuf, dispatcher: Arc<Dispatcher>) -> Result<SocketServerHandle> {
        Self::start_with_limit(path, dispatcher, TransportConfig::MAX_CONNECTIONS).await
    }

    /// [`SocketServer::start`] with an explicit cap on open connections.
    /// Connections over the cap get `RPC_S_SERVER_TOO_BUSY`.
    pub async fn start_with_limit(
        path: PathBuf,
        dispatcher: Arc<Dispatcher>,
        max_connections: usize,
    ) -> Result<SocketServerHandle> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            if !platform::is_endpoint_file(&path)? {
                return Err(BridgeError::Registration {
                    status: StatusCode::RPC_S_DUPLICATE_ENDPOINT,
                    message: format!("{} exists and is not an endpoint", path.display()),
                });
            }
            if platform::connect(&path).await.is_ok() {
                return Err(BridgeError::Registration {
                    status: StatusCode::RPC_S_DUPLICATE_ENDPOINT,
                    message: format!("a server is already listening at {}", path.display()),
                });
            }
            warn!("Removing stale endpoint {}", path.display());
            std::fs::remove_file(&path)?;
        }

        let listener = Listener::bind(&path).await.map_err(|e| BridgeError::Registration {
            status: StatusCode::RPC_S_OUT_OF_RESOURCES,
            message: format!("cannot bind {}: {}", path.display(), e),
        })?;
        info!("Socket server listening on {}", path.display());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatcher,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
            max_connections,
        ));

        Ok(SocketServerHandle {
            path,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: Listener,
        dispatcher: Arc<Dispatcher>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
        max_connections: usize,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Socket server for {} shutting down", dispatcher.endpoint());
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(stream) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= max_connections {
                                warn!(
                                    "Rejecting connection to {}: at max capacity ({})",
                                    dispatcher.endpoint(),
                                    max_connections
                                );
                                tokio::spawn(Self::reject_busy(stream));
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatcher = dispatcher.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                if let Err(fault) = Self::handle_connection(stream, &dispatcher, &mut conn_shutdown).await {
                                    debug!("Connection to {} ended: {}", dispatcher.endpoint(), fault);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Socket accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn reject_busy(mut stream: Stream) {
        let (mut reader, mut writer) = stream.split();
        if let Ok(Some(_)) = read_frame(&mut reader).await {
            let response = CallResponse::fault(None, &TransportFault::ServerTooBusy);
            if let Ok(bytes) = serde_json::to_vec(&response) {
                let _ = write_frame(&mut writer, &bytes).await;
            }
        }
    }

    async fn handle_connection(
        mut stream: Stream,
        dispatcher: &Dispatcher,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), TransportFault> {
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let response = Self::process_request(&frame, dispatcher).await;
            let response_bytes = serde_json::to_vec(&response).map_err(|e| TransportFault::Protocol {
                message: format!("cannot encode reply: {}", e),
            })?;
            write_frame(&mut writer, &response_bytes).await?;
        }
    }

    async fn process_request(frame: &[u8], dispatcher: &Dispatcher) -> CallResponse {
        let request: CallRequest = match serde_json::from_slice(frame) {
            Ok(req) => req,
            Err(e) => {
                return CallResponse::fault(
                    None,
                    &TransportFault::Protocol {
                        message: format!("parse error: {}", e),
                    },
                );
            }
        };

        if request.jsonrpc != "2.0" {
            return CallResponse::fault(
                Some(request.id),
                &TransportFault::Protocol {
                    message: "expected jsonrpc 2.0".to_string(),
                },
            );
        }

        let scratch = match decode_payload(&request.params.payload, dispatcher.allocator()) {
            Ok(buffer) => buffer,
            Err(fault) => return CallResponse::fault(Some(request.id), &fault),
        };

        match fault::intercept(dispatcher.dispatch(&request.method, scratch)).await {
            Ok(response) => {
                let (status, output) = response.into_parts();
                CallResponse::reply(request.id, status, output.as_ref().map(|b| b.as_slice()))
            }
            Err(fault) => CallResponse::fault(Some(request.id), &fault),
        }
    }
}
