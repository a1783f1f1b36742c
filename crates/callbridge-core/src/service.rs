//! Service side of the bridge: callback sets, dispatch, and the host
//! lifecycle.
//!
//! A [`ServiceHost`] owns one callback slot. `initialize` registers the
//! endpoint and installs a [`CallbackSet`]; `terminate` unregisters and clears
//! it. Every inbound call goes through a [`Dispatcher`], which holds a read
//! guard on the slot for as long as the callback runs, so clearing the slot
//! waits for in-flight calls.
//!
//! A callback may terminate its own host. The endpoint is unregistered at
//! once and the slot is cleared as soon as that callback returns.

use crate::binding::EndpointDescriptor;
use crate::buffer::{OwnedBuffer, SharedAllocator, TransportBuffer};
use crate::error::{BridgeError, Result};
use crate::fault::{self, TransportFault};
use crate::status::StatusCode;
use crate::transport::{Registration, Response, TransportRuntime};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// What a callback hands back.
pub enum Payload {
    /// Bytes on the local heap.
    Local(Vec<u8>),
    /// Bytes owned by another allocator domain, typically a foreign runtime.
    Owned(OwnedBuffer<SharedAllocator>),
}

impl Payload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Local(bytes) => bytes,
            Payload::Owned(buffer) => buffer.as_slice(),
        }
    }

    /// Move the payload into the transport domain.
    ///
    /// A foreign buffer is copied and then freed through its own allocator.
    fn into_transport(self, allocator: &SharedAllocator) -> Result<TransportBuffer> {
        match self {
            Payload::Local(bytes) => TransportBuffer::copy_from(&bytes, allocator.clone()),
            Payload::Owned(buffer) => buffer.rehome(allocator.clone()),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Local(bytes)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Local(s.into_bytes())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Local(bytes) => write!(f, "Payload::Local({} bytes)", bytes.len()),
            Payload::Owned(buffer) => write!(f, "Payload::Owned({:?})", buffer),
        }
    }
}

/// Result of one callback invocation.
///
/// `Ok(None)` is a valid empty result. `Err` is an explicit status that
/// travels back to the caller unchanged.
pub type CallbackOutput = std::result::Result<Option<Payload>, StatusCode>;

/// A callback entry point.
pub type Callback = Arc<dyn Fn(&[u8]) -> CallbackOutput + Send + Sync>;

/// Operation name to callback mapping. Immutable once installed.
#[derive(Clone, Default)]
pub struct CallbackSet {
    callbacks: HashMap<String, Callback>,
}

impl CallbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`CallbackSet::insert`].
    pub fn with<F>(mut self, operation: &str, callback: F) -> Self
    where
        F: Fn(&[u8]) -> CallbackOutput + Send + Sync + 'static,
    {
        self.insert(operation, callback);
        self
    }

    /// Add or replace the callback for `operation`.
    pub fn insert<F>(&mut self, operation: &str, callback: F)
    where
        F: Fn(&[u8]) -> CallbackOutput + Send + Sync + 'static,
    {
        self.callbacks
            .insert(operation.to_string(), Arc::new(callback));
    }

    pub fn get(&self, operation: &str) -> Option<Callback> {
        self.callbacks.get(operation).cloned()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.callbacks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSet")
            .field("operations", &self.operations())
            .finish()
    }
}

type CallbackSlot = Arc<RwLock<Option<Arc<CallbackSet>>>>;

thread_local! {
    /// Slot whose callback is running on this thread, if any.
    static DISPATCHING: Cell<*const ()> = const { Cell::new(std::ptr::null()) };
}

fn slot_id(slot: &CallbackSlot) -> *const () {
    Arc::as_ptr(slot).cast()
}

/// Whether this thread is inside a callback dispatched from `slot`.
fn dispatching(slot: &CallbackSlot) -> bool {
    DISPATCHING.with(|current| current.get() == slot_id(slot))
}

/// Marks the current thread as running a callback from one slot.
struct DispatchMark {
    previous: *const (),
}

impl DispatchMark {
    fn enter(slot: &CallbackSlot) -> Self {
        let previous = DISPATCHING.with(|current| current.replace(slot_id(slot)));
        Self { previous }
    }
}

impl Drop for DispatchMark {
    fn drop(&mut self) {
        DISPATCHING.with(|current| current.set(self.previous));
    }
}

/// Routes inbound calls to the installed callback set.
pub struct Dispatcher {
    endpoint: String,
    slot: CallbackSlot,
    allocator: SharedAllocator,
}

impl Dispatcher {
    pub fn new(endpoint: &str, slot: CallbackSlot, allocator: SharedAllocator) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            slot,
            allocator,
        }
    }

    /// Dispatcher over a fixed callback set, outside any host.
    pub fn with_callbacks(endpoint: &str, callbacks: CallbackSet, allocator: SharedAllocator) -> Self {
        let slot = Arc::new(RwLock::new(Some(Arc::new(callbacks))));
        Self::new(endpoint, slot, allocator)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn allocator(&self) -> &SharedAllocator {
        &self.allocator
    }

    /// Run one inbound call.
    ///
    /// The callback borrows `request` in place and runs on a blocking worker.
    /// The slot stays read-locked until it returns. Its result is moved into
    /// the transport domain; a panic becomes `ERROR_INTERNAL_ERROR`.
    pub async fn dispatch(
        &self,
        operation: &str,
        request: TransportBuffer,
    ) -> std::result::Result<Response, TransportFault> {
        let guard = self.slot.clone().read_owned().await;
        let callbacks = match &*guard {
            Some(set) => set.clone(),
            None => {
                return Err(TransportFault::UnknownInterface {
                    endpoint: self.endpoint.clone(),
                })
            }
        };
        let callback = callbacks
            .get(operation)
            .ok_or_else(|| TransportFault::UnknownOperation {
                operation: operation.to_string(),
            })?;

        debug!(
            "Dispatching {} on {} ({} bytes)",
            operation,
            self.endpoint,
            request.len()
        );

        let allocator = self.allocator.clone();
        let operation = operation.to_string();
        let slot = self.slot.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let outcome = {
                let _mark = DispatchMark::enter(&slot);
                std::panic::catch_unwind(AssertUnwindSafe(|| callback(request.as_slice())))
            };
            drop(request);

            match outcome {
                Ok(Ok(None)) => Response::success(None),
                Ok(Ok(Some(payload))) => match payload.into_transport(&allocator) {
                    Ok(buffer) => Response::success(Some(buffer)),
                    Err(e) => {
                        warn!("Reply for {} not moved to transport: {}", operation, e);
                        Response::failure(e.status())
                    }
                },
                Ok(Err(status)) => Response::failure(status),
                Err(payload) => {
                    error!(
                        "Callback for {} panicked: {}",
                        operation,
                        fault::panic_message(payload.as_ref())
                    );
                    Response::failure(StatusCode::INTERNAL_ERROR)
                }
            }
        });

        task.await.map_err(|e| TransportFault::CallFailed {
            message: e.to_string(),
        })
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Hosts one service endpoint.
///
/// The callback slot lives here, not in process-wide state. At most one
/// callback set is installed at a time.
pub struct ServiceHost {
    runtime: Arc<TransportRuntime>,
    descriptor: EndpointDescriptor,
    slot: CallbackSlot,
    registration: Arc<Mutex<Option<Registration>>>,
}

impl ServiceHost {
    pub fn new(runtime: Arc<TransportRuntime>, descriptor: EndpointDescriptor) -> Self {
        Self {
            runtime,
            descriptor,
            slot: Arc::new(RwLock::new(None)),
            registration: Arc::new(Mutex::new(None)),
        }
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    /// Register the endpoint and install `callbacks`.
    ///
    /// The slot is write-locked across registration, so a call that arrives
    /// before the set is installed waits for it.
    ///
    /// Fails with `RPC_S_DUPLICATE_ENDPOINT` when called from inside one of
    /// this host's own callbacks, since that set is still installed until the
    /// callback returns.
    pub async fn initialize(&self, callbacks: CallbackSet) -> Result<()> {
        if dispatching(&self.slot) {
            return Err(BridgeError::Registration {
                status: StatusCode::RPC_S_DUPLICATE_ENDPOINT,
                message: format!("{} cannot be initialized from its own callback", self.descriptor),
            });
        }

        let mut registration = self.registration.lock().await;
        if registration.is_some() {
            return Err(BridgeError::Registration {
                status: StatusCode::RPC_S_DUPLICATE_ENDPOINT,
                message: format!("{} is already being served", self.descriptor),
            });
        }

        let mut slot = self.slot.write().await;
        let dispatcher = Arc::new(Dispatcher::new(
            self.descriptor.endpoint(),
            self.slot.clone(),
            self.runtime.allocator().clone(),
        ));
        let live = self.runtime.listen(&self.descriptor, dispatcher).await?;

        info!(
            "Serving {} with operations {:?}",
            self.descriptor,
            callbacks.operations()
        );
        *slot = Some(Arc::new(callbacks));
        *registration = Some(live);
        Ok(())
    }

    /// Unregister the endpoint and clear the callback set.
    ///
    /// Returns only after every dispatch that started under the old set has
    /// finished. No callback from that set runs afterwards.
    ///
    /// Called from inside one of this host's callbacks, it unregisters and
    /// returns without waiting: the calling callback still holds the slot.
    /// The slot is cleared once it returns, and a later `initialize` waits
    /// for that.
    pub async fn terminate(&self) -> Result<()> {
        let mut registration = self.registration.clone().lock_owned().await;
        let live = registration.take().ok_or_else(|| BridgeError::Registration {
            status: StatusCode::RPC_S_NOT_LISTENING,
            message: format!("{} is not being served", self.descriptor),
        })?;
        live.unregister();

        if dispatching(&self.slot) {
            debug!("Terminating {} from its own callback", self.descriptor);
            let slot = self.slot.clone();
            let descriptor = self.descriptor.clone();
            // Holds the registration lock until the slot is clear.
            tokio::spawn(async move {
                *slot.write().await = None;
                drop(registration);
                info!("Stopped serving {}", descriptor);
            });
            return Ok(());
        }

        let mut slot = self.slot.write().await;
        *slot = None;
        info!("Stopped serving {}", self.descriptor);
        Ok(())
    }

    /// Whether a callback set is installed.
    pub async fn is_serving(&self) -> bool {
        self.slot.read().await.is_some()
    }
}

impl fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHost")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
