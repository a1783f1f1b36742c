//! Same-process transport.
//!
//! A service hosted in this process registers its dispatcher under an
//! endpoint name. Clients look the name up on every call, marshal the request
//! into transport-owned scratch space and hand it to the dispatcher on a
//! tokio task. The reply buffer moves back to the caller without a copy; only
//! ownership changes hands.

use super::{Response, Transport, TransportKind};
use crate::buffer::{SharedAllocator, TransportBuffer};
use crate::error::{BridgeError, Result};
use crate::fault::TransportFault;
use crate::service::Dispatcher;
use crate::status::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Endpoint table for in-process services.
#[derive(Clone, Default)]
pub struct InprocRegistry {
    endpoints: Arc<Mutex<HashMap<String, Arc<Dispatcher>>>>,
}

impl InprocRegistry {
    /// Register a dispatcher. Fails if the endpoint is taken.
    pub fn register(&self, endpoint: &str, dispatcher: Arc<Dispatcher>) -> Result<()> {
        let mut endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(endpoint) {
            return Err(BridgeError::Registration {
                status: StatusCode::RPC_S_DUPLICATE_ENDPOINT,
                message: format!("endpoint {} is already registered", endpoint),
            });
        }
        endpoints.insert(endpoint.to_string(), dispatcher);
        debug!("Registered in-process endpoint {}", endpoint);
        Ok(())
    }

    /// Remove an endpoint. Returns whether it was registered.
    pub fn unregister(&self, endpoint: &str) -> bool {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint)
            .is_some()
    }

    pub fn lookup(&self, endpoint: &str) -> Option<Arc<Dispatcher>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
    }

    pub fn is_registered(&self, endpoint: &str) -> bool {
        self.lookup(endpoint).is_some()
    }
}

/// Client side of an in-process binding.
pub struct InprocTransport {
    registry: InprocRegistry,
    endpoint: String,
    allocator: SharedAllocator,
}

impl InprocTransport {
    pub fn new(registry: InprocRegistry, endpoint: &str, allocator: SharedAllocator) -> Self {
        Self {
            registry,
            endpoint: endpoint.to_string(),
            allocator,
        }
    }
}

#[async_trait::async_trait]
impl Transport for InprocTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    async fn call(
        &self,
        operation: &str,
        request: &[u8],
    ) -> std::result::Result<Response, TransportFault> {
        let dispatcher =
            self.registry
                .lookup(&self.endpoint)
                .ok_or_else(|| TransportFault::ServerUnavailable {
                    endpoint: self.endpoint.clone(),
                })?;

        // Marshal into codec-owned scratch space, as a wire transport would.
        let scratch = TransportBuffer::copy_from(request, self.allocator.clone()).map_err(|e| {
            TransportFault::from_status(StatusCode::RPC_S_OUT_OF_RESOURCES, e.to_string())
        })?;

        let operation = operation.to_string();
        let task = tokio::spawn(async move { dispatcher.dispatch(&operation, scratch).await });

        match task.await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => Err(TransportFault::Panicked {
                message: crate::fault::panic_message(join_err.into_panic().as_ref()),
            }),
            Err(join_err) => Err(TransportFault::CallFailed {
                message: join_err.to_string(),
            }),
        }
    }
}
