//! Process-wide state behind the C exports.
//!
//! The C ABI carries no context parameter, so the exports share one lazily
//! built context: a tokio runtime that drives the async core, the transport
//! runtime, and the service host for the configured binding.

use crate::foreign::CoTaskMemAllocator;
use callbridge_core::config::{EndpointConfig, LoggingConfig};
use callbridge_core::{
    BridgeError, EndpointDescriptor, Result, ServiceHost, SharedAllocator, TransportRuntime,
};
use std::sync::{Arc, Once, OnceLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

static CONTEXT: OnceLock<BridgeContext> = OnceLock::new();

pub struct BridgeContext {
    runtime: tokio::runtime::Runtime,
    transport: Arc<TransportRuntime>,
    descriptor: EndpointDescriptor,
    host: ServiceHost,
    foreign: SharedAllocator,
}

impl BridgeContext {
    fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("callbridge")
            .build()
            .map_err(|e| BridgeError::Runtime {
                message: format!("cannot start async runtime: {}", e),
            })?;

        let descriptor = configured_descriptor()?;
        let transport = Arc::new(TransportRuntime::new());
        let host = ServiceHost::new(transport.clone(), descriptor.clone());

        info!(
            "callbridge context ready for {} (sockets in {})",
            descriptor,
            transport.socket_dir().display()
        );

        Ok(Self {
            runtime,
            transport,
            descriptor,
            host,
            foreign: CoTaskMemAllocator::shared(),
        })
    }

    pub fn runtime(&self) -> &tokio::runtime::Runtime {
        &self.runtime
    }

    pub fn transport(&self) -> &TransportRuntime {
        &self.transport
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn host(&self) -> &ServiceHost {
        &self.host
    }

    pub fn foreign(&self) -> &SharedAllocator {
        &self.foreign
    }
}

/// The shared context, built on first use.
pub fn context() -> Result<&'static BridgeContext> {
    init_tracing();
    if let Some(ctx) = CONTEXT.get() {
        return Ok(ctx);
    }
    let ctx = BridgeContext::new()?;
    Ok(CONTEXT.get_or_init(|| ctx))
}

fn configured_descriptor() -> Result<EndpointDescriptor> {
    match std::env::var(EndpointConfig::BINDING_ENV) {
        Ok(binding) if !binding.is_empty() => EndpointDescriptor::parse(&binding),
        Ok(_) => Ok(EndpointDescriptor::default()),
        Err(std::env::VarError::NotPresent) => Ok(EndpointDescriptor::default()),
        Err(e) => {
            warn!("Ignoring {}: {}", EndpointConfig::BINDING_ENV, e);
            Ok(EndpointDescriptor::default())
        }
    }
}

/// Install a stderr subscriber unless the embedding process already has one.
fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LoggingConfig::FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(LoggingConfig::DEFAULT_DIRECTIVE));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    });
}
