//! Callbridge Core - call a named operation in another process or runtime.
//!
//! The caller binds to an endpoint, invokes an operation with a byte request,
//! and gets back a status code and an owned reply. The service side installs a
//! set of callbacks on a [`ServiceHost`]. In between, the bridge tracks which
//! allocator owns each buffer and folds transport faults, explicit statuses
//! and panics into one status-code channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use callbridge_core::{
//!     connect, gateway, CallbackSet, EndpointDescriptor, Payload, ServiceHost, TransportRuntime,
//!     PASS_AND_GET_STRING,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> callbridge_core::Result<()> {
//!     let runtime = Arc::new(TransportRuntime::new());
//!     let descriptor = EndpointDescriptor::inproc("demo")?;
//!
//!     let host = ServiceHost::new(runtime.clone(), descriptor.clone());
//!     host.initialize(CallbackSet::new().with(PASS_AND_GET_STRING, |input: &[u8]| {
//!         Ok(Some(Payload::Local(input.to_ascii_uppercase())))
//!     }))
//!     .await?;
//!
//!     let session = connect(&runtime, &descriptor)?;
//!     assert_eq!(gateway::pass_and_get_string(&session, "hi").await?, "HI");
//!
//!     host.terminate().await
//! }
//! ```

pub mod binding;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fault;
pub mod gateway;
pub mod service;
pub mod status;
pub mod transport;

// Re-export commonly used types
pub use binding::{connect, disconnect, EndpointDescriptor, SessionHandle};
pub use buffer::{
    AllocDomain, Allocator, CountingAllocator, HeapAllocator, OwnedBuffer, SharedAllocator,
    TransportBuffer,
};
pub use error::{BridgeError, Result};
pub use fault::TransportFault;
pub use gateway::{invoke, CallResult};
pub use service::{Callback, CallbackOutput, CallbackSet, Dispatcher, Payload, ServiceHost};
pub use status::StatusCode;
pub use transport::{TransportKind, TransportRuntime};

/// The one operation the bundled service surface exposes.
pub const PASS_AND_GET_STRING: &str = "pass_and_get_string";
