//! Fault interception and boundary translation.
//!
//! Three failure representations meet here:
//!
//! - **Explicit status**: a [`StatusCode`] returned by the callback or the
//!   dispatch logic. Passed through unchanged.
//! - **Transport fault**: raised by the transport outside the normal return
//!   channel, including panics inside the transport or codec. Stopped by
//!   [`intercept`] and mapped 1:1 onto the status domain.
//! - **Local exception**: a [`BridgeError`](crate::error::BridgeError) or panic inside the bridge's own
//!   logic. Stopped by [`export_boundary`] at the library export and turned
//!   into a fallback value plus a diagnostic.

use crate::error::Result;
use crate::status::StatusCode;
use futures::FutureExt;
use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tracing::error;

/// A failure signalled by the transport rather than by the remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFault {
    #[error("no server is listening at endpoint {endpoint}")]
    ServerUnavailable { endpoint: String },

    #[error("no interface is registered at endpoint {endpoint}")]
    UnknownInterface { endpoint: String },

    #[error("operation {operation} is not implemented by the service")]
    UnknownOperation { operation: String },

    #[error("call failed: {message}")]
    CallFailed { message: String },

    #[error("protocol violation: {message}")]
    Protocol { message: String },

    #[error("server is too busy to accept the call")]
    ServerTooBusy,

    #[error("transport panicked: {message}")]
    Panicked { message: String },

    #[error("remote fault {status}: {message}")]
    Remote { status: StatusCode, message: String },
}

impl TransportFault {
    /// Map onto the status code domain.
    pub fn status(&self) -> StatusCode {
        match self {
            TransportFault::ServerUnavailable { .. } => StatusCode::RPC_S_SERVER_UNAVAILABLE,
            TransportFault::UnknownInterface { .. } => StatusCode::RPC_S_UNKNOWN_IF,
            TransportFault::UnknownOperation { .. } => StatusCode::RPC_S_PROCNUM_OUT_OF_RANGE,
            TransportFault::CallFailed { .. } => StatusCode::RPC_S_CALL_FAILED,
            TransportFault::Protocol { .. } => StatusCode::RPC_S_PROTOCOL_ERROR,
            TransportFault::ServerTooBusy => StatusCode::RPC_S_SERVER_TOO_BUSY,
            TransportFault::Panicked { .. } => StatusCode::RPC_S_INTERNAL_ERROR,
            TransportFault::Remote { status, .. } => *status,
        }
    }

    /// Rebuild a fault from a status code received on the wire.
    ///
    /// Endpoint and operation names do not travel with the code, so the
    /// message stands in for them.
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            StatusCode::RPC_S_SERVER_UNAVAILABLE => {
                TransportFault::ServerUnavailable { endpoint: message }
            }
            StatusCode::RPC_S_UNKNOWN_IF => TransportFault::UnknownInterface { endpoint: message },
            StatusCode::RPC_S_PROCNUM_OUT_OF_RANGE => {
                TransportFault::UnknownOperation { operation: message }
            }
            StatusCode::RPC_S_CALL_FAILED => TransportFault::CallFailed { message },
            StatusCode::RPC_S_PROTOCOL_ERROR => TransportFault::Protocol { message },
            StatusCode::RPC_S_SERVER_TOO_BUSY => TransportFault::ServerTooBusy,
            StatusCode::RPC_S_INTERNAL_ERROR => TransportFault::Panicked { message },
            status => TransportFault::Remote { status, message },
        }
    }
}

/// Run a transport call and stop every fault at this frame.
///
/// Panics raised while the call is polled are caught here and reported as
/// [`TransportFault::Panicked`]. The body is a single match on the caught
/// outcome; no other code runs between the fault and its interception.
pub async fn intercept<F, T>(call: F) -> std::result::Result<T, TransportFault>
where
    F: Future<Output = std::result::Result<T, TransportFault>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(TransportFault::Panicked {
            message: panic_message(payload.as_ref()),
        }),
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Run the body of a library export.
///
/// Errors and panics never leave this function: they are logged, recorded as
/// the calling thread's last error, and replaced by `fallback`. A successful
/// export clears the last error.
pub fn export_boundary<T>(name: &str, fallback: T, body: impl FnOnce() -> Result<T>) -> T {
    let diagnostic = match std::panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => {
            take_last_error();
            return value;
        }
        Ok(Err(err)) => format!("{} failed: {}", name, err),
        Err(payload) => format!("{} panicked: {}", name, panic_message(payload.as_ref())),
    };

    error!("{}", diagnostic);
    set_last_error(diagnostic);
    fallback
}

/// The calling thread's most recent boundary diagnostic.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Take and clear the calling thread's most recent boundary diagnostic.
pub fn take_last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

fn set_last_error(message: String) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[test]
    fn test_fault_status_round_trip() {
        for fault in [
            TransportFault::ServerUnavailable {
                endpoint: "svc".into(),
            },
            TransportFault::UnknownInterface {
                endpoint: "svc".into(),
            },
            TransportFault::UnknownOperation {
                operation: "op".into(),
            },
            TransportFault::CallFailed {
                message: "eof".into(),
            },
            TransportFault::Protocol {
                message: "bad".into(),
            },
            TransportFault::ServerTooBusy,
        ] {
            let rebuilt = TransportFault::from_status(fault.status(), "x");
            assert_eq!(rebuilt.status(), fault.status());
        }
    }

    #[test]
    fn test_unknown_code_is_remote() {
        let fault = TransportFault::from_status(StatusCode::from_raw(31), "gen failure");
        assert_eq!(fault.status().raw(), 31);
        assert!(matches!(fault, TransportFault::Remote { .. }));
    }

    #[tokio::test]
    async fn test_intercept_passes_success_and_faults() {
        let ok: std::result::Result<u32, TransportFault> = intercept(async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let fault = intercept(async {
            Err::<u32, _>(TransportFault::ServerUnavailable {
                endpoint: "svc".into(),
            })
        })
        .await
        .unwrap_err();
        assert_eq!(fault.status(), StatusCode::RPC_S_SERVER_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_intercept_stops_panics() {
        let fault = intercept(async {
            if true {
                panic!("codec exploded");
            }
            Ok::<u32, TransportFault>(0)
        })
        .await
        .unwrap_err();

        assert_eq!(fault.status(), StatusCode::RPC_S_INTERNAL_ERROR);
        assert!(fault.to_string().contains("codec exploded"));
    }

    #[test]
    fn test_export_boundary_converts_errors() {
        take_last_error();
        let ok = export_boundary("ok_export", false, || Ok(true));
        assert!(ok);
        assert!(last_error().is_none());

        let failed = export_boundary("failing_export", false, || {
            Err(BridgeError::InvalidArgument {
                message: "null pointer".into(),
            })
        });
        assert!(!failed);
        let diagnostic = take_last_error().unwrap();
        assert!(diagnostic.contains("failing_export"));
        assert!(diagnostic.contains("null pointer"));
    }

    #[test]
    fn test_export_boundary_success_clears_last_error() {
        let failed = export_boundary("stopping_export", false, || {
            Err(BridgeError::Registration {
                status: StatusCode::RPC_S_NOT_LISTENING,
                message: "not served".into(),
            })
        });
        assert!(!failed);
        assert!(last_error().is_some());

        assert!(export_boundary("starting_export", false, || Ok(true)));
        assert_eq!(last_error(), None);
    }

    #[test]
    fn test_export_boundary_converts_panics() {
        let value = export_boundary("panicking_export", -1, || -> Result<i32> {
            panic!("boom");
        });
        assert_eq!(value, -1);
        assert!(take_last_error().unwrap().contains("boom"));
    }
}
