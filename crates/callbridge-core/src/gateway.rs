//! Client call path.
//!
//! [`invoke`] sends one request over a session and folds every outcome into a
//! single [`CallResult`]: the operation's own status, a transport fault, or a
//! panic inside the transport all end up as a status code. Reply bytes are
//! copied out of the transport buffer, which is released before the caller
//! sees the result.

use crate::binding::SessionHandle;
use crate::error::{BridgeError, Result};
use crate::fault::{self, TransportFault};
use crate::status::StatusCode;
use crate::PASS_AND_GET_STRING;
use tracing::{debug, warn};

/// Outcome of one call. A non-success status never carries output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    status: StatusCode,
    output: Option<Vec<u8>>,
    fault: Option<TransportFault>,
}

impl CallResult {
    pub fn success(output: Option<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::SUCCESS,
            output,
            fault: None,
        }
    }

    /// Explicit failure status from the operation.
    pub fn failure(status: StatusCode) -> Self {
        Self {
            status,
            output: None,
            fault: None,
        }
    }

    /// Failure raised by the transport.
    pub fn faulted(fault: TransportFault) -> Self {
        Self {
            status: fault.status(),
            output: None,
            fault: Some(fault),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The fault behind a non-success status, if the transport raised it.
    pub fn fault(&self) -> Option<&TransportFault> {
        self.fault.as_ref()
    }

    pub fn output(&self) -> Option<&[u8]> {
        self.output.as_deref()
    }

    pub fn into_output(self) -> Option<Vec<u8>> {
        self.output
    }

    pub fn into_result(self) -> std::result::Result<Option<Vec<u8>>, StatusCode> {
        if self.status.is_success() {
            Ok(self.output)
        } else {
            Err(self.status)
        }
    }

    /// Like [`CallResult::into_result`], keeping the fault detail.
    pub fn into_bridge_result(self) -> Result<Option<Vec<u8>>> {
        match (self.status.is_success(), self.fault) {
            (true, _) => Ok(self.output),
            (false, Some(fault)) => Err(BridgeError::TransportFault(fault)),
            (false, None) => Err(BridgeError::Status(self.status)),
        }
    }
}

/// Call `operation` on the session's service.
pub async fn invoke(session: &SessionHandle, operation: &str, request: &[u8]) -> CallResult {
    let transport = session.transport();
    let outcome = fault::intercept(transport.call(operation, request)).await;

    match outcome {
        Ok(response) => {
            let (status, output) = response.into_parts();
            if status.is_success() {
                // Copy out; dropping the buffer frees it in the transport domain.
                CallResult::success(output.map(|buffer| buffer.into_vec()))
            } else {
                debug!(
                    "Session {}: {} returned {}",
                    session.id(),
                    operation,
                    status
                );
                CallResult::failure(status)
            }
        }
        Err(fault) => {
            warn!(
                "Session {}: {} on {} faulted: {}",
                session.id(),
                operation,
                session.descriptor(),
                fault
            );
            CallResult::faulted(fault)
        }
    }
}

/// Send a string and get one back.
///
/// An empty result comes back as `""`.
pub async fn pass_and_get_string(session: &SessionHandle, input: &str) -> Result<String> {
    let output = invoke(session, PASS_AND_GET_STRING, input.as_bytes())
        .await
        .into_bridge_result()?;

    match output {
        None => Ok(String::new()),
        Some(bytes) => String::from_utf8(bytes).map_err(|e| BridgeError::Encoding {
            message: format!("reply is not valid UTF-8: {}", e),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_has_no_output() {
        let result = CallResult::failure(StatusCode::from_raw(5));
        assert!(!result.is_success());
        assert!(result.output().is_none());
        assert_eq!(result.clone().into_result(), Err(StatusCode::from_raw(5)));
        assert!(matches!(
            result.into_bridge_result(),
            Err(BridgeError::Status(_))
        ));
    }

    #[test]
    fn test_faulted_keeps_detail() {
        let result = CallResult::faulted(TransportFault::ServerUnavailable {
            endpoint: "svc".into(),
        });
        assert_eq!(result.status(), StatusCode::RPC_S_SERVER_UNAVAILABLE);
        assert!(result.fault().is_some());

        let err = result.into_bridge_result().unwrap_err();
        assert!(err.is_transport_fault());
    }

    #[test]
    fn test_success_without_output() {
        let result = CallResult::success(None);
        assert_eq!(result.into_result(), Ok(None));
    }
}
