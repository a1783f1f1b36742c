//! Status codes shared by every side of the bridge.
//!
//! The status domain is the Win32/RPC system error code space: `0` is success
//! and every other value names a failure. Explicit failures returned by a
//! callback, faults raised by the transport and local errors all end up as one
//! of these values, so a caller only ever checks one channel.

use std::fmt;

/// A status code in the system error code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StatusCode(u32);

impl StatusCode {
    pub const SUCCESS: StatusCode = StatusCode(0);
    pub const NOT_ENOUGH_MEMORY: StatusCode = StatusCode(8);
    pub const INVALID_PARAMETER: StatusCode = StatusCode(87);
    pub const NO_UNICODE_TRANSLATION: StatusCode = StatusCode(1113);
    pub const INTERNAL_ERROR: StatusCode = StatusCode(1359);

    // RPC runtime codes
    pub const RPC_S_INVALID_STRING_BINDING: StatusCode = StatusCode(1700);
    pub const RPC_S_PROTSEQ_NOT_SUPPORTED: StatusCode = StatusCode(1703);
    pub const RPC_S_INVALID_ENDPOINT_FORMAT: StatusCode = StatusCode(1706);
    pub const RPC_S_NOT_LISTENING: StatusCode = StatusCode(1715);
    pub const RPC_S_UNKNOWN_IF: StatusCode = StatusCode(1717);
    pub const RPC_S_OUT_OF_RESOURCES: StatusCode = StatusCode(1721);
    pub const RPC_S_SERVER_UNAVAILABLE: StatusCode = StatusCode(1722);
    pub const RPC_S_SERVER_TOO_BUSY: StatusCode = StatusCode(1723);
    pub const RPC_S_CALL_FAILED: StatusCode = StatusCode(1726);
    pub const RPC_S_PROTOCOL_ERROR: StatusCode = StatusCode(1728);
    pub const RPC_S_DUPLICATE_ENDPOINT: StatusCode = StatusCode(1740);
    pub const RPC_S_PROCNUM_OUT_OF_RANGE: StatusCode = StatusCode(1745);
    pub const RPC_S_INTERNAL_ERROR: StatusCode = StatusCode(1766);
    pub const RPC_X_BAD_STUB_DATA: StatusCode = StatusCode(1783);

    /// Wrap a raw code received from the wire or a foreign caller.
    pub const fn from_raw(code: u32) -> Self {
        StatusCode(code)
    }

    /// The raw numeric code.
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Convert into a `Result`, treating any non-zero code as the error.
    pub fn into_result(self) -> Result<(), StatusCode> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Short symbolic name for the codes the bridge produces itself.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            StatusCode::SUCCESS => "ERROR_SUCCESS",
            StatusCode::NOT_ENOUGH_MEMORY => "ERROR_NOT_ENOUGH_MEMORY",
            StatusCode::INVALID_PARAMETER => "ERROR_INVALID_PARAMETER",
            StatusCode::NO_UNICODE_TRANSLATION => "ERROR_NO_UNICODE_TRANSLATION",
            StatusCode::INTERNAL_ERROR => "ERROR_INTERNAL_ERROR",
            StatusCode::RPC_S_INVALID_STRING_BINDING => "RPC_S_INVALID_STRING_BINDING",
            StatusCode::RPC_S_PROTSEQ_NOT_SUPPORTED => "RPC_S_PROTSEQ_NOT_SUPPORTED",
            StatusCode::RPC_S_INVALID_ENDPOINT_FORMAT => "RPC_S_INVALID_ENDPOINT_FORMAT",
            StatusCode::RPC_S_NOT_LISTENING => "RPC_S_NOT_LISTENING",
            StatusCode::RPC_S_UNKNOWN_IF => "RPC_S_UNKNOWN_IF",
            StatusCode::RPC_S_OUT_OF_RESOURCES => "RPC_S_OUT_OF_RESOURCES",
            StatusCode::RPC_S_SERVER_UNAVAILABLE => "RPC_S_SERVER_UNAVAILABLE",
            StatusCode::RPC_S_SERVER_TOO_BUSY => "RPC_S_SERVER_TOO_BUSY",
            StatusCode::RPC_S_CALL_FAILED => "RPC_S_CALL_FAILED",
            StatusCode::RPC_S_PROTOCOL_ERROR => "RPC_S_PROTOCOL_ERROR",
            StatusCode::RPC_S_DUPLICATE_ENDPOINT => "RPC_S_DUPLICATE_ENDPOINT",
            StatusCode::RPC_S_PROCNUM_OUT_OF_RANGE => "RPC_S_PROCNUM_OUT_OF_RANGE",
            StatusCode::RPC_S_INTERNAL_ERROR => "RPC_S_INTERNAL_ERROR",
            StatusCode::RPC_X_BAD_STUB_DATA => "RPC_X_BAD_STUB_DATA",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

impl From<u32> for StatusCode {
    fn from(code: u32) -> Self {
        StatusCode(code)
    }
}

impl From<StatusCode> for u32 {
    fn from(status: StatusCode) -> Self {
        status.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_zero() {
        assert!(StatusCode::SUCCESS.is_success());
        assert_eq!(StatusCode::default(), StatusCode::SUCCESS);
        assert!(StatusCode::SUCCESS.into_result().is_ok());
    }

    #[test]
    fn test_failure_into_result() {
        let err = StatusCode::RPC_S_SERVER_UNAVAILABLE.into_result().unwrap_err();
        assert_eq!(err.raw(), 1722);
    }

    #[test]
    fn test_display_named_and_unnamed() {
        assert_eq!(
            StatusCode::RPC_S_UNKNOWN_IF.to_string(),
            "RPC_S_UNKNOWN_IF (1717)"
        );
        assert_eq!(StatusCode::from_raw(42).to_string(), "status 42");
    }
}
