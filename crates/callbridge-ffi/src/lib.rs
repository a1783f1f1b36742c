//! C ABI exports for callbridge.
//!
//! Loaded as a shared library by a host runtime (for example a managed
//! application). The same library serves both roles:
//!
//! - **Service**: `server_initialize` registers the configured endpoint and
//!   routes `pass_and_get_string` calls to the supplied callbacks;
//!   `server_terminate` stops serving.
//! - **Client**: `pass_and_get_string` / `pass_and_get_string_out` connect to
//!   the endpoint, make one call, and disconnect.
//!
//! The endpoint defaults to `ncalrpc:[playground_server]` and can be
//! overridden with `CALLBRIDGE_BINDING`.
//!
//! Strings returned by this library are allocated with the task allocator
//! (`CoTaskMemAlloc` on Windows, `malloc` elsewhere) so a managed marshaller
//! can free them; `callbridge_free_string` does the same. Failures never
//! unwind into the caller: exports return `false` or null, and the reason is
//! available from `callbridge_last_error` on the same thread.

#![allow(unsafe_code)]

pub mod context;
pub mod foreign;

use callbridge_core::fault::{self, export_boundary};
use callbridge_core::{
    connect, gateway, BridgeError, CallbackOutput, CallbackSet, Payload, Result, SharedAllocator,
    StatusCode, PASS_AND_GET_STRING,
};
use std::ffi::{c_char, CStr, CString};
use std::ptr;

/// Callback returning a foreign-allocated string, or null for an empty result.
pub type PassAndGetStringFn = unsafe extern "C" fn(input: *const c_char) -> *mut c_char;

/// Callback writing a foreign-allocated string (or null) through `output`.
pub type PassAndGetStringOutFn =
    unsafe extern "C" fn(input: *const c_char, output: *mut *mut c_char);

/// Callbacks supplied by the hosting runtime.
///
/// When `pass_and_get_string` is null, `pass_and_get_string_out` is used.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Callbacks {
    pub pass_and_get_string: Option<PassAndGetStringFn>,
    pub pass_and_get_string_out: Option<PassAndGetStringOutFn>,
}

#[derive(Clone, Copy)]
enum ForeignCall {
    Returning(PassAndGetStringFn),
    OutParam(PassAndGetStringOutFn),
}

impl ForeignCall {
    fn call(self, input: &[u8], foreign: &SharedAllocator) -> CallbackOutput {
        let input = CString::new(input).map_err(|_| StatusCode::INVALID_PARAMETER)?;

        let raw = match self {
            // SAFETY: the host keeps the callback alive until
            // `server_terminate` returns; `input` outlives the call.
            ForeignCall::Returning(f) => unsafe { f(input.as_ptr()) },
            ForeignCall::OutParam(f) => {
                let mut out: *mut c_char = ptr::null_mut();
                // SAFETY: as above; `out` is a valid place to write a pointer.
                unsafe { f(input.as_ptr(), &mut out) };
                out
            }
        };

        // SAFETY: the callback contract says the result is null or a string
        // from the foreign allocator, handed over to us.
        let adopted = unsafe { foreign::adopt_string(raw, foreign.clone()) };
        Ok(adopted.map(Payload::Owned))
    }
}

fn callback_set(callbacks: &Callbacks, foreign: SharedAllocator) -> Result<CallbackSet> {
    let call = match (callbacks.pass_and_get_string, callbacks.pass_and_get_string_out) {
        (Some(f), _) => ForeignCall::Returning(f),
        (None, Some(f)) => ForeignCall::OutParam(f),
        (None, None) => {
            return Err(BridgeError::InvalidArgument {
                message: "no pass_and_get_string callback supplied".to_string(),
            })
        }
    };

    Ok(CallbackSet::new().with(PASS_AND_GET_STRING, move |input: &[u8]| {
        call.call(input, &foreign)
    }))
}

fn input_str<'a>(ptr: *const c_char) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(BridgeError::InvalidArgument {
            message: "input string is null".to_string(),
        });
    }
    // SAFETY: the caller passes a valid NUL-terminated string that stays
    // alive for the duration of the export call.
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|e| BridgeError::Encoding {
            message: format!("input is not valid UTF-8: {}", e),
        })
}

fn call_service(input: *const c_char) -> Result<*mut c_char> {
    let input = input_str(input)?;
    let ctx = context::context()?;
    let output = ctx.runtime().block_on(async {
        let session = connect(ctx.transport(), ctx.descriptor())?;
        gateway::pass_and_get_string(&session, input).await
    })?;
    foreign::alloc_string(&output, ctx.foreign())
}

/// Start serving the configured endpoint with `callbacks`.
///
/// Returns `false` if the endpoint is already served or cannot be registered.
///
/// # Safety
///
/// The function pointers in `callbacks` must stay valid, and whatever they
/// reference on the host side must stay alive, from this call until
/// `server_terminate` returns. The bridge cannot detect a callback that was
/// reclaimed early.
#[no_mangle]
pub unsafe extern "C" fn server_initialize(callbacks: Callbacks) -> bool {
    export_boundary("server_initialize", false, || {
        let ctx = context::context()?;
        let set = callback_set(&callbacks, ctx.foreign().clone())?;
        ctx.runtime().block_on(ctx.host().initialize(set))?;
        Ok(true)
    })
}

/// Stop serving and drop the callbacks.
///
/// Waits for calls already inside a callback to finish. Returns `false` if
/// nothing was being served.
///
/// May be called from inside a callback. The endpoint stops accepting calls
/// at once and the call returns without waiting; the callbacks are dropped
/// when the calling callback returns. A `server_initialize` made from inside
/// that callback fails.
#[no_mangle]
pub extern "C" fn server_terminate() -> bool {
    export_boundary("server_terminate", false, || {
        let ctx = context::context()?;
        ctx.runtime().block_on(ctx.host().terminate())?;
        Ok(true)
    })
}

/// Call the service with `input` and return its reply.
///
/// Returns a string to be freed with `callbridge_free_string` (or the task
/// allocator), or null on failure.
///
/// # Safety
///
/// `input` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn pass_and_get_string(input: *const c_char) -> *mut c_char {
    export_boundary("pass_and_get_string", ptr::null_mut(), || call_service(input))
}

/// Out-parameter form of [`pass_and_get_string`]. `*output` is set to null on
/// failure.
///
/// # Safety
///
/// `input` must be null or a valid NUL-terminated string; `output` must be null
/// or valid for a pointer write.
#[no_mangle]
pub unsafe extern "C" fn pass_and_get_string_out(input: *const c_char, output: *mut *mut c_char) {
    let result = export_boundary("pass_and_get_string_out", ptr::null_mut(), || {
        if output.is_null() {
            return Err(BridgeError::InvalidArgument {
                message: "output pointer is null".to_string(),
            });
        }
        call_service(input)
    });

    if !output.is_null() {
        // SAFETY: checked non-null; the caller guarantees it is writable.
        unsafe { *output = result };
    }
}

/// The calling thread's last failure message, or null.
///
/// Cleared by the next export on this thread that succeeds.
///
/// Free the result with `callbridge_free_string`.
#[no_mangle]
pub extern "C" fn callbridge_last_error() -> *mut c_char {
    let Some(message) = fault::last_error() else {
        return ptr::null_mut();
    };
    let allocator = foreign::CoTaskMemAllocator::shared();
    foreign::alloc_string(&message, &allocator).unwrap_or(ptr::null_mut())
}

/// Free a string returned by this library. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a string returned by this library that has not been
/// freed yet.
#[no_mangle]
pub unsafe extern "C" fn callbridge_free_string(ptr: *mut c_char) {
    // SAFETY: upheld by the caller.
    unsafe { foreign::free_string(ptr) }
}
