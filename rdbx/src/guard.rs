/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! Guards for crossing the boundary between native unwinding and the host's
//! non-local-jump error signaling, in both call directions.
//!
//! Outbound, [`guard_call`] establishes a recovery point around a call into
//! the host and translates a host-signaled error into a [`HostError`] after
//! the jump has been confined to the guard's own frame. The guarded closure
//! is that dedicated frame: it should capture only the call's arguments, so
//! the jump never unwinds caller-owned RAII state. Caller destructors run
//! through ordinary Rust unwinding or not at all.
//!
//! Inbound, [`inbound_guard`] wraps native code the host calls back into, so
//! that no native panic ever crosses the ABI boundary uncaught: panics are
//! translated into the host's own error-raising convention and re-raised in
//! the host's terms.
//!
//! A second error during error translation is fatal by design: it unwinds as
//! a [`DoubleFault`], which both guards propagate untranslated.

use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use tracing::debug;

use crate::error::HostError;
use crate::memcxt;
use crate::sys;

pub use crate::sys::DoubleFault;

/// Calls into the host, catching a host-signaled error and surfacing it as a
/// recoverable [`HostError`] whose message is exactly the host's.
///
/// The current-context stack is rebalanced before the error is returned, so a
/// failing host call never leaves it off by an entry. Panics that are not
/// host errors (including [`DoubleFault`]) resume unwinding untouched.
pub fn guard_call<R>(f: impl FnOnce() -> R) -> Result<R, HostError> {
    let depth = memcxt::stack_depth();
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            memcxt::unwind_stack_to(depth);
            match payload.downcast::<sys::ErrorData>() {
                Ok(err) => {
                    debug!(code = err.sqlerrcode, message = %err.message, "host error translated");
                    Err(HostError::from(*err))
                }
                Err(payload) => resume_unwind(payload),
            }
        }
    }
}

/// Wraps native code invoked by the host (e.g. a registered callback).
///
/// A normal return passes through. A host error already in the host's terms
/// (or a [`DoubleFault`]) resumes unwinding unchanged, letting the host's own
/// jump take over. Any other panic is translated and re-raised through the
/// host's error convention; the translation itself runs inside an
/// error-translation section, so a host error raised mid-translation
/// escalates to a fatal [`DoubleFault`].
pub fn inbound_guard<R>(f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            if payload.is::<sys::ErrorData>() || payload.is::<DoubleFault>() {
                resume_unwind(payload);
            }
            let err = sys::error_translation_scope(|| {
                sys::ErrorData::error(panic_message(payload.as_ref()))
            });
            sys::error_raise(err)
        }
    }
}

/// Raises `err` through the host's error convention. Control does not return.
pub fn raise(err: HostError) -> ! {
    sys::error_raise(sys::ErrorData::from(err))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "native code panicked".to_owned()
    }
}
