/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! The host's error-raise jump.
//!
//! On a real engine an internal error performs a `siglongjmp` out of the
//! current call stack, bypassing every native destructor in between. A
//! `sigsetjmp`-based FFI boundary catches that jump and converts it into a
//! Rust unwind so destructors get to run; the embedded host raises the unwind
//! directly, carrying the same [`ErrorData`] payload that boundary would have
//! copied out of the host's error state.

use std::cell::Cell;

/// Host error severity levels, numbered as the host numbers them.
pub mod elevel {
    pub const DEBUG: i32 = 10;
    pub const LOG: i32 = 15;
    pub const NOTICE: i32 = 18;
    pub const WARNING: i32 = 19;
    pub const ERROR: i32 = 21;
    pub const FATAL: i32 = 22;
    pub const PANIC: i32 = 23;
}

/// Payload of one host-raised error: severity, error code, message, and an
/// optional detail line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorData {
    pub elevel: i32,
    pub sqlerrcode: i32,
    pub message: String,
    pub detail: Option<String>,
}

impl ErrorData {
    /// An `ERROR`-level payload with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        ErrorData { elevel: elevel::ERROR, sqlerrcode: 0, message: message.into(), detail: None }
    }

    pub fn with_code(mut self, sqlerrcode: i32) -> Self {
        self.sqlerrcode = sqlerrcode;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Marker payload for an error raised while another error was being
/// translated. It is fatal to the enclosing unit of work: guards propagate it
/// untranslated, and nothing may convert it into a recoverable error.
#[derive(Debug)]
pub struct DoubleFault;

thread_local! {
    static IN_ERROR_TRANSLATION: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current call chain is inside an error-translation section.
pub fn in_error_translation() -> bool {
    IN_ERROR_TRANSLATION.with(|flag| flag.get())
}

/// Runs `f` as an error-translation section.
///
/// Any host error raised while the section is active escalates to a
/// [`DoubleFault`] instead of unwinding as an ordinary recoverable error. The
/// section flag is restored on every exit path, including unwinding.
pub fn error_translation_scope<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(bool);
    impl Drop for Restore {
        fn drop(&mut self) {
            IN_ERROR_TRANSLATION.with(|flag| flag.set(self.0));
        }
    }

    let previous = IN_ERROR_TRANSLATION.with(|flag| flag.replace(true));
    let _restore = Restore(previous);
    f()
}

/// Raises a host error: control leaves through the host's non-local jump and
/// does not return.
///
/// A raise inside an error-translation section means error handling itself
/// has failed; that escalates to [`DoubleFault`].
pub fn error_raise(err: ErrorData) -> ! {
    if in_error_translation() {
        tracing::error!(
            message = %err.message,
            code = err.sqlerrcode,
            "host error raised while translating another error; escalating"
        );
        std::panic::panic_any(DoubleFault);
    }
    std::panic::panic_any(err);
}
