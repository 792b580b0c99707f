/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! Recoverable error kinds surfaced by the bridge.
//!
//! Everything here is ordinary and propagates with `?`; the one unrecoverable
//! condition, a [`DoubleFault`](crate::guard::DoubleFault), is an unwind
//! marker rather than a `Result` error so that it can never be absorbed by a
//! stray `match`.

use serde::Serialize;
use thiserror::Error;

use crate::datum::Oid;

/// Memory-context operations that the host or the hierarchy rules refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The host refused to allocate; carries the host's own message.
    #[error("host refused allocation: {0}")]
    HostAllocation(String),

    /// The handle points at a context the host has already reset or deleted.
    #[error("memory context has been reset or deleted by the host")]
    DanglingContext,

    /// The operation would violate the parent/child lifetime rules.
    #[error("memory context hierarchy violation: {0}")]
    Hierarchy(String),

    /// A host error signaled during a context operation, relayed verbatim.
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Failures marshaling between native values and host datums.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    /// The handle is null and the target type has no null representation.
    #[error("value is null and `{type_name}` has no null representation")]
    NullNotAllowed { type_name: &'static str },

    /// The descriptor's host type is not the one the target type maps to.
    #[error("host type with oid {found} does not match expected oid {expected}")]
    TypeMismatch { expected: Oid, found: Oid },

    /// A by-reference payload failed structural validation.
    #[error("by-reference payload failed validation: {0}")]
    CorruptData(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Host(#[from] HostError),
}

/// A host-signaled error translated at a guarded boundary.
///
/// The message text is exactly what the host reported, preserving diagnostic
/// fidelity end to end.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct HostError {
    /// Host error code.
    pub code: i32,
    /// The host's message, verbatim.
    pub message: String,
    /// Optional detail line, also verbatim.
    pub detail: Option<String>,
}

impl From<rdbx_sys::ErrorData> for HostError {
    fn from(err: rdbx_sys::ErrorData) -> Self {
        HostError { code: err.sqlerrcode, message: err.message, detail: err.detail }
    }
}

impl From<HostError> for rdbx_sys::ErrorData {
    fn from(err: HostError) -> Self {
        let data = rdbx_sys::ErrorData::error(err.message).with_code(err.code);
        match err.detail {
            Some(detail) => data.with_detail(detail),
            None => data,
        }
    }
}
