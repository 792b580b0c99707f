/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! `rdbx` is a framework for writing native extensions that run in-process
//! inside a C-ABI relational database engine.
//!
//! The host engine owns every allocation arena and reports internal errors by
//! jumping out of the current call stack, bypassing native stack unwinding
//! and therefore every destructor in between. This crate is the runtime
//! bridge that lets extension code stay ordinary, typed, RAII-scoped Rust
//! while cooperating with those conventions. Three pieces do the work, and
//! they are deliberately coupled:
//!
//! - [`memcxt`]: handles to the host's tree of memory contexts, with a
//!   scoped, always-restored current-context stack and a strict split between
//!   owning and non-owning handles.
//! - [`guard`]: boundary guards in both call directions, so a host-signaled
//!   error becomes a catchable [`HostError`](error::HostError) before it can
//!   jump over live destructors, and no native panic ever escapes across the
//!   ABI uncaught.
//! - [`datum`]: compile-time-dispatched conversions between native types and
//!   opaque host datums, allocating in whichever context the caller targets
//!   and validating nullability, type identity, and payload structure.
//!
//! Every conversion allocates through a memory context, and every host call
//! goes through a guard; collaborators (executors, cache wrappers) consume
//! [`guard_call`](guard::guard_call), [`with_context`](memcxt::with_context),
//! [`convert_in`](datum::convert_in) and [`convert_out`](datum::convert_out)
//! rather than touching the ABI directly.

pub use ::rdbx_sys as sys;

pub mod datum;
pub mod error;
pub mod guard;
pub mod memcxt;
pub mod prelude;

pub use datum::{convert_in, convert_out, FromDatum, IntoDatum, TypeDesc, TypedValue};
pub use error::{ConversionError, HostError, MemoryError};
pub use guard::{guard_call, inbound_guard};
pub use memcxt::{create, enter, with_context, MemoryContext, OwnedMemoryContext};
