/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! The host ABI surface consumed by `rdbx`.
//!
//! A production build of an extension runs inside a database engine that owns
//! every allocation arena and reports internal errors by jumping out of the
//! current call stack. This crate exposes exactly the primitives that call
//! convention consists of: opaque [`Datum`] value tokens, the memory-context
//! arena tree, the current-context switch, reset callbacks, the error-raise
//! jump, and builtin type-identifier lookup.
//!
//! No engine can be linked from a plain `cargo test` run, so the primitives
//! here are backed by an embedded host that implements the same contract
//! in-process: arenas hand out tagged chunk handles instead of raw addresses
//! (making stale references detectable rather than wild), and the non-local
//! jump is realized as an unwind carrying an [`ErrorData`] payload, which is
//! the exact shape a `sigsetjmp`-based boundary would convert a host
//! `siglongjmp` into before handing it to Rust. Everything above this crate
//! treats the surface as opaque, so swapping in generated bindings to a real
//! engine replaces the implementation, not the interface.
//!
//! Host state lives in thread-local storage: the host call convention is
//! single-threaded per active call chain, and independent test threads behave
//! as independent backends.

mod datum;
mod error;
mod memory;
mod typecat;

pub use datum::Datum;
pub use error::{
    elevel, error_raise, error_translation_scope, in_error_translation, DoubleFault, ErrorData,
};
pub use memory::{
    current_memory_context, datum_chunk_context, datum_chunk_size, datum_read_bytes,
    inject_allocation_failures, memory_context_create, memory_context_delete,
    memory_context_is_valid, memory_context_name, memory_context_parent,
    memory_context_register_reset_callback, memory_context_reset, memory_context_switch_to,
    palloc_bytes, top_memory_context, MemoryContext, ERRCODE_OUT_OF_MEMORY,
};
pub use typecat::{oids, type_lookup, Oid, TypeEntry};
