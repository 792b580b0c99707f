/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! Handles to host-owned memory contexts and the current-context stack.
//!
//! The host owns every arena and may reclaim them out-of-band, so a plain
//! [`MemoryContext`] is a weak, non-owning reference with an explicit liveness
//! check. [`OwnedMemoryContext`] is the distinct owning variant with
//! deterministic release; the two are never conflated. The ambient "current
//! context" is scoped state with guaranteed restoration: [`enter`] hands back
//! a token whose drop pops exactly one stack entry on every exit path,
//! including unwinding.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::MemoryError;
use crate::guard::guard_call;
use crate::sys;
use crate::sys::Datum;

thread_local! {
    // never empty once touched: seeded with the top context
    static CONTEXT_STACK: RefCell<Vec<sys::MemoryContext>> = RefCell::new(Vec::new());
}

fn with_stack<R>(f: impl FnOnce(&mut Vec<sys::MemoryContext>) -> R) -> R {
    CONTEXT_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if stack.is_empty() {
            stack.push(sys::top_memory_context());
        }
        f(&mut stack)
    })
}

pub(crate) fn stack_depth() -> usize {
    with_stack(|stack| stack.len())
}

/// Rebalances the current-context stack after a host error unwound through a
/// guarded call. Scope tokens normally restore this themselves; truncation
/// here only catches scopes that were leaked past the guard.
pub(crate) fn unwind_stack_to(depth: usize) {
    let top = with_stack(|stack| {
        if stack.len() > depth {
            warn!(
                expected = depth,
                found = stack.len(),
                "context scopes leaked across a guarded call; rebalancing"
            );
            stack.truncate(depth);
        }
        if stack.is_empty() {
            stack.push(sys::top_memory_context());
        }
        *stack.last().expect("current-context stack is never empty")
    });
    let top = if sys::memory_context_is_valid(top) { top } else { sys::top_memory_context() };
    let _ = sys::memory_context_switch_to(top);
}

/// Non-owning handle to one host arena.
///
/// Copying the handle copies nothing but identity. Liveness is controlled by
/// the host (or by whoever owns the context); check [`is_valid`][Self::is_valid]
/// before trusting a handle that crossed a host lifecycle boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryContext {
    raw: sys::MemoryContext,
}

impl MemoryContext {
    /// The root context; lives for the whole call chain.
    pub fn top() -> MemoryContext {
        MemoryContext { raw: sys::top_memory_context() }
    }

    /// The context unscoped allocations currently land in.
    pub fn current() -> MemoryContext {
        MemoryContext { raw: sys::current_memory_context() }
    }

    /// Wraps a raw host handle.
    pub fn from_raw(raw: sys::MemoryContext) -> MemoryContext {
        MemoryContext { raw }
    }

    pub fn raw(self) -> sys::MemoryContext {
        self.raw
    }

    /// Whether the host still considers this arena live.
    pub fn is_valid(self) -> bool {
        sys::memory_context_is_valid(self.raw)
    }

    pub fn name(self) -> Option<String> {
        sys::memory_context_name(self.raw)
    }

    pub fn parent(self) -> Option<MemoryContext> {
        sys::memory_context_parent(self.raw).map(|raw| MemoryContext { raw })
    }

    /// Whether `self` is a proper ancestor of `other`.
    pub fn is_ancestor_of(self, other: MemoryContext) -> bool {
        let mut cursor = other.parent();
        while let Some(cxt) = cursor {
            if cxt == self {
                return true;
            }
            cursor = cxt.parent();
        }
        false
    }

    /// The context owning the chunk behind a by-reference datum, if the chunk
    /// is still live. By-value datums have no owning context.
    pub fn for_datum(datum: Datum) -> Option<MemoryContext> {
        sys::datum_chunk_context(datum).map(|raw| MemoryContext { raw })
    }

    /// Allocates a chunk in this arena holding a copy of `bytes`.
    pub fn alloc_bytes(self, bytes: &[u8]) -> Result<Datum, MemoryError> {
        if !self.is_valid() {
            return Err(MemoryError::DanglingContext);
        }
        guard_call(|| sys::palloc_bytes(self.raw, bytes))
            .map_err(|err| MemoryError::HostAllocation(err.message))
    }

    /// Invalidates every allocation in this arena without destroying the
    /// arena itself. Handles into it dangle afterwards.
    pub fn reset(self) -> Result<(), MemoryError> {
        if !self.is_valid() {
            return Err(MemoryError::DanglingContext);
        }
        guard_call(|| sys::memory_context_reset(self.raw)).map_err(MemoryError::from)
    }

    /// Registers a callback fired on every reset and once on deletion.
    pub fn register_reset_callback(
        self,
        callback: impl FnMut() + 'static,
    ) -> Result<(), MemoryError> {
        if !self.is_valid() {
            return Err(MemoryError::DanglingContext);
        }
        guard_call(|| sys::memory_context_register_reset_callback(self.raw, Box::new(callback)))
            .map_err(MemoryError::from)
    }

    /// Returns this arena to the host.
    ///
    /// Refused for the top context, for the current context, for any ancestor
    /// of the current context, and for handles that are already dead.
    pub fn delete_context(self) -> Result<(), MemoryError> {
        if !self.is_valid() {
            return Err(MemoryError::DanglingContext);
        }
        if self == MemoryContext::top() {
            return Err(MemoryError::Hierarchy(
                "the top-level memory context cannot be deleted".into(),
            ));
        }
        let current = MemoryContext::current();
        if self == current || self.is_ancestor_of(current) {
            return Err(MemoryError::Hierarchy(format!(
                "context {:?} is the current context or one of its ancestors",
                self.name().unwrap_or_default()
            )));
        }
        guard_call(|| sys::memory_context_delete(self.raw)).map_err(MemoryError::from)?;
        debug!(id = self.raw.as_u32(), "memory context deleted");
        Ok(())
    }
}

/// Asks the host for a new arena as a child of `parent` (default: current).
///
/// The returned context is owned by the caller and released deterministically
/// on drop or via [`OwnedMemoryContext::delete`].
pub fn create(
    parent: Option<MemoryContext>,
    name: &str,
) -> Result<OwnedMemoryContext, MemoryError> {
    let parent = parent.unwrap_or_else(MemoryContext::current);
    if !parent.is_valid() {
        return Err(MemoryError::DanglingContext);
    }
    let raw = guard_call(|| sys::memory_context_create(parent.raw, name))
        .map_err(|err| MemoryError::HostAllocation(err.message))?;
    debug!(id = raw.as_u32(), name, "memory context created");
    Ok(OwnedMemoryContext { cxt: MemoryContext { raw }, released: false })
}

/// Owning handle to an arena created by this framework.
///
/// Dropping it deletes the arena when that is still safe to do; the checked
/// path is [`delete`][Self::delete]. Host-managed contexts (the current
/// context during a call, the top context) are never owned.
#[derive(Debug)]
pub struct OwnedMemoryContext {
    cxt: MemoryContext,
    released: bool,
}

impl OwnedMemoryContext {
    /// Borrows the non-owning handle.
    pub fn context(&self) -> MemoryContext {
        self.cxt
    }

    /// Deletes the arena now, reporting hierarchy violations instead of
    /// deferring them to drop.
    pub fn delete(mut self) -> Result<(), MemoryError> {
        self.released = true;
        self.cxt.delete_context()
    }

    /// Releases ownership without deleting; the caller takes over the
    /// arena's lifetime.
    pub fn into_raw(mut self) -> MemoryContext {
        self.released = true;
        self.cxt
    }
}

impl Drop for OwnedMemoryContext {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if !self.cxt.is_valid() {
            // the host reclaimed it first, e.g. via a parent reset
            return;
        }
        if let Err(err) = self.cxt.delete_context() {
            warn!(error = %err, "owned memory context leaked: deletion refused at drop");
        }
    }
}

/// Scope token for one entry on the current-context stack.
///
/// Dropping it pops exactly that entry and restores the previous current
/// context, on normal exit and during unwinding alike. Scopes must be
/// released strictly last-in-first-out; an out-of-order release is a
/// programming error and panics (or, while already unwinding, logs and
/// repairs the stack).
#[must_use = "dropping the scope immediately restores the previous context"]
#[derive(Debug)]
pub struct ContextScope {
    depth: usize,
}

/// Pushes `cxt` onto the current-context stack and makes it current.
///
/// Fails fast with [`MemoryError::DanglingContext`] if the host has already
/// invalidated `cxt`.
pub fn enter(cxt: MemoryContext) -> Result<ContextScope, MemoryError> {
    if !cxt.is_valid() {
        return Err(MemoryError::DanglingContext);
    }
    let depth = with_stack(|stack| {
        stack.push(cxt.raw);
        stack.len()
    });
    let _ = sys::memory_context_switch_to(cxt.raw);
    Ok(ContextScope { depth })
}

/// Runs `f` with `cxt` as the current context, restoring the previous one on
/// every exit path.
pub fn with_context<R>(cxt: MemoryContext, f: impl FnOnce() -> R) -> Result<R, MemoryError> {
    let _scope = enter(cxt)?;
    Ok(f())
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        let (out_of_order, restored) = with_stack(|stack| {
            let out_of_order = stack.len() != self.depth;
            if stack.len() >= self.depth {
                stack.truncate(self.depth);
                stack.pop();
            }
            if stack.is_empty() {
                stack.push(sys::top_memory_context());
            }
            (out_of_order, *stack.last().expect("current-context stack is never empty"))
        });
        let restored =
            if sys::memory_context_is_valid(restored) { restored } else { sys::top_memory_context() };
        let _ = sys::memory_context_switch_to(restored);
        if out_of_order {
            if std::thread::panicking() {
                tracing::error!(
                    expected = self.depth,
                    "memory context scope released out of order during unwinding; stack repaired"
                );
            } else {
                panic!("memory context scope released out of order");
            }
        }
    }
}

/// Wrapper over a context that counts the allocations made through it,
/// distinctly from allocations the host performs directly, plus the resets
/// the host applies to the underlying arena.
pub struct TrackingContext {
    inner: MemoryContext,
    allocations: Cell<u64>,
    bytes: Cell<u64>,
    resets: Rc<Cell<u64>>,
}

impl TrackingContext {
    /// Wraps `inner`, wiring a host reset callback to observe out-of-band
    /// invalidation.
    pub fn new(inner: MemoryContext) -> Result<TrackingContext, MemoryError> {
        let resets = Rc::new(Cell::new(0u64));
        let observed = Rc::clone(&resets);
        inner.register_reset_callback(move || observed.set(observed.get() + 1))?;
        Ok(TrackingContext { inner, allocations: Cell::new(0), bytes: Cell::new(0), resets })
    }

    /// The wrapped context; lifetime rules are unchanged by the wrapper.
    pub fn context(&self) -> MemoryContext {
        self.inner
    }

    /// Allocates through the wrapper, recording the allocation.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Result<Datum, MemoryError> {
        let datum = self.inner.alloc_bytes(bytes)?;
        self.allocations.set(self.allocations.get() + 1);
        self.bytes.set(self.bytes.get() + bytes.len() as u64);
        Ok(datum)
    }

    /// Number of allocations made through this wrapper.
    pub fn allocations(&self) -> u64 {
        self.allocations.get()
    }

    /// Bytes allocated through this wrapper.
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes.get()
    }

    /// Resets of the underlying arena observed via the host callback,
    /// whoever triggered them.
    pub fn resets(&self) -> u64 {
        self.resets.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_restore_the_previous_context() {
        let before = MemoryContext::current();
        let owned = create(None, "scope-test").unwrap();
        {
            let _scope = enter(owned.context()).unwrap();
            assert_eq!(MemoryContext::current(), owned.context());
        }
        assert_eq!(MemoryContext::current(), before);
    }

    #[test]
    fn nested_scopes_unwind_in_order() {
        let before = MemoryContext::current();
        let outer = create(None, "outer").unwrap();
        let inner = create(Some(outer.context()), "inner").unwrap();
        {
            let _outer_scope = enter(outer.context()).unwrap();
            {
                let _inner_scope = enter(inner.context()).unwrap();
                assert_eq!(MemoryContext::current(), inner.context());
            }
            assert_eq!(MemoryContext::current(), outer.context());
        }
        assert_eq!(MemoryContext::current(), before);
    }

    #[test]
    fn with_context_restores_on_panic() {
        let before = MemoryContext::current();
        let owned = create(None, "panicky").unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_context(owned.context(), || panic!("boom")).unwrap();
        }));
        assert!(result.is_err());
        assert_eq!(MemoryContext::current(), before);
    }

    #[test]
    fn entering_a_deleted_context_fails_fast() {
        let owned = create(None, "short-lived").unwrap();
        let cxt = owned.context();
        owned.delete().unwrap();
        assert_eq!(enter(cxt).unwrap_err(), MemoryError::DanglingContext);
    }

    #[test]
    fn delete_rejects_the_current_context() {
        let owned = create(None, "busy").unwrap();
        let scope = enter(owned.context()).unwrap();
        let err = owned.context().delete_context().unwrap_err();
        assert!(matches!(err, MemoryError::Hierarchy(_)));
        drop(scope);
    }

    #[test]
    fn delete_rejects_ancestors_of_the_current_context() {
        let outer = create(None, "ancestor").unwrap();
        let inner = create(Some(outer.context()), "descendant").unwrap();
        let scope = enter(inner.context()).unwrap();
        let err = outer.context().delete_context().unwrap_err();
        assert!(matches!(err, MemoryError::Hierarchy(_)));
        drop(scope);
        drop(inner);
    }

    #[test]
    fn out_of_order_release_is_detected() {
        let before = MemoryContext::current();
        let a = create(None, "first").unwrap();
        let b = create(None, "second").unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let outer = enter(a.context()).unwrap();
            let _inner = enter(b.context()).unwrap();
            drop(outer);
        }));
        assert!(result.is_err());
        assert_eq!(MemoryContext::current(), before);
    }

    #[test]
    fn the_top_context_cannot_be_deleted() {
        let err = MemoryContext::top().delete_context().unwrap_err();
        assert!(matches!(err, MemoryError::Hierarchy(_)));
    }

    #[test]
    fn owned_contexts_release_on_drop() {
        let cxt = {
            let owned = create(None, "dropped").unwrap();
            owned.context()
        };
        assert!(!cxt.is_valid());
    }

    #[test]
    fn into_raw_keeps_the_arena_alive() {
        let cxt = create(None, "kept").unwrap().into_raw();
        assert!(cxt.is_valid());
        cxt.delete_context().unwrap();
    }

    #[test]
    fn reset_invalidates_chunks_but_not_the_context() {
        let owned = create(None, "resettable").unwrap();
        let cxt = owned.context();
        let datum = cxt.alloc_bytes(b"ephemeral").unwrap();
        assert!(MemoryContext::for_datum(datum).is_some());
        cxt.reset().unwrap();
        assert!(cxt.is_valid());
        assert!(MemoryContext::for_datum(datum).is_none());
    }

    #[test]
    fn allocation_failure_surfaces_the_host_message() {
        let owned = create(None, "strained").unwrap();
        sys::inject_allocation_failures(1);
        let err = owned.context().alloc_bytes(b"too big").unwrap_err();
        match err {
            MemoryError::HostAllocation(message) => assert_eq!(message, "out of memory"),
            other => panic!("expected HostAllocation, got {other:?}"),
        }
    }

    #[test]
    fn create_failure_is_a_host_allocation_error() {
        sys::inject_allocation_failures(1);
        let err = create(None, "refused").unwrap_err();
        assert!(matches!(err, MemoryError::HostAllocation(_)));
    }

    #[test]
    fn tracking_counts_allocations_and_resets() {
        let owned = create(None, "tracked").unwrap();
        let tracked = TrackingContext::new(owned.context()).unwrap();

        tracked.alloc_bytes(b"abc").unwrap();
        tracked.alloc_bytes(b"defgh").unwrap();
        // direct host allocation, invisible to the wrapper's counters
        owned.context().alloc_bytes(b"direct").unwrap();

        assert_eq!(tracked.allocations(), 2);
        assert_eq!(tracked.bytes_allocated(), 8);
        assert_eq!(tracked.resets(), 0);

        owned.context().reset().unwrap();
        assert_eq!(tracked.resets(), 1);
    }

    #[test]
    fn for_datum_recovers_the_owning_context() {
        let owned = create(None, "owner").unwrap();
        let datum = owned.context().alloc_bytes(b"chunk").unwrap();
        assert_eq!(MemoryContext::for_datum(datum), Some(owned.context()));
        // a by-value token has no owning context
        assert_eq!(MemoryContext::for_datum(Datum::from(7usize)), None);
    }
}
