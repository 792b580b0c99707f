/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! The host's memory-context arena tree.
//!
//! Arenas form a parent/child tree rooted at the top context; a per-call-chain
//! "current context" decides where unscoped allocations land. The host owns
//! every arena: it may reset or delete them out-of-band, and a handle into a
//! reclaimed arena must be detectable as dead. To that end context ids are
//! never reused, and chunk handles carry their owning context id, so the
//! embedded host can answer "is this still live" instead of handing back a
//! wild pointer.

use std::cell::RefCell;
use std::num::NonZeroU32;

use crate::datum::Datum;
use crate::error::{error_raise, ErrorData};

/// SQLSTATE-style code the host reports for allocation failures.
pub const ERRCODE_OUT_OF_MEMORY: i32 = 53200;

/// Handle to one host-owned arena.
///
/// Plain identity, no ownership: copying a handle never copies or pins the
/// arena behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MemoryContext(NonZeroU32);

impl MemoryContext {
    fn from_index(index: usize) -> MemoryContext {
        let id = u32::try_from(index + 1).expect("memory context id space exhausted");
        MemoryContext(NonZeroU32::new(id).expect("context ids start at 1"))
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// The raw id, for diagnostics only.
    pub fn as_u32(self) -> u32 {
        self.0.get()
    }
}

type ResetCallback = Box<dyn FnMut()>;

struct ContextData {
    name: String,
    parent: Option<MemoryContext>,
    children: Vec<MemoryContext>,
    chunks: Vec<Option<Box<[u8]>>>,
    reset_callbacks: Vec<ResetCallback>,
}

impl ContextData {
    fn new(name: &str, parent: Option<MemoryContext>) -> ContextData {
        ContextData {
            name: name.to_owned(),
            parent,
            children: Vec::new(),
            chunks: Vec::new(),
            reset_callbacks: Vec::new(),
        }
    }
}

struct HostState {
    // id N lives at index N-1; deleted slots stay None so ids are never reused
    contexts: Vec<Option<ContextData>>,
    current: MemoryContext,
    armed_failures: u32,
}

const TOP_CONTEXT: MemoryContext = match NonZeroU32::new(1) {
    Some(id) => MemoryContext(id),
    None => unreachable!(),
};

impl HostState {
    fn bootstrap() -> HostState {
        HostState {
            contexts: vec![Some(ContextData::new("TopMemoryContext", None))],
            current: TOP_CONTEXT,
            armed_failures: 0,
        }
    }

    fn get(&self, cxt: MemoryContext) -> Option<&ContextData> {
        self.contexts.get(cxt.index()).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, cxt: MemoryContext) -> Option<&mut ContextData> {
        self.contexts.get_mut(cxt.index()).and_then(Option::as_mut)
    }

    /// Ids of `cxt` and every descendant, children before parents.
    fn subtree_bottom_up(&self, cxt: MemoryContext) -> Vec<MemoryContext> {
        let mut ordered = Vec::new();
        let mut pending = vec![cxt];
        while let Some(next) = pending.pop() {
            ordered.push(next);
            if let Some(data) = self.get(next) {
                pending.extend(data.children.iter().copied());
            }
        }
        ordered.reverse();
        ordered
    }

    fn is_in_subtree(&self, needle: MemoryContext, root: MemoryContext) -> bool {
        let mut cursor = Some(needle);
        while let Some(cxt) = cursor {
            if cxt == root {
                return true;
            }
            cursor = self.get(cxt).and_then(|data| data.parent);
        }
        false
    }
}

thread_local! {
    static HOST: RefCell<HostState> = RefCell::new(HostState::bootstrap());
}

fn with_host<R>(f: impl FnOnce(&mut HostState) -> R) -> R {
    HOST.with(|host| f(&mut host.borrow_mut()))
}

fn invalid_context(cxt: MemoryContext) -> ! {
    error_raise(
        ErrorData::error(format!(
            "memory context {} has been reset or deleted",
            cxt.as_u32()
        ))
        .with_code(ERRCODE_OUT_OF_MEMORY),
    )
}

/// The root arena; it lives for the whole call chain and is never deletable.
pub fn top_memory_context() -> MemoryContext {
    TOP_CONTEXT
}

/// The arena unscoped allocations currently land in.
pub fn current_memory_context() -> MemoryContext {
    with_host(|host| host.current)
}

/// Makes `cxt` current, returning the previous current context. Raises a host
/// error if `cxt` is no longer live.
pub fn memory_context_switch_to(cxt: MemoryContext) -> MemoryContext {
    match with_host(|host| {
        host.get(cxt)?;
        Some(std::mem::replace(&mut host.current, cxt))
    }) {
        Some(previous) => previous,
        None => invalid_context(cxt),
    }
}

/// Asks the host for a new arena as a child of `parent`.
///
/// Raises an out-of-memory host error when the host refuses (armed via
/// [`inject_allocation_failures`] in tests).
pub fn memory_context_create(parent: MemoryContext, name: &str) -> MemoryContext {
    enum Outcome {
        Created(MemoryContext),
        Refused,
        BadParent,
    }
    let outcome = with_host(|host| {
        if host.get(parent).is_none() {
            return Outcome::BadParent;
        }
        if host.armed_failures > 0 {
            host.armed_failures -= 1;
            return Outcome::Refused;
        }
        let cxt = MemoryContext::from_index(host.contexts.len());
        host.contexts.push(Some(ContextData::new(name, Some(parent))));
        if let Some(data) = host.get_mut(parent) {
            data.children.push(cxt);
        }
        Outcome::Created(cxt)
    });
    match outcome {
        Outcome::Created(cxt) => {
            tracing::trace!(target: "host", id = cxt.as_u32(), name, "memory context created");
            cxt
        }
        Outcome::Refused => error_raise(
            ErrorData::error("out of memory")
                .with_code(ERRCODE_OUT_OF_MEMORY)
                .with_detail(format!("failed while creating memory context \"{name}\"")),
        ),
        Outcome::BadParent => invalid_context(parent),
    }
}

pub fn memory_context_is_valid(cxt: MemoryContext) -> bool {
    with_host(|host| host.get(cxt).is_some())
}

pub fn memory_context_parent(cxt: MemoryContext) -> Option<MemoryContext> {
    with_host(|host| host.get(cxt).and_then(|data| data.parent))
}

pub fn memory_context_name(cxt: MemoryContext) -> Option<String> {
    with_host(|host| host.get(cxt).map(|data| data.name.clone()))
}

/// Registers a callback fired whenever `cxt` is reset, and once more when it
/// is deleted. Raises if `cxt` is no longer live.
pub fn memory_context_register_reset_callback(cxt: MemoryContext, callback: ResetCallback) {
    let registered = with_host(|host| match host.get_mut(cxt) {
        Some(data) => {
            data.reset_callbacks.push(callback);
            true
        }
        None => false,
    });
    if !registered {
        invalid_context(cxt);
    }
}

// Callbacks run with the host unborrowed: they may call back into the ABI.
fn fire_reset_callbacks(cxt: MemoryContext, retain: bool) {
    let mut callbacks = match with_host(|host| {
        host.get_mut(cxt).map(|data| std::mem::take(&mut data.reset_callbacks))
    }) {
        Some(callbacks) => callbacks,
        None => return,
    };
    for callback in &mut callbacks {
        callback();
    }
    if retain {
        with_host(|host| {
            if let Some(data) = host.get_mut(cxt) {
                // callbacks registered by a callback land behind the originals
                callbacks.append(&mut data.reset_callbacks);
                data.reset_callbacks = callbacks;
            }
        });
    }
}

/// Frees every allocation in `cxt` and its descendants without destroying any
/// context handle. Raises if `cxt` is no longer live.
pub fn memory_context_reset(cxt: MemoryContext) {
    let subtree = with_host(|host| {
        host.get(cxt)?;
        Some(host.subtree_bottom_up(cxt))
    });
    let subtree = match subtree {
        Some(subtree) => subtree,
        None => invalid_context(cxt),
    };
    for member in subtree {
        fire_reset_callbacks(member, true);
        with_host(|host| {
            if let Some(data) = host.get_mut(member) {
                data.chunks.clear();
            }
        });
    }
    tracing::trace!(target: "host", id = cxt.as_u32(), "memory context reset");
}

/// Returns `cxt` and its descendants to the host.
///
/// Raises on the top context, on a context that is (or encloses) the current
/// one, and on a handle that is already dead.
pub fn memory_context_delete(cxt: MemoryContext) {
    enum Refusal {
        Dead,
        Top,
        Active,
    }
    let plan = with_host(|host| {
        if host.get(cxt).is_none() {
            return Err(Refusal::Dead);
        }
        if cxt == TOP_CONTEXT {
            return Err(Refusal::Top);
        }
        if host.is_in_subtree(host.current, cxt) {
            return Err(Refusal::Active);
        }
        let parent = host.get(cxt).and_then(|data| data.parent);
        Ok((host.subtree_bottom_up(cxt), parent))
    });
    let (subtree, parent) = match plan {
        Ok(plan) => plan,
        Err(Refusal::Dead) => invalid_context(cxt),
        Err(Refusal::Top) => {
            error_raise(ErrorData::error("cannot delete the top memory context"))
        }
        Err(Refusal::Active) => error_raise(ErrorData::error(format!(
            "cannot delete memory context {}: it encloses the current context",
            cxt.as_u32()
        ))),
    };
    for member in subtree {
        fire_reset_callbacks(member, false);
        with_host(|host| {
            if let Some(slot) = host.contexts.get_mut(member.index()) {
                *slot = None;
            }
        });
    }
    if let Some(parent) = parent {
        with_host(|host| {
            if let Some(data) = host.get_mut(parent) {
                data.children.retain(|child| *child != cxt);
            }
        });
    }
    tracing::trace!(target: "host", id = cxt.as_u32(), "memory context deleted");
}

/// Allocates a chunk in `cxt` holding a copy of `bytes` and returns its
/// handle. Raises out-of-memory when an injected failure is armed, and raises
/// on a dead context.
pub fn palloc_bytes(cxt: MemoryContext, bytes: &[u8]) -> Datum {
    enum Outcome {
        Allocated(Datum),
        Refused,
        Dead,
    }
    let outcome = with_host(|host| {
        if host.armed_failures > 0 {
            host.armed_failures -= 1;
            return Outcome::Refused;
        }
        match host.get_mut(cxt) {
            Some(data) => {
                let chunk = data.chunks.len();
                data.chunks.push(Some(bytes.to_vec().into_boxed_slice()));
                Outcome::Allocated(encode_chunk(cxt, chunk))
            }
            None => Outcome::Dead,
        }
    });
    match outcome {
        Outcome::Allocated(datum) => datum,
        Outcome::Refused => error_raise(
            ErrorData::error("out of memory")
                .with_code(ERRCODE_OUT_OF_MEMORY)
                .with_detail(format!("failed on request of size {}", bytes.len())),
        ),
        Outcome::Dead => invalid_context(cxt),
    }
}

/// The context that owns a chunk datum, if the chunk is still live.
pub fn datum_chunk_context(datum: Datum) -> Option<MemoryContext> {
    let (cxt, chunk) = decode_chunk(datum)?;
    with_host(|host| {
        let data = host.get(cxt)?;
        data.chunks.get(chunk).and_then(Option::as_ref)?;
        Some(cxt)
    })
}

/// Size in bytes of a live chunk datum.
pub fn datum_chunk_size(datum: Datum) -> Option<usize> {
    let (cxt, chunk) = decode_chunk(datum)?;
    with_host(|host| {
        host.get(cxt)?
            .chunks
            .get(chunk)
            .and_then(Option::as_ref)
            .map(|bytes| bytes.len())
    })
}

/// Copies a live chunk's contents out. `None` means the handle is stale or
/// was never a chunk handle.
pub fn datum_read_bytes(datum: Datum) -> Option<Vec<u8>> {
    let (cxt, chunk) = decode_chunk(datum)?;
    with_host(|host| {
        host.get(cxt)?
            .chunks
            .get(chunk)
            .and_then(Option::as_ref)
            .map(|bytes| bytes.to_vec())
    })
}

/// Arms the next `n` host allocations (context creation or chunk allocation)
/// to fail with an out-of-memory error.
pub fn inject_allocation_failures(n: u32) {
    with_host(|host| host.armed_failures = n);
}

fn encode_chunk(cxt: MemoryContext, chunk: usize) -> Datum {
    let chunk = u32::try_from(chunk + 1).expect("chunk id space exhausted");
    Datum::from(((cxt.as_u32() as usize) << 32) | chunk as usize)
}

fn decode_chunk(datum: Datum) -> Option<(MemoryContext, usize)> {
    let bits = datum.value();
    let id = NonZeroU32::new((bits >> 32) as u32)?;
    let chunk = NonZeroU32::new(bits as u32)?;
    Some((MemoryContext(id), chunk.get() as usize - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::rc::Rc;

    #[test]
    fn top_context_is_current_at_bootstrap() {
        assert_eq!(current_memory_context(), top_memory_context());
        assert!(memory_context_is_valid(top_memory_context()));
        assert_eq!(
            memory_context_name(top_memory_context()).as_deref(),
            Some("TopMemoryContext")
        );
    }

    #[test]
    fn chunks_survive_until_reset() {
        let cxt = memory_context_create(top_memory_context(), "scratch");
        let datum = palloc_bytes(cxt, b"payload");
        assert_eq!(datum_read_bytes(datum).as_deref(), Some(&b"payload"[..]));
        assert_eq!(datum_chunk_size(datum), Some(7));
        assert_eq!(datum_chunk_context(datum), Some(cxt));

        memory_context_reset(cxt);
        assert!(memory_context_is_valid(cxt));
        assert_eq!(datum_read_bytes(datum), None);
        assert_eq!(datum_chunk_context(datum), None);
    }

    #[test]
    fn delete_reclaims_the_whole_subtree() {
        let outer = memory_context_create(top_memory_context(), "outer");
        let inner = memory_context_create(outer, "inner");
        memory_context_delete(outer);
        assert!(!memory_context_is_valid(outer));
        assert!(!memory_context_is_valid(inner));
    }

    #[test]
    fn deleting_the_top_context_is_refused() {
        let caught = catch_unwind(AssertUnwindSafe(|| {
            memory_context_delete(top_memory_context());
        }))
        .unwrap_err();
        let err = caught.downcast::<ErrorData>().unwrap();
        assert_eq!(err.message, "cannot delete the top memory context");
    }

    #[test]
    fn deleting_an_enclosing_context_is_refused() {
        let outer = memory_context_create(top_memory_context(), "outer");
        let inner = memory_context_create(outer, "inner");
        let previous = memory_context_switch_to(inner);
        let caught = catch_unwind(AssertUnwindSafe(|| memory_context_delete(outer))).unwrap_err();
        assert!(caught.is::<ErrorData>());
        memory_context_switch_to(previous);
        memory_context_delete(outer);
    }

    #[test]
    fn reset_callbacks_fire_on_reset_and_delete() {
        let cxt = memory_context_create(top_memory_context(), "watched");
        let fired = Rc::new(Cell::new(0u32));
        let watcher = Rc::clone(&fired);
        memory_context_register_reset_callback(cxt, Box::new(move || watcher.set(watcher.get() + 1)));

        memory_context_reset(cxt);
        assert_eq!(fired.get(), 1);
        memory_context_reset(cxt);
        assert_eq!(fired.get(), 2);
        memory_context_delete(cxt);
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn armed_failures_refuse_allocation() {
        let cxt = memory_context_create(top_memory_context(), "fallible");
        inject_allocation_failures(1);
        let caught =
            catch_unwind(AssertUnwindSafe(|| palloc_bytes(cxt, b"doomed"))).unwrap_err();
        let err = caught.downcast::<ErrorData>().unwrap();
        assert_eq!(err.sqlerrcode, ERRCODE_OUT_OF_MEMORY);
        // the failure was consumed
        let datum = palloc_bytes(cxt, b"fine");
        assert_eq!(datum_read_bytes(datum).as_deref(), Some(&b"fine"[..]));
    }

    #[test]
    fn context_ids_are_never_reused() {
        let first = memory_context_create(top_memory_context(), "one");
        memory_context_delete(first);
        let second = memory_context_create(top_memory_context(), "two");
        assert_ne!(first, second);
        assert!(!memory_context_is_valid(first));
    }
}
