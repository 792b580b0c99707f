/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! End-to-end exercises of the bridge: context scoping, guarded boundary
//! crossings, and marshaling working together the way a real extension call
//! uses them.

use rdbx::prelude::*;

#[test]
fn string_survives_a_scoped_context_until_deletion() -> eyre::Result<()> {
    let root = MemoryContext::top();
    let child = create(Some(root), "call-scratch")?;

    let typed = {
        let _scope = enter(child.context())?;
        // allocates in the entered context because it is passed explicitly
        convert_out("abc", MemoryContext::current())?
    };

    // the scope is gone; the context and its chunks are not
    assert!(child.context().is_valid());
    assert_eq!(convert_in::<String>(&typed)?, "abc");

    // the root cannot be deleted out from under its children (or anyone)
    let err = root.delete_context().unwrap_err();
    assert!(matches!(err, MemoryError::Hierarchy(_)));

    child.delete()?;
    Ok(())
}

#[test]
fn host_error_surfaces_with_destructors_intact() {
    struct SideEffect<'a>(&'a std::cell::Cell<u32>);
    impl Drop for SideEffect<'_> {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    let drops = std::cell::Cell::new(0);
    let before = MemoryContext::current();

    let _outer = SideEffect(&drops);
    let result = guard_call(|| -> () {
        let _inner = SideEffect(&drops);
        sys::error_raise(sys::ErrorData::error("division by zero").with_code(42))
    });

    let err = result.unwrap_err();
    assert_eq!(err.code, 42);
    assert_eq!(err.message, "division by zero");
    // the guard-internal frame unwound, nothing above it was skipped
    assert_eq!(drops.get(), 1);
    // and the current-context stack is balanced
    assert_eq!(MemoryContext::current(), before);
}

#[test]
fn stack_discipline_holds_when_a_nested_scope_fails() -> eyre::Result<()> {
    let before = MemoryContext::current();
    let outer = create(None, "outer")?;
    let inner = create(Some(outer.context()), "inner")?;

    let result = guard_call(|| -> () {
        let _outer_scope = enter(outer.context()).expect("outer context is live");
        let _inner_scope = enter(inner.context()).expect("inner context is live");
        sys::error_raise(sys::ErrorData::error("statement aborted"))
    });

    assert!(result.is_err());
    assert_eq!(MemoryContext::current(), before);
    Ok(())
}

#[test]
fn reentrant_boundary_calls_nest_on_one_stack() -> eyre::Result<()> {
    let scratch = create(None, "reentrant")?;

    // native -> host -> native callback -> host again
    let outcome = guard_call(|| {
        inbound_guard(|| {
            let typed = with_context(scratch.context(), || {
                convert_out(7i32, MemoryContext::current())
            })
            .expect("context is live")
            .expect("conversion succeeds");
            match guard_call(|| -> () {
                sys::error_raise(sys::ErrorData::error("nested host failure"))
            }) {
                Ok(_) => unreachable!("the nested call raised"),
                Err(err) => (convert_in::<i32>(&typed).expect("int survives"), err.message),
            }
        })
    })?;

    assert_eq!(outcome, (7, "nested host failure".to_owned()));
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    x: f64,
    y: f64,
}

impl IntoDatum for Point {
    const PASS_BY_VALUE: bool = false;

    fn type_desc() -> TypeDesc {
        <(f64, f64)>::type_desc()
    }

    fn into_datum(self, cxt: MemoryContext) -> Result<TypedValue, ConversionError> {
        (self.x, self.y).into_datum(cxt)
    }
}

impl FromDatum for Point {
    fn from_datum(value: &TypedValue) -> Result<Self, ConversionError> {
        let (x, y) = <(f64, f64)>::from_datum(value)?;
        Ok(Point { x, y })
    }
}

#[test]
fn user_composites_delegate_to_record_conversion() -> eyre::Result<()> {
    let cxt = MemoryContext::current();
    let point = Point { x: 1.5, y: -2.25 };
    let typed = convert_out(point, cxt)?;
    assert_eq!(convert_in::<Point>(&typed)?, point);

    // null record, non-nullable composite
    let null = TypedValue::null(typed.type_desc());
    assert!(matches!(
        convert_in::<Point>(&null).unwrap_err(),
        ConversionError::NullNotAllowed { .. }
    ));
    Ok(())
}

#[test]
fn tracking_reports_what_one_call_allocated() -> eyre::Result<()> {
    let owned = create(None, "per-call")?;
    let tracked = TrackingContext::new(owned.context())?;

    tracked.alloc_bytes(b"state")?;
    tracked.alloc_bytes(b"more state")?;

    assert_eq!(tracked.allocations(), 2);
    assert_eq!(tracked.bytes_allocated(), 15);

    owned.context().reset()?;
    assert_eq!(tracked.resets(), 1);
    // counters describe the wrapper's history, not arena contents
    assert_eq!(tracked.allocations(), 2);
    Ok(())
}

#[test]
fn conversion_reports_host_allocation_failure() -> eyre::Result<()> {
    let owned = create(None, "strained")?;
    sys::inject_allocation_failures(1);

    let err = convert_out("does not fit", owned.context()).unwrap_err();
    match err {
        ConversionError::Memory(MemoryError::HostAllocation(message)) => {
            assert_eq!(message, "out of memory");
        }
        other => panic!("expected a host allocation failure, got {other:?}"),
    }
    Ok(())
}

#[test]
fn retained_values_do_not_outlive_their_context() -> eyre::Result<()> {
    let owned = create(None, "transient")?;
    let typed = convert_out(String::from("ephemeral"), owned.context())?;
    owned.context().reset()?;

    // the handle now dangles and conversion refuses it
    assert!(matches!(
        convert_in::<String>(&typed).unwrap_err(),
        ConversionError::Memory(MemoryError::DanglingContext)
    ));
    Ok(())
}
