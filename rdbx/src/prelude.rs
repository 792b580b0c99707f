// From "external" crates:
pub use ::rdbx_sys as sys;

// The boundary: nothing crosses the ABI without these.
pub use crate::guard::{guard_call, inbound_guard, DoubleFault};

// Memory contexts and scoping.
pub use crate::memcxt::{
    create, enter, with_context, ContextScope, MemoryContext, OwnedMemoryContext, TrackingContext,
};

// Value marshaling.
pub use crate::datum::{
    convert_in, convert_out, Datum, FromDatum, IntoDatum, Oid, TypeDesc, TypedValue,
};

// Everything fallible speaks these.
pub use crate::error::{ConversionError, HostError, MemoryError};
