/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! Typed values: a datum, its null flag, and the host type descriptor needed
//! to interpret it.

mod from;
mod into;

pub use from::FromDatum;
pub use into::IntoDatum;

use serde::Serialize;

pub use crate::sys::{Datum, Oid};
use crate::error::ConversionError;
use crate::memcxt::MemoryContext;
use crate::sys;

/// Host type descriptor: a type identifier plus its by-value/by-reference and
/// length metadata. Required to interpret any datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypeDesc {
    pub oid: Oid,
    pub byval: bool,
    /// Fixed payload width in bytes, `-1` for varlena.
    pub len: i16,
}

impl TypeDesc {
    /// Looks the descriptor up in the host's type catalog.
    pub fn of(oid: Oid) -> Option<TypeDesc> {
        sys::type_lookup(oid)
            .map(|entry| TypeDesc { oid: entry.oid, byval: entry.byval, len: entry.len })
    }

    /// Descriptor of a builtin type; the catalog is complete for builtins.
    pub(crate) fn builtin(oid: Oid) -> TypeDesc {
        TypeDesc::of(oid).expect("builtin type is present in the host catalog")
    }
}

/// One host value with its null flag and type descriptor: the common currency
/// between conversions, guards, and collaborators.
///
/// Transient by design: a typed value is produced per call and its datum is
/// only as live as the memory context backing it.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    datum: Datum,
    is_null: bool,
    ty: TypeDesc,
}

impl TypedValue {
    pub fn from_parts(datum: Datum, is_null: bool, ty: TypeDesc) -> TypedValue {
        TypedValue { datum, is_null, ty }
    }

    /// The null value of a type.
    pub fn null(ty: TypeDesc) -> TypedValue {
        TypedValue { datum: Datum::NULL, is_null: true, ty }
    }

    pub fn is_null(&self) -> bool {
        self.is_null
    }

    pub fn type_desc(&self) -> TypeDesc {
        self.ty
    }

    /// The datum, or `None` when null: a null handle is never handed out as
    /// if it were data.
    pub fn datum(&self) -> Option<Datum> {
        (!self.is_null).then_some(self.datum)
    }
}

/// Marshals a native value into a typed value, allocating any by-reference
/// payload in `cxt` rather than the ambient current context, so callers can
/// target a longer-lived arena explicitly.
pub fn convert_out<T: IntoDatum>(
    value: T,
    cxt: MemoryContext,
) -> Result<TypedValue, ConversionError> {
    value.into_datum(cxt)
}

/// Marshals a typed value back into a native value, validating nullability,
/// type identity, and by-reference payload structure.
pub fn convert_in<T: FromDatum>(value: &TypedValue) -> Result<T, ConversionError> {
    T::from_datum(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::oids;

    #[test]
    fn null_values_do_not_expose_a_datum() {
        let null = TypedValue::null(TypeDesc::builtin(oids::INT4));
        assert!(null.is_null());
        assert_eq!(null.datum(), None);
    }

    #[test]
    fn descriptors_come_from_the_catalog() {
        let text = TypeDesc::of(oids::TEXT).unwrap();
        assert!(!text.byval);
        assert_eq!(text.len, -1);
        assert_eq!(TypeDesc::of(4_000_000), None);
    }
}
