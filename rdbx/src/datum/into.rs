/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! Marshaling native values into typed values.

use crate::datum::{Datum, TypeDesc, TypedValue};
use crate::error::{ConversionError, MemoryError};
use crate::memcxt::MemoryContext;
use crate::sys;
use crate::sys::oids;

/// Compile-time-resolved rule for producing a typed value from a native
/// value.
///
/// By-reference payloads are allocated in the context the caller passes, not
/// the ambient current context, so a conversion can target a longer-lived
/// arena (e.g. a per-result context) explicitly.
pub trait IntoDatum: Sized {
    /// Whether the value is carried inline in the datum's storage.
    const PASS_BY_VALUE: bool;

    /// The host type this native type maps to.
    fn type_desc() -> TypeDesc;

    /// Produces the typed value, allocating in `cxt` when not inline.
    fn into_datum(self, cxt: MemoryContext) -> Result<TypedValue, ConversionError>;
}

// Fixed-width types map 1:1 to the host's fixed-width representation; width
// is part of the impl, so a width mismatch cannot compile.
macro_rules! into_datum_byval {
    ($ty:ty, $oid:expr, |$value:ident| $encode:expr) => {
        impl IntoDatum for $ty {
            const PASS_BY_VALUE: bool = true;

            fn type_desc() -> TypeDesc {
                TypeDesc::builtin($oid)
            }

            fn into_datum(self, _cxt: MemoryContext) -> Result<TypedValue, ConversionError> {
                let $value = self;
                Ok(TypedValue::from_parts(Datum::from($encode), false, Self::type_desc()))
            }
        }
    };
}

into_datum_byval!(bool, oids::BOOL, |value| usize::from(value));
into_datum_byval!(i8, oids::CHAR, |value| value as u8 as usize);
into_datum_byval!(i16, oids::INT2, |value| value as u16 as usize);
into_datum_byval!(i32, oids::INT4, |value| value as u32 as usize);
into_datum_byval!(i64, oids::INT8, |value| value as u64 as usize);
into_datum_byval!(u32, oids::OID, |value| value as usize);
into_datum_byval!(f32, oids::FLOAT4, |value| value.to_bits() as usize);
into_datum_byval!(f64, oids::FLOAT8, |value| value.to_bits() as usize);

// Varlena payloads carry a 4-byte length header inside the chunk.
fn write_varlena(
    cxt: MemoryContext,
    oid: sys::Oid,
    payload: &[u8],
) -> Result<TypedValue, ConversionError> {
    let mut chunk = Vec::with_capacity(payload.len() + 4);
    chunk.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    chunk.extend_from_slice(payload);
    let datum = cxt.alloc_bytes(&chunk)?;
    Ok(TypedValue::from_parts(datum, false, TypeDesc::builtin(oid)))
}

macro_rules! into_datum_varlena {
    ($ty:ty, $oid:expr, |$value:ident| $payload:expr) => {
        impl IntoDatum for $ty {
            const PASS_BY_VALUE: bool = false;

            fn type_desc() -> TypeDesc {
                TypeDesc::builtin($oid)
            }

            fn into_datum(self, cxt: MemoryContext) -> Result<TypedValue, ConversionError> {
                let $value = self;
                write_varlena(cxt, $oid, $payload)
            }
        }
    };
}

into_datum_varlena!(String, oids::TEXT, |value| value.as_bytes());
into_datum_varlena!(&str, oids::TEXT, |value| value.as_bytes());
into_datum_varlena!(Vec<u8>, oids::BYTEA, |value| &value);
into_datum_varlena!(&[u8], oids::BYTEA, |value| value);

impl<T: IntoDatum> IntoDatum for Option<T> {
    const PASS_BY_VALUE: bool = T::PASS_BY_VALUE;

    fn type_desc() -> TypeDesc {
        T::type_desc()
    }

    /// An empty optional becomes the null value of `T`'s host type instead of
    /// failing; a present value uses `T`'s own rule.
    fn into_datum(self, cxt: MemoryContext) -> Result<TypedValue, ConversionError> {
        match self {
            Some(value) => value.into_datum(cxt),
            None => Ok(TypedValue::null(T::type_desc())),
        }
    }
}

pub(super) fn write_record_attribute(
    buf: &mut Vec<u8>,
    attribute: TypedValue,
) -> Result<(), ConversionError> {
    let ty = attribute.type_desc();
    buf.extend_from_slice(&ty.oid.to_le_bytes());
    match attribute.datum() {
        None => buf.push(1),
        Some(datum) => {
            buf.push(0);
            buf.push(ty.byval as u8);
            if ty.byval {
                buf.extend_from_slice(&(datum.value() as u64).to_le_bytes());
            } else {
                let payload = sys::datum_read_bytes(datum)
                    .ok_or(ConversionError::Memory(MemoryError::DanglingContext))?;
                buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                buf.extend_from_slice(&payload);
            }
        }
    }
    Ok(())
}

// Composites apply the field-level rules in declaration order and serialize
// the results into a single record chunk.
macro_rules! into_datum_record {
    ($n:literal; $($idx:tt => $T:ident),+) => {
        impl<$($T: IntoDatum),+> IntoDatum for ($($T,)+) {
            const PASS_BY_VALUE: bool = false;

            fn type_desc() -> TypeDesc {
                TypeDesc::builtin(oids::RECORD)
            }

            fn into_datum(self, cxt: MemoryContext) -> Result<TypedValue, ConversionError> {
                let mut buf = Vec::new();
                buf.extend_from_slice(&($n as u32).to_le_bytes());
                $( write_record_attribute(&mut buf, self.$idx.into_datum(cxt)?)?; )+
                let datum = cxt.alloc_bytes(&buf)?;
                Ok(TypedValue::from_parts(datum, false, Self::type_desc()))
            }
        }
    };
}

into_datum_record!(1; 0 => A);
into_datum_record!(2; 0 => A, 1 => B);
into_datum_record!(3; 0 => A, 1 => B, 2 => C);
into_datum_record!(4; 0 => A, 1 => B, 2 => C, 3 => D);
into_datum_record!(5; 0 => A, 1 => B, 2 => C, 3 => D, 4 => E);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memcxt;

    #[test]
    fn by_value_types_need_no_arena() {
        let cxt = MemoryContext::current();
        let tv = 42i32.into_datum(cxt).unwrap();
        assert!(!tv.is_null());
        assert_eq!(tv.type_desc().oid, oids::INT4);
        assert!(tv.type_desc().byval);
        assert!(i32::PASS_BY_VALUE);
    }

    #[test]
    fn strings_allocate_in_the_requested_context() {
        let owned = memcxt::create(None, "target").unwrap();
        let tv = "hello".into_datum(owned.context()).unwrap();
        let datum = tv.datum().unwrap();
        assert_eq!(MemoryContext::for_datum(datum), Some(owned.context()));
        assert!(!<&str>::PASS_BY_VALUE);
    }

    #[test]
    fn none_becomes_the_null_of_the_inner_type() {
        let tv = Option::<i64>::None.into_datum(MemoryContext::current()).unwrap();
        assert!(tv.is_null());
        assert_eq!(tv.type_desc().oid, oids::INT8);
    }

    #[test]
    fn records_serialize_into_a_single_chunk() {
        let owned = memcxt::create(None, "record").unwrap();
        let tv = (1i32, String::from("two")).into_datum(owned.context()).unwrap();
        assert_eq!(tv.type_desc().oid, oids::RECORD);
        assert_eq!(MemoryContext::for_datum(tv.datum().unwrap()), Some(owned.context()));
    }
}
