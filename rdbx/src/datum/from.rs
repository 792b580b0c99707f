/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! Marshaling typed values back into native values.

use crate::datum::{Datum, Oid, TypeDesc, TypedValue};
use crate::error::{ConversionError, MemoryError};
use crate::memcxt::MemoryContext;
use crate::sys;
use crate::sys::oids;

/// Compile-time-resolved rule for reconstructing a native value from a typed
/// value.
pub trait FromDatum: Sized {
    /// Fails with [`ConversionError::NullNotAllowed`] when the value is null
    /// and `Self` has no null representation, with
    /// [`ConversionError::TypeMismatch`] when the descriptor names a host
    /// type `Self` does not map to, and with
    /// [`ConversionError::CorruptData`] when a by-reference payload fails
    /// structural validation.
    fn from_datum(value: &TypedValue) -> Result<Self, ConversionError>;
}

fn expect_oid(value: &TypedValue, expected: Oid) -> Result<(), ConversionError> {
    let found = value.type_desc().oid;
    if found != expected {
        return Err(ConversionError::TypeMismatch { expected, found });
    }
    Ok(())
}

fn non_null<T>(value: &TypedValue) -> Result<Datum, ConversionError> {
    value
        .datum()
        .ok_or(ConversionError::NullNotAllowed { type_name: std::any::type_name::<T>() })
}

// Strict widths: each impl accepts exactly the host type it maps to, so a
// width mismatch is a different impl, not a runtime coercion.
macro_rules! from_datum_byval {
    ($ty:ty, $oid:expr, |$raw:ident| $decode:expr) => {
        impl FromDatum for $ty {
            fn from_datum(value: &TypedValue) -> Result<Self, ConversionError> {
                expect_oid(value, $oid)?;
                let $raw = non_null::<Self>(value)?.value();
                Ok($decode)
            }
        }
    };
}

from_datum_byval!(bool, oids::BOOL, |raw| raw != 0);
from_datum_byval!(i8, oids::CHAR, |raw| raw as u8 as i8);
from_datum_byval!(i16, oids::INT2, |raw| raw as u16 as i16);
from_datum_byval!(i32, oids::INT4, |raw| raw as u32 as i32);
from_datum_byval!(i64, oids::INT8, |raw| raw as u64 as i64);
from_datum_byval!(u32, oids::OID, |raw| raw as u32);
from_datum_byval!(f32, oids::FLOAT4, |raw| f32::from_bits(raw as u32));
from_datum_byval!(f64, oids::FLOAT8, |raw| f64::from_bits(raw as u64));

fn read_varlena<T>(value: &TypedValue, expected: Oid) -> Result<Vec<u8>, ConversionError> {
    expect_oid(value, expected)?;
    let datum = non_null::<T>(value)?;
    let chunk = sys::datum_read_bytes(datum)
        .ok_or(ConversionError::Memory(MemoryError::DanglingContext))?;
    if chunk.len() < 4 {
        return Err(ConversionError::CorruptData(
            "varlena chunk is shorter than its length header".into(),
        ));
    }
    let declared = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
    if chunk.len() - 4 != declared {
        return Err(ConversionError::CorruptData(format!(
            "varlena header declares {declared} bytes but the chunk holds {}",
            chunk.len() - 4
        )));
    }
    Ok(chunk[4..].to_vec())
}

impl FromDatum for String {
    fn from_datum(value: &TypedValue) -> Result<Self, ConversionError> {
        let payload = read_varlena::<Self>(value, oids::TEXT)?;
        String::from_utf8(payload)
            .map_err(|_| ConversionError::CorruptData("text payload is not valid utf-8".into()))
    }
}

impl FromDatum for Vec<u8> {
    fn from_datum(value: &TypedValue) -> Result<Self, ConversionError> {
        read_varlena::<Self>(value, oids::BYTEA)
    }
}

impl<T: FromDatum> FromDatum for Option<T> {
    /// Null maps to `None` instead of failing; a present value uses `T`'s
    /// own rule.
    fn from_datum(value: &TypedValue) -> Result<Self, ConversionError> {
        if value.is_null() {
            return Ok(None);
        }
        T::from_datum(value).map(Some)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Cursor<'a> {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ConversionError> {
        if self.pos + n > self.bytes.len() {
            return Err(ConversionError::CorruptData("record payload is truncated".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ConversionError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, ConversionError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, ConversionError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn finish(self) -> Result<(), ConversionError> {
        if self.pos != self.bytes.len() {
            return Err(ConversionError::CorruptData("record payload has trailing bytes".into()));
        }
        Ok(())
    }
}

fn attribute_type(oid: Oid) -> Result<TypeDesc, ConversionError> {
    TypeDesc::of(oid).ok_or_else(|| {
        ConversionError::CorruptData(format!("record attribute has unknown type oid {oid}"))
    })
}

// Re-materializes one attribute as a standalone typed value; by-reference
// payloads land in the current context.
fn read_record_attribute(cursor: &mut Cursor<'_>) -> Result<TypedValue, ConversionError> {
    let oid = cursor.read_u32()?;
    let is_null = cursor.read_u8()? != 0;
    let ty = attribute_type(oid)?;
    if is_null {
        return Ok(TypedValue::null(ty));
    }
    let byval = cursor.read_u8()? != 0;
    if byval != ty.byval {
        return Err(ConversionError::CorruptData(format!(
            "record attribute storage class disagrees with the catalog for oid {oid}"
        )));
    }
    if byval {
        let raw = cursor.read_u64()? as usize;
        Ok(TypedValue::from_parts(Datum::from(raw), false, ty))
    } else {
        let len = cursor.read_u32()? as usize;
        let payload = cursor.take(len)?;
        let datum = MemoryContext::current().alloc_bytes(payload)?;
        Ok(TypedValue::from_parts(datum, false, ty))
    }
}

// A composite decodes field by field in declaration order and constructs the
// tuple only once every field has decoded; a failing field leaves nothing
// partially built behind.
macro_rules! from_datum_record {
    ($n:literal; $($T:ident),+) => {
        impl<$($T: FromDatum),+> FromDatum for ($($T,)+) {
            fn from_datum(value: &TypedValue) -> Result<Self, ConversionError> {
                expect_oid(value, oids::RECORD)?;
                let datum = non_null::<Self>(value)?;
                let bytes = sys::datum_read_bytes(datum)
                    .ok_or(ConversionError::Memory(MemoryError::DanglingContext))?;
                let mut cursor = Cursor::new(&bytes);
                let natts = cursor.read_u32()?;
                if natts != $n {
                    return Err(ConversionError::CorruptData(format!(
                        "record holds {natts} attributes, expected {}",
                        $n
                    )));
                }
                let decoded = (
                    $( <$T as FromDatum>::from_datum(&read_record_attribute(&mut cursor)?)?, )+
                );
                cursor.finish()?;
                Ok(decoded)
            }
        }
    };
}

from_datum_record!(1; A);
from_datum_record!(2; A, B);
from_datum_record!(3; A, B, C);
from_datum_record!(4; A, B, C, D);
from_datum_record!(5; A, B, C, D, E);
