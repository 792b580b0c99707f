/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! Builtin type-identifier lookup.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Host type identifier.
pub type Oid = u32;

/// Identifiers of the builtin types the host assigns fixed oids.
pub mod oids {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const CHAR: Oid = 18;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const RECORD: Oid = 2249;
}

/// One row of the host's type catalog.
///
/// `len` is the fixed payload width in bytes, or `-1` for varlena types whose
/// by-reference payload carries its own length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeEntry {
    pub oid: Oid,
    pub name: &'static str,
    pub byval: bool,
    pub len: i16,
}

static BUILTINS: &[TypeEntry] = &[
    TypeEntry { oid: oids::BOOL, name: "bool", byval: true, len: 1 },
    TypeEntry { oid: oids::BYTEA, name: "bytea", byval: false, len: -1 },
    TypeEntry { oid: oids::CHAR, name: "char", byval: true, len: 1 },
    TypeEntry { oid: oids::INT8, name: "int8", byval: true, len: 8 },
    TypeEntry { oid: oids::INT2, name: "int2", byval: true, len: 2 },
    TypeEntry { oid: oids::INT4, name: "int4", byval: true, len: 4 },
    TypeEntry { oid: oids::TEXT, name: "text", byval: false, len: -1 },
    TypeEntry { oid: oids::OID, name: "oid", byval: true, len: 4 },
    TypeEntry { oid: oids::FLOAT4, name: "float4", byval: true, len: 4 },
    TypeEntry { oid: oids::FLOAT8, name: "float8", byval: true, len: 8 },
    TypeEntry { oid: oids::RECORD, name: "record", byval: false, len: -1 },
];

static BY_OID: Lazy<HashMap<Oid, &'static TypeEntry>> =
    Lazy::new(|| BUILTINS.iter().map(|entry| (entry.oid, entry)).collect());

/// Looks a type up by identifier.
pub fn type_lookup(oid: Oid) -> Option<&'static TypeEntry> {
    BY_OID.get(&oid).copied()
}
