/*
Use of this source code is governed by the MIT license that can be found in the LICENSE file.
*/

//! [`Datum`], the host's opaque fixed-width value token.

// Chunk handles pack a context id and a chunk index into one Datum.
const _: () = assert!(usize::BITS >= 64, "rdbx-sys requires a 64-bit target");

/// One host value, meaningful only to the host.
///
/// A `Datum` carries no ownership and no type information by itself. By-value
/// payloads (integers, floats, booleans) are stored directly in the token;
/// by-reference payloads are handles to chunks allocated in some memory
/// context, and their validity is bounded by that context's liveness. Code
/// above the ABI never interprets the bits except through conversion traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Datum(usize);

impl Datum {
    /// The conventional token paired with a raised null flag.
    pub const NULL: Datum = Datum(0);

    /// The raw token bits.
    #[inline]
    pub fn value(self) -> usize {
        self.0
    }
}

impl From<usize> for Datum {
    #[inline]
    fn from(value: usize) -> Self {
        Datum(value)
    }
}

impl From<Datum> for usize {
    #[inline]
    fn from(datum: Datum) -> Self {
        datum.0
    }
}
