//! # Ring Identifiers and Interval Arithmetic
//!
//! This module defines the numeric foundation of the overlay:
//!
//! - [`Identifier`]: 64-byte unsigned point on the 2^512 identifier ring
//! - [`Unreduced`]: intermediate result of ring arithmetic awaiting reduction
//! - [`Interval`]: the four boundary conventions for ring-membership tests
//! - [`NodeRef`]: identifier plus optional last-known network location
//!
//! ## Identifier Model
//!
//! Identifiers are fixed-width 512-bit unsigned values stored big-endian
//! (byte 0 is most significant), derived by hashing whatever names a node
//! (SHA-512 output is exactly the ring width). On the wire an identifier is
//! a 128-character lowercase hex string and is valid iff the length matches
//! exactly.
//!
//! ## Arithmetic Model
//!
//! The ring only ever needs two operations beyond comparison: adding and
//! subtracting a power of two ([`Identifier::add_pow2`] /
//! [`Identifier::sub_pow2`]), both byte-wise with carry/borrow propagation.
//! A subtraction that crosses below zero is not an error: it yields an
//! [`Unreduced`] value flagged as needing reduction, and
//! [`Unreduced::modulo`] consumes the flag. Short byte inputs are
//! zero-extended rather than rejected, keeping the arithmetic total.
//!
//! ## Interval Model
//!
//! Every routing decision in the protocol ("does X fall between me and my
//! successor", "is C strictly between self and target") is exactly one
//! [`Interval::contains`] call. When `lower >= upper` the interval crosses
//! the ring's zero point and is evaluated as the union of the two arcs
//! `[lower, MAX]` and `[0, upper]` with the endpoint rules of the chosen
//! convention. Equal bounds therefore denote the full ring (minus excluded
//! endpoints), which is what lets a sole node route every key to itself.
//!
//! ## Invariants
//!
//! - I1: `Identifier::from_bytes(b).as_bytes() == b`
//! - I2: every arithmetic result is reduced into `[0, 2^512)` before use
//! - I3: ordering is the canonical most-significant-first byte scan shared
//!   with `Interval::contains`; nothing compares by subtraction
//! - I4: `NodeRef` equality and hashing consider the identifier only

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of the identifier space in bits.
pub const RING_BITS: u16 = 512;

/// Width of an identifier in bytes.
pub const ID_LEN: usize = 64;

/// Exact length of an identifier's wire form (lowercase hex).
pub const ID_HEX_LEN: usize = 128;

/// Milliseconds since the Unix epoch. Used for token minting timestamps.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Identifier
// ============================================================================

/// A 512-bit point on the circular identifier space, big-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier([u8; ID_LEN]);

// Serde's derive only covers arrays up to 32 elements, so the 64-byte
// payload is (de)serialized by hand with the same fixed-width tuple
// encoding the derive would produce.
impl Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeTuple;
        let mut tup = serializer.serialize_tuple(ID_LEN)?;
        for byte in &self.0 {
            tup.serialize_element(byte)?;
        }
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct IdVisitor;

        impl<'de> serde::de::Visitor<'de> for IdVisitor {
            type Value = Identifier;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{ID_LEN} identifier bytes")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Identifier, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut out = [0u8; ID_LEN];
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(Identifier(out))
            }
        }

        deserializer.deserialize_tuple(ID_LEN, IdVisitor)
    }
}

impl Identifier {
    /// The additive identity (all zero bytes).
    pub const ZERO: Identifier = Identifier([0u8; ID_LEN]);

    /// The largest representable identifier, 2^512 - 1.
    pub const MAX: Identifier = Identifier([0xff; ID_LEN]);

    /// Wrap an exact 64-byte buffer.
    #[inline]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Identifier(bytes)
    }

    /// Build an identifier from an arbitrary byte slice.
    ///
    /// Short inputs are zero-extended on the most-significant side; inputs
    /// longer than 64 bytes keep their low-order 64 bytes (reduction modulo
    /// 2^512). Never fails.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0u8; ID_LEN];
        if bytes.len() >= ID_LEN {
            out.copy_from_slice(&bytes[bytes.len() - ID_LEN..]);
        } else {
            out[ID_LEN - bytes.len()..].copy_from_slice(bytes);
        }
        Identifier(out)
    }

    /// Derive an identifier by hashing arbitrary input with SHA-512.
    ///
    /// The digest width is the ring width, so the result needs no further
    /// reduction.
    pub fn digest(input: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(input);
        Identifier(hasher.finalize().into())
    }

    /// Convenience constructor placing `v` in the low-order bytes.
    #[inline]
    pub fn from_low_u64(v: u64) -> Self {
        Self::from_slice(&v.to_be_bytes())
    }

    /// Parse the wire form: exactly 128 lowercase hex characters.
    pub fn from_hex(s: &str) -> Result<Self, IdentifierError> {
        if s.len() != ID_HEX_LEN {
            return Err(IdentifierError::Length(s.len()));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(IdentifierError::Charset);
        }
        let mut out = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|_| IdentifierError::Charset)?;
        Ok(Identifier(out))
    }

    /// Render the wire form (128 lowercase hex characters).
    #[inline]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log fields.
    #[inline]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Borrow the raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Add 2^exp on the ring, with byte-wise carry propagation.
    ///
    /// `exp >= 512` adds a multiple of the ring size, a no-op.
    pub fn add_pow2(&self, exp: u16) -> Unreduced {
        if exp >= RING_BITS {
            return Unreduced { bytes: self.0, needs_reduction: false };
        }
        let mut bytes = self.0;
        let mut idx = ID_LEN - 1 - (exp as usize / 8);
        let mut carry = 1u8 << (exp % 8);
        loop {
            let (sum, overflow) = bytes[idx].overflowing_add(carry);
            bytes[idx] = sum;
            if !overflow || idx == 0 {
                break;
            }
            carry = 1;
            idx -= 1;
        }
        // A carry out of byte 0 vanishes: the width is the ring size.
        Unreduced { bytes, needs_reduction: false }
    }

    /// Subtract 2^exp on the ring, with byte-wise borrow propagation.
    ///
    /// Crossing below zero is not an error: the result wraps and is flagged
    /// as needing reduction, which [`Unreduced::modulo`] consumes.
    pub fn sub_pow2(&self, exp: u16) -> Unreduced {
        if exp >= RING_BITS {
            return Unreduced { bytes: self.0, needs_reduction: false };
        }
        let mut bytes = self.0;
        let mut idx = ID_LEN - 1 - (exp as usize / 8);
        let mut borrow = 1u8 << (exp % 8);
        let mut crossed_zero = false;
        loop {
            let (diff, underflow) = bytes[idx].overflowing_sub(borrow);
            bytes[idx] = diff;
            if !underflow {
                break;
            }
            if idx == 0 {
                crossed_zero = true;
                break;
            }
            borrow = 1;
            idx -= 1;
        }
        Unreduced { bytes, needs_reduction: crossed_zero }
    }

    /// Reduce into `[0, 2^m)` by keeping the low `m` bits.
    pub fn modulo(&self, m: u16) -> Identifier {
        Unreduced { bytes: self.0, needs_reduction: false }.modulo(m)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({}..)", self.short())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl PartialOrd for Identifier {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    /// The canonical comparison: scan from the most significant byte and
    /// short-circuit at the first decisive byte. Never subtraction, because
    /// the surrounding space wraps.
    fn cmp(&self, other: &Self) -> Ordering {
        for i in 0..ID_LEN {
            match self.0[i].cmp(&other.0[i]) {
                Ordering::Equal => continue,
                decisive => return decisive,
            }
        }
        Ordering::Equal
    }
}

// ============================================================================
// Unreduced intermediate + modulo
// ============================================================================

/// Result of a ring addition or subtraction before modular reduction.
///
/// Carries the needs-reduction flag recording that a subtraction borrowed
/// past zero. The flag never escapes this module: [`Unreduced::modulo`]
/// consumes it, and callers only ever see reduced [`Identifier`]s.
#[derive(Clone, Copy, Debug)]
pub struct Unreduced {
    bytes: [u8; ID_LEN],
    needs_reduction: bool,
}

impl Unreduced {
    /// Reduce into `[0, 2^m)`.
    ///
    /// Bits at or above `m` are cleared. Because 2^m divides 2^512, masking
    /// the wrapped representation of a flagged (borrowed-past-zero) value
    /// gives exactly the value the repeated-subtraction formulation would:
    /// the wrap already added 2^512, itself a multiple of 2^m.
    pub fn modulo(self, m: u16) -> Identifier {
        if m == 0 {
            return Identifier::ZERO;
        }
        if m >= RING_BITS {
            // Full width: the representation is already the residue.
            return Identifier(self.bytes);
        }
        let mut bytes = self.bytes;
        let keep_bytes = (m as usize + 7) / 8;
        let boundary = ID_LEN - keep_bytes;
        for b in bytes[..boundary].iter_mut() {
            *b = 0;
        }
        let partial = m % 8;
        if partial != 0 {
            bytes[boundary] &= (1u8 << partial) - 1;
        }
        Identifier(bytes)
    }
}

// ============================================================================
// Interval membership
// ============================================================================

/// Boundary convention for a ring interval from `lower` to `upper`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interval {
    /// `[lower, upper]` - both endpoints included.
    Closed,
    /// `(lower, upper)` - both endpoints excluded.
    Open,
    /// `[lower, upper)` - lower included, upper excluded.
    ClosedOpen,
    /// `(lower, upper]` - lower excluded, upper included.
    OpenClosed,
}

impl Interval {
    #[inline]
    fn includes_lower(self) -> bool {
        matches!(self, Interval::Closed | Interval::ClosedOpen)
    }

    #[inline]
    fn includes_upper(self) -> bool {
        matches!(self, Interval::Closed | Interval::OpenClosed)
    }

    /// Ring-membership test for `target` in the interval from `lower` to
    /// `upper` under this boundary convention.
    ///
    /// If `lower >= upper` numerically the interval crosses the ring's zero
    /// point: membership is evaluated as the union of the arc up to `MAX`
    /// (lower-endpoint rule applies, `MAX` included) and the arc from zero
    /// (zero included, upper-endpoint rule applies). Equal bounds therefore
    /// denote the full ring minus any excluded endpoint.
    pub fn contains(self, lower: &Identifier, upper: &Identifier, target: &Identifier) -> bool {
        let above = match target.cmp(lower) {
            Ordering::Greater => true,
            Ordering::Equal => self.includes_lower(),
            Ordering::Less => false,
        };
        let below = match target.cmp(upper) {
            Ordering::Less => true,
            Ordering::Equal => self.includes_upper(),
            Ordering::Greater => false,
        };
        if lower >= upper {
            above || below
        } else {
            above && below
        }
    }
}

// ============================================================================
// NodeRef
// ============================================================================

/// A reference to a node: its ring identifier plus the last-known network
/// location, if any.
///
/// A `NodeRef` may stay unresolved (identifier only) until a lookup or the
/// transport layer fills in a location. It is a plain value: immutable once
/// constructed and freely copied. Equality and hashing consider the
/// identifier only, so a located and an unresolved reference to the same
/// node compare equal.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct NodeRef {
    id: Identifier,
    addr: Option<SocketAddr>,
}

impl NodeRef {
    /// An unresolved reference (identifier only).
    #[inline]
    pub const fn new(id: Identifier) -> Self {
        NodeRef { id, addr: None }
    }

    /// A reference with a known location.
    #[inline]
    pub const fn with_addr(id: Identifier, addr: SocketAddr) -> Self {
        NodeRef { id, addr: Some(addr) }
    }

    #[inline]
    pub fn id(&self) -> Identifier {
        self.id
    }

    #[inline]
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Copy of this reference with the location filled in.
    #[inline]
    pub fn located(&self, addr: SocketAddr) -> Self {
        NodeRef { id: self.id, addr: Some(addr) }
    }
}

impl PartialEq for NodeRef {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeRef {}

impl std::hash::Hash for NodeRef {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "NodeRef({}.. @ {})", self.id.short(), addr),
            None => write!(f, "NodeRef({}..)", self.id.short()),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Rejection reasons for identifier wire forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierError {
    /// Wrong length; valid identifiers are exactly 128 hex characters.
    Length(usize),
    /// A character outside lowercase hex.
    Charset,
}

impl fmt::Display for IdentifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierError::Length(got) => {
                write!(f, "identifier must be {ID_HEX_LEN} hex chars, got {got}")
            }
            IdentifierError::Charset => {
                write!(f, "identifier contains non-lowercase-hex characters")
            }
        }
    }
}

impl std::error::Error for IdentifierError {}

// ============================================================================
// Tests
// ============================================================================
