//! # Byte-Comparable Entry Codec
//!
//! Keys and values stored in the tree are user-supplied fixed-size types that
//! serialize themselves through the [`Item`] capability trait. The tree never
//! interprets a key beyond its canonical byte encoding: key order *is* the
//! lexicographic order of the encoded bytes, so a single `memcmp`-style slice
//! comparison decides every descent.
//!
//! ## Encoding Requirements
//!
//! 1. **Fixed size**: `size()` must return the same value for every instance
//!    of the type stored in one tree file; the node layout is computed from it
//!    once at creation and validated on every reopen.
//! 2. **Order-preserving**: the encoding must sort byte-lexicographically in
//!    the intended key order. Unsigned integers achieve this with plain
//!    big-endian bytes. Signed integers flip the sign bit so that negative
//!    values sort below positive ones:
//!
//!    ```text
//!    i32::MIN  -> 00 00 00 00
//!    -1        -> 7f ff ff ff
//!    0         -> 80 00 00 00
//!    i32::MAX  -> ff ff ff ff
//!    ```
//!
//! 3. **Invertible**: `decode(encode(x)) == x`.
//!
//! ## The nil sentinel
//!
//! `is_nil` marks the "no key" value that [`Tree::scan`](crate::Tree::scan)
//! interprets as "start from the minimum". `Default::default()` must produce
//! a nil instance; for the stock integer implementations nil is zero.

use std::fmt::Debug;

/// Capability trait for fixed-size, self-encoding keys and values.
pub trait Item: Clone + Default + Debug {
    /// Encoded byte size. Constant per type for the life of a tree file.
    fn size(&self) -> usize;

    /// Writes the canonical encoding into `buf`.
    ///
    /// `buf.len()` must equal `self.size()`; the tree always hands out
    /// exactly-sized slices.
    fn encode(&self, buf: &mut [u8]);

    /// Reconstructs a value from its canonical encoding.
    fn decode(buf: &[u8]) -> Self;

    /// Whether this is the "no key" sentinel (scan-from-minimum).
    fn is_nil(&self) -> bool;
}

/// A key/value pair as stored in one tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<K, V> {
    pub key: K,
    pub val: V,
}

impl<K: Item, V: Item> Entry<K, V> {
    pub fn new(key: K, val: V) -> Self {
        Self { key, val }
    }

    pub fn size(&self) -> usize {
        self.key.size() + self.val.size()
    }

    /// Writes `key bytes | val bytes` into `buf` (`buf.len() == self.size()`).
    pub fn encode(&self, buf: &mut [u8]) {
        let split = self.key.size();
        self.key.encode(&mut buf[..split]);
        self.val.encode(&mut buf[split..]);
    }

    /// Inverse of [`encode`](Self::encode); `split` is the key's byte size.
    pub fn decode(buf: &[u8], split: usize) -> Self {
        Self {
            key: K::decode(&buf[..split]),
            val: V::decode(&buf[split..]),
        }
    }
}

impl<K: Item, V: Item> Default for Entry<K, V> {
    fn default() -> Self {
        Self {
            key: K::default(),
            val: V::default(),
        }
    }
}

macro_rules! unsigned_item {
    ($ty:ty) => {
        impl Item for $ty {
            fn size(&self) -> usize {
                size_of::<$ty>()
            }

            fn encode(&self, buf: &mut [u8]) {
                buf.copy_from_slice(&self.to_be_bytes());
            }

            fn decode(buf: &[u8]) -> Self {
                <$ty>::from_be_bytes(buf.try_into().expect("buffer size mismatch"))
            }

            fn is_nil(&self) -> bool {
                *self == 0
            }
        }
    };
}

unsigned_item!(u32);
unsigned_item!(u64);

macro_rules! signed_item {
    ($ty:ty, $unsigned:ty) => {
        impl Item for $ty {
            fn size(&self) -> usize {
                size_of::<$ty>()
            }

            // Sign bit flipped so byte order matches numeric order.
            fn encode(&self, buf: &mut [u8]) {
                let flipped = (*self as $unsigned) ^ (1 << (<$ty>::BITS - 1));
                buf.copy_from_slice(&flipped.to_be_bytes());
            }

            fn decode(buf: &[u8]) -> Self {
                let flipped =
                    <$unsigned>::from_be_bytes(buf.try_into().expect("buffer size mismatch"));
                (flipped ^ (1 << (<$ty>::BITS - 1))) as $ty
            }

            fn is_nil(&self) -> bool {
                *self == 0
            }
        }
    };
}

signed_item!(i32, u32);
signed_item!(i64, u64);

impl<const N: usize> Item for [u8; N]
where
    Self: Default,
{
    fn size(&self) -> usize {
        N
    }

    fn encode(&self, buf: &mut [u8]) {
        buf.copy_from_slice(self);
    }

    fn decode(buf: &[u8]) -> Self {
        buf.try_into().expect("buffer size mismatch")
    }

    fn is_nil(&self) -> bool {
        self.iter().all(|b| *b == 0)
    }
}
