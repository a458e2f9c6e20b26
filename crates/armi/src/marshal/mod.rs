// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Argument and result marshaling.
//!
//! A marshaled value is its flat part followed by a dynamic region:
//!
//! ```text
//! base
//! +------------------+-----------+-----------+-----
//! | flat (FLAT_SIZE) | chunk 0   | chunk 1   | ...
//! +------------------+-----------+-----------+-----
//!        |  u32 offset ^
//!        +-------------+
//! ```
//!
//! References inside the flat part are `u32` offsets relative to `base`, never
//! pointers. A null reference is [`NULL_OFFSET`] and is never followed on
//! unpack. Each chunk is padded to [`DYNAMIC_ALIGN`] bytes, so
//! [`Marshal::extra_size`] is exact and independent of where the value lands.
//!
//! Flat types (`Packing::Flat`) own no dynamic data and marshal as a straight
//! byte copy. Packed types recurse member by member in declared order.

pub mod cursor;
mod impls;

use std::fmt;

pub use cursor::{Cursor, CursorMut};

use crate::error::{Error, Result};

/// Offset value meaning "no referenced data".
pub const NULL_OFFSET: u32 = u32::MAX;

/// Padding unit for dynamic chunks.
pub const DYNAMIC_ALIGN: usize = 8;

/// Round `len` up to the next multiple of [`DYNAMIC_ALIGN`].
pub const fn padded(len: usize) -> usize {
    (len + DYNAMIC_ALIGN - 1) & !(DYNAMIC_ALIGN - 1)
}

/// How a type is marshaled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Packing {
    /// Copyable as raw bytes.
    Flat,
    /// Owns dynamically sized data that needs active packing.
    Packed,
}

impl Packing {
    /// `Packed` if either side is packed.
    pub const fn and(self, other: Packing) -> Packing {
        match (self, other) {
            (Packing::Flat, Packing::Flat) => Packing::Flat,
            _ => Packing::Packed,
        }
    }

    pub const fn is_flat(self) -> bool {
        matches!(self, Packing::Flat)
    }
}

/// Marshal buffer error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarshalError {
    WriteFailed { offset: usize, reason: String },
    ReadFailed { offset: usize, reason: String },
    InvalidData { reason: String },
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::WriteFailed { offset, reason } => {
                write!(f, "write failed at offset {}: {}", offset, reason)
            }
            MarshalError::ReadFailed { offset, reason } => {
                write!(f, "read failed at offset {}: {}", offset, reason)
            }
            MarshalError::InvalidData { reason } => write!(f, "invalid data: {}", reason),
        }
    }
}

impl std::error::Error for MarshalError {}

pub type MarshalResult<T> = core::result::Result<T, MarshalError>;

/// A type that can travel as RMI arguments or results.
///
/// Implementations are provided for scalars, `String`, `Vec<T>`, `Option<T>`,
/// `Box<T>`, arrays and tuples. User structs implement it with
/// [`marshal_struct!`](crate::marshal_struct).
pub trait Marshal: Sized {
    /// Classification, fixed per type.
    const PACKING: Packing;
    /// Size of the flat representation.
    const FLAT_SIZE: usize;

    /// Dynamic bytes needed beyond the flat representation.
    fn extra_size(&self) -> usize {
        0
    }

    /// Write the flat part at `at` and append dynamic data to the packer tail.
    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()>;

    /// Rebuild a value whose flat part starts at `at`.
    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self>;
}

/// Write side of one marshaled value. Offsets are relative to the buffer start.
pub struct Packer<'a> {
    buffer: &'a mut [u8],
    tail: usize,
}

impl<'a> Packer<'a> {
    /// Packer for a value of flat size `flat_size`; dynamic data starts after it.
    pub fn new(buffer: &'a mut [u8], flat_size: usize) -> Self {
        Self {
            buffer,
            tail: flat_size,
        }
    }

    /// Cursor over the flat slot at `at`.
    pub fn cursor(&mut self, at: usize) -> MarshalResult<CursorMut<'_>> {
        CursorMut::at(&mut *self.buffer, at)
    }

    /// Claim a zeroed chunk of `len` bytes and return its offset.
    pub fn chunk(&mut self, len: usize) -> MarshalResult<usize> {
        let start = self.tail;
        let end = start + padded(len);
        if end > self.buffer.len() {
            return Err(MarshalError::WriteFailed {
                offset: start,
                reason: "dynamic region overflows buffer".into(),
            });
        }
        self.buffer[start..end].fill(0);
        self.tail = end;
        Ok(start)
    }

    /// Bytes used so far.
    pub fn used(&self) -> usize {
        self.tail
    }
}

/// Read side of one marshaled value.
pub struct Unpacker<'a> {
    buffer: &'a [u8],
}

impl<'a> Unpacker<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    pub fn cursor(&self, at: usize) -> MarshalResult<Cursor<'a>> {
        Cursor::at(self.buffer, at)
    }

    /// Resolve a stored offset to a chunk start, checking `len` bytes fit.
    pub fn chunk(&self, offset: u32, len: usize) -> MarshalResult<usize> {
        if offset == NULL_OFFSET {
            return Err(MarshalError::InvalidData {
                reason: "dereference of null offset".into(),
            });
        }
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.buffer.len() => Ok(start),
            _ => Err(MarshalError::ReadFailed {
                offset: start,
                reason: format!("chunk of {} bytes out of bounds", len),
            }),
        }
    }

    pub fn bytes(&self, start: usize, len: usize) -> MarshalResult<&'a [u8]> {
        let mut cursor = self.cursor(start)?;
        cursor.read_bytes(len)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Classification of `T`. A compile-time constant, so computed once per type.
pub const fn classify<T: Marshal>() -> Packing {
    T::PACKING
}

/// Total marshaled size of `value`.
pub fn packed_size<T: Marshal>(value: &T) -> usize {
    T::FLAT_SIZE + value.extra_size()
}

/// Marshal `value` at the start of `buffer` and return the bytes written.
pub fn pack_into<T: Marshal>(value: &T, buffer: &mut [u8]) -> MarshalResult<usize> {
    let size = packed_size(value);
    if size > buffer.len() {
        return Err(MarshalError::WriteFailed {
            offset: 0,
            reason: format!("need {} bytes, have {}", size, buffer.len()),
        });
    }
    let mut packer = Packer::new(&mut buffer[..size], T::FLAT_SIZE);
    value.pack(&mut packer, 0)?;
    debug_assert_eq!(packer.used(), size);
    Ok(size)
}

/// Unmarshal a value whose flat part starts at `buffer[0]`.
pub fn unpack_from<T: Marshal>(buffer: &[u8]) -> MarshalResult<T> {
    if buffer.len() < T::FLAT_SIZE {
        return Err(MarshalError::ReadFailed {
            offset: 0,
            reason: format!("need {} flat bytes, have {}", T::FLAT_SIZE, buffer.len()),
        });
    }
    T::unpack(&Unpacker::new(buffer), 0)
}

/// Marshal into a fresh buffer, enforcing the `ceiling`.
pub fn to_bytes<T: Marshal>(value: &T, ceiling: usize) -> Result<Vec<u8>> {
    let size = packed_size(value);
    if size > ceiling {
        return Err(Error::PayloadTooLarge {
            size,
            capacity: ceiling,
        });
    }
    let mut buffer = vec![0u8; size];
    pack_into(value, &mut buffer)?;
    Ok(buffer)
}

/// Implement [`Marshal`] for a struct, member by member in declared order.
///
/// ```ignore
/// struct Edge { from: u64, to: u64, label: String }
/// armi::marshal_struct!(Edge { from: u64, to: u64, label: String });
/// ```
#[macro_export]
macro_rules! marshal_struct {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        impl $crate::marshal::Marshal for $name {
            const PACKING: $crate::marshal::Packing = $crate::marshal::Packing::Flat
                $(.and(<$ty as $crate::marshal::Marshal>::PACKING))*;
            const FLAT_SIZE: usize = 0 $(+ <$ty as $crate::marshal::Marshal>::FLAT_SIZE)*;

            fn extra_size(&self) -> usize {
                0 $(+ $crate::marshal::Marshal::extra_size(&self.$field))*
            }

            #[allow(unused_assignments, unused_mut, unused_variables)]
            fn pack(
                &self,
                packer: &mut $crate::marshal::Packer<'_>,
                at: usize,
            ) -> $crate::marshal::MarshalResult<()> {
                let mut at = at;
                $(
                    $crate::marshal::Marshal::pack(&self.$field, packer, at)?;
                    at += <$ty as $crate::marshal::Marshal>::FLAT_SIZE;
                )*
                Ok(())
            }

            #[allow(unused_assignments, unused_mut, unused_variables)]
            fn unpack(
                unpacker: &$crate::marshal::Unpacker<'_>,
                at: usize,
            ) -> $crate::marshal::MarshalResult<Self> {
                let mut at = at;
                $(
                    let $field = <$ty as $crate::marshal::Marshal>::unpack(unpacker, at)?;
                    at += <$ty as $crate::marshal::Marshal>::FLAT_SIZE;
                )*
                Ok(Self { $($field),* })
            }
        }
    };
}
