// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `Marshal` implementations for std types.

use super::{padded, Marshal, MarshalError, MarshalResult, Packer, Packing, Unpacker, NULL_OFFSET};

/// Scalars: little-endian byte copy.
macro_rules! impl_marshal_scalar {
    ($($type:ty),* $(,)?) => {
        $(
            impl Marshal for $type {
                const PACKING: Packing = Packing::Flat;
                const FLAT_SIZE: usize = std::mem::size_of::<$type>();

                fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
                    packer.cursor(at)?.write_bytes(&self.to_le_bytes())
                }

                fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
                    let mut cursor = unpacker.cursor(at)?;
                    Ok(<$type>::from_le_bytes(cursor.read_array()?))
                }
            }
        )*
    };
}

impl_marshal_scalar!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl Marshal for bool {
    const PACKING: Packing = Packing::Flat;
    const FLAT_SIZE: usize = 1;

    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
        packer.cursor(at)?.write_u8(u8::from(*self))
    }

    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
        match unpacker.cursor(at)?.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(MarshalError::InvalidData {
                reason: format!("invalid bool byte {:#04x}", other),
            }),
        }
    }
}

impl Marshal for char {
    const PACKING: Packing = Packing::Flat;
    const FLAT_SIZE: usize = 4;

    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
        packer.cursor(at)?.write_u32_le(u32::from(*self))
    }

    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
        let raw = unpacker.cursor(at)?.read_u32_le()?;
        char::from_u32(raw).ok_or_else(|| MarshalError::InvalidData {
            reason: format!("invalid char {:#x}", raw),
        })
    }
}

// usize/isize travel as 64-bit so mixed-width peers agree on the layout.
impl Marshal for usize {
    const PACKING: Packing = Packing::Flat;
    const FLAT_SIZE: usize = 8;

    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
        packer.cursor(at)?.write_u64_le(*self as u64)
    }

    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
        let raw = unpacker.cursor(at)?.read_u64_le()?;
        usize::try_from(raw).map_err(|_| MarshalError::InvalidData {
            reason: format!("usize value {} does not fit", raw),
        })
    }
}

impl Marshal for isize {
    const PACKING: Packing = Packing::Flat;
    const FLAT_SIZE: usize = 8;

    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
        packer.cursor(at)?.write_bytes(&(*self as i64).to_le_bytes())
    }

    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
        let raw = i64::from_le_bytes(unpacker.cursor(at)?.read_array()?);
        isize::try_from(raw).map_err(|_| MarshalError::InvalidData {
            reason: format!("isize value {} does not fit", raw),
        })
    }
}

impl Marshal for () {
    const PACKING: Packing = Packing::Flat;
    const FLAT_SIZE: usize = 0;

    fn pack(&self, _packer: &mut Packer<'_>, _at: usize) -> MarshalResult<()> {
        Ok(())
    }

    fn unpack(_unpacker: &Unpacker<'_>, _at: usize) -> MarshalResult<Self> {
        Ok(())
    }
}

/// Write the `(offset, len)` pair of a sequence.
fn write_sequence_header(
    packer: &mut Packer<'_>,
    at: usize,
    offset: u32,
    len: usize,
) -> MarshalResult<()> {
    let len = u32::try_from(len).map_err(|_| MarshalError::InvalidData {
        reason: format!("sequence of {} elements exceeds u32", len),
    })?;
    let mut cursor = packer.cursor(at)?;
    cursor.write_u32_le(offset)?;
    cursor.write_u32_le(len)
}

fn read_sequence_header(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<(u32, usize)> {
    let mut cursor = unpacker.cursor(at)?;
    let offset = cursor.read_u32_le()?;
    let len = cursor.read_u32_le()? as usize;
    Ok((offset, len))
}

fn chunk_offset(start: usize) -> MarshalResult<u32> {
    u32::try_from(start).map_err(|_| MarshalError::WriteFailed {
        offset: start,
        reason: "offset exceeds u32".into(),
    })
}

impl Marshal for String {
    const PACKING: Packing = Packing::Packed;
    const FLAT_SIZE: usize = 8;

    fn extra_size(&self) -> usize {
        padded(self.len())
    }

    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
        if self.is_empty() {
            return write_sequence_header(packer, at, NULL_OFFSET, 0);
        }
        let start = packer.chunk(self.len())?;
        packer.cursor(start)?.write_bytes(self.as_bytes())?;
        write_sequence_header(packer, at, chunk_offset(start)?, self.len())
    }

    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
        let (offset, len) = read_sequence_header(unpacker, at)?;
        if len == 0 {
            return Ok(String::new());
        }
        let start = unpacker.chunk(offset, len)?;
        let bytes = unpacker.bytes(start, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| MarshalError::InvalidData {
            reason: format!("string is not UTF-8: {}", e),
        })
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    const PACKING: Packing = Packing::Packed;
    const FLAT_SIZE: usize = 8;

    fn extra_size(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let elements = padded(self.len() * T::FLAT_SIZE);
        if T::PACKING.is_flat() {
            elements
        } else {
            elements + self.iter().map(Marshal::extra_size).sum::<usize>()
        }
    }

    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
        if self.is_empty() {
            return write_sequence_header(packer, at, NULL_OFFSET, 0);
        }
        let start = packer.chunk(self.len() * T::FLAT_SIZE)?;
        for (i, element) in self.iter().enumerate() {
            element.pack(packer, start + i * T::FLAT_SIZE)?;
        }
        write_sequence_header(packer, at, chunk_offset(start)?, self.len())
    }

    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
        let (offset, len) = read_sequence_header(unpacker, at)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        if T::FLAT_SIZE == 0 && len > unpacker.len() {
            return Err(MarshalError::InvalidData {
                reason: format!("implausible length {} for zero-sized elements", len),
            });
        }
        let bytes = len
            .checked_mul(T::FLAT_SIZE)
            .ok_or_else(|| MarshalError::InvalidData {
                reason: format!("sequence length {} overflows", len),
            })?;
        let start = unpacker.chunk(offset, bytes)?;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(T::unpack(unpacker, start + i * T::FLAT_SIZE)?);
        }
        Ok(out)
    }
}

/// Nullable dynamic reference: `None` packs to [`NULL_OFFSET`].
impl<T: Marshal> Marshal for Option<T> {
    const PACKING: Packing = Packing::Packed;
    const FLAT_SIZE: usize = 4;

    fn extra_size(&self) -> usize {
        match self {
            None => 0,
            Some(value) => padded(T::FLAT_SIZE) + value.extra_size(),
        }
    }

    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
        let offset = match self {
            None => NULL_OFFSET,
            Some(value) => {
                let start = packer.chunk(T::FLAT_SIZE)?;
                value.pack(packer, start)?;
                chunk_offset(start)?
            }
        };
        packer.cursor(at)?.write_u32_le(offset)
    }

    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
        let offset = unpacker.cursor(at)?.read_u32_le()?;
        if offset == NULL_OFFSET {
            return Ok(None);
        }
        let start = unpacker.chunk(offset, T::FLAT_SIZE)?;
        T::unpack(unpacker, start).map(Some)
    }
}

/// Non-null dynamic reference.
impl<T: Marshal> Marshal for Box<T> {
    const PACKING: Packing = Packing::Packed;
    const FLAT_SIZE: usize = 4;

    fn extra_size(&self) -> usize {
        padded(T::FLAT_SIZE) + self.as_ref().extra_size()
    }

    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
        let start = packer.chunk(T::FLAT_SIZE)?;
        self.as_ref().pack(packer, start)?;
        packer.cursor(at)?.write_u32_le(chunk_offset(start)?)
    }

    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
        let offset = unpacker.cursor(at)?.read_u32_le()?;
        let start = unpacker.chunk(offset, T::FLAT_SIZE)?;
        T::unpack(unpacker, start).map(Box::new)
    }
}

impl<T: Marshal, const N: usize> Marshal for [T; N] {
    const PACKING: Packing = T::PACKING;
    const FLAT_SIZE: usize = T::FLAT_SIZE * N;

    fn extra_size(&self) -> usize {
        self.iter().map(Marshal::extra_size).sum()
    }

    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
        for (i, element) in self.iter().enumerate() {
            element.pack(packer, at + i * T::FLAT_SIZE)?;
        }
        Ok(())
    }

    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
        let mut items = Vec::with_capacity(N);
        for i in 0..N {
            items.push(T::unpack(unpacker, at + i * T::FLAT_SIZE)?);
        }
        <[T; N]>::try_from(items).map_err(|_| MarshalError::InvalidData {
            reason: format!("array of {} elements", N),
        })
    }
}

macro_rules! impl_marshal_tuple {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: Marshal),+> Marshal for ($($name,)+) {
            const PACKING: Packing = Packing::Flat $(.and(<$name as Marshal>::PACKING))+;
            const FLAT_SIZE: usize = 0 $(+ <$name as Marshal>::FLAT_SIZE)+;

            fn extra_size(&self) -> usize {
                0 $(+ self.$idx.extra_size())+
            }

            #[allow(unused_assignments)]
            fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
                let mut at = at;
                $(
                    self.$idx.pack(packer, at)?;
                    at += <$name as Marshal>::FLAT_SIZE;
                )+
                Ok(())
            }

            #[allow(unused_assignments)]
            fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
                let mut at = at;
                Ok(($(
                    {
                        let value = <$name as Marshal>::unpack(unpacker, at)?;
                        at += <$name as Marshal>::FLAT_SIZE;
                        value
                    },
                )+))
            }
        }
    };
}

impl_marshal_tuple!(A 0);
impl_marshal_tuple!(A 0, B 1);
impl_marshal_tuple!(A 0, B 1, C 2);
impl_marshal_tuple!(A 0, B 1, C 2, D 3);
impl_marshal_tuple!(A 0, B 1, C 2, D 3, E 4);
impl_marshal_tuple!(A 0, B 1, C 2, D 3, E 4, F 5);
impl_marshal_tuple!(A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_marshal_tuple!(A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);

#[cfg(test)]
mod tests {
    use super::super::{pack_into, packed_size, to_bytes, unpack_from, Marshal};
    use super::*;

    fn roundtrip<T: Marshal + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = to_bytes(&value, 1 << 20).expect("pack value");
        assert_eq!(bytes.len(), packed_size(&value));
        let back: T = unpack_from(&bytes).expect("unpack value");
        assert_eq!(back, value);
    }

    #[test]
    fn test_scalar_layouts() {
        assert_eq!(<u16 as Marshal>::FLAT_SIZE, 2);
        assert_eq!(<usize as Marshal>::FLAT_SIZE, 8);
        let bytes = to_bytes(&0xDEAD_BEEFu32, 16).expect("pack u32");
        assert_eq!(bytes, 0xDEAD_BEEFu32.to_le_bytes());
        roundtrip(-17i64);
        roundtrip(3.5f32);
        roundtrip(u128::MAX);
        roundtrip('\u{1F980}');
        roundtrip(usize::MAX >> 1);
    }

    #[test]
    fn test_bool_rejects_garbage() {
        roundtrip(true);
        assert!(matches!(
            unpack_from::<bool>(&[2]),
            Err(MarshalError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_char_rejects_surrogate() {
        let bytes = 0xD800u32.to_le_bytes();
        assert!(unpack_from::<char>(&bytes).is_err());
    }

    #[test]
    fn test_sequences_of_sequences() {
        roundtrip(vec![vec![1u8, 2, 3], Vec::new(), vec![9; 17]]);
        roundtrip(vec![String::from("alpha"), String::new(), String::from("omega")]);
        roundtrip(Vec::<u64>::new());
        roundtrip(vec![(); 5]);
    }

    #[test]
    fn test_options_and_boxes() {
        roundtrip(Some(42u32));
        roundtrip(Option::<String>::None);
        roundtrip(Some(Some(String::from("inner"))));
        roundtrip(Box::new(vec![Some(1i16), None, Some(-1)]));
    }

    #[test]
    fn test_box_rejects_null() {
        let bytes = NULL_OFFSET.to_le_bytes();
        assert!(matches!(
            unpack_from::<Box<u8>>(&bytes),
            Err(MarshalError::InvalidData { .. })
        ));
    }

    #[test]
    fn test_arrays_and_tuples() {
        roundtrip([1u32, 2, 3, 4]);
        roundtrip([String::from("a"), String::from("bc")]);
        roundtrip((1u8, String::from("two"), 3.0f64));
        roundtrip((1u8, 2u16, 3u32, 4u64, 5i8, 6i16, 7i32, vec![8i64]));
        assert_eq!(<(u8, u64) as Marshal>::FLAT_SIZE, 9);
        assert_eq!(<(u8, u64) as Marshal>::PACKING, Packing::Flat);
    }

    #[test]
    fn test_pack_into_larger_buffer_leaves_tail() {
        let mut buffer = [0xFFu8; 32];
        let written = pack_into(&(7u32, String::from("hi")), &mut buffer).expect("pack tuple");
        assert_eq!(written, 4 + 8 + 8);
        assert_eq!(buffer[written], 0xFF);
        let back: (u32, String) = unpack_from(&buffer[..written]).expect("unpack tuple");
        assert_eq!(back, (7, String::from("hi")));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut bytes = to_bytes(&String::from("ok!"), 64).expect("pack string");
        bytes[8] = 0xFF;
        assert!(matches!(
            unpack_from::<String>(&bytes),
            Err(MarshalError::InvalidData { .. })
        ));
    }
}
