// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounds-checked little-endian cursors over marshal buffers.

use super::{MarshalError, MarshalResult};

/// Generate write methods for primitive types.
///
/// Each generated method checks bounds, copies the little-endian bytes and
/// advances the offset.
macro_rules! impl_write_le {
    ($name:ident, $type:ty, $size:expr) => {
        pub fn $name(&mut self, value: $type) -> MarshalResult<()> {
            if self.offset + $size > self.buffer.len() {
                return Err(MarshalError::WriteFailed {
                    offset: self.offset,
                    reason: "buffer too small".into(),
                });
            }
            self.buffer[self.offset..self.offset + $size].copy_from_slice(&value.to_le_bytes());
            self.offset += $size;
            Ok(())
        }
    };
}

/// Generate read methods for primitive types.
macro_rules! impl_read_le {
    ($name:ident, $type:ty, $size:expr) => {
        pub fn $name(&mut self) -> MarshalResult<$type> {
            if self.offset + $size > self.buffer.len() {
                return Err(MarshalError::ReadFailed {
                    offset: self.offset,
                    reason: "unexpected end of buffer".into(),
                });
            }
            let mut bytes = [0u8; $size];
            bytes.copy_from_slice(&self.buffer[self.offset..self.offset + $size]);
            self.offset += $size;
            Ok(<$type>::from_le_bytes(bytes))
        }
    };
}

/// Generate common cursor methods (offset, remaining, seek).
macro_rules! impl_cursor_common {
    ($error_variant:ident, $seek_err_msg:expr) => {
        pub fn offset(&self) -> usize {
            self.offset
        }

        pub fn remaining(&self) -> usize {
            self.buffer.len().saturating_sub(self.offset)
        }

        /// Move to an absolute position within the buffer.
        pub fn seek(&mut self, offset: usize) -> MarshalResult<()> {
            if offset > self.buffer.len() {
                return Err(MarshalError::$error_variant {
                    offset,
                    reason: $seek_err_msg.into(),
                });
            }
            self.offset = offset;
            Ok(())
        }
    };
}

/// Mutable cursor for writing.
pub struct CursorMut<'a> {
    buffer: &'a mut [u8],
    offset: usize,
}

impl<'a> CursorMut<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    /// Cursor positioned at `offset`.
    pub fn at(buffer: &'a mut [u8], offset: usize) -> MarshalResult<Self> {
        let mut cursor = Self::new(buffer);
        cursor.seek(offset)?;
        Ok(cursor)
    }

    impl_write_le!(write_u8, u8, 1);
    impl_write_le!(write_u16_le, u16, 2);
    impl_write_le!(write_u32_le, u32, 4);
    impl_write_le!(write_u64_le, u64, 8);

    pub fn write_bytes(&mut self, data: &[u8]) -> MarshalResult<()> {
        if self.offset + data.len() > self.buffer.len() {
            return Err(MarshalError::WriteFailed {
                offset: self.offset,
                reason: "buffer too small".into(),
            });
        }
        self.buffer[self.offset..self.offset + data.len()].copy_from_slice(data);
        self.offset += data.len();
        Ok(())
    }

    /// Write `count` zero bytes.
    pub fn write_zeros(&mut self, count: usize) -> MarshalResult<()> {
        if self.offset + count > self.buffer.len() {
            return Err(MarshalError::WriteFailed {
                offset: self.offset,
                reason: "buffer too small".into(),
            });
        }
        self.buffer[self.offset..self.offset + count].fill(0);
        self.offset += count;
        Ok(())
    }

    impl_cursor_common!(WriteFailed, "seek past end of buffer");
}

/// Immutable cursor for reading.
pub struct Cursor<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    pub fn at(buffer: &'a [u8], offset: usize) -> MarshalResult<Self> {
        let mut cursor = Self::new(buffer);
        cursor.seek(offset)?;
        Ok(cursor)
    }

    impl_read_le!(read_u8, u8, 1);
    impl_read_le!(read_u16_le, u16, 2);
    impl_read_le!(read_u32_le, u32, 4);
    impl_read_le!(read_u64_le, u64, 8);

    pub fn read_bytes(&mut self, len: usize) -> MarshalResult<&'a [u8]> {
        if self.offset + len > self.buffer.len() {
            return Err(MarshalError::ReadFailed {
                offset: self.offset,
                reason: "unexpected end of buffer".into(),
            });
        }
        let slice = &self.buffer[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Read exactly `N` bytes into an array.
    pub fn read_array<const N: usize>(&mut self) -> MarshalResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> MarshalResult<()> {
        self.read_bytes(len).map(|_| ())
    }

    impl_cursor_common!(ReadFailed, "seek past end of buffer");

    pub fn is_eof(&self) -> bool {
        self.offset >= self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_U16: u16 = 0xCDEF;
    const TEST_U32: u32 = 0x1234_5678;
    const TEST_U64: u64 = 0x1122_3344_5566_7788;

    #[test]
    fn test_cursor_mut_write_overflow_reports_offset() {
        let mut buffer = [0u8; 2];
        let mut cursor = CursorMut::new(&mut buffer);
        cursor.write_u16_le(TEST_U16).expect("Write u16 should succeed");

        match cursor.write_u8(0xFF) {
            Err(MarshalError::WriteFailed { offset, reason }) => {
                assert_eq!(offset, 2);
                assert_eq!(reason, "buffer too small");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_cursor_read_overflow_reports_offset() {
        let buffer = [0u8; 1];
        let mut cursor = Cursor::new(&buffer);
        assert_eq!(cursor.read_u8().expect("Read u8 should succeed"), 0);

        match cursor.read_u32_le() {
            Err(MarshalError::ReadFailed { offset, reason }) => {
                assert_eq!(offset, 1);
                assert_eq!(reason, "unexpected end of buffer");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_positioned_writes_and_reads() {
        let mut buffer = [0u8; 32];
        {
            let mut writer = CursorMut::at(&mut buffer, 8).expect("seek within buffer");
            writer.write_u32_le(TEST_U32).expect("Write u32 should succeed");
            writer.write_u64_le(TEST_U64).expect("Write u64 should succeed");
            assert_eq!(writer.offset(), 20);
            assert_eq!(writer.remaining(), 12);
        }
        assert_eq!(&buffer[..8], &[0u8; 8]);

        let mut reader = Cursor::at(&buffer, 8).expect("seek within buffer");
        assert_eq!(reader.read_u32_le().expect("Read u32"), TEST_U32);
        assert_eq!(reader.read_u64_le().expect("Read u64"), TEST_U64);
        reader.skip(12).expect("skip to end");
        assert!(reader.is_eof());
    }

    #[test]
    fn test_seek_past_end_fails() {
        let mut buffer = [0u8; 4];
        assert!(CursorMut::at(&mut buffer, 5).is_err());
        assert!(Cursor::at(&buffer, 4).is_ok());
        assert!(Cursor::at(&buffer, 5).is_err());
    }

    #[test]
    fn test_write_zeros_clears_range() {
        let mut buffer = [0xAAu8; 6];
        let mut writer = CursorMut::at(&mut buffer, 1).expect("seek");
        writer.write_zeros(3).expect("zeros fit");
        assert!(writer.write_zeros(3).is_err());
        assert_eq!(buffer, [0xAA, 0, 0, 0, 0xAA, 0xAA]);
    }
}
