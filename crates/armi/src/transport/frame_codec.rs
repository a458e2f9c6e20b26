// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for frames carried over TCP.
//!
//! TCP is a byte stream without message boundaries. Every frame is prefixed
//! with its length and the destination endpoint:
//!
//! ```text
//! +----------------+------------------+-------------------+
//! | Length (4B BE) | Dest (4B BE)     | Frame bytes       |
//! +----------------+------------------+-------------------+
//! ```
//!
//! The length covers the frame bytes only. Lengths above the configured
//! maximum are rejected before any allocation.

use std::io::{self, Read, Write};

/// Prefix size (length + destination).
pub const FRAME_PREFIX_SIZE: usize = 8;

/// Blocking length-prefix codec.
#[derive(Debug)]
pub struct FrameCodec {
    max_size: usize,
    frames_decoded: u64,
    bytes_decoded: u64,
    frames_rejected: u64,
}

impl FrameCodec {
    /// Codec accepting frames of at most `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            frames_decoded: 0,
            bytes_decoded: 0,
            frames_rejected: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Write one prefixed frame.
    pub fn write_frame<W: Write + ?Sized>(
        writer: &mut W,
        dest: u32,
        frame: &[u8],
    ) -> io::Result<()> {
        let len = u32::try_from(frame.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds 32-bit length")
        })?;
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        prefix[..4].copy_from_slice(&len.to_be_bytes());
        prefix[4..].copy_from_slice(&dest.to_be_bytes());
        writer.write_all(&prefix)?;
        writer.write_all(frame)?;
        writer.flush()
    }

    /// Read one frame.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary.
    pub fn read_frame<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> io::Result<Option<(u32, Vec<u8>)>> {
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        let mut read = 0;
        while read < FRAME_PREFIX_SIZE {
            match reader.read(&mut prefix[read..]) {
                Ok(0) if read == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside frame prefix",
                    ))
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let dest = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if len > self.max_size {
            self.frames_rejected += 1;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds maximum {}", len, self.max_size),
            ));
        }

        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame)?;
        self.frames_decoded += 1;
        self.bytes_decoded += len as u64;
        Ok(Some((dest, frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader returning at most `chunk` bytes per call.
    struct Trickle<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_prefix_layout() {
        let mut out = Vec::new();
        FrameCodec::write_frame(&mut out, 9, b"hello").expect("write frame");
        assert_eq!(&out[..4], &5u32.to_be_bytes());
        assert_eq!(&out[4..8], &9u32.to_be_bytes());
        assert_eq!(&out[8..], b"hello");
    }

    #[test]
    fn test_decode_across_short_reads() {
        let mut stream = Vec::new();
        FrameCodec::write_frame(&mut stream, 1, b"first").expect("write");
        FrameCodec::write_frame(&mut stream, 2, &[7u8; 300]).expect("write");
        let mut reader = Trickle {
            data: &stream,
            chunk: 3,
        };
        let mut codec = FrameCodec::new(1024);
        assert_eq!(
            codec.read_frame(&mut reader).expect("frame 1"),
            Some((1, b"first".to_vec()))
        );
        assert_eq!(
            codec.read_frame(&mut reader).expect("frame 2"),
            Some((2, vec![7u8; 300]))
        );
        assert_eq!(codec.read_frame(&mut reader).expect("eof"), None);
        assert_eq!(codec.frames_decoded(), 2);
        assert_eq!(codec.bytes_decoded(), 305);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut stream = Vec::new();
        FrameCodec::write_frame(&mut stream, 0, &[0u8; 64]).expect("write");
        let mut codec = FrameCodec::new(32);
        let err = codec
            .read_frame(&mut Cursor::new(stream))
            .expect_err("frame above max");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(codec.frames_rejected(), 1);
    }

    #[test]
    fn test_truncated_prefix_is_error() {
        let mut codec = FrameCodec::new(32);
        let err = codec
            .read_frame(&mut Cursor::new(vec![0u8, 0, 0]))
            .expect_err("truncated prefix");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
