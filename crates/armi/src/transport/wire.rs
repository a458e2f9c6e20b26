// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message-passing frame header.
//!
//! ```text
//! +--------+---------+---------------+-------------------+-------------+
//! | tag u8 | pad [3] | source u32 LE | reply_token u64 LE| body ...    |
//! +--------+---------+---------------+-------------------+-------------+
//! ```
//!
//! Sections reserve [`WIRE_HEADER_SIZE`] bytes up front so the header is
//! written in place before a send.

use crate::error::{Error, Result};
use crate::marshal::{Cursor, CursorMut};
use crate::EndpointId;

/// Encoded size of [`WireHeader`].
pub const WIRE_HEADER_SIZE: usize = 16;

/// Frame kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    /// Section of fire-and-forget requests.
    AsyncOnly = 1,
    /// One return-expected request; `reply_token` identifies the caller's wait.
    AsyncSync = 2,
    /// Packed result for `reply_token`.
    SyncReturn = 3,
    /// Fence subtotal travelling towards the root.
    FenceArrival = 4,
    /// Fence totals travelling away from the root.
    FenceRelease = 5,
    /// Run-wide abort with a UTF-8 reason.
    Abort = 6,
}

impl TryFrom<u8> for MessageTag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageTag::AsyncOnly),
            2 => Ok(MessageTag::AsyncSync),
            3 => Ok(MessageTag::SyncReturn),
            4 => Ok(MessageTag::FenceArrival),
            5 => Ok(MessageTag::FenceRelease),
            6 => Ok(MessageTag::Abort),
            other => Err(Error::transport(format!("unknown frame tag {}", other))),
        }
    }
}

/// Fixed header in front of every message-passing frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireHeader {
    pub tag: MessageTag,
    pub source: EndpointId,
    pub reply_token: u64,
}

impl WireHeader {
    pub fn new(tag: MessageTag, source: EndpointId, reply_token: u64) -> Self {
        Self {
            tag,
            source,
            reply_token,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let source = u32::try_from(self.source)
            .map_err(|_| Error::transport(format!("endpoint {} exceeds 32 bits", self.source)))?;
        let mut cursor = CursorMut::new(buf);
        cursor.write_u8(self.tag as u8)?;
        cursor.write_zeros(3)?;
        cursor.write_u32_le(source)?;
        cursor.write_u64_le(self.reply_token)?;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let tag = MessageTag::try_from(cursor.read_u8()?)?;
        cursor.skip(3)?;
        let source = cursor.read_u32_le()? as EndpointId;
        let reply_token = cursor.read_u64_le()?;
        Ok(Self {
            tag,
            source,
            reply_token,
        })
    }
}

/// Build a standalone frame: header followed by `body`.
pub fn frame(header: WireHeader, body: &[u8]) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; WIRE_HEADER_SIZE + body.len()];
    header.encode(&mut bytes[..WIRE_HEADER_SIZE])?;
    bytes[WIRE_HEADER_SIZE..].copy_from_slice(body);
    Ok(bytes)
}

/// Body of a frame, after its header.
pub fn body(frame: &[u8]) -> Result<&[u8]> {
    frame.get(WIRE_HEADER_SIZE..).ok_or_else(|| {
        Error::transport(format!(
            "frame of {} bytes shorter than its header",
            frame.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = WireHeader::new(MessageTag::SyncReturn, 7, 0x0102_0304_0506_0708);
        let mut buf = [0xFFu8; WIRE_HEADER_SIZE];
        header.encode(&mut buf).expect("encode header");
        assert_eq!(buf[0], 3);
        assert_eq!(&buf[1..4], &[0, 0, 0]);
        assert_eq!(&buf[4..8], &7u32.to_le_bytes());
        assert_eq!(&buf[8..16], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(WireHeader::decode(&buf).expect("decode header"), header);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = [0u8; WIRE_HEADER_SIZE];
        buf[0] = 42;
        assert!(matches!(
            WireHeader::decode(&buf),
            Err(Error::TransportFailure { .. })
        ));
    }

    #[test]
    fn test_frame_and_body() {
        let bytes = frame(WireHeader::new(MessageTag::Abort, 2, 0), b"boom").expect("frame");
        assert_eq!(bytes.len(), WIRE_HEADER_SIZE + 4);
        assert_eq!(body(&bytes).expect("body"), b"boom");
        assert!(body(&bytes[..8]).is_err());
    }
}
