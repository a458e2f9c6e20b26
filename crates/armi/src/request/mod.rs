// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request encoding.
//!
//! Sections and carriers hold a sequence of requests, each laid out as:
//!
//! ```text
//! +---------+----------+--------+---------+---------+------------------+
//! | len u32 | handle   | op u32 | kind u8 | pad [3] | packed arguments |
//! +---------+----------+--------+---------+---------+------------------+
//! |<-------------------- REQUEST_HEADER_SIZE ------>|
//! ```
//!
//! `len` covers the header plus the arguments. Argument offsets are relative
//! to the start of the argument region.

pub mod method;

pub use method::{Method, MethodTable, ObjectEntry, RemoteObject, TypedEntry};

use crate::error::{Error, Result};
use crate::marshal::{self, Cursor, CursorMut, Marshal, MarshalError};
use crate::registry::{GlobalRef, Handle};

/// Operation selector within an object's method table.
pub type OpId = u32;

/// Encoded size of [`RequestHeader`].
pub const REQUEST_HEADER_SIZE: usize = 16;

/// Whether the caller waits for a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Fire-and-forget; the result is discarded.
    Async,
    /// Return-expected; the result is packed into a reply.
    Sync,
}

impl RequestKind {
    fn to_wire(self) -> u8 {
        match self {
            RequestKind::Async => 0,
            RequestKind::Sync => 1,
        }
    }

    fn from_wire(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(RequestKind::Async),
            1 => Ok(RequestKind::Sync),
            other => Err(MarshalError::InvalidData {
                reason: format!("unknown request kind {}", other),
            }
            .into()),
        }
    }
}

/// Fixed header in front of every request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub len: u32,
    pub handle: Handle,
    pub op: OpId,
    pub kind: RequestKind,
}

impl RequestHeader {
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let mut cursor = CursorMut::new(buf);
        cursor.write_u32_le(self.len)?;
        cursor.write_u32_le(self.handle.raw())?;
        cursor.write_u32_le(self.op)?;
        cursor.write_u8(self.kind.to_wire())?;
        cursor.write_zeros(3)?;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let len = cursor.read_u32_le()?;
        let handle = Handle::new(cursor.read_u32_le()?);
        let op = cursor.read_u32_le()?;
        let kind = RequestKind::from_wire(cursor.read_u8()?)?;
        cursor.skip(3)?;
        if (len as usize) < REQUEST_HEADER_SIZE {
            return Err(MarshalError::InvalidData {
                reason: format!("request length {} shorter than header", len),
            }
            .into());
        }
        Ok(Self {
            len,
            handle,
            op,
            kind,
        })
    }
}

/// A typed request, built at the call site and encoded into a section.
pub struct Request<A> {
    pub target: GlobalRef,
    pub op: OpId,
    pub kind: RequestKind,
    pub args: A,
}

impl<A: Marshal> Request<A> {
    pub fn new(target: GlobalRef, op: OpId, kind: RequestKind, args: A) -> Self {
        Self {
            target,
            op,
            kind,
            args,
        }
    }

    /// Header plus packed arguments.
    pub fn encoded_len(&self) -> usize {
        REQUEST_HEADER_SIZE + marshal::packed_size(&self.args)
    }

    /// Encode into `buf`, which must be exactly [`encoded_len`](Self::encoded_len) bytes.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        let len = u32::try_from(buf.len()).map_err(|_| Error::PayloadTooLarge {
            size: buf.len(),
            capacity: u32::MAX as usize,
        })?;
        if buf.len() != self.encoded_len() {
            return Err(MarshalError::WriteFailed {
                offset: 0,
                reason: format!(
                    "request slot of {} bytes, need {}",
                    buf.len(),
                    self.encoded_len()
                ),
            }
            .into());
        }
        let (header, args) = buf.split_at_mut(REQUEST_HEADER_SIZE);
        RequestHeader {
            len,
            handle: self.target.handle,
            op: self.op,
            kind: self.kind,
        }
        .encode(header)?;
        marshal::pack_into(&self.args, args)?;
        Ok(())
    }
}

/// A decoded request borrowed from an inbound slot.
#[derive(Clone, Copy, Debug)]
pub struct RequestView<'a> {
    pub header: RequestHeader,
    pub args: &'a [u8],
}

impl<'a> RequestView<'a> {
    /// Parse exactly one request spanning all of `bytes`.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let header = RequestHeader::decode(bytes)?;
        if header.len as usize != bytes.len() {
            return Err(MarshalError::InvalidData {
                reason: format!(
                    "request claims {} bytes, slot holds {}",
                    header.len,
                    bytes.len()
                ),
            }
            .into());
        }
        Ok(Self {
            header,
            args: &bytes[REQUEST_HEADER_SIZE..],
        })
    }

    /// Length of the request starting at `bytes[0]`, validated against `bytes`.
    pub fn peek_len(bytes: &[u8]) -> Result<usize> {
        let header = RequestHeader::decode(bytes)?;
        let len = header.len as usize;
        if len > bytes.len() {
            return Err(MarshalError::ReadFailed {
                offset: 0,
                reason: format!("request of {} bytes truncated to {}", len, bytes.len()),
            }
            .into());
        }
        Ok(len)
    }
}
