// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request execution against the object registry.
//!
//! Results of return-expected requests are packed into a reply carrier. When
//! the carrier is too small the packing step reports `NeedsLargerBuffer`, the
//! carrier grows and only the packing is repeated: the operation itself runs
//! exactly once.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::marshal::{self, Marshal};
use crate::request::{RequestKind, RequestView};

/// Packs one result into a reply carrier, starting at `front`.
pub struct ReplyWriter<'a> {
    carrier: &'a mut Vec<u8>,
    front: usize,
    ceiling: usize,
    len: usize,
    grown: bool,
}

impl<'a> ReplyWriter<'a> {
    /// Writer over `carrier[front..]`; the carrier may grow up to `ceiling` bytes.
    pub fn new(carrier: &'a mut Vec<u8>, front: usize, ceiling: usize) -> Self {
        Self {
            carrier,
            front,
            ceiling,
            len: 0,
            grown: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.carrier.len().saturating_sub(self.front)
    }

    /// Pack `value` if the carrier is large enough.
    pub fn try_store<R: Marshal>(&mut self, value: &R) -> Result<()> {
        let required = marshal::packed_size(value);
        let capacity = self.capacity();
        if required > capacity {
            return Err(Error::NeedsLargerBuffer { required, capacity });
        }
        self.len = marshal::pack_into(value, &mut self.carrier[self.front..])?;
        Ok(())
    }

    /// Pack `value`, growing the carrier once if needed.
    pub fn store<R: Marshal>(&mut self, value: &R) -> Result<()> {
        match self.try_store(value) {
            Err(Error::NeedsLargerBuffer { required, capacity }) => {
                let limit = self.ceiling.saturating_sub(self.front);
                if required > limit {
                    return Err(Error::PayloadTooLarge {
                        size: required,
                        capacity: limit,
                    });
                }
                log::warn!(
                    "[dispatch] reply carrier grows from {} to {} bytes",
                    capacity,
                    required
                );
                self.carrier.resize(self.front + required, 0);
                self.grown = true;
                self.try_store(value)
            }
            other => other,
        }
    }

    /// Packed reply length, excluding `front`.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn was_grown(&self) -> bool {
        self.grown
    }
}

/// Reply rendezvous between endpoints sharing memory.
///
/// The caller allocates the carrier; the executing endpoint fills it and
/// raises `ready`.
pub struct ReplyCell {
    ready: AtomicBool,
    payload: Mutex<ReplyPayload>,
}

struct ReplyPayload {
    carrier: Vec<u8>,
    len: usize,
}

impl ReplyCell {
    pub fn new(capacity: usize) -> Self {
        Self {
            ready: AtomicBool::new(false),
            payload: Mutex::new(ReplyPayload {
                carrier: vec![0u8; capacity],
                len: 0,
            }),
        }
    }

    /// Borrow the carrier out of the cell for packing.
    pub fn take_carrier(&self) -> Vec<u8> {
        std::mem::take(&mut self.payload.lock().carrier)
    }

    /// Hand the filled carrier back and wake the caller.
    pub fn fulfil(&self, carrier: Vec<u8>, len: usize) {
        {
            let mut payload = self.payload.lock();
            payload.carrier = carrier;
            payload.len = len;
        }
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Packed reply bytes once ready.
    pub fn take_reply(&self) -> Option<Vec<u8>> {
        if !self.is_ready() {
            return None;
        }
        let mut payload = self.payload.lock();
        let len = payload.len;
        let mut bytes = std::mem::take(&mut payload.carrier);
        bytes.truncate(len);
        Some(bytes)
    }
}

/// Executes decoded requests.
pub struct Dispatcher {
    ceiling: usize,
}

impl Dispatcher {
    /// Dispatcher whose reply carriers may grow up to `ceiling` bytes.
    pub fn new(ceiling: usize) -> Self {
        Self { ceiling }
    }

    /// Run `request` on `endpoint`.
    ///
    /// Return-expected requests need `reply = Some((carrier, front))`; the
    /// packed result lands at `carrier[front..]` and its length is returned.
    pub fn exec(
        &self,
        endpoint: &Endpoint,
        request: &RequestView<'_>,
        reply: Option<(&mut Vec<u8>, usize)>,
    ) -> Result<Option<usize>> {
        let header = request.header;
        let entry = endpoint.lookup_entry(header.handle)?;
        log::trace!(
            "[dispatch] endpoint {} exec {}::{} ({:?})",
            endpoint.id(),
            entry.type_name(),
            header.op,
            header.kind
        );
        match (header.kind, reply) {
            (RequestKind::Async, _) => {
                entry.invoke(endpoint, header.handle, header.op, request.args, None)?;
                Ok(None)
            }
            (RequestKind::Sync, Some((carrier, front))) => {
                let mut writer = ReplyWriter::new(carrier, front, self.ceiling);
                entry.invoke(
                    endpoint,
                    header.handle,
                    header.op,
                    request.args,
                    Some(&mut writer),
                )?;
                Ok(Some(writer.len()))
            }
            (RequestKind::Sync, None) => Err(Error::transport(format!(
                "sync request for handle {} arrived without a reply route",
                header.handle
            ))),
        }
    }
}
