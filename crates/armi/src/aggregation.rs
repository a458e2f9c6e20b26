// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-destination outgoing aggregation.
//!
//! Each destination owns a small pool of fixed-capacity sections. Requests
//! are encoded straight into the current section; a full section, or one that
//! reached the aggregation threshold, is handed to a [`SectionSink`] and the
//! buffer rotates to an idle section. When every section is still in flight
//! a new one is allocated instead of blocking.
//!
//! Section layout:
//!
//! ```text
//! +-------------------+-----------+-----------+-----+
//! | wire header space | request 0 | request 1 | ... |
//! +-------------------+-----------+-----------+-----+
//! ```

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::inbound::Completion;
use crate::EndpointId;

/// Lifecycle of one outgoing section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionState {
    /// Accepting requests.
    Filling,
    /// Handed to the transport; waiting for the consumer to finish.
    Sending,
    /// Free for reuse.
    Idle,
}

/// A flushed section on its way to `dest`.
pub struct SectionHandoff {
    /// Section bytes; the first `header_reserve` bytes are free for a wire header.
    pub bytes: Vec<u8>,
    /// Used length, header reserve included.
    pub len: usize,
    /// Number of requests in the section.
    pub requests: u32,
    /// Raised by the consumer once every request has been dispatched.
    pub completion: Arc<Completion>,
}

/// Receiver of flushed sections.
pub trait SectionSink {
    fn deliver(&self, dest: EndpointId, section: SectionHandoff) -> Result<()>;
}

struct OutgoingSection {
    buffer: Option<Vec<u8>>,
    state: SectionState,
    completion: Arc<Completion>,
}

impl OutgoingSection {
    fn new(state: SectionState, buffer: Option<Vec<u8>>) -> Self {
        Self {
            buffer,
            state,
            completion: Arc::new(Completion::new()),
        }
    }
}

/// Outgoing sections for one destination endpoint.
pub struct AggregationBuffer {
    dest: EndpointId,
    sections: Vec<OutgoingSection>,
    current: usize,
    fill: usize,
    requests: u32,
    threshold: u32,
    capacity: usize,
    header_reserve: usize,
    flushes: u64,
}

impl AggregationBuffer {
    /// Buffer with `initial` sections of `capacity` bytes each.
    pub fn new(
        dest: EndpointId,
        capacity: usize,
        initial: usize,
        header_reserve: usize,
        threshold: u32,
    ) -> Self {
        let mut sections = Vec::with_capacity(initial.max(1));
        sections.push(OutgoingSection::new(
            SectionState::Filling,
            Some(vec![0u8; capacity]),
        ));
        for _ in 1..initial {
            sections.push(OutgoingSection::new(SectionState::Idle, None));
        }
        Self {
            dest,
            sections,
            current: 0,
            fill: header_reserve,
            requests: 0,
            threshold: threshold.max(1),
            capacity,
            header_reserve,
            flushes: 0,
        }
    }

    pub fn dest(&self) -> EndpointId {
        self.dest
    }

    /// Largest request a section can hold.
    pub fn room(&self) -> usize {
        self.capacity - self.header_reserve
    }

    /// Space for a `bytes`-long request in the current section.
    ///
    /// Flushes and rotates first when the current section lacks room.
    pub fn reserve(&mut self, bytes: usize, sink: &dyn SectionSink) -> Result<&mut [u8]> {
        if bytes > self.room() {
            return Err(Error::PayloadTooLarge {
                size: bytes,
                capacity: self.room(),
            });
        }
        if self.fill + bytes > self.capacity {
            self.flush(sink)?;
        }
        let start = self.fill;
        self.fill += bytes;
        let capacity = self.capacity;
        let buffer = self.sections[self.current]
            .buffer
            .get_or_insert_with(|| vec![0u8; capacity]);
        Ok(&mut buffer[start..start + bytes])
    }

    /// Count one encoded request; flushes when the threshold is reached.
    pub fn note_request(&mut self, sink: &dyn SectionSink) -> Result<()> {
        self.requests += 1;
        if self.requests >= self.threshold {
            self.flush(sink)?;
        }
        Ok(())
    }

    /// Send the current section if it holds any request.
    pub fn flush(&mut self, sink: &dyn SectionSink) -> Result<bool> {
        if self.fill <= self.header_reserve {
            return Ok(false);
        }
        let capacity = self.capacity;
        let section = &mut self.sections[self.current];
        let bytes = section
            .buffer
            .take()
            .unwrap_or_else(|| vec![0u8; capacity]);
        section.state = SectionState::Sending;
        let handoff = SectionHandoff {
            bytes,
            len: self.fill,
            requests: self.requests,
            completion: Arc::clone(&section.completion),
        };
        log::trace!(
            "[aggregation] flush {} requests ({} bytes) to endpoint {}",
            self.requests,
            self.fill,
            self.dest
        );
        self.fill = self.header_reserve;
        self.requests = 0;
        self.flushes += 1;
        let delivered = sink.deliver(self.dest, handoff);
        self.rotate();
        delivered.map(|()| true)
    }

    fn rotate(&mut self) {
        self.reclaim();
        let idx = match self
            .sections
            .iter()
            .position(|s| s.state == SectionState::Idle)
        {
            Some(idx) => idx,
            None => {
                self.sections
                    .push(OutgoingSection::new(SectionState::Idle, None));
                log::debug!(
                    "[aggregation] endpoint {} sections in flight, grew to {}",
                    self.dest,
                    self.sections.len()
                );
                self.sections.len() - 1
            }
        };
        let capacity = self.capacity;
        let section = &mut self.sections[idx];
        section.state = SectionState::Filling;
        section.buffer.get_or_insert_with(|| vec![0u8; capacity]);
        self.current = idx;
    }

    /// Return sections whose consumer has finished to the idle pool.
    pub fn reclaim(&mut self) -> usize {
        let capacity = self.capacity;
        let mut reclaimed = 0;
        for section in self
            .sections
            .iter_mut()
            .filter(|s| s.state == SectionState::Sending)
        {
            if let Some(returned) = section.completion.reclaim() {
                section.buffer = returned.map(|mut buffer| {
                    buffer.resize(capacity, 0);
                    buffer
                });
                section.state = SectionState::Idle;
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold.max(1);
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Requests encoded but not yet flushed.
    pub fn pending_requests(&self) -> u32 {
        self.requests
    }

    pub fn is_empty(&self) -> bool {
        self.fill <= self.header_reserve
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn in_flight(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| s.state == SectionState::Sending)
            .count()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    const RESERVE: usize = 16;

    /// Records handoffs; optionally completes them on arrival.
    struct RecordingSink {
        complete: bool,
        seen: RefCell<Vec<(usize, u32, Arc<Completion>)>>,
    }

    impl RecordingSink {
        fn new(complete: bool) -> Self {
            Self {
                complete,
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl SectionSink for RecordingSink {
        fn deliver(&self, _dest: EndpointId, section: SectionHandoff) -> Result<()> {
            if self.complete {
                section.completion.complete(Some(section.bytes));
            }
            self.seen
                .borrow_mut()
                .push((section.len, section.requests, section.completion));
            Ok(())
        }
    }

    fn put(buffer: &mut AggregationBuffer, sink: &RecordingSink, bytes: usize, fill: u8) {
        buffer
            .reserve(bytes, sink)
            .expect("reserve")
            .iter_mut()
            .for_each(|b| *b = fill);
        buffer.note_request(sink).expect("note request");
    }

    #[test]
    fn test_flush_sends_partial_section() {
        let sink = RecordingSink::new(true);
        let mut buffer = AggregationBuffer::new(1, 128, 2, RESERVE, 10);
        put(&mut buffer, &sink, 24, 1);
        put(&mut buffer, &sink, 24, 2);
        assert_eq!(buffer.pending_requests(), 2);
        assert!(buffer.flush(&sink).expect("flush"));
        assert!(!buffer.flush(&sink).expect("empty flush"));
        let seen = sink.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!((seen[0].0, seen[0].1), (RESERVE + 48, 2));
    }

    #[test]
    fn test_threshold_triggers_flush() {
        let sink = RecordingSink::new(true);
        let mut buffer = AggregationBuffer::new(0, 1024, 2, RESERVE, 3);
        for i in 0..7 {
            put(&mut buffer, &sink, 16, i);
        }
        assert_eq!(sink.seen.borrow().len(), 2);
        assert_eq!(buffer.pending_requests(), 1);
    }

    #[test]
    fn test_full_section_rotates() {
        let sink = RecordingSink::new(true);
        let mut buffer = AggregationBuffer::new(0, 64, 2, RESERVE, 100);
        put(&mut buffer, &sink, 40, 1);
        put(&mut buffer, &sink, 40, 2);
        let seen = sink.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, RESERVE + 40);
        assert_eq!(buffer.section_count(), 2);
    }

    #[test]
    fn test_grows_when_every_section_is_in_flight() {
        let sink = RecordingSink::new(false);
        let mut buffer = AggregationBuffer::new(3, 64, 2, RESERVE, 1);
        for i in 0..4 {
            put(&mut buffer, &sink, 32, i);
        }
        assert_eq!(sink.seen.borrow().len(), 4);
        assert_eq!(buffer.section_count(), 5);
        assert_eq!(buffer.in_flight(), 4);

        for (_, _, completion) in sink.seen.borrow().iter() {
            completion.complete(None);
        }
        assert_eq!(buffer.reclaim(), 4);
        assert_eq!(buffer.in_flight(), 0);
        put(&mut buffer, &sink, 32, 9);
        assert_eq!(buffer.section_count(), 5);
    }

    #[test]
    fn test_completed_sections_are_reused() {
        let sink = RecordingSink::new(true);
        let mut buffer = AggregationBuffer::new(0, 64, 2, RESERVE, 1);
        for i in 0..20 {
            put(&mut buffer, &sink, 32, i);
        }
        assert_eq!(sink.seen.borrow().len(), 20);
        assert_eq!(buffer.section_count(), 2);
        assert_eq!(buffer.flushes(), 20);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let sink = RecordingSink::new(true);
        let mut buffer = AggregationBuffer::new(0, 64, 1, RESERVE, 1);
        match buffer.reserve(49, &sink) {
            Err(Error::PayloadTooLarge { size, capacity }) => {
                assert_eq!((size, capacity), (49, 48));
            }
            _ => panic!("expected PayloadTooLarge"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_threshold_clamped_to_one() {
        let mut buffer = AggregationBuffer::new(0, 64, 1, RESERVE, 0);
        assert_eq!(buffer.threshold(), 1);
        buffer.set_threshold(0);
        assert_eq!(buffer.threshold(), 1);
    }
}
