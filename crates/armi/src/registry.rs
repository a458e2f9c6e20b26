// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-endpoint object registry.
//!
//! Maps small integer [`Handle`]s to local objects. Handles are handed out
//! smallest-first, so endpoints that register in the same order (SPMD) agree
//! on every handle. Handle 0 is reserved for the runtime's collective mailbox.
//!
//! The registry is owned by one endpoint and mutated only from its thread.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::marshal::{Marshal, MarshalResult, Packer, Packing, Unpacker};
use crate::EndpointId;

/// Object handle, unique within one endpoint while registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Handle of the runtime's internal collective mailbox.
    pub const RESERVED: Handle = Handle(0);

    pub const fn new(raw: u32) -> Self {
        Handle(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Marshal for Handle {
    const PACKING: Packing = Packing::Flat;
    const FLAT_SIZE: usize = 4;

    fn pack(&self, packer: &mut Packer<'_>, at: usize) -> MarshalResult<()> {
        self.0.pack(packer, at)
    }

    fn unpack(unpacker: &Unpacker<'_>, at: usize) -> MarshalResult<Self> {
        u32::unpack(unpacker, at).map(Handle)
    }
}

/// Address of an object anywhere in the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobalRef {
    pub endpoint: EndpointId,
    pub handle: Handle,
}

impl GlobalRef {
    pub const fn new(endpoint: EndpointId, handle: Handle) -> Self {
        Self { endpoint, handle }
    }
}

impl fmt::Display for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.handle, self.endpoint)
    }
}

crate::marshal_struct!(GlobalRef {
    endpoint: usize,
    handle: Handle,
});

enum Slot<O: ?Sized> {
    Occupied { object: Rc<O>, identity: usize },
    Free,
}

/// Handle table for one endpoint.
pub struct ObjectRegistry<O: ?Sized> {
    endpoint: EndpointId,
    slots: Vec<Slot<O>>,
    free: BinaryHeap<Reverse<u32>>,
    identities: HashMap<usize, Handle>,
    trace: Option<Vec<&'static str>>,
}

impl<O: ?Sized> ObjectRegistry<O> {
    /// Empty registry with `capacity` pre-allocated slots.
    ///
    /// Slot 0 stays reserved until [`register_reserved`](Self::register_reserved).
    pub fn new(endpoint: EndpointId, capacity: usize, trace: bool) -> Self {
        let mut slots = Vec::with_capacity(capacity.max(1));
        slots.push(Slot::Free);
        Self {
            endpoint,
            slots,
            free: BinaryHeap::new(),
            identities: HashMap::new(),
            trace: trace.then(Vec::new),
        }
    }

    /// Install the runtime object at [`Handle::RESERVED`].
    pub fn register_reserved(&mut self, object: Rc<O>, identity: usize) {
        self.identities.insert(identity, Handle::RESERVED);
        self.slots[0] = Slot::Occupied { object, identity };
    }

    /// Register `object` under the smallest free handle.
    ///
    /// `identity` is the address of the user object; registering it twice
    /// returns the existing handle.
    pub fn register(&mut self, object: Rc<O>, identity: usize, type_name: &'static str) -> Handle {
        if let Some(&existing) = self.identities.get(&identity) {
            log::warn!(
                "[registry] endpoint {} object already registered as {}",
                self.endpoint,
                existing
            );
            return existing;
        }

        let handle = match self.free.pop() {
            Some(Reverse(raw)) => Handle(raw),
            None => {
                if self.slots.len() == self.slots.capacity() {
                    let grow = self.slots.capacity();
                    self.slots.reserve_exact(grow);
                    log::debug!(
                        "[registry] endpoint {} grew to {} slots",
                        self.endpoint,
                        self.slots.capacity()
                    );
                }
                self.slots.push(Slot::Free);
                Handle((self.slots.len() - 1) as u32)
            }
        };

        self.slots[handle.index()] = Slot::Occupied { object, identity };
        self.identities.insert(identity, handle);
        if let Some(trace) = self.trace.as_mut() {
            trace.push(type_name);
        }
        log::trace!(
            "[registry] endpoint {} registered {} as {}",
            self.endpoint,
            type_name,
            handle
        );
        handle
    }

    /// Re-point `handle` at a new object.
    ///
    /// An object already registered under another handle keeps that handle
    /// for duplicate detection.
    pub fn update(&mut self, handle: Handle, object: Rc<O>, identity: usize) -> Result<()> {
        let endpoint = self.endpoint;
        let old = match self.slots.get_mut(handle.index()) {
            Some(Slot::Occupied {
                object: current,
                identity: old_identity,
            }) if handle != Handle::RESERVED => {
                *current = object;
                std::mem::replace(old_identity, identity)
            }
            _ => return Err(Error::InvalidHandle { endpoint, handle }),
        };
        self.forget_identity(old, handle);
        match self.identities.get(&identity) {
            Some(&existing) if existing != handle => {
                log::warn!(
                    "[registry] endpoint {} pointed {} at the object already registered as {}",
                    endpoint,
                    handle,
                    existing
                );
            }
            _ => {
                self.identities.insert(identity, handle);
            }
        }
        Ok(())
    }

    /// Drop the identity entry for `identity` if it belongs to `handle`.
    fn forget_identity(&mut self, identity: usize, handle: Handle) {
        if self.identities.get(&identity) == Some(&handle) {
            self.identities.remove(&identity);
        }
    }

    /// Release `handle` for reuse.
    pub fn unregister(&mut self, handle: Handle) -> Result<Rc<O>> {
        let endpoint = self.endpoint;
        if handle == Handle::RESERVED {
            return Err(Error::InvalidHandle { endpoint, handle });
        }
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(Error::InvalidHandle { endpoint, handle })?;
        match std::mem::replace(slot, Slot::Free) {
            Slot::Occupied { object, identity } => {
                self.forget_identity(identity, handle);
                self.free.push(Reverse(handle.raw()));
                log::trace!("[registry] endpoint {} released {}", endpoint, handle);
                Ok(object)
            }
            Slot::Free => Err(Error::InvalidHandle { endpoint, handle }),
        }
    }

    /// Object registered under `handle`.
    pub fn lookup(&self, handle: Handle) -> Result<Rc<O>> {
        match self.slots.get(handle.index()) {
            Some(Slot::Occupied { object, .. }) => Ok(Rc::clone(object)),
            _ => Err(Error::InvalidHandle {
                endpoint: self.endpoint,
                handle,
            }),
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        matches!(self.slots.get(handle.index()), Some(Slot::Occupied { .. }))
    }

    /// Currently registered user handles, ascending.
    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, slot)| matches!(slot, Slot::Occupied { .. }))
            .map(|(i, _)| Handle(i as u32))
            .collect()
    }

    /// Number of registered user objects.
    pub fn len(&self) -> usize {
        self.identities
            .values()
            .filter(|h| **h != Handle::RESERVED)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Registration order by type name, when tracing is enabled.
    pub fn trace(&self) -> Option<&[&'static str]> {
        self.trace.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn registry() -> ObjectRegistry<str> {
        ObjectRegistry::new(0, 2, true)
    }

    fn object(name: &str) -> (Rc<str>, usize) {
        let rc: Rc<str> = Rc::from(name);
        let identity = Rc::as_ptr(&rc).cast::<u8>() as usize;
        (rc, identity)
    }

    #[test]
    fn test_handles_start_at_one() {
        let mut reg = registry();
        let (a, ia) = object("a");
        let (b, ib) = object("b");
        assert_eq!(reg.register(a, ia, "str"), Handle::new(1));
        assert_eq!(reg.register(b, ib, "str"), Handle::new(2));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_lookup_and_unregister() {
        let mut reg = registry();
        let (a, ia) = object("alpha");
        let h = reg.register(a, ia, "str");
        assert_eq!(&*reg.lookup(h).expect("lookup registered"), "alpha");
        reg.unregister(h).expect("unregister registered");
        assert!(matches!(
            reg.lookup(h),
            Err(Error::InvalidHandle { handle, .. }) if handle == h
        ));
        assert!(reg.unregister(h).is_err());
    }

    #[test]
    fn test_freed_handle_is_reused() {
        let mut reg = registry();
        let (x, ix) = object("x");
        let h0 = reg.register(x, ix, "str");
        reg.unregister(h0).expect("unregister x");
        let (y, iy) = object("y");
        assert_eq!(reg.register(y, iy, "str"), h0);
    }

    #[test]
    fn test_smallest_free_handle_first() {
        let mut reg = registry();
        let objects: Vec<_> = (0..5).map(|i| object(&format!("o{}", i))).collect();
        let handles: Vec<_> = objects
            .iter()
            .map(|(o, i)| reg.register(Rc::clone(o), *i, "str"))
            .collect();
        reg.unregister(handles[3]).expect("unregister 4");
        reg.unregister(handles[1]).expect("unregister 2");
        let (n, i) = object("n");
        assert_eq!(reg.register(n, i, "str"), handles[1]);
        let (m, j) = object("m");
        assert_eq!(reg.register(m, j, "str"), handles[3]);
        let (k, l) = object("k");
        assert_eq!(reg.register(k, l, "str"), Handle::new(6));
    }

    #[test]
    fn test_growth_doubles_capacity() {
        let mut reg = registry();
        let before = reg.capacity();
        let objects: Vec<_> = (0..10).map(|i| object(&format!("g{}", i))).collect();
        for (o, i) in &objects {
            reg.register(Rc::clone(o), *i, "str");
        }
        assert!(reg.capacity() >= 11);
        assert!(reg.capacity() > before);
        assert_eq!(reg.len(), 10);
    }

    #[test]
    fn test_update_repoints_handle() {
        let mut reg = registry();
        let (a, ia) = object("before");
        let h = reg.register(a, ia, "str");
        let (b, ib) = object("after");
        reg.update(h, b, ib).expect("update live handle");
        assert_eq!(&*reg.lookup(h).expect("lookup updated"), "after");
        let (c, ic) = object("c");
        assert!(reg.update(Handle::new(40), c, ic).is_err());
    }

    #[test]
    fn test_update_to_registered_object_keeps_its_handle() {
        let mut reg = registry();
        let (a, ia) = object("a");
        let (b, ib) = object("b");
        let ha = reg.register(Rc::clone(&a), ia, "str");
        let hb = reg.register(b, ib, "str");
        reg.update(hb, Rc::clone(&a), ia).expect("alias a under hb");
        assert_eq!(&*reg.lookup(hb).expect("lookup alias"), "a");
        assert_eq!(reg.register(Rc::clone(&a), ia, "str"), ha);

        reg.unregister(hb).expect("unregister alias");
        assert_eq!(reg.register(Rc::clone(&a), ia, "str"), ha);
        reg.unregister(ha).expect("unregister original");
        assert_eq!(reg.register(a, ia, "str"), ha);
    }

    #[test]
    fn test_duplicate_registration_returns_existing() {
        let mut reg = registry();
        let (a, ia) = object("dup");
        let first = reg.register(Rc::clone(&a), ia, "str");
        let second = reg.register(a, ia, "str");
        assert_eq!(first, second);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.trace().expect("trace enabled").len(), 1);
    }

    #[test]
    fn test_reserved_handle_is_protected() {
        let mut reg = registry();
        let (r, ir) = object("runtime");
        reg.register_reserved(r, ir);
        assert!(reg.contains(Handle::RESERVED));
        assert!(reg.unregister(Handle::RESERVED).is_err());
        let (u, iu) = object("user");
        assert!(reg.update(Handle::RESERVED, u, iu).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_random_cycles_track_live_set() {
        let mut rng = fastrand::Rng::with_seed(0x5EED);
        let mut reg = registry();
        let mut live: Vec<(Handle, Rc<str>)> = Vec::new();
        for step in 0..500 {
            if live.is_empty() || rng.bool() {
                let (o, i) = object(&format!("r{}", step));
                let h = reg.register(Rc::clone(&o), i, "str");
                assert!(live.iter().all(|(lh, _)| *lh != h), "handle {} reused while live", h);
                live.push((h, o));
            } else {
                let (h, _) = live.swap_remove(rng.usize(..live.len()));
                reg.unregister(h).expect("unregister live handle");
            }
        }
        let expected: BTreeSet<Handle> = live.iter().map(|(h, _)| *h).collect();
        let actual: BTreeSet<Handle> = reg.handles().into_iter().collect();
        assert_eq!(actual, expected);
    }
}
