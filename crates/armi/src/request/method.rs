// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed operation selectors and per-type method tables.
//!
//! A [`Method`] pairs a wire selector with a plain function pointer. The
//! same constant serves both paths: calls to the local endpoint invoke the
//! function directly with typed arguments, remote calls ship the selector and
//! the receiver looks it up in the target type's [`MethodTable`].
//!
//! ```ignore
//! struct Counter { value: Cell<u64> }
//!
//! impl Counter {
//!     const ADD: Method<Counter, (u64,), ()> = Method::new(1, "add", |c, _ep, (n,)| {
//!         c.value.set(c.value.get() + n)
//!     });
//! }
//!
//! impl RemoteObject for Counter {
//!     fn methods(table: &mut MethodTable<Self>) {
//!         table.add(Self::ADD);
//!     }
//! }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

use crate::dispatch::ReplyWriter;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::marshal::{self, Marshal};
use crate::registry::Handle;

use super::OpId;

/// Operation on objects of type `T` taking `A` and returning `R`.
///
/// Handlers receive `&T`; objects mutate through interior mutability so a
/// handler may safely re-enter its own object through a nested call.
pub struct Method<T, A, R> {
    id: OpId,
    name: &'static str,
    func: fn(&T, &Endpoint, A) -> R,
}

impl<T, A, R> Method<T, A, R> {
    pub const fn new(id: OpId, name: &'static str, func: fn(&T, &Endpoint, A) -> R) -> Self {
        Self { id, name, func }
    }

    pub const fn id(&self) -> OpId {
        self.id
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Invoke directly on a local object.
    pub fn call(&self, target: &T, endpoint: &Endpoint, args: A) -> R {
        (self.func)(target, endpoint, args)
    }
}

impl<T, A, R> Clone for Method<T, A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, A, R> Copy for Method<T, A, R> {}

/// An object type that can be the target of remote calls.
pub trait RemoteObject: 'static {
    /// Populate the method table. Called once per type per endpoint.
    fn methods(table: &mut MethodTable<Self>)
    where
        Self: Sized;
}

type Invoker<T> = Box<dyn Fn(&T, &Endpoint, &[u8], Option<&mut ReplyWriter<'_>>) -> Result<()>>;

/// Wire-side dispatch table for one object type.
pub struct MethodTable<T> {
    entries: HashMap<OpId, (&'static str, Invoker<T>)>,
}

impl<T: 'static> MethodTable<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register `method` for remote invocation.
    pub fn add<A, R>(&mut self, method: Method<T, A, R>) -> &mut Self
    where
        A: Marshal + 'static,
        R: Marshal + 'static,
    {
        let invoker: Invoker<T> = Box::new(
            move |target: &T,
                  endpoint: &Endpoint,
                  args: &[u8],
                  reply: Option<&mut ReplyWriter<'_>>| {
                let args: A = marshal::unpack_from(args)?;
                let result = method.call(target, endpoint, args);
                // Result stays alive here, so a short carrier only repeats the packing.
                match reply {
                    Some(writer) => writer.store(&result),
                    None => Ok(()),
                }
            },
        );
        if let Some((previous, _)) = self.entries.insert(method.id, (method.name, invoker)) {
            log::warn!(
                "[method] selector {} of {} rebound from '{}' to '{}'",
                method.id,
                std::any::type_name::<T>(),
                previous,
                method.name
            );
        }
        self
    }

    /// Decode, invoke and optionally pack the result of operation `op`.
    pub fn invoke(
        &self,
        target: &T,
        endpoint: &Endpoint,
        handle: Handle,
        op: OpId,
        args: &[u8],
        reply: Option<&mut ReplyWriter<'_>>,
    ) -> Result<()> {
        let (_, invoker) = self
            .entries
            .get(&op)
            .ok_or(Error::UnknownOperation { handle, op })?;
        invoker(target, endpoint, args, reply)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name_of(&self, op: OpId) -> Option<&'static str> {
        self.entries.get(&op).map(|(name, _)| *name)
    }
}

impl<T: 'static> Default for MethodTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased registry entry.
pub trait ObjectEntry {
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Execute a wire request against this object.
    fn invoke(
        &self,
        endpoint: &Endpoint,
        handle: Handle,
        op: OpId,
        args: &[u8],
        reply: Option<&mut ReplyWriter<'_>>,
    ) -> Result<()>;
}

/// Registry entry for a concrete object type.
pub struct TypedEntry<T: RemoteObject> {
    object: Rc<T>,
    methods: Rc<MethodTable<T>>,
}

impl<T: RemoteObject> TypedEntry<T> {
    pub fn new(object: Rc<T>, methods: Rc<MethodTable<T>>) -> Self {
        Self { object, methods }
    }

    pub fn object(&self) -> &Rc<T> {
        &self.object
    }
}

impl<T: RemoteObject> ObjectEntry for TypedEntry<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn invoke(
        &self,
        endpoint: &Endpoint,
        handle: Handle,
        op: OpId,
        args: &[u8],
        reply: Option<&mut ReplyWriter<'_>>,
    ) -> Result<()> {
        self.methods
            .invoke(&self.object, endpoint, handle, op, args, reply)
    }
}
