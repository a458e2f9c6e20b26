// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport layer.
//!
//! A [`Transport`] moves whole frames between endpoints that do not share
//! memory. Endpoints of one node bypass it entirely unless the
//! [`TransportPolicy`] forces message passing.
//!
//! | Backend | Scope | Mechanism |
//! |---------|-------|-----------|
//! | [`ChannelTransport`] | one process | crossbeam mailbox per endpoint |
//! | [`TcpTransport`] | one node per process | full TCP mesh, reader thread per peer |

pub mod channel;
pub mod frame_codec;
pub mod selector;
pub mod tcp;
pub mod wire;

pub use channel::ChannelTransport;
pub use frame_codec::FrameCodec;
pub use selector::{Route, TransportPolicy, TransportSelector};
pub use tcp::TcpTransport;
pub use wire::{MessageTag, WireHeader, WIRE_HEADER_SIZE};

use crate::error::Result;
use crate::EndpointId;

/// Backend selector for [`Runtime`](crate::Runtime).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// In-process channels.
    #[default]
    Channel,
    /// TCP over loopback, one listener per node.
    Tcp,
}

/// Frame transport between endpoints.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Total endpoints reachable through this transport.
    fn endpoints(&self) -> usize;

    /// Send `frame` (wire header included) to `dest`.
    ///
    /// Returns the frame buffer when the backend copied it out, so the
    /// sender can reuse it.
    fn send(&self, dest: EndpointId, frame: Vec<u8>) -> Result<Option<Vec<u8>>>;

    /// Next frame addressed to local endpoint `endpoint`, if any.
    fn try_recv(&self, endpoint: EndpointId) -> Result<Option<Vec<u8>>>;

    /// Release background resources.
    fn shutdown(&self) {}
}
