// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process message passing over crossbeam channels.
//!
//! Every endpoint of the run owns one unbounded mailbox. Frames move by
//! value, so a send never copies and never returns the buffer.

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use crate::error::{Error, Result};
use crate::EndpointId;

use super::{Transport, TransportKind};

/// Full mesh of in-process mailboxes.
pub struct ChannelTransport {
    senders: Vec<Sender<Vec<u8>>>,
    receivers: Vec<Receiver<Vec<u8>>>,
}

impl ChannelTransport {
    /// Mesh connecting `endpoints` endpoints.
    pub fn new(endpoints: usize) -> Self {
        let (senders, receivers) = (0..endpoints).map(|_| channel::unbounded()).unzip();
        log::debug!("[channel] mesh of {} mailboxes", endpoints);
        Self { senders, receivers }
    }

    fn check(&self, endpoint: EndpointId) -> Result<()> {
        if endpoint >= self.senders.len() {
            return Err(Error::InvalidEndpoint {
                endpoint,
                endpoints: self.senders.len(),
            });
        }
        Ok(())
    }

    /// Frames waiting for `endpoint`.
    pub fn pending(&self, endpoint: EndpointId) -> usize {
        self.receivers.get(endpoint).map_or(0, Receiver::len)
    }
}

impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn endpoints(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, dest: EndpointId, frame: Vec<u8>) -> Result<Option<Vec<u8>>> {
        self.check(dest)?;
        self.senders[dest]
            .send(frame)
            .map_err(|_| Error::transport(format!("mailbox of endpoint {} closed", dest)))?;
        Ok(None)
    }

    fn try_recv(&self, endpoint: EndpointId) -> Result<Option<Vec<u8>>> {
        self.check(endpoint)?;
        match self.receivers[endpoint].try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::transport(format!(
                "mailbox of endpoint {} disconnected",
                endpoint
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_frames_arrive_in_order() {
        let transport = ChannelTransport::new(3);
        for i in 0..5u8 {
            assert!(transport.send(2, vec![i; 4]).expect("send").is_none());
        }
        assert_eq!(transport.pending(2), 5);
        for i in 0..5u8 {
            assert_eq!(transport.try_recv(2).expect("recv"), Some(vec![i; 4]));
        }
        assert_eq!(transport.try_recv(2).expect("recv empty"), None);
        assert_eq!(transport.try_recv(0).expect("other mailbox"), None);
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let transport = ChannelTransport::new(2);
        assert!(matches!(
            transport.send(2, Vec::new()),
            Err(Error::InvalidEndpoint {
                endpoint: 2,
                endpoints: 2
            })
        ));
    }

    #[test]
    fn test_cross_thread_delivery() {
        let transport = Arc::new(ChannelTransport::new(2));
        let sender = Arc::clone(&transport);
        std::thread::spawn(move || {
            for i in 0..100u32 {
                sender.send(1, i.to_le_bytes().to_vec()).expect("send");
            }
        })
        .join()
        .expect("sender thread");
        let mut received = Vec::new();
        while let Some(frame) = transport.try_recv(1).expect("recv") {
            received.push(u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]));
        }
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }
}
