// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP mesh between nodes.
//!
//! Each node listens on one socket. During [`TcpTransport::establish`] a node
//! connects to every lower-numbered node and accepts one connection from
//! every higher-numbered node; the connecting side opens with its node id
//! (4 bytes, big-endian). Afterwards one reader thread per peer decodes
//! frames with [`FrameCodec`] and routes them to per-endpoint mailboxes.
//! Frames between workers of the same node never touch a socket.
//!
//! A reader that hits a decode or I/O error before [`Transport::shutdown`]
//! records the failure; every later `try_recv` that finds its mailbox empty
//! then reports `TransportFailure`. Sends keep working so the resulting
//! abort notice still reaches the healthy peers. A clean EOF means the peer
//! left the run and is not a failure.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};
use crate::node::Topology;
use crate::EndpointId;

use super::frame_codec::{FrameCodec, FRAME_PREFIX_SIZE};
use super::{Transport, TransportKind};

/// Connect attempts before a peer is declared unreachable.
const CONNECT_ATTEMPTS: u32 = 100;

/// Pause between connect attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// One node's view of the TCP mesh.
pub struct TcpTransport {
    node: usize,
    topology: Topology,
    writers: Vec<Option<Mutex<TcpStream>>>,
    local_tx: Vec<Sender<Vec<u8>>>,
    local_rx: Vec<Receiver<Vec<u8>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
}

impl TcpTransport {
    /// Listening socket for a node, with `SO_REUSEADDR`.
    pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        log::debug!("[tcp] listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Join the mesh as `node`. `peers[n]` is the listen address of node `n`.
    pub fn establish(
        node: usize,
        topology: Topology,
        listener: TcpListener,
        peers: &[SocketAddr],
        max_frame: usize,
    ) -> Result<Self> {
        let nodes = topology.nodes();
        if peers.len() != nodes || node >= nodes {
            return Err(Error::Config {
                reason: format!(
                    "node {} given {} peer addresses for {} nodes",
                    node,
                    peers.len(),
                    nodes
                ),
            });
        }

        let mut streams: Vec<Option<TcpStream>> = (0..nodes).map(|_| None).collect();
        for (peer, addr) in peers.iter().enumerate().take(node) {
            let mut stream = connect_with_retry(*addr)?;
            stream.set_nodelay(true)?;
            stream.write_all(&(node as u32).to_be_bytes())?;
            log::debug!("[tcp] node {} connected to node {} at {}", node, peer, addr);
            streams[peer] = Some(stream);
        }
        for _ in node + 1..nodes {
            let (mut stream, addr) = listener.accept()?;
            let mut hello = [0u8; 4];
            stream.read_exact(&mut hello)?;
            let peer = u32::from_be_bytes(hello) as usize;
            if peer <= node || peer >= nodes || streams[peer].is_some() {
                return Err(Error::transport(format!(
                    "node {} got unexpected handshake from node {} ({})",
                    node, peer, addr
                )));
            }
            stream.set_nodelay(true)?;
            log::debug!("[tcp] node {} accepted node {} from {}", node, peer, addr);
            streams[peer] = Some(stream);
        }

        let workers = topology.workers();
        let (local_tx, local_rx): (Vec<_>, Vec<_>) =
            (0..workers).map(|_| channel::unbounded()).unzip();

        let closed = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));
        let mut writers = Vec::with_capacity(nodes);
        let mut readers = Vec::with_capacity(nodes.saturating_sub(1));
        for (peer, stream) in streams.into_iter().enumerate() {
            let Some(stream) = stream else {
                writers.push(None);
                continue;
            };
            let reader = stream.try_clone()?;
            let link = PeerLink {
                node,
                peer,
                topology,
                mailboxes: local_tx.clone(),
                closed: Arc::clone(&closed),
                failure: Arc::clone(&failure),
            };
            let handle = std::thread::Builder::new()
                .name(format!("armi-tcp-{}-{}", node, peer))
                .spawn(move || link.read_loop(reader, max_frame))?;
            readers.push(handle);
            writers.push(Some(Mutex::new(stream)));
        }

        Ok(Self {
            node,
            topology,
            writers,
            local_tx,
            local_rx,
            readers: Mutex::new(readers),
            closed,
            failure,
        })
    }

    /// Fully connected loopback mesh, one transport per node.
    pub fn loopback_mesh(topology: Topology, max_frame: usize) -> Result<Vec<Arc<TcpTransport>>> {
        let loopback: SocketAddr = ([127, 0, 0, 1], 0).into();
        let listeners = (0..topology.nodes())
            .map(|_| Self::bind(loopback))
            .collect::<Result<Vec<_>>>()?;
        let addrs = listeners
            .iter()
            .map(TcpListener::local_addr)
            .collect::<std::io::Result<Vec<_>>>()?;

        let built: Vec<Result<TcpTransport>> = std::thread::scope(|scope| {
            let handles: Vec<_> = listeners
                .into_iter()
                .enumerate()
                .map(|(node, listener)| {
                    let addrs = &addrs;
                    scope.spawn(move || Self::establish(node, topology, listener, addrs, max_frame))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::transport("mesh setup thread panicked")))
                })
                .collect()
        });
        built
            .into_iter()
            .map(|transport| transport.map(Arc::new))
            .collect()
    }

    pub fn node(&self) -> usize {
        self.node
    }

    fn local_index(&self, endpoint: EndpointId) -> Result<usize> {
        if self.topology.node_of(endpoint) != self.node || endpoint >= self.topology.endpoints() {
            return Err(Error::InvalidEndpoint {
                endpoint,
                endpoints: self.topology.endpoints(),
            });
        }
        Ok(self.topology.worker_of(endpoint))
    }

    /// Error recorded by a reader thread, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    fn check_failure(&self) -> Result<()> {
        match self.failure.lock().as_ref() {
            Some(reason) => Err(Error::transport(reason.clone())),
            None => Ok(()),
        }
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn endpoints(&self) -> usize {
        self.topology.endpoints()
    }

    fn send(&self, dest: EndpointId, frame: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if dest >= self.topology.endpoints() {
            return Err(Error::InvalidEndpoint {
                endpoint: dest,
                endpoints: self.topology.endpoints(),
            });
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::transport("transport closed"));
        }
        let dest_node = self.topology.node_of(dest);
        if dest_node == self.node {
            self.local_tx[self.topology.worker_of(dest)]
                .send(frame)
                .map_err(|_| Error::transport(format!("mailbox of endpoint {} closed", dest)))?;
            return Ok(None);
        }
        let writer = self.writers[dest_node]
            .as_ref()
            .ok_or_else(|| Error::transport(format!("no stream to node {}", dest_node)))?;
        FrameCodec::write_frame(&mut *writer.lock(), dest as u32, &frame).map_err(|e| {
            Error::transport(format!("write to node {} failed: {}", dest_node, e))
        })?;
        Ok(Some(frame))
    }

    fn try_recv(&self, endpoint: EndpointId) -> Result<Option<Vec<u8>>> {
        let worker = self.local_index(endpoint)?;
        match self.local_rx[worker].try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => self.check_failure().map(|()| None),
            Err(TryRecvError::Disconnected) => Err(Error::transport(format!(
                "mailbox of endpoint {} disconnected",
                endpoint
            ))),
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for writer in self.writers.iter().flatten() {
            let _ = writer.lock().shutdown(Shutdown::Both);
        }
        let readers = std::mem::take(&mut *self.readers.lock());
        for handle in readers {
            if handle.join().is_err() {
                log::warn!("[tcp] node {} reader thread panicked", self.node);
            }
        }
        log::debug!("[tcp] node {} transport closed", self.node);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                attempt += 1;
                log::trace!("[tcp] connect to {} failed ({}), retrying", addr, e);
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            Err(e) => {
                return Err(Error::transport(format!(
                    "cannot reach {} after {} attempts: {}",
                    addr, CONNECT_ATTEMPTS, e
                )))
            }
        }
    }
}

/// What a reader thread needs to route frames and report failure.
struct PeerLink {
    node: usize,
    peer: usize,
    topology: Topology,
    mailboxes: Vec<Sender<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
}

impl PeerLink {
    fn read_loop(&self, mut stream: TcpStream, max_frame: usize) {
        let mut codec = FrameCodec::new(max_frame + FRAME_PREFIX_SIZE);
        loop {
            match codec.read_frame(&mut stream) {
                Ok(Some((dest, frame))) => {
                    let dest = dest as EndpointId;
                    if self.topology.node_of(dest) != self.node
                        || dest >= self.topology.endpoints()
                    {
                        log::warn!(
                            "[tcp] node {} dropped frame for foreign endpoint {} from node {}",
                            self.node,
                            dest,
                            self.peer
                        );
                        continue;
                    }
                    if self.mailboxes[self.topology.worker_of(dest)].send(frame).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    log::debug!(
                        "[tcp] node {} stream from node {} closed",
                        self.node,
                        self.peer
                    );
                    break;
                }
                Err(e) if self.closed.load(Ordering::Acquire) => {
                    log::debug!(
                        "[tcp] node {} stream from node {} ended: {}",
                        self.node,
                        self.peer,
                        e
                    );
                    break;
                }
                Err(e) => {
                    let reason = format!(
                        "stream from node {} to node {} failed: {}",
                        self.peer, self.node, e
                    );
                    log::error!("[tcp] {}", reason);
                    let mut failure = self.failure.lock();
                    if failure.is_none() {
                        *failure = Some(reason);
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wire::{self, MessageTag, WireHeader};

    fn recv_blocking(transport: &TcpTransport, endpoint: EndpointId) -> Vec<u8> {
        for _ in 0..10_000 {
            if let Some(frame) = transport.try_recv(endpoint).expect("try_recv") {
                return frame;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("no frame for endpoint {}", endpoint);
    }

    #[test]
    fn test_loopback_mesh_routes_frames() {
        let topology = Topology::new(3, 2);
        let mesh = TcpTransport::loopback_mesh(topology, 1 << 16).expect("mesh");
        assert_eq!(mesh.len(), 3);

        let frame = wire::frame(WireHeader::new(MessageTag::AsyncOnly, 0, 0), b"to five")
            .expect("frame");
        let returned = mesh[0].send(5, frame.clone()).expect("send 0 -> 5");
        assert_eq!(returned.as_deref(), Some(frame.as_slice()));
        assert_eq!(recv_blocking(&mesh[2], 5), frame);

        let local = wire::frame(WireHeader::new(MessageTag::AsyncOnly, 2, 0), b"same node")
            .expect("frame");
        assert!(mesh[1].send(3, local.clone()).expect("local send").is_none());
        assert_eq!(recv_blocking(&mesh[1], 3), local);

        for transport in &mesh {
            transport.shutdown();
        }
    }

    #[test]
    fn test_frames_keep_order_per_pair() {
        let topology = Topology::new(2, 1);
        let mesh = TcpTransport::loopback_mesh(topology, 1 << 16).expect("mesh");
        for i in 0..200u32 {
            mesh[1].send(0, i.to_le_bytes().to_vec()).expect("send");
        }
        for i in 0..200u32 {
            assert_eq!(recv_blocking(&mesh[0], 0), i.to_le_bytes().to_vec());
        }
    }

    #[test]
    fn test_corrupt_stream_reports_failure() {
        let topology = Topology::new(2, 1);
        let mesh = TcpTransport::loopback_mesh(topology, 1024).expect("mesh");
        {
            let writer = mesh[1].writers[0].as_ref().expect("stream to node 0");
            writer.lock().write_all(&[0xff; 8]).expect("inject bad prefix");
        }

        let mut outcome = Ok(None);
        for _ in 0..10_000 {
            outcome = mesh[0].try_recv(0);
            if outcome.is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(outcome, Err(Error::TransportFailure { .. })));
        assert!(mesh[0].failure().is_some());
        // The abort notice path towards the healthy direction stays open.
        mesh[0].send(1, b"abort".to_vec()).expect("send after failure");
        assert_eq!(recv_blocking(&mesh[1], 1), b"abort".to_vec());
        assert!(mesh[1].failure().is_none());
    }

    #[test]
    fn test_clean_shutdown_is_not_a_failure() {
        let topology = Topology::new(2, 1);
        let mesh = TcpTransport::loopback_mesh(topology, 1024).expect("mesh");
        mesh[1].send(0, b"last".to_vec()).expect("send");
        mesh[1].shutdown();
        assert_eq!(recv_blocking(&mesh[0], 0), b"last".to_vec());
        std::thread::sleep(Duration::from_millis(50));
        assert!(mesh[0].try_recv(0).expect("peer left cleanly").is_none());
        mesh[0].shutdown();
    }

    #[test]
    fn test_foreign_endpoint_rejected() {
        let topology = Topology::new(2, 2);
        let mesh = TcpTransport::loopback_mesh(topology, 1024).expect("mesh");
        assert!(matches!(
            mesh[0].try_recv(2),
            Err(Error::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            mesh[0].send(4, Vec::new()),
            Err(Error::InvalidEndpoint { .. })
        ));
    }
}
