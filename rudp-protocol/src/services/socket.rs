//! Server Demux: one UDP socket shared by every peer the server has
//! accepted, keyed by remote address.
//!
//! Grounded directly in `services/socket.rs`'s `MinetestSocketRunner`: a
//! `tokio::select!` loop over socket readability and a channel peer tasks
//! use to report their own exit, a `HashMap<SocketAddr, _>` of routing
//! entries, and an `accept_tx` channel handing newly-established peers
//! upward. Unlike the teacher, outbound writes are not funneled through
//! this task's own `try_send_to`/`Interest::WRITABLE` queue — each peer
//! task sends directly through the shared `Arc<UdpSocket>`, since `tokio`
//! supports concurrent sends on one socket and there is no longer a
//! single-threaded discipline to preserve once every peer has its own task.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::peer::engine::PeerEngine;
use crate::peer::task;
use crate::services::conn::Connection;
use crate::wire::packet::{Body, Packet};

const MAX_DATAGRAM_SIZE: usize = 65536;

/// Handle to a running server demux: yields newly-accepted connections.
pub struct Socket {
    accept_rx: mpsc::UnboundedReceiver<Connection>,
}

impl Socket {
    /// Binds `bind_addr` (V4 or V6; use port 0 for an ephemeral port) and
    /// spawns the demux task.
    pub async fn bind(bind_addr: SocketAddr, config: TransportConfig) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (reaped_tx, reaped_rx) = mpsc::unbounded_channel();
        let runner = SocketRunner {
            socket,
            config,
            peers: HashMap::new(),
            accept_tx,
            reaped_tx,
            reaped_rx,
        };
        tokio::spawn(runner.run());
        Ok(Self { accept_rx })
    }

    /// Returns `None` once the demux task has exited.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.accept_rx.recv().await
    }
}

struct SocketRunner {
    socket: Arc<UdpSocket>,
    config: TransportConfig,
    peers: HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>,
    accept_tx: mpsc::UnboundedSender<Connection>,
    reaped_tx: mpsc::UnboundedSender<SocketAddr>,
    reaped_rx: mpsc::UnboundedReceiver<SocketAddr>,
}

impl SocketRunner {
    async fn run(mut self) {
        if let Err(err) = self.run_inner().await {
            warn!("socket demux on {:?}: exiting: {:#}", self.socket.local_addr(), err);
        }
    }

    async fn run_inner(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, remote_addr)) => self.route(remote_addr, &buf[..n]).await,
                        Err(err) => return Err(err.into()),
                    }
                }
                reaped = self.reaped_rx.recv() => {
                    match reaped {
                        Some(remote_addr) => {
                            self.peers.remove(&remote_addr);
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Step 1 of §4.4: forward to an existing peer's task if one is
    /// already routed for this address.
    async fn route(&mut self, remote_addr: SocketAddr, data: &[u8]) {
        if let Some(inbound_tx) = self.peers.get(&remote_addr) {
            if inbound_tx.send(data.to_vec()).is_err() {
                self.peers.remove(&remote_addr);
            }
            return;
        }
        self.accept_new(remote_addr, data);
    }

    /// Steps 2-3 of §4.4: an unknown source must present a well-formed
    /// CONN_REQ or is discarded; a recognized one gets a fresh peer engine
    /// in NEW, which is handed the packet directly (no task yet) so we can
    /// decide accept-or-reject before spawning anything.
    fn accept_new(&mut self, remote_addr: SocketAddr, data: &[u8]) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("socket: dropping malformed datagram from unknown peer {}: {:#}", remote_addr, err);
                return;
            }
        };
        if !matches!(packet.body, Body::ConnReq(_)) {
            debug!(
                "socket: dropping non-CONN_REQ command {} from unknown peer {}",
                packet.header.command, remote_addr
            );
            return;
        }
        let now = Instant::now();
        let mut engine = PeerEngine::new_server(remote_addr, self.config, now);
        let effects = engine.on_datagram(data, now);
        if !effects.became_connected {
            debug!("socket: peer {} rejected during handshake", remote_addr);
            return;
        }

        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, _lifecycle_rx) = mpsc::unbounded_channel();
        let handle = task::spawn(
            engine,
            self.socket.clone(),
            delivered_tx,
            lifecycle_tx,
            self.reaped_tx.clone(),
            None,
        );
        self.peers.insert(remote_addr, handle.inbound_tx);
        let conn = Connection::new(remote_addr, handle.app_tx, delivered_rx);
        if self.accept_tx.send(conn).is_err() {
            debug!("socket: accept channel closed, dropping freshly accepted peer {}", remote_addr);
        }
    }
}
