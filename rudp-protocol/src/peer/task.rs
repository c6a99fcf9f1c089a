//! Drives one [`PeerEngine`] inside a `tokio::select!` loop: inbound
//! datagrams, application send/close requests, and the single per-peer
//! service timer all arrive on this one task, so the engine itself never
//! has to worry about concurrent access.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use log::warn;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;
use crate::peer::engine::{Effects, PeerEngine};

/// A request from application code to the peer's task.
pub enum AppCommand {
    Send {
        reliable: bool,
        sub_command: u8,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Close,
}

/// A lifecycle edge the owner (`Client` or `Server`) needs to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Dropped,
}

/// Channels the peer's owner uses to drive and observe its task.
pub struct PeerHandle {
    pub inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub app_tx: mpsc::UnboundedSender<AppCommand>,
}

struct PeerTask {
    engine: PeerEngine,
    socket: Arc<UdpSocket>,
    inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    app_rx: mpsc::UnboundedReceiver<AppCommand>,
    delivered_tx: mpsc::UnboundedSender<(u8, Vec<u8>)>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
    reaped_tx: mpsc::UnboundedSender<SocketAddr>,
    ready_tx: Option<oneshot::Sender<Result<(), TransportError>>>,
}

/// Spawns the peer's driving task and returns the channels used to talk to
/// it. The socket is shared with every other peer owned by the same
/// server (or the client's one endpoint); concurrent sends on it are safe,
/// there is no per-peer socket to bind.
///
/// `reaped_tx` is separate from `lifecycle_tx`: the latter is the owning
/// `Connection`'s view of its own peer, the former is the demux's signal
/// to drop its routing table entry, fired exactly once on exit regardless
/// of which side caused it.
///
/// `ready_tx`, when given, is fired exactly once with the outcome of the
/// handshake (`Ok` on the first `became_connected`, `Err(PeerDropped)` if
/// the peer dies first) — this is how `Client::connect` folds the engine's
/// CONNECTING → RUN transition into the success of `connect()` itself.
/// Server-side peers are already RUN by the time they're spawned (see
/// `services::socket`), so they're always spawned with `None`.
pub fn spawn(
    engine: PeerEngine,
    socket: Arc<UdpSocket>,
    delivered_tx: mpsc::UnboundedSender<(u8, Vec<u8>)>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleEvent>,
    reaped_tx: mpsc::UnboundedSender<SocketAddr>,
    ready_tx: Option<oneshot::Sender<Result<(), TransportError>>>,
) -> PeerHandle {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let task = PeerTask {
        engine,
        socket,
        inbound_rx,
        app_rx,
        delivered_tx,
        lifecycle_tx,
        reaped_tx,
        ready_tx,
    };
    tokio::spawn(task.run());
    PeerHandle { inbound_tx, app_tx }
}

impl PeerTask {
    async fn run(mut self) {
        loop {
            let wake = tokio::time::Instant::from_std(self.engine.next_wake(Instant::now()));
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {
                    let effects = self.engine.service(Instant::now());
                    self.apply(effects).await;
                }
                datagram = self.inbound_rx.recv() => {
                    match datagram {
                        Some(datagram) => {
                            let effects = self.engine.on_datagram(&datagram, Instant::now());
                            self.apply(effects).await;
                        }
                        None => break,
                    }
                }
                command = self.app_rx.recv() => {
                    match command {
                        Some(AppCommand::Send { reliable, sub_command, data, reply }) => {
                            let result = self.engine.send_app(reliable, sub_command, data);
                            let _ = reply.send(result);
                        }
                        Some(AppCommand::Close) => {
                            let effects = self.engine.close(Instant::now());
                            self.apply(effects).await;
                        }
                        None => break,
                    }
                }
            }
            if self.engine.is_dead() {
                break;
            }
        }
        let _ = self.lifecycle_tx.send(LifecycleEvent::Dropped);
        let _ = self.reaped_tx.send(self.engine.remote);
    }

    async fn apply(&mut self, effects: Effects) {
        for datagram in effects.datagrams {
            if let Err(err) = self.socket.send_to(&datagram, self.engine.remote).await {
                warn!("peer {}: send failed: {}", self.engine.remote, err);
            }
        }
        for delivered in effects.delivered {
            let _ = self.delivered_tx.send(delivered);
        }
        if effects.became_connected {
            let _ = self.lifecycle_tx.send(LifecycleEvent::Connected);
            if let Some(ready_tx) = self.ready_tx.take() {
                let _ = ready_tx.send(Ok(()));
            }
        }
        if effects.dropped {
            if let Some(ready_tx) = self.ready_tx.take() {
                let _ = ready_tx.send(Err(TransportError::PeerDropped));
            }
        }
    }
}
