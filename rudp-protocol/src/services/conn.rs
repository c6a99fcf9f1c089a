//! The application-facing handle to one peer association: send/recv plus
//! the peer's remote address.

use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;
use crate::peer::task::AppCommand;

/// One established (or establishing) peer, as handed to application code
/// by [`crate::services::server::Server::accept`] or held internally by
/// [`crate::services::client::Client`].
pub struct Connection {
    remote: SocketAddr,
    app_tx: mpsc::UnboundedSender<AppCommand>,
    delivered_rx: mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
}

impl Connection {
    pub(crate) fn new(
        remote: SocketAddr,
        app_tx: mpsc::UnboundedSender<AppCommand>,
        delivered_rx: mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
    ) -> Self {
        Self {
            remote,
            app_tx,
            delivered_rx,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Queues an application payload for transmission. `reliable` selects
    /// ordered, acknowledged delivery; unreliable payloads are sent at
    /// most once and may arrive out of order relative to other unreliable
    /// sends.
    pub async fn send(&self, reliable: bool, sub_command: u8, data: Vec<u8>) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.app_tx
            .send(AppCommand::Send {
                reliable,
                sub_command,
                data,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::PeerDropped)?;
        reply_rx.await.map_err(|_| TransportError::PeerDropped)?
    }

    /// Awaits the next application payload. Returns `Err(PeerDropped)`
    /// once the association dies, folding what the source calls
    /// `peer_dropped` into the same recv loop that delivers `handle_packet`.
    pub async fn recv(&mut self) -> Result<(u8, Vec<u8>), TransportError> {
        self.delivered_rx.recv().await.ok_or(TransportError::PeerDropped)
    }

    /// Sends a best-effort CLOSE and tears the association down locally;
    /// does not wait for the remote to acknowledge it.
    pub async fn close(&self) {
        let _ = self.app_tx.send(AppCommand::Close);
    }
}
