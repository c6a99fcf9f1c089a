//! For now, the `Server` is just a wrapper around a [`Socket`] with a
//! bind-retry loop; in the future it may provide its own abstraction above
//! raw sub-command bytes.

use std::net::SocketAddr;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::services::conn::Connection;
use crate::services::socket::Socket;

pub struct Server {
    accept_rx: mpsc::UnboundedReceiver<Connection>,
}

impl Server {
    /// Spawns a task that retries the bind until it succeeds, then demuxes
    /// inbound datagrams by source address, handing each newly-established
    /// peer out through [`Server::accept`].
    pub fn bind(bind_addr: SocketAddr, config: TransportConfig) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let runner = ServerRunner {
            bind_addr,
            config,
            accept_tx,
        };
        tokio::spawn(runner.run());
        Self { accept_rx }
    }

    /// Returns `None` once the server has shut down.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.accept_rx.recv().await
    }
}

struct ServerRunner {
    bind_addr: SocketAddr,
    config: TransportConfig,
    accept_tx: mpsc::UnboundedSender<Connection>,
}

impl ServerRunner {
    async fn run(self) {
        info!("server: binding {}", self.bind_addr);
        let mut socket = loop {
            match Socket::bind(self.bind_addr, self.config).await {
                Ok(socket) => break socket,
                Err(err) => {
                    warn!("server: bind on {} failed: {}, retrying in 5s", self.bind_addr, err);
                    tokio::time::sleep(Duration::from_millis(5000)).await;
                }
            }
        };
        info!("server: listening on {}", self.bind_addr);
        while let Some(conn) = socket.accept().await {
            info!("server: accepted connection from {}", conn.remote_addr());
            if self.accept_tx.send(conn).is_err() {
                break;
            }
        }
    }
}
