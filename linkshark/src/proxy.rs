//!
//! Rudp proxy
//!
//! Accepts connections on `bind_addr` and relays application payloads to a
//! `Client` connected to `forwarding_addr`, logging each payload's
//! sub-command and length in both directions. The reliable/unreliable
//! distinction a sender chose is not visible past `Connection::recv` (the
//! protocol never exposes it to the application layer, see the callback
//! surface in the design notes), so every relayed payload is forwarded
//! reliably; this trades the original's exact delivery class for a
//! guarantee that nothing a client sent through the proxy is silently lost.
//!
use log::info;
use log::warn;
use rudp_protocol::Client;
use rudp_protocol::Connection;
use rudp_protocol::Server;
use rudp_protocol::TransportConfig;
use rudp_protocol::TransportError;
use std::net::SocketAddr;

pub struct Proxy {}

impl Proxy {
    pub fn new(bind_addr: SocketAddr, forwarding_addr: SocketAddr, verbosity: u8) -> Self {
        let runner = ProxyRunner {
            bind_addr,
            forwarding_addr,
            verbosity,
        };
        tokio::spawn(async move { runner.run().await });
        Proxy {}
    }
}

struct ProxyRunner {
    bind_addr: SocketAddr,
    forwarding_addr: SocketAddr,
    verbosity: u8,
}

impl ProxyRunner {
    async fn run(self) {
        let mut server = Server::bind(self.bind_addr, TransportConfig::default());
        let mut next_id: u64 = 1;
        while let Some(conn) = server.accept().await {
            let id = next_id;
            next_id += 1;
            info!("[{}] accepted connection from {}", id, conn.remote_addr());
            match Client::connect(self.forwarding_addr, TransportConfig::default()).await {
                Ok(client) => AdapterRunner::spawn(id, conn, client, self.verbosity),
                Err(err) => warn!("[{}] connect to {} failed: {}", id, self.forwarding_addr, err),
            }
        }
    }
}

struct AdapterRunner {
    id: u64,
    conn: Connection,
    client: Client,
    verbosity: u8,
}

impl AdapterRunner {
    fn spawn(id: u64, conn: Connection, client: Client, verbosity: u8) {
        let runner = AdapterRunner {
            id,
            conn,
            client,
            verbosity,
        };
        tokio::spawn(async move { runner.run().await });
    }

    async fn run(mut self) {
        match self.run_inner().await {
            Ok(_) => (),
            Err(err) => info!("[{}] disconnected: {}", self.id, err),
        }
    }

    async fn run_inner(&mut self) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                incoming = self.conn.recv() => {
                    let (sub_command, data) = incoming?;
                    self.maybe_show("C->S", sub_command, data.len());
                    self.client.send(true, sub_command, data).await?;
                }
                incoming = self.client.recv() => {
                    let (sub_command, data) = incoming?;
                    self.maybe_show("S->C", sub_command, data.len());
                    self.conn.send(true, sub_command, data).await?;
                }
            }
        }
    }

    fn maybe_show(&self, direction: &str, sub_command: u8, len: usize) {
        if self.verbosity > 0 {
            info!("[{}] {} sub_command={} len={}", self.id, direction, sub_command, len);
        }
    }
}
