//! Connection-oriented surface built on top of the peer engine: socket
//! demux, server accept loop, client connect, and the app-facing handle.

pub mod client;
pub mod conn;
pub mod server;
pub mod socket;

/// Loopback scenario tests wiring a real `Server` and `Client` together
/// over actual UDP sockets, exercising the `tokio::select!` plumbing in
/// `peer::task` and `services::socket` that the engine's own unit tests
/// (`peer::engine`) never touch, since those call `on_datagram`/`service`
/// directly without a socket or task in the loop.
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::TransportConfig;
    use crate::error::TransportError;
    use crate::services::client::Client;
    use crate::services::server::Server;

    /// `Server::bind` returns as soon as its runner task is spawned, before
    /// the socket is actually bound — giving the runner a beat to finish
    /// before `Client::connect` fires its CONN_REQ avoids relying on the
    /// client's multi-second retransmit backoff to paper over the race.
    async fn let_server_finish_binding() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn s1_client_connect_completes_handshake_with_server() {
        let bind_addr = "127.0.0.1:38412".parse().unwrap();
        let mut server = Server::bind(bind_addr, TransportConfig::default());
        let_server_finish_binding().await;
        let client = Client::connect(bind_addr, TransportConfig::default())
            .await
            .expect("handshake should complete");
        let conn = server.accept().await.expect("server should accept the peer");
        assert_eq!(conn.remote_addr(), client.remote_addr());
    }

    #[tokio::test]
    async fn reliable_app_payload_round_trips_client_to_server() {
        let bind_addr = "127.0.0.1:38413".parse().unwrap();
        let mut server = Server::bind(bind_addr, TransportConfig::default());
        let_server_finish_binding().await;
        let client = Client::connect(bind_addr, TransportConfig::default())
            .await
            .expect("handshake should complete");
        let mut conn = server.accept().await.expect("server should accept the peer");

        client.send(true, 7, b"hello".to_vec()).await.expect("send should succeed");
        let (sub_command, data) = conn.recv().await.expect("server should receive the payload");
        assert_eq!(sub_command, 7);
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn bidirectional_traffic_flows_both_ways() {
        let bind_addr = "127.0.0.1:38414".parse().unwrap();
        let mut server = Server::bind(bind_addr, TransportConfig::default());
        let_server_finish_binding().await;
        let mut client = Client::connect(bind_addr, TransportConfig::default())
            .await
            .expect("handshake should complete");
        let mut conn = server.accept().await.expect("server should accept the peer");

        conn.send(false, 1, b"from-server".to_vec()).await.expect("send should succeed");
        let (sub_command, data) = client.recv().await.expect("client should receive the payload");
        assert_eq!(sub_command, 1);
        assert_eq!(data, b"from-server");
    }

    #[tokio::test]
    async fn s6_explicit_client_close_drops_the_server_side_connection() {
        let bind_addr = "127.0.0.1:38415".parse().unwrap();
        let mut server = Server::bind(bind_addr, TransportConfig::default());
        let_server_finish_binding().await;
        let client = Client::connect(bind_addr, TransportConfig::default())
            .await
            .expect("handshake should complete");
        let mut conn = server.accept().await.expect("server should accept the peer");

        client.close().await;
        let result = tokio::time::timeout(Duration::from_secs(2), conn.recv()).await;
        assert!(matches!(result, Ok(Err(TransportError::PeerDropped))));
    }
}
