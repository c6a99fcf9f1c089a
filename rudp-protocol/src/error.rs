//! Error kinds reported across the application-visible boundary.
//!
//! `MalformedPacket` and `InvalidAck` are never returned from a public
//! method: both conditions are swallowed and logged at `warn!` inside the
//! engine and demux (see `peer::engine::on_datagram`/`process_ack` and
//! `services::socket::accept_new`), since a peer that sends garbage or a
//! stale ack is an expected occurrence under packet loss, not something the
//! caller's own `send`/`recv` failed to do. The variants still belong to
//! this enum so the full set of error kinds the wire protocol can detect is
//! represented in one place, not scattered across log lines.

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("application sub-command {0} is out of range")]
    InvalidArgument(u8),

    #[error("send attempted before the handshake completed")]
    NotConnected,

    #[error("malformed packet")]
    MalformedPacket,

    #[error("ack {0} advances past the highest sequence sent")]
    InvalidAck(u16),

    #[error("peer connection was dropped")]
    PeerDropped,

    #[error("server connection was lost")]
    ServerLost,

    #[error("no usable local address for this connection's family")]
    AddressUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
