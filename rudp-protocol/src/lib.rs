//! A reliable datagram transport built on top of unreliable UDP: ordered,
//! acknowledged delivery and unordered unreliable delivery over the same
//! association, with a symmetric peer model (`Server` accepts many peers,
//! `Client` binds exactly one).
//!
//! See [`services::server::Server`], [`services::client::Client`] and
//! [`services::conn::Connection`] for the application-facing surface;
//! [`peer::engine::PeerEngine`] for the protocol state machine itself.

pub mod config;
pub mod error;
pub mod peer;
pub mod services;
pub mod wire;

pub use config::TransportConfig;
pub use error::TransportError;
pub use services::client::Client;
pub use services::conn::Connection;
pub use services::server::Server;
