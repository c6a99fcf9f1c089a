//! Protocol timing constants, gathered into a value passed at construction
//! time rather than hard-coded, the way `MinetestSocket::new` takes its
//! `bind_addr` as a parameter instead of assuming one.

/// Timing knobs for a [`crate::services::server::Server`] or
/// [`crate::services::client::Client`]. [`Default`] matches the numbers
/// fixed by the wire protocol; there is currently no supported way to run
/// two peers with mismatched configs, since the timers are purely local
/// policy and never negotiated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Idle time before a keep-alive PING is injected.
    pub action_timeout_ms: u64,
    /// Silence duration after which a peer is declared dead.
    pub drop_timeout_ms: u64,
    /// Upper bound on the retransmit timeout's exponential backoff.
    pub max_rto_ms: u64,
    /// Initial smoothed RTT estimate, before any sample is taken.
    pub initial_srtt_ms: u64,
    /// Initial RTT variance estimate.
    pub initial_rttvar_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            action_timeout_ms: 5000,
            drop_timeout_ms: 10000,
            max_rto_ms: 3000,
            initial_srtt_ms: 100,
            initial_rttvar_ms: 50,
        }
    }
}
