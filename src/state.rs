//! Shared per-endpoint connection state.

use std::net::SocketAddr;

use rand::Rng;

/// `OPEN → CONN_EST → OPEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    ConnEst,
}

/// Fields common to both the client and server engine, factored out the way
/// a full TCP control block holds send/receive state regardless of active vs. passive open.
#[derive(Debug)]
pub struct ConnState {
    pub state: State,
    /// Own next send sequence.
    pub seq_nr: u16,
    /// Next sequence expected from the peer.
    pub ack_nr: u16,
    /// Configured ceiling on the own advertised receive window (segments).
    pub recv_win: u8,
    /// Peer's last-advertised window.
    pub peer_recv_win: u8,
    /// Set on handshake completion; later arrivals from other addresses are
    /// silently ignored.
    pub peer_address: Option<SocketAddr>,
}

impl ConnState {
    /// A fresh, unconnected endpoint with a random initial sequence number.
    pub fn new(recv_win: u8) -> Self {
        ConnState {
            state: State::Open,
            seq_nr: rand::thread_rng().gen(),
            ack_nr: 0,
            recv_win,
            peer_recv_win: 0,
            peer_address: None,
        }
    }

    /// The window actually advertised on the wire: the configured ceiling
    /// minus current receive-side occupancy (buffered-but-undelivered
    /// segments), floored at zero.
    pub fn advertised_window(&self, occupancy: usize) -> u8 {
        self.recv_win.saturating_sub(occupancy.min(u8::MAX as usize) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_window_shrinks_with_occupancy() {
        let conn = ConnState::new(10);
        assert_eq!(conn.advertised_window(0), 10);
        assert_eq!(conn.advertised_window(4), 6);
    }

    #[test]
    fn advertised_window_floors_at_zero() {
        let conn = ConnState::new(10);
        assert_eq!(conn.advertised_window(20), 0);
    }
}
