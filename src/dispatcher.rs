//! Non-blocking arrival dispatch: decode, checksum-verify, peer-filter, and
//! flag-filter a single queued arrival.

use std::net::SocketAddr;

use crossbeam_channel::Receiver;

use crate::segment::{Flag, Segment};
use crate::transport::{self, Arrival};

/// Outcome of one dispatch attempt.
pub enum Dispatch {
    /// Nothing was waiting in the arrival queue.
    Empty,
    /// An arrival was present but failed validation (bad checksum, wrong
    /// peer, or unexpected flag) and was discarded.
    Discarded,
    /// A valid, expected segment, from the source address it arrived on.
    Segment(Segment, SocketAddr),
}

/// Drains exactly one item from `queue` and validates it against the
/// caller's expectations.
///
/// - Decodes the raw bytes; a checksum failure discards silently.
/// - If `peer` is `Some`, arrivals from any other address are discarded —
///   once connected, the dispatcher filters by peer.
/// - If `expected_flags` is non-empty, segments whose flag isn't in the set
///   are discarded.
/// - On a segment that passes every check, updates `*peer_recv_win` from
///   the segment's advertised window before returning it, so every call
///   site shares one place that tracks the peer's window.
pub fn handle_flow(
    queue: &Receiver<Arrival>,
    peer: Option<SocketAddr>,
    expected_flags: &[Flag],
    peer_recv_win: &mut u8,
) -> Dispatch {
    let Some((bytes, src)) = transport::try_recv(queue) else {
        return Dispatch::Empty;
    };

    let Some(segment) = Segment::unpack(&bytes) else {
        log::trace!("discarding segment from {src}: checksum mismatch");
        return Dispatch::Discarded;
    };

    if let Some(peer) = peer {
        if src != peer {
            log::trace!("discarding segment from unexpected peer {src} (connected to {peer})");
            return Dispatch::Discarded;
        }
    }

    if !expected_flags.is_empty() && !expected_flags.contains(&segment.flag) {
        log::trace!(
            "discarding segment from {src}: flag {:?} not in expected set",
            segment.flag
        );
        return Dispatch::Discarded;
    }

    *peer_recv_win = segment.window;
    Dispatch::Segment(segment, src)
}
