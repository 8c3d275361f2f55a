//! The sliding send window: per-payload metadata, selective retransmit on a
//! per-segment timer, and window slide on in-order ACK.

use std::time::{Duration, Instant};

use crate::config::PAYLOAD_SIZE;
use crate::seq::safe_incr;

/// Sender-side metadata for one chunk of the file being transferred.
#[derive(Debug, Clone)]
pub struct PayloadRecord {
    pub id: u16,
    pub data: Vec<u8>,
    pub sent: bool,
    pub acknowledged: bool,
    sent_at: Option<Instant>,
}

impl PayloadRecord {
    fn new(id: u16, data: Vec<u8>) -> Self {
        PayloadRecord {
            id,
            data,
            sent: false,
            acknowledged: false,
            sent_at: None,
        }
    }

    /// Elapsed time since this payload was last (re)sent. `None` if never sent.
    pub fn elapsed(&self) -> Option<Duration> {
        self.sent_at.map(|t| t.elapsed())
    }

    fn mark_sent(&mut self) {
        self.sent = true;
        self.sent_at = Some(Instant::now());
    }

    /// The `ack_nr` that acknowledges this payload: `start_seq ⊕ (id ⊕ 1)`.
    fn expected_ack(&self, start_seq: u16) -> u16 {
        safe_incr(start_seq, safe_incr(self.id, 1))
    }
}

/// Splits `bytes` into `PAYLOAD_SIZE` chunks (the last may be shorter),
/// indexed from 0.
pub fn chunk_payloads(bytes: &[u8]) -> Vec<PayloadRecord> {
    if bytes.is_empty() {
        return Vec::new();
    }

    bytes
        .chunks(PAYLOAD_SIZE)
        .enumerate()
        .map(|(i, chunk)| PayloadRecord::new(i as u16, chunk.to_vec()))
        .collect()
}

/// The sliding window over payload indices `[lower, upper)`, with
/// selective (not cumulative) acknowledgement: each ACK identifies exactly
/// one in-window payload by its expected-ack value.
pub struct SendWindow {
    pub payloads: Vec<PayloadRecord>,
    pub lower: usize,
    pub upper: usize,
    start_seq: u16,
    timeout: Duration,
}

impl SendWindow {
    pub fn new(payloads: Vec<PayloadRecord>, start_seq: u16, peer_recv_win: u8, timeout: Duration) -> Self {
        let total = payloads.len();
        let upper = (peer_recv_win as usize).min(total);

        SendWindow {
            payloads,
            lower: 0,
            upper,
            start_seq,
            timeout,
        }
    }

    pub fn total(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_complete(&self) -> bool {
        self.lower >= self.upper && self.lower >= self.total()
    }

    /// Payloads in `[lower, upper)` that need (re)sending: never sent, or
    /// whose per-segment timer has exceeded `timeout`.
    pub fn due_for_send(&self) -> Vec<usize> {
        (self.lower..self.upper)
            .filter(|&i| {
                let p = &self.payloads[i];
                !p.sent || p.elapsed().map(|e| e >= self.timeout).unwrap_or(false)
            })
            .collect()
    }

    pub fn mark_sent(&mut self, index: usize) {
        self.payloads[index].mark_sent();
    }

    /// The wire `seq_nr` for payload `index`: `safe_incr(start_seq, id)`.
    pub fn seq_for(&self, index: usize) -> u16 {
        safe_incr(self.start_seq, self.payloads[index].id)
    }

    /// Applies an incoming `ack_nr`: finds the in-window payload whose
    /// expected ack matches and marks it acknowledged. Returns whether a
    /// match was found.
    pub fn apply_ack(&mut self, ack_nr: u16) -> bool {
        for i in self.lower..self.upper {
            if self.payloads[i].expected_ack(self.start_seq) == ack_nr {
                self.payloads[i].acknowledged = true;
                return true;
            }
        }
        false
    }

    /// Slides the window: advances `lower` over a contiguous acknowledged
    /// prefix, advancing `upper` in lockstep while more payloads remain.
    pub fn slide(&mut self) {
        while self.lower < self.upper && self.payloads[self.lower].acknowledged {
            self.lower += 1;
            if self.upper < self.total() {
                self.upper += 1;
            }
        }
    }

    /// Recomputes `upper` against the peer's latest advertised window.
    pub fn resize(&mut self, peer_recv_win: u8) {
        let total = self.total();
        self.upper = (self.lower + peer_recv_win as usize).min(total);
        if self.upper < self.lower {
            self.upper = self.lower;
        }
    }

    /// The sender's own next-send sequence once the whole window is
    /// complete: `safe_incr(start_seq, last_payload.id)`.
    pub fn final_seq(&self) -> u16 {
        match self.payloads.last() {
            Some(p) => safe_incr(self.start_seq, p.id),
            None => self.start_seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_splits_on_payload_boundaries() {
        let bytes = vec![0xAB; PAYLOAD_SIZE * 3 + 48];
        let payloads = chunk_payloads(&bytes);
        assert_eq!(payloads.len(), 4);
        assert_eq!(payloads[0].data.len(), PAYLOAD_SIZE);
        assert_eq!(payloads[3].data.len(), 48);
        assert_eq!(payloads[3].id, 3);
    }

    #[test]
    fn empty_input_yields_no_payloads() {
        assert!(chunk_payloads(&[]).is_empty());
    }

    #[test]
    fn window_slides_only_over_contiguous_acked_prefix() {
        let payloads = chunk_payloads(&vec![0u8; PAYLOAD_SIZE * 4]);
        let mut win = SendWindow::new(payloads, 100, 10, Duration::from_millis(50));
        assert_eq!(win.upper, 4);

        let ack0 = win.payloads[0].expected_ack(100);
        let ack2 = win.payloads[2].expected_ack(100);

        assert!(win.apply_ack(ack2));
        win.slide();
        assert_eq!(win.lower, 0, "cannot slide past an unacked payload 0");

        assert!(win.apply_ack(ack0));
        win.slide();
        assert_eq!(win.lower, 1, "slides once 0 is acked, but stops before unacked 1");
    }

    #[test]
    fn resize_tracks_peer_window_shrinking() {
        let payloads = chunk_payloads(&vec![0u8; PAYLOAD_SIZE * 10]);
        let mut win = SendWindow::new(payloads, 0, 10, Duration::from_millis(50));
        win.resize(3);
        assert_eq!(win.upper, 3);
    }

    #[test]
    fn seq_for_uses_modular_successor_from_start() {
        let payloads = chunk_payloads(&vec![0u8; PAYLOAD_SIZE * 2]);
        let win = SendWindow::new(payloads, u16::MAX, 10, Duration::from_millis(50));
        assert_eq!(win.seq_for(0), u16::MAX);
        assert_eq!(win.seq_for(1), 0);
    }

    #[test]
    fn due_for_send_includes_unsent_and_timed_out() {
        let payloads = chunk_payloads(&vec![0u8; PAYLOAD_SIZE * 2]);
        let mut win = SendWindow::new(payloads, 0, 10, Duration::from_millis(0));
        assert_eq!(win.due_for_send(), vec![0, 1]);
        win.mark_sent(0);
        // timeout is 0ms, so even the just-sent payload is immediately due again.
        assert_eq!(win.due_for_send(), vec![0, 1]);
    }

    #[test]
    fn final_seq_is_start_plus_last_payload_id_with_no_extra_successor() {
        let payloads = chunk_payloads(&vec![0u8; PAYLOAD_SIZE * 4]);
        let win = SendWindow::new(payloads, 100, 10, Duration::from_millis(50));
        assert_eq!(win.final_seq(), 103, "no payloads sent, last id is 3");
    }

    #[test]
    fn final_seq_falls_back_to_start_seq_when_empty() {
        let win = SendWindow::new(Vec::new(), 42, 10, Duration::from_millis(50));
        assert_eq!(win.final_seq(), 42);
    }
}
