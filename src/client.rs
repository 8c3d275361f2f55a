//! Client state machine: `OPEN → CONN_EST → OPEN` via `connect`, `send`,
//! `disconnect`.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::config::Config;
use crate::dispatcher::{handle_flow, Dispatch};
use crate::error::Error;
use crate::segment::{Flag, Segment};
use crate::seq::safe_incr;
use crate::state::{ConnState, State};
use crate::transport::{Arrival, Transport};
use crate::window::{chunk_payloads, SendWindow};

/// How long the engine sleeps between empty polls of the arrival queue.
/// Keeps the busy-wait from pegging a core while still being far below any
/// realistic `timeout` configuration.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct Client {
    transport: Box<dyn Transport>,
    arrivals: Receiver<Arrival>,
    conn: ConnState,
    config: Config,
}

impl Client {
    pub fn new(transport: Box<dyn Transport>, arrivals: Receiver<Arrival>, config: Config) -> Self {
        Client {
            transport,
            arrivals,
            conn: ConnState::new(config.window),
            config,
        }
    }

    pub fn state(&self) -> State {
        self.conn.state
    }

    /// The client never buffers received data (it only ever receives
    /// control segments), so its occupancy is always zero.
    fn advertised_window(&self) -> u8 {
        self.conn.advertised_window(0)
    }

    fn send_control(&self, dst: SocketAddr, seq_nr: u16, ack_nr: u16, flag: Flag) -> Result<(), Error> {
        let seg = Segment::control(seq_nr, ack_nr, flag, self.advertised_window());
        self.transport.send_segment(&seg.pack(), dst)?;
        Ok(())
    }

    /// Three-way handshake. Guard: must be `OPEN`.
    pub fn connect(&mut self, server: SocketAddr) -> Result<(), Error> {
        if self.conn.state != State::Open {
            return Err(Error::BadState);
        }

        let own_seq = self.conn.seq_nr;
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut attempts = 0u32;

        self.send_control(server, own_seq, 0, Flag::Syn)?;
        log::debug!("client: sent SYN seq={own_seq}, awaiting SYNACK");

        loop {
            if attempts >= self.config.max_attempts {
                log::warn!("client: handshake exhausted {} attempts", self.config.max_attempts);
                return Ok(());
            }

            let deadline = Instant::now() + timeout;

            while Instant::now() < deadline {
                match handle_flow(&self.arrivals, None, &[Flag::SynAck], &mut self.conn.peer_recv_win) {
                    Dispatch::Segment(seg, src) => {
                        if seg.ack_nr != safe_incr(own_seq, 1) {
                            // Mismatched peer: reset the attempt counter and
                            // keep waiting.
                            attempts = 0;
                            continue;
                        }

                        self.conn.seq_nr = safe_incr(own_seq, 1);
                        self.conn.ack_nr = safe_incr(seg.seq_nr, 1);
                        self.conn.peer_address = Some(src);

                        self.send_control(src, self.conn.seq_nr, self.conn.ack_nr, Flag::Ack)?;
                        self.conn.state = State::ConnEst;
                        log::info!("client: handshake complete with {src}");
                        return Ok(());
                    }
                    Dispatch::Discarded => continue,
                    Dispatch::Empty => thread::sleep(POLL_INTERVAL),
                }
            }

            attempts += 1;
            self.send_control(server, own_seq, 0, Flag::Syn)?;
            log::debug!("client: retransmitting SYN, attempt {attempts}");
        }
    }

    /// Selective-retransmit sliding-window transfer of `bytes`. Guard: must be `CONN_EST`.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.conn.state != State::ConnEst {
            return Err(Error::BadState);
        }

        let peer = self.conn.peer_address.expect("CONN_EST implies a latched peer");
        let start_seq = self.conn.seq_nr;
        let timeout = Duration::from_millis(self.config.timeout_ms);

        let payloads = chunk_payloads(bytes);
        if payloads.is_empty() {
            return Ok(());
        }

        let mut window = SendWindow::new(payloads, start_seq, self.conn.peer_recv_win, timeout);

        // Open question (b): zero-window probing. If the peer starts (or
        // becomes) zero-window, send an empty probe on the retransmit timer
        // until it re-advertises a nonzero window. The probe's seq_nr sits
        // one slot behind `start_seq` — behind every real payload's
        // sequence number — so the receiver's duplicate/out-of-order
        // classification discards it instead of mistaking it for the
        // payload at `window.lower`.
        let probe_seq = safe_incr(start_seq, u16::MAX);
        let mut last_probe = Instant::now();

        while !window.is_complete() {
            if self.conn.peer_recv_win == 0 {
                if last_probe.elapsed() >= timeout {
                    self.send_control(peer, probe_seq, self.conn.ack_nr, Flag::None)?;
                    last_probe = Instant::now();
                }
            } else {
                for idx in window.due_for_send() {
                    let seq_nr = window.seq_for(idx);
                    let seg = Segment::new(
                        seq_nr,
                        self.conn.ack_nr,
                        Flag::None,
                        self.advertised_window(),
                        &window.payloads[idx].data,
                    )?;
                    self.transport.send_segment(&seg.pack(), peer)?;
                    window.mark_sent(idx);
                }
            }

            match handle_flow(&self.arrivals, Some(peer), &[Flag::Ack], &mut self.conn.peer_recv_win) {
                Dispatch::Segment(seg, _) => {
                    window.apply_ack(seg.ack_nr);
                    window.slide();
                    window.resize(self.conn.peer_recv_win);
                }
                Dispatch::Discarded => {}
                Dispatch::Empty => thread::sleep(POLL_INTERVAL),
            }
        }

        self.conn.seq_nr = window.final_seq();
        log::info!("client: send complete, {} payload(s) delivered", window.total());
        Ok(())
    }

    /// Three-way teardown, symmetric to `connect` with FIN/FINACK.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        if self.conn.state != State::ConnEst {
            return Err(Error::BadState);
        }

        let peer = self.conn.peer_address.expect("CONN_EST implies a latched peer");
        let own_seq = self.conn.seq_nr;
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut attempts = 0u32;

        self.send_control(peer, own_seq, self.conn.ack_nr, Flag::Fin)?;
        log::debug!("client: sent FIN seq={own_seq}, awaiting FINACK");

        loop {
            if attempts >= self.config.max_attempts {
                log::warn!("client: teardown exhausted {} attempts", self.config.max_attempts);
                return Ok(());
            }

            let deadline = Instant::now() + timeout;

            while Instant::now() < deadline {
                match handle_flow(&self.arrivals, Some(peer), &[Flag::FinAck], &mut self.conn.peer_recv_win) {
                    Dispatch::Segment(seg, _) => {
                        if seg.ack_nr != safe_incr(own_seq, 1) {
                            attempts = 0;
                            continue;
                        }

                        self.conn.seq_nr = safe_incr(own_seq, 1);
                        self.send_control(peer, self.conn.seq_nr, safe_incr(seg.seq_nr, 1), Flag::Ack)?;
                        self.conn.state = State::Open;
                        self.conn.peer_address = None;
                        log::info!("client: teardown complete");
                        return Ok(());
                    }
                    Dispatch::Discarded => continue,
                    Dispatch::Empty => thread::sleep(POLL_INTERVAL),
                }
            }

            attempts += 1;
            self.send_control(peer, own_seq, self.conn.ack_nr, Flag::Fin)?;
            log::debug!("client: retransmitting FIN, attempt {attempts}");
        }
    }

    pub fn close(&mut self) {
        self.transport.destroy();
    }
}
