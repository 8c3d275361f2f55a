//! Server state machine: `OPEN → CONN_EST → OPEN` via `accept`, `recv`, and
//! disconnect acceptance.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::config::Config;
use crate::dispatcher::{handle_flow, Dispatch};
use crate::error::Error;
use crate::reorder::{Classification, ReorderBuffer};
use crate::segment::{Flag, Segment};
use crate::seq::safe_incr;
use crate::state::{ConnState, State};
use crate::transport::{Arrival, Transport};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct Server {
    transport: Box<dyn Transport>,
    arrivals: Receiver<Arrival>,
    conn: ConnState,
    config: Config,
    reorder: ReorderBuffer,
}

impl Server {
    pub fn new(transport: Box<dyn Transport>, arrivals: Receiver<Arrival>, config: Config) -> Self {
        Server {
            transport,
            arrivals,
            conn: ConnState::new(config.window),
            config,
            reorder: ReorderBuffer::new(),
        }
    }

    pub fn state(&self) -> State {
        self.conn.state
    }

    /// Peak depth of the out-of-order reorder buffer, surfaced for tests.
    pub fn reorder_peak_len(&self) -> usize {
        self.reorder.peak_len()
    }

    /// The configured window minus the reorder buffer's current occupancy:
    /// undelivered, buffered-out-of-order segments count against the
    /// receive window just as they would against a real receive queue.
    fn advertised_window(&self) -> u8 {
        self.conn.advertised_window(self.reorder.len())
    }

    fn send_control(&self, dst: SocketAddr, seq_nr: u16, ack_nr: u16, flag: Flag) -> Result<(), Error> {
        let seg = Segment::control(seq_nr, ack_nr, flag, self.advertised_window());
        self.transport.send_segment(&seg.pack(), dst)?;
        Ok(())
    }

    fn finish_handshake(&mut self, peer: SocketAddr) {
        self.conn.seq_nr = safe_incr(self.conn.seq_nr, 1);
        self.conn.peer_address = Some(peer);
        self.conn.state = State::ConnEst;
        log::info!("server: handshake complete with {peer}");
    }

    /// Waits indefinitely for a SYN, then for the handshake-closing ACK (or,
    /// defensively, a data segment if the ACK itself was lost).
    pub fn accept(&mut self) -> Result<(), Error> {
        if self.conn.state != State::Open {
            return Err(Error::BadState);
        }

        let mut pending_peer: Option<SocketAddr> = None;

        loop {
            match handle_flow(
                &self.arrivals,
                None,
                &[Flag::Syn, Flag::Ack, Flag::None],
                &mut self.conn.peer_recv_win,
            ) {
                Dispatch::Segment(seg, src) => match seg.flag {
                    Flag::Syn => {
                        self.conn.ack_nr = safe_incr(seg.seq_nr, 1);
                        self.send_control(src, self.conn.seq_nr, self.conn.ack_nr, Flag::SynAck)?;
                        pending_peer = Some(src);
                        log::debug!("server: SYN from {src}, sent SYNACK");
                    }
                    Flag::Ack => {
                        if pending_peer == Some(src) && seg.ack_nr == safe_incr(self.conn.seq_nr, 1) {
                            self.finish_handshake(src);
                            return Ok(());
                        }
                    }
                    Flag::None => {
                        // The peer's ACK was lost but it has moved on to
                        // sending data; treat the handshake as complete and
                        // don't drop the bytes.
                        if pending_peer == Some(src) {
                            self.finish_handshake(src);
                            self.reorder.insert(seg);
                            return Ok(());
                        }
                    }
                    _ => {}
                },
                Dispatch::Discarded => {}
                Dispatch::Empty => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    /// Produces one application-visible chunk, or `None` on clean
    /// end-of-stream. Guard: `CONN_EST`.
    pub fn recv(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if self.conn.state != State::ConnEst {
            return Err(Error::BadState);
        }

        let peer = self.conn.peer_address.expect("CONN_EST implies a latched peer");

        loop {
            if let Some(seg) = self.reorder.take_expected(self.conn.ack_nr) {
                self.conn.ack_nr = safe_incr(self.conn.ack_nr, 1);
                return Ok(Some(seg.data().to_vec()));
            }

            match handle_flow(
                &self.arrivals,
                Some(peer),
                &[Flag::None, Flag::Fin],
                &mut self.conn.peer_recv_win,
            ) {
                Dispatch::Segment(seg, _) => match seg.flag {
                    Flag::Fin => {
                        self.accept_disconnect(seg)?;
                        return Ok(None);
                    }
                    Flag::None => {
                        // Always ACK, even duplicates, so the sender can
                        // make progress if its view of our ACK was lost.
                        self.send_control(
                            peer,
                            self.conn.seq_nr,
                            safe_incr(seg.seq_nr, 1),
                            Flag::Ack,
                        )?;

                        match self.reorder.classify(self.conn.ack_nr, seg.seq_nr) {
                            Classification::InOrder => {
                                self.conn.ack_nr = safe_incr(self.conn.ack_nr, 1);
                                return Ok(Some(seg.data().to_vec()));
                            }
                            Classification::OutOfOrder => self.reorder.insert(seg),
                            Classification::Duplicate => {}
                        }
                    }
                    _ => {}
                },
                Dispatch::Discarded => {}
                Dispatch::Empty => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    /// Reply `FINACK`, then wait up to `FIN_TIMEOUT` for the client's final
    /// `ACK`, further `FIN` retransmissions (reply `FINACK`, reset the
    /// timer), or timer exhaustion (assume the ACK was lost; close anyway).
    fn accept_disconnect(&mut self, fin: Segment) -> Result<(), Error> {
        let peer = self.conn.peer_address.expect("CONN_EST implies a latched peer");
        let own_seq = self.conn.seq_nr;

        self.send_control(peer, own_seq, safe_incr(fin.seq_nr, 1), Flag::FinAck)?;
        log::debug!("server: FIN received, sent FINACK");

        let fin_timeout = Duration::from_millis(self.config.fin_timeout_ms);
        let mut deadline = Instant::now() + fin_timeout;

        loop {
            if Instant::now() >= deadline {
                log::info!("server: FIN_TIMEOUT elapsed, assuming final ACK was lost");
                break;
            }

            match handle_flow(
                &self.arrivals,
                Some(peer),
                &[Flag::Ack, Flag::Fin],
                &mut self.conn.peer_recv_win,
            ) {
                Dispatch::Segment(seg, _) => match seg.flag {
                    Flag::Ack if seg.ack_nr == safe_incr(own_seq, 1) => {
                        log::info!("server: clean teardown, final ACK received");
                        break;
                    }
                    Flag::Fin => {
                        self.send_control(peer, own_seq, safe_incr(seg.seq_nr, 1), Flag::FinAck)?;
                        deadline = Instant::now() + fin_timeout;
                    }
                    _ => {}
                },
                Dispatch::Discarded => {}
                Dispatch::Empty => thread::sleep(POLL_INTERVAL),
            }
        }

        self.conn.state = State::Open;
        self.conn.peer_address = None;
        Ok(())
    }

    pub fn close(&mut self) {
        self.transport.destroy();
    }
}
