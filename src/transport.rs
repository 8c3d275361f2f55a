//! The datagram transport collaborator.
//!
//! `Transport` is the abstract `send_segment`/`destroy` contract bTCP's
//! engines depend on. `UdpTransport` is a real implementation over
//! `std::net::UdpSocket`. `LossyTransport` is a deterministic in-process
//! test double used by the integration tests to drive loss, reordering,
//! duplication, and corruption scenarios.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::segment::SEGMENT_SIZE;

/// One arrival: the raw bytes plus the address they came from.
pub type Arrival = (Vec<u8>, SocketAddr);

/// Bounded MPSC queue between the transport's reception thread (producer)
/// and the engine thread (sole consumer). The producer does a single
/// non-blocking-ish enqueue with a small bounded timeout (~25ms), dropping
/// the arrival if the queue is still full; the engine's dequeue never
/// blocks.
pub const ARRIVAL_QUEUE_CAPACITY: usize = 1024;
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(25);

pub fn arrival_queue() -> (Sender<Arrival>, Receiver<Arrival>) {
    crossbeam_channel::bounded(ARRIVAL_QUEUE_CAPACITY)
}

/// Non-blocking drain of a single arrival. Returns `None` when the queue is
/// empty — the engine never blocks on a segment.
pub fn try_recv(queue: &Receiver<Arrival>) -> Option<Arrival> {
    queue.try_recv().ok()
}

fn enqueue_with_timeout(tx: &Sender<Arrival>, item: Arrival) {
    match tx.try_send(item) {
        Ok(()) => {}
        Err(TrySendError::Full(item)) => {
            // Bounded wait on a full queue, then drop.
            if tx.send_timeout(item, ENQUEUE_TIMEOUT).is_err() {
                log::debug!("arrival queue still full after {ENQUEUE_TIMEOUT:?}, dropping segment");
            }
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// What the engine hands to the outside world to move segments.
pub trait Transport: Send {
    fn send_segment(&self, bytes: &[u8], dst: SocketAddr) -> io::Result<()>;
    fn destroy(&mut self);
}

/// A real UDP-backed transport. Binds a socket, spawns a reception thread
/// that blocking-reads datagrams and enqueues them, via a background reception thread.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    reception_thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr, arrivals_tx: Sender<Arrival>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr)?);
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let shutdown = Arc::new(AtomicBool::new(false));

        let reception_thread = {
            let socket = socket.clone();
            let shutdown = shutdown.clone();

            thread::spawn(move || {
                let mut buf = [0u8; SEGMENT_SIZE];
                while !shutdown.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buf) {
                        Ok((n, src)) => {
                            enqueue_with_timeout(&arrivals_tx, (buf[..n].to_vec(), src));
                        }
                        Err(e)
                            if e.kind() == io::ErrorKind::WouldBlock
                                || e.kind() == io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            log::warn!("transport reception thread stopping: {e}");
                            break;
                        }
                    }
                }
            })
        };

        Ok(UdpTransport {
            socket,
            reception_thread: Some(reception_thread),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send_segment(&self, bytes: &[u8], dst: SocketAddr) -> io::Result<()> {
        self.socket.send_to(bytes, dst)?;
        Ok(())
    }

    fn destroy(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(jh) = self.reception_thread.take() {
            let _ = jh.join();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A deterministic lossy transport double for integration tests, simulating
/// the substrate faults a datagram network can exhibit: loss, reordering, duplication, corruption, delay. Exposed unconditionally (rather than
/// behind `#[cfg(test)]`) so the `tests/` integration crate can use it.
pub mod lossy {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct FaultProfile {
        pub drop_prob: f64,
        pub duplicate_prob: f64,
        pub corrupt_prob: f64,
        /// When true, every other delivered datagram to this endpoint is held
        /// back one slot and delivered after the next one (a simple, fully
        /// deterministic reorder rather than a random shuffle).
        pub reorder_pairs: bool,
    }

    /// Shared "wire" between two `LossyTransport` endpoints in a test.
    pub struct LossyWire {
        rng: Mutex<StdRng>,
        profile: FaultProfile,
    }

    impl LossyWire {
        pub fn new(seed: u64, profile: FaultProfile) -> Arc<Self> {
            Arc::new(LossyWire {
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                profile,
            })
        }

        fn roll(&self, p: f64) -> bool {
            if p <= 0.0 {
                return false;
            }
            self.rng.lock().unwrap().gen_bool(p.min(1.0))
        }
    }

    /// One endpoint's view of a `LossyWire`: sends corrupt/drop/duplicate per
    /// the shared profile, and enqueues onto the peer's arrival queue
    /// in-process (no real socket).
    pub struct LossyTransport {
        wire: Arc<LossyWire>,
        peer_tx: Sender<Arrival>,
        self_addr: SocketAddr,
        held_back: Mutex<Option<(Vec<u8>, SocketAddr)>>,
    }

    impl LossyTransport {
        pub fn new(wire: Arc<LossyWire>, peer_tx: Sender<Arrival>, self_addr: SocketAddr) -> Self {
            LossyTransport {
                wire,
                peer_tx,
                self_addr,
                held_back: Mutex::new(None),
            }
        }

        fn deliver(&self, mut bytes: Vec<u8>) {
            if self.wire.roll(self.wire.profile.corrupt_prob) && !bytes.is_empty() {
                let idx = bytes.len() - 1;
                bytes[idx] ^= 0xFF;
            }

            let copies = if self.wire.roll(self.wire.profile.duplicate_prob) {
                2
            } else {
                1
            };

            for _ in 0..copies {
                if self.wire.profile.reorder_pairs {
                    let mut held = self.held_back.lock().unwrap();
                    match held.take() {
                        None => *held = Some((bytes.clone(), self.self_addr)),
                        Some((prev_bytes, prev_addr)) => {
                            let _ = self.peer_tx.try_send((bytes.clone(), self.self_addr));
                            let _ = self.peer_tx.try_send((prev_bytes, prev_addr));
                        }
                    }
                } else {
                    let _ = self.peer_tx.try_send((bytes.clone(), self.self_addr));
                }
            }
        }
    }

    impl Transport for LossyTransport {
        fn send_segment(&self, bytes: &[u8], _dst: SocketAddr) -> io::Result<()> {
            if self.wire.roll(self.wire.profile.drop_prob) {
                return Ok(());
            }
            self.deliver(bytes.to_vec());
            Ok(())
        }

        fn destroy(&mut self) {}
    }
}
