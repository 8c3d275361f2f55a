//! End-to-end transfer scenarios over a scripted, deliberately flaky
//! `Transport`, exercising loss, reordering, duplication, and corruption of
//! segments in flight.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::Sender;

use btcp::{arrival_queue, Arrival, Client, Config, Server, State, Transport, SEGMENT_SIZE};

const PAYLOAD_SIZE: usize = SEGMENT_SIZE - 10;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A `Transport` whose faults are scripted by send index rather than drawn
/// from an RNG, so each scenario below is fully deterministic: "the Nth
/// segment this endpoint sends" is dropped, corrupted, duplicated, or
/// delayed by exactly one slot.
struct ScriptedTransport {
    peer_tx: Sender<Arrival>,
    self_addr: SocketAddr,
    sent: Mutex<u32>,
    drop_nth: Option<u32>,
    corrupt_nth: Option<u32>,
    duplicate_nth: Option<u32>,
    /// Captures sends whose global index falls in `[first, first + order.len())`
    /// and releases them all, once the last one arrives, in `order` (a
    /// permutation of `0..order.len()` over capture-relative position) —
    /// used to reproduce a fixed "delivers 2,0,3,1" reordering of four
    /// emitted payloads.
    permute: Option<(u32, Vec<usize>)>,
    captured: Mutex<Vec<Option<Vec<u8>>>>,
}

impl ScriptedTransport {
    fn new(peer_tx: Sender<Arrival>, self_addr: SocketAddr) -> Self {
        ScriptedTransport {
            peer_tx,
            self_addr,
            sent: Mutex::new(0),
            drop_nth: None,
            corrupt_nth: None,
            duplicate_nth: None,
            permute: None,
            captured: Mutex::new(Vec::new()),
        }
    }

    fn with_permute(mut self, first: u32, order: Vec<usize>) -> Self {
        self.captured = Mutex::new(vec![None; order.len()]);
        self.permute = Some((first, order));
        self
    }
}

impl Transport for ScriptedTransport {
    fn send_segment(&self, bytes: &[u8], _dst: SocketAddr) -> io::Result<()> {
        let idx = {
            let mut n = self.sent.lock().unwrap();
            *n += 1;
            *n
        };

        if let Some((first, order)) = &self.permute {
            let last = first + order.len() as u32 - 1;
            if idx >= *first && idx <= last {
                let pos = (idx - first) as usize;
                self.captured.lock().unwrap()[pos] = Some(bytes.to_vec());
                if idx == last {
                    let captured = self.captured.lock().unwrap();
                    for &p in order {
                        if let Some(b) = &captured[p] {
                            let _ = self.peer_tx.try_send((b.clone(), self.self_addr));
                        }
                    }
                }
                return Ok(());
            }
        }

        if self.drop_nth == Some(idx) {
            return Ok(());
        }

        let mut bytes = bytes.to_vec();
        if self.corrupt_nth == Some(idx) {
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
        }

        let _ = self.peer_tx.try_send((bytes.clone(), self.self_addr));

        if self.duplicate_nth == Some(idx) {
            let _ = self.peer_tx.try_send((bytes, self.self_addr));
        }

        Ok(())
    }

    fn destroy(&mut self) {}
}

const CLIENT_ADDR_PORT: u16 = 41000;
const SERVER_ADDR_PORT: u16 = 41001;

struct Outcome {
    received: Vec<u8>,
    reorder_peak: usize,
    server_final_state: State,
}

/// Wires a client/server pair over the two provided (already-scripted)
/// transports and runs a full connect/send/disconnect cycle, the client on
/// the calling thread and the server on a background thread.
fn run_transfer(
    client_transport: Box<dyn Transport>,
    client_rx: crossbeam_channel::Receiver<Arrival>,
    server_transport: Box<dyn Transport>,
    server_rx: crossbeam_channel::Receiver<Arrival>,
    config: Config,
    data: Vec<u8>,
) -> Outcome {
    let server_handle = thread::spawn(move || {
        let mut server = Server::new(server_transport, server_rx, config);
        server.accept().expect("server accept");

        let mut received = Vec::new();
        loop {
            match server.recv().expect("server recv") {
                Some(chunk) => received.extend_from_slice(&chunk),
                None => break,
            }
        }

        (received, server.reorder_peak_len(), server.state())
    });

    let mut client = Client::new(client_transport, client_rx, config);
    client.connect(addr(SERVER_ADDR_PORT)).expect("client connect");
    client.send(&data).expect("client send");
    client.disconnect().expect("client disconnect");
    client.close();

    let (received, reorder_peak, server_final_state) = server_handle.join().unwrap();
    Outcome {
        received,
        reorder_peak,
        server_final_state,
    }
}

fn fast_config() -> Config {
    Config {
        timeout_ms: 20,
        max_attempts: 20,
        fin_timeout_ms: 100,
        ..Config::default()
    }
}

#[test]
fn ideal_substrate_delivers_whole_file_in_expected_segment_count() {
    let (client_tx, client_rx) = arrival_queue();
    let (server_tx, server_rx) = arrival_queue();

    let client_transport = ScriptedTransport::new(server_tx, addr(CLIENT_ADDR_PORT));
    let server_transport = ScriptedTransport::new(client_tx, addr(SERVER_ADDR_PORT));

    // A 3072-byte file chunks into 3 full 1008-byte segments plus one
    // 48-byte short segment (4 total).
    let data = sample_data(3072);
    assert_eq!((data.len() + PAYLOAD_SIZE - 1) / PAYLOAD_SIZE, 4);

    let outcome = run_transfer(
        Box::new(client_transport),
        client_rx,
        Box::new(server_transport),
        server_rx,
        fast_config(),
        data.clone(),
    );

    assert_eq!(outcome.received, data);
    assert_eq!(outcome.server_final_state, State::Open);
}

#[test]
fn single_syn_loss_is_recovered_by_retransmission() {
    let (client_tx, client_rx) = arrival_queue();
    let (server_tx, server_rx) = arrival_queue();

    let mut client_transport = ScriptedTransport::new(server_tx, addr(CLIENT_ADDR_PORT));
    // The very first segment the client ever sends is its SYN.
    client_transport.drop_nth = Some(1);
    let server_transport = ScriptedTransport::new(client_tx, addr(SERVER_ADDR_PORT));

    let data = sample_data(256);

    let outcome = run_transfer(
        Box::new(client_transport),
        client_rx,
        Box::new(server_transport),
        server_rx,
        fast_config(),
        data.clone(),
    );

    assert_eq!(outcome.received, data);
}

#[test]
fn reordered_data_is_reassembled_in_order() {
    let (client_tx, client_rx) = arrival_queue();
    let (server_tx, server_rx) = arrival_queue();

    // Sends: 1=SYN, 2=ACK, 3=data0, 4=data1, 5=data2, 6=data3. The
    // substrate delivers them out of order, as 2,0,3,1.
    let client_transport =
        ScriptedTransport::new(server_tx, addr(CLIENT_ADDR_PORT)).with_permute(3, vec![2, 0, 3, 1]);
    let server_transport = ScriptedTransport::new(client_tx, addr(SERVER_ADDR_PORT));

    let data = sample_data(3 * PAYLOAD_SIZE + 1);

    let outcome = run_transfer(
        Box::new(client_transport),
        client_rx,
        Box::new(server_transport),
        server_rx,
        fast_config(),
        data.clone(),
    );

    assert_eq!(outcome.received, data);
    assert_eq!(
        outcome.reorder_peak, 2,
        "a 2,0,3,1 delivery order should peak the reorder buffer at exactly 2 entries"
    );
}

#[test]
fn corrupt_segment_is_discarded_and_recovered_by_retransmission() {
    let (client_tx, client_rx) = arrival_queue();
    let (server_tx, server_rx) = arrival_queue();

    let mut client_transport = ScriptedTransport::new(server_tx, addr(CLIENT_ADDR_PORT));
    // The first data segment's first transmission is corrupted; its
    // retransmission after the timeout is a fresh send and arrives intact.
    client_transport.corrupt_nth = Some(3);
    let server_transport = ScriptedTransport::new(client_tx, addr(SERVER_ADDR_PORT));

    let data = sample_data(2 * PAYLOAD_SIZE + 200);

    let outcome = run_transfer(
        Box::new(client_transport),
        client_rx,
        Box::new(server_transport),
        server_rx,
        fast_config(),
        data.clone(),
    );

    assert_eq!(outcome.received, data);
}

#[test]
fn duplicated_data_segment_is_delivered_exactly_once() {
    let (client_tx, client_rx) = arrival_queue();
    let (server_tx, server_rx) = arrival_queue();

    let mut client_transport = ScriptedTransport::new(server_tx, addr(CLIENT_ADDR_PORT));
    // Duplicate the first data segment's only transmission.
    client_transport.duplicate_nth = Some(3);
    let server_transport = ScriptedTransport::new(client_tx, addr(SERVER_ADDR_PORT));

    let data = sample_data(PAYLOAD_SIZE + 10);

    let outcome = run_transfer(
        Box::new(client_transport),
        client_rx,
        Box::new(server_transport),
        server_rx,
        fast_config(),
        data.clone(),
    );

    assert_eq!(
        outcome.received, data,
        "a duplicated segment must not appear twice in the reassembled stream"
    );
}

#[test]
fn loss_of_the_final_teardown_ack_still_closes_the_server_after_fin_timeout() {
    let (client_tx, client_rx) = arrival_queue();
    let (server_tx, server_rx) = arrival_queue();

    let mut client_transport = ScriptedTransport::new(server_tx, addr(CLIENT_ADDR_PORT));
    // No data is sent (empty payload), so sends are: 1=SYN, 2=ACK, 3=FIN,
    // 4=the client's final ACK of the teardown. Drop that last one.
    client_transport.drop_nth = Some(4);
    let server_transport = ScriptedTransport::new(client_tx, addr(SERVER_ADDR_PORT));

    let outcome = run_transfer(
        Box::new(client_transport),
        client_rx,
        Box::new(server_transport),
        server_rx,
        fast_config(),
        Vec::new(),
    );

    assert!(outcome.received.is_empty());
    assert_eq!(
        outcome.server_final_state,
        State::Open,
        "server must close anyway once FIN_TIMEOUT elapses without the final ACK"
    );
}
