//! bTCP: a reliable, connection-oriented, byte-stream file-transfer protocol
//! layered over an unreliable datagram substrate, with a three-way
//! handshake, a selective-acknowledgement sliding send window, timeout
//! retransmission, and a three-way teardown.

mod client;
mod config;
mod dispatcher;
mod error;
mod reorder;
mod segment;
mod seq;
mod server;
mod state;
mod transport;
mod window;

pub use client::Client;
pub use config::Config;
pub use error::Error;
pub use segment::{Flag, Segment, SEGMENT_SIZE};
pub use server::Server;
pub use state::State;
pub use transport::{arrival_queue, lossy, Arrival, Transport, UdpTransport};
