use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use btcp::{arrival_queue, Client, Config, UdpTransport};

/// Send a file to a bTCP server.
#[derive(Debug, Parser)]
#[command(name = "btcp-client")]
struct Args {
    /// File to send.
    file: PathBuf,

    /// Address of the bTCP server.
    #[arg(long, default_value = "127.0.0.1:30000")]
    server_addr: SocketAddr,

    /// Local address to bind the client's UDP socket to.
    #[arg(long, default_value = "0.0.0.0:20000")]
    bind: SocketAddr,

    /// Advertised receive window, in segments.
    #[arg(long, default_value_t = Config::default().window)]
    window: u8,

    /// Per-segment retransmission timeout, in milliseconds.
    #[arg(long, default_value_t = Config::default().timeout_ms)]
    timeout: u64,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = Config {
        window: args.window,
        timeout_ms: args.timeout,
        ..Config::default()
    };
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let bytes = match fs::read(&args.file) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("failed to read {}: {e}", args.file.display());
            return ExitCode::FAILURE;
        }
    };

    let (tx, rx) = arrival_queue();
    let transport = match UdpTransport::bind(args.bind, tx) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("failed to bind {}: {e}", args.bind);
            return ExitCode::FAILURE;
        }
    };

    let mut client = Client::new(Box::new(transport), rx, config);

    log::info!("connecting to {}", args.server_addr);
    if let Err(e) = client.connect(args.server_addr) {
        eprintln!("connect failed: {e}");
        return ExitCode::FAILURE;
    }

    log::info!("sending {} bytes from {}", bytes.len(), args.file.display());
    if let Err(e) = client.send(&bytes) {
        eprintln!("send failed: {e}");
        return ExitCode::FAILURE;
    }

    if let Err(e) = client.disconnect() {
        eprintln!("disconnect failed: {e}");
        return ExitCode::FAILURE;
    }

    client.close();
    println!(">>> transfer complete: {} bytes sent", bytes.len());
    ExitCode::SUCCESS
}
