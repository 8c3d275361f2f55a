use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use btcp::{arrival_queue, Config, Server, UdpTransport};

/// Receive a file over bTCP and write it to disk.
#[derive(Debug, Parser)]
#[command(name = "btcp-server")]
struct Args {
    /// Path to write the received file to.
    out_file: PathBuf,

    /// Address to bind the server's UDP socket to.
    #[arg(long, default_value = "0.0.0.0:30000")]
    bind: SocketAddr,

    /// Advertised receive window, in segments.
    #[arg(long, default_value_t = Config::default().window)]
    window: u8,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = Config {
        window: args.window,
        ..Config::default()
    };
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let mut out = match File::create(&args.out_file) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("failed to create {}: {e}", args.out_file.display());
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

    let mut server = Server::new(Box::new(transport), rx, config);

    println!(">>> waiting for a connection on {}", args.bind);
    if let Err(e) = server.accept() {
        eprintln!("accept failed: {e}");
        return ExitCode::FAILURE;
    }
    println!(">>> connection accepted");

    let mut total = 0usize;
    loop {
        match server.recv() {
            Ok(Some(chunk)) => {
                if let Err(e) = out.write_all(&chunk) {
                    eprintln!("failed to write {}: {e}", args.out_file.display());
                    return ExitCode::FAILURE;
                }
                total += chunk.len();
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("recv failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    server.close();
    println!(">>> transfer complete: {total} bytes written to {}", args.out_file.display());
    ExitCode::SUCCESS
}
