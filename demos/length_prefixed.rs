//! Length-Prefixed Framing Demo - server and client in one process
//!
//! ## What it shows
//!
//! - Serving with [`LengthPrefixProtocol`] (u32 big-endian length prefix)
//! - Downcasting the frame context to [`LengthHeader`]
//! - A plain blocking client speaking the same framing
//!
//! # Usage
//!
//! ```bash
//! cargo run --example length_prefixed
//! ```

use netloop::{Connection, Frame, Handler, LengthHeader, LengthPrefixProtocol, Server};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

struct Shouter;

impl Handler for Shouter {
    fn on_message(&self, _conn: &mut Connection, frame: Frame) -> Option<Vec<u8>> {
        if let Some(header) = frame
            .context
            .as_ref()
            .and_then(|c| c.downcast_ref::<LengthHeader>())
        {
            println!("server: frame of {} bytes", header.len);
        }
        Some(frame.payload.to_ascii_uppercase())
    }

    fn on_close(&self, conn: &mut Connection) {
        println!("server: {} disconnected", conn.peer_addr());
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut wire = (payload.len() as u32).to_be_bytes().to_vec();
    wire.extend_from_slice(payload);
    wire
}

fn main() -> Result<(), netloop::Error> {
    tracing_subscriber::fmt().init();

    let config = config::Config::default();
    let server = Server::new(
        &config,
        "127.0.0.1:0",
        Arc::new(Shouter),
        Arc::new(LengthPrefixProtocol::default()),
    )?;
    let addr = server.local_addr();
    let handle = server.handle();
    println!("Server listening on {addr}");
    let join = thread::spawn(move || server.run().expect("Server failed"));

    let mut stream = TcpStream::connect(addr).expect("Failed to connect");
    stream
        .write_all(&frame(b"hello, reactor"))
        .expect("Failed to send");

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).expect("Failed to read header");
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut payload).expect("Failed to read payload");
    println!("client: {}", String::from_utf8_lossy(&payload));

    handle.stop();
    join.join().expect("Server thread panicked");
    Ok(())
}
