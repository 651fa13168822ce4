//! Echo Server Demo - line-framed echo with a connection counter
//!
//! ## What it shows
//!
//! - Implementing [`Handler`] for connect/message/close callbacks
//! - Serving with the built-in [`LineProtocol`]
//! - Tracking live connections with the library's atomic cells
//!
//! # Usage
//!
//! ```bash
//! cargo run --example echo -- 127.0.0.1:1833
//! ```
//!
//! Then in another terminal:
//!
//! ```bash
//! printf 'PING\r\n' | nc 127.0.0.1 1833
//! ```

use netloop::atomic;
use netloop::{Connection, Frame, Handler, LineProtocol, Server};
use std::sync::Arc;

struct Echo {
    online: atomic::Int64,
}

impl Handler for Echo {
    fn on_connect(&self, conn: &mut Connection) {
        let online = self.online.add(1);
        println!("+ {} ({online} online)", conn.peer_addr());
    }

    fn on_message(&self, _conn: &mut Connection, frame: Frame) -> Option<Vec<u8>> {
        Some(frame.payload)
    }

    fn on_close(&self, conn: &mut Connection) {
        let online = self.online.add(-1);
        println!("- {} ({online} online)", conn.peer_addr());
    }
}

fn main() -> Result<(), netloop::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1833".to_string());
    let config = config::Config::builder()
        .add_source(config::Environment::with_prefix("NETLOOP"))
        .build()?;

    let server = Server::new(
        &config,
        addr.as_str(),
        Arc::new(Echo {
            online: atomic::Int64::default(),
        }),
        Arc::new(LineProtocol),
    )?;
    println!("Echo server listening on {}", server.local_addr());
    server.run()
}
