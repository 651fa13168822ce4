//! A lightweight reactor-pattern TCP server library built on
//! [mio](https://docs.rs/mio).
//!
//! - **Event-loop pool:** Connections are distributed over single-threaded
//!   event loops and stay pinned to their loop for life - the data path is
//!   lock-free per connection
//! - **Pluggable framing:** Implement [`Protocol`] to translate between wire
//!   bytes and logical frames; newline-delimited and length-prefixed framings
//!   are built in
//! - **Backpressure-aware writes:** Output the socket does not accept is ring
//!   buffered, and poller write interest tracks the backlog
//! - **Idle timeouts:** A hashed timing wheel closes connections that go
//!   quiet
//! - **Thread-safe handles:** [`Conn`] lets any thread send to or close a
//!   connection; the work itself always runs on the owning loop
//!
//! # Quick Start
//!
//! Add netloop to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! netloop = "0.1"
//! ```
//!
//! An echo server framing on line endings:
//!
//! ```no_run
//! use netloop::{Connection, Frame, Handler, LineProtocol, Server};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&self, _conn: &mut Connection, frame: Frame) -> Option<Vec<u8>> {
//!         // Returning bytes sends them back through the protocol's pack()
//!         Some(frame.payload)
//!     }
//!
//!     fn on_close(&self, conn: &mut Connection) {
//!         println!("{} disconnected", conn.peer_addr());
//!     }
//! }
//!
//! fn main() -> Result<(), netloop::Error> {
//!     let config = config::Config::default();
//!     let server = Server::new(
//!         &config,
//!         "127.0.0.1:1833",
//!         Arc::new(Echo),
//!         Arc::new(LineProtocol),
//!     )?;
//!     println!("Listening on {}", server.local_addr());
//!     server.run()
//! }
//! ```
//!
//! Sending outside a callback goes through a connection handle, from any
//! thread:
//!
//! ```no_run
//! # fn demo(conn: &netloop::Conn) -> Result<(), netloop::Error> {
//! conn.send(b"server push".to_vec())?;
//! conn.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! netloop is configured through the [`config`](https://docs.rs/config/)
//! crate. You can use configuration files (TOML, YAML), environment
//! variables, or build configs programmatically.
//!
//! ## Configuration Keys
//!
//! | Key | Description |
//! |-----|-------------|
//! | `num_loops` | Worker event loops (default: available parallelism) |
//! | `max_read_size` | Per-loop scratch read buffer size in bytes (default: 64 KiB) |
//! | `poll_capacity` | Event polling capacity for mio (default: 256) |
//! | `idle_timeout_ms` | Close connections idle for this long; 0 disables (default: 0) |
//! | `timer_tick_ms` | Timing-wheel tick in milliseconds (default: 100) |
//! | `buffer_size` | Initial capacity of pooled ring buffers (default: 4 KiB) |
//!
//! ## Named Instances
//!
//! Use namespacing to configure multiple servers in one process separately:
//!
//! ```toml
//! # Global defaults
//! num_loops = 4
//!
//! # The chat server tolerates idle clients
//! [chat]
//! idle_timeout_ms = 600000
//!
//! # The gateway does not
//! [gateway]
//! idle_timeout_ms = 30000
//! ```
//!
//! Use with:
//!
//! ```no_run
//! # use netloop::{Server, Handler, Connection, Frame, LineProtocol};
//! # use std::sync::Arc;
//! # struct Echo;
//! # impl Handler for Echo {
//! #     fn on_message(&self, _c: &mut Connection, f: Frame) -> Option<Vec<u8>> { Some(f.payload) }
//! #     fn on_close(&self, _c: &mut Connection) {}
//! # }
//! # fn main() -> Result<(), netloop::Error> {
//! # let config = config::Config::default();
//! let chat = Server::new_named(&config, "chat", "0.0.0.0:7000", Arc::new(Echo), Arc::new(LineProtocol))?;
//! # Ok(())
//! # }
//! ```
//!
//! # Threading Model
//!
//! All handler and protocol callbacks run on the connection's owning loop and
//! must not block; they get `&mut Connection` for the duration of the call.
//! Cross-thread access goes through [`Conn`] (and [`ServerHandle`]), which
//! only touch atomics and the loop's task queue.

// Internal-only modules
pub(crate) mod config;
mod connection;
mod error;
mod eventloop;
mod server;
mod timer;

pub mod atomic;
pub mod buffer;
pub mod protocol;

// These are the intended public API
pub use buffer::RingBuffer;
pub use connection::{Conn, Connection, Handler, KvContext};
pub use error::Error;
pub use protocol::{
    Frame, FrameContext, LengthHeader, LengthPrefixProtocol, LineProtocol, Protocol,
};
pub use server::{Server, ServerHandle};
pub use timer::TimingWheel;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::Error;
    pub use crate::protocol::{
        Frame, FrameContext, LengthHeader, LengthPrefixProtocol, LineProtocol, Protocol,
    };
    pub use crate::{Conn, Connection, Handler, KvContext, RingBuffer, Server, ServerHandle};
}
