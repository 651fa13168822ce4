use mio::event::Source;
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::Shutdown;

// Byte-stream socket driven by the reactor. The connection state machine
// only needs nonblocking read/write, poller registration, and half-close.
pub(crate) trait Socket: Read + Write + Source + Send {
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }
}
