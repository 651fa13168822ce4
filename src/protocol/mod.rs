//! Framing protocols: the translation between wire bytes and logical frames.
//!
//! A [`Protocol`] is consulted by the connection's read path in a loop:
//! [`Protocol::unpack`] either commits one complete frame out of the inbound
//! ring buffer, returns `Ok(None)` to signal that more bytes are needed, or
//! fails the connection with an error. Outbound payloads pass through
//! [`Protocol::pack`] before they reach the socket, both for replies returned
//! from [`Handler::on_message`](crate::Handler::on_message) and for payloads
//! given to [`Conn::send`](crate::Conn::send).
//!
//! Protocols that frame on anything other than a delimiter should use the
//! ring buffer's virtual cursor (see [`RingBuffer`]) to peek at a header and
//! commit only once the whole frame is available; [`LengthPrefixProtocol`]
//! shows the pattern.

mod length;
mod line;

pub use length::{LengthHeader, LengthPrefixProtocol};
pub use line::LineProtocol;

use crate::buffer::RingBuffer;
use crate::connection::Connection;
use crate::error::Error;
use downcast_rs::{impl_downcast, Downcast};
use std::fmt::Debug;

/// Per-frame context produced by a framing protocol.
///
/// Protocols attach whatever they parsed out of the frame envelope (a header,
/// flags, an opcode) and handlers downcast it back:
///
/// ```no_run
/// # use netloop::{Frame, LengthHeader};
/// # fn handle(frame: &Frame) {
/// if let Some(header) = frame.context.as_ref().and_then(|c| c.downcast_ref::<LengthHeader>()) {
///     println!("frame of {} bytes", header.len);
/// }
/// # }
/// ```
pub trait FrameContext: Send + Debug + Downcast {}
impl_downcast!(FrameContext);

/// One decoded inbound frame.
#[derive(Debug)]
pub struct Frame {
    /// Protocol-specific frame envelope, if the protocol produces one.
    pub context: Option<Box<dyn FrameContext>>,
    /// The frame payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame carrying only a payload.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            context: None,
            payload,
        }
    }

    /// Creates a frame with a protocol context.
    pub fn with_context(context: Box<dyn FrameContext>, payload: Vec<u8>) -> Self {
        Self {
            context: Some(context),
            payload,
        }
    }
}

/// A framing protocol.
///
/// Both operations run on the connection's owning loop; implementations may
/// keep per-connection state in the connection's key/value context (for
/// example a handshake-completed marker).
pub trait Protocol: Send + Sync {
    /// Decodes one frame from `buf`.
    ///
    /// Returns `Ok(None)` when no complete frame is available yet; in that
    /// case the buffer must be left uncommitted (use
    /// [`RingBuffer::virtual_revert`] after a partial peek). `Ok(Some)` means
    /// the frame's bytes have been consumed from `buf`.
    ///
    /// Returning `Err` fails the connection: the framing loop logs the error
    /// and runs the terminal transition. A protocol that prefers back-pressure
    /// over closing should log the problem itself and return `Ok(None)`.
    fn unpack(&self, conn: &mut Connection, buf: &mut RingBuffer)
        -> Result<Option<Frame>, Error>;

    /// Encodes one outbound payload into its wire form.
    fn pack(&self, conn: &mut Connection, payload: &[u8]) -> Vec<u8>;
}
