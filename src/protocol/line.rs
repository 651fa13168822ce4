use super::{Frame, Protocol};
use crate::buffer::RingBuffer;
use crate::connection::Connection;
use crate::error::Error;

/// Newline-delimited framing.
///
/// Inbound frames end at `\n`; a trailing `\r` is stripped from the payload.
/// Outbound payloads are terminated with `\r\n`.
#[derive(Debug, Default)]
pub struct LineProtocol;

impl Protocol for LineProtocol {
    fn unpack(
        &self,
        _conn: &mut Connection,
        buf: &mut RingBuffer,
    ) -> Result<Option<Frame>, Error> {
        let (first, second) = buf.peek_all();
        let Some(pos) = first.iter().position(|&b| b == b'\n').or_else(|| {
            second
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| first.len() + i)
        }) else {
            return Ok(None);
        };
        let mut line = vec![0; pos + 1];
        buf.read(&mut line);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(Frame::new(line)))
    }

    fn pack(&self, _conn: &mut Connection, payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::with_capacity(payload.len() + 2);
        wire.extend_from_slice(payload);
        wire.extend_from_slice(b"\r\n");
        wire
    }
}
