use super::{Frame, FrameContext, Protocol};
use crate::buffer::RingBuffer;
use crate::connection::Connection;
use crate::error::Error;

const HEADER_SIZE: usize = 4;
const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame envelope produced by [`LengthPrefixProtocol`].
#[derive(Debug, Clone, Copy)]
pub struct LengthHeader {
    /// Payload length as declared on the wire.
    pub len: u32,
}

impl FrameContext for LengthHeader {}

/// Length-prefixed framing: a big-endian `u32` payload length followed by
/// that many payload bytes.
///
/// The header is peeked through the ring buffer's virtual cursor and only
/// committed once the whole payload is available, so partial frames stay in
/// the buffer across reads without copying. A frame declaring more than the
/// configured maximum fails the connection with [`Error::Protocol`].
#[derive(Debug)]
pub struct LengthPrefixProtocol {
    max_frame_size: usize,
}

impl LengthPrefixProtocol {
    /// Creates the protocol with a maximum accepted payload size.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for LengthPrefixProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Protocol for LengthPrefixProtocol {
    fn unpack(
        &self,
        _conn: &mut Connection,
        buf: &mut RingBuffer,
    ) -> Result<Option<Frame>, Error> {
        let mut header = [0; HEADER_SIZE];
        if buf.virtual_read(&mut header) < HEADER_SIZE {
            buf.virtual_revert();
            return Ok(None);
        }
        let len = u32::from_be_bytes(header);
        if len as usize > self.max_frame_size {
            buf.virtual_revert();
            return Err(Error::Protocol(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_frame_size
            )));
        }
        if buf.virtual_len() < len as usize {
            buf.virtual_revert();
            return Ok(None);
        }
        buf.virtual_flush();

        let mut payload = vec![0; len as usize];
        buf.read(&mut payload);
        Ok(Some(Frame::with_context(
            Box::new(LengthHeader { len }),
            payload,
        )))
    }

    fn pack(&self, _conn: &mut Connection, payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::with_capacity(HEADER_SIZE + payload.len());
        wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        wire.extend_from_slice(payload);
        wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut wire = (payload.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(payload);
        wire
    }

    #[test]
    fn unpack_whole_frame() {
        let mut t = testing::connection();
        let proto = LengthPrefixProtocol::default();
        let mut buf = RingBuffer::new(64);
        buf.write(&framed(b"hello"));

        let frame = proto.unpack(&mut t.conn, &mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, b"hello");
        let header = frame
            .context
            .unwrap()
            .downcast::<LengthHeader>()
            .expect("Wrong frame context type");
        assert_eq!(header.len, 5);
        assert!(buf.is_empty());
    }

    #[test]
    fn unpack_partial_header_leaves_buffer_untouched() {
        let mut t = testing::connection();
        let proto = LengthPrefixProtocol::default();
        let mut buf = RingBuffer::new(64);
        buf.write(&[0, 0, 0]);
        assert!(proto.unpack(&mut t.conn, &mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.virtual_len(), 3);
    }

    #[test]
    fn unpack_partial_payload_leaves_buffer_untouched() {
        let mut t = testing::connection();
        let proto = LengthPrefixProtocol::default();
        let mut buf = RingBuffer::new(64);
        buf.write(&framed(b"hello")[..7]);
        assert!(proto.unpack(&mut t.conn, &mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
        assert_eq!(buf.virtual_len(), 7);
    }

    #[test]
    fn unpack_back_to_back_frames() {
        let mut t = testing::connection();
        let proto = LengthPrefixProtocol::default();
        let mut buf = RingBuffer::new(64);
        buf.write(&framed(b"one"));
        buf.write(&framed(b"two"));

        let frame = proto.unpack(&mut t.conn, &mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, b"one");
        let frame = proto.unpack(&mut t.conn, &mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, b"two");
        assert!(proto.unpack(&mut t.conn, &mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_a_protocol_error() {
        let mut t = testing::connection();
        let proto = LengthPrefixProtocol::new(8);
        let mut buf = RingBuffer::new(64);
        buf.write(&framed(&[0; 32]));

        assert!(matches!(
            proto.unpack(&mut t.conn, &mut buf),
            Err(Error::Protocol(_))
        ));
        // The buffer stays uncommitted; the connection is about to close.
        assert_eq!(buf.virtual_len(), buf.len());
    }

    #[test]
    fn pack_prepends_length() {
        let mut t = testing::connection();
        let proto = LengthPrefixProtocol::default();
        assert_eq!(proto.pack(&mut t.conn, b"abc"), framed(b"abc"));
    }
}
