//! Ring buffers for per-connection byte queues.
//!
//! [`RingBuffer`] is a growable circular byte FIFO. Its contents are exposed
//! as the two contiguous halves of the wrap-around region via
//! [`RingBuffer::peek_all`], so the write path can hand slices straight to
//! vectored-style socket writes without linearizing.
//!
//! Framing protocols use the *virtual cursor* for try-read semantics: bytes
//! are read ahead with [`RingBuffer::virtual_read`] without being consumed,
//! then either committed with [`RingBuffer::virtual_flush`] once a whole frame
//! is available, or abandoned with [`RingBuffer::virtual_revert`].

mod pool;

pub(crate) use pool::BufferPool;

const MIN_CAPACITY: usize = 64;

/// Growable circular byte FIFO with a peek-then-commit virtual cursor.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    r: usize,
    w: usize,
    // Virtual read cursor: `vr` trails `w` by `len() - v_count` bytes and
    // rejoins `r` on every flush, revert or retrieve.
    vr: usize,
    v_count: usize,
    empty: bool,
}

impl RingBuffer {
    /// Creates a buffer with the given initial capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            r: 0,
            w: 0,
            vr: 0,
            v_count: 0,
            empty: true,
        }
    }

    /// Creates a buffer primed with `data`, exactly full.
    pub fn with_data(data: &[u8]) -> Self {
        Self {
            buf: data.to_vec(),
            r: 0,
            w: 0,
            vr: 0,
            v_count: 0,
            empty: data.is_empty(),
        }
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        if self.empty {
            0
        } else if self.w > self.r {
            self.w - self.r
        } else {
            self.buf.len() - self.r + self.w
        }
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Appends `data`, growing the buffer if needed.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let free = self.buf.len() - self.len();
        if free < data.len() {
            self.grow(data.len() - free);
        }
        let size = self.buf.len();
        if self.w + data.len() <= size {
            self.buf[self.w..self.w + data.len()].copy_from_slice(data);
        } else {
            let first = size - self.w;
            self.buf[self.w..].copy_from_slice(&data[..first]);
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }
        self.w = (self.w + data.len()) % size;
        self.empty = false;
    }

    /// Returns the two contiguous halves of the readable region. The second
    /// half is empty unless the contents wrap around.
    pub fn peek_all(&self) -> (&[u8], &[u8]) {
        if self.empty {
            (&[], &[])
        } else if self.w > self.r {
            (&self.buf[self.r..self.w], &[])
        } else {
            (&self.buf[self.r..], &self.buf[..self.w])
        }
    }

    /// Discards up to `n` bytes from the front and resets the virtual cursor.
    pub fn retrieve(&mut self, n: usize) {
        if n == 0 || self.empty {
            return;
        }
        if n >= self.len() {
            self.r = self.w;
            self.empty = true;
        } else {
            self.r = (self.r + n) % self.buf.len();
        }
        self.vr = self.r;
        self.v_count = 0;
    }

    /// Copies up to `out.len()` bytes into `out` and consumes them. Returns
    /// the number of bytes read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        if n == 0 {
            return 0;
        }
        self.copy_out(self.r, &mut out[..n]);
        self.retrieve(n);
        n
    }

    /// Number of bytes readable past the virtual cursor.
    pub fn virtual_len(&self) -> usize {
        self.len() - self.v_count
    }

    /// Copies up to `out.len()` bytes at the virtual cursor into `out`,
    /// advancing the cursor without consuming. Returns the number of bytes
    /// read.
    pub fn virtual_read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.virtual_len());
        if n == 0 {
            return 0;
        }
        self.copy_out(self.vr, &mut out[..n]);
        self.vr = (self.vr + n) % self.buf.len();
        self.v_count += n;
        n
    }

    /// Commits everything read through the virtual cursor.
    pub fn virtual_flush(&mut self) {
        if self.v_count == 0 {
            return;
        }
        if self.v_count == self.len() {
            self.empty = true;
        }
        self.r = self.vr;
        self.v_count = 0;
    }

    /// Abandons the virtual cursor, rewinding it to the read position.
    pub fn virtual_revert(&mut self) {
        self.vr = self.r;
        self.v_count = 0;
    }

    /// Empties the buffer, keeping its storage.
    pub fn reset(&mut self) {
        self.r = 0;
        self.w = 0;
        self.vr = 0;
        self.v_count = 0;
        self.empty = true;
    }

    fn copy_out(&self, from: usize, out: &mut [u8]) {
        let size = self.buf.len();
        let out_len = out.len();
        let first = out_len.min(size - from);
        out[..first].copy_from_slice(&self.buf[from..from + first]);
        if first < out_len {
            out[first..].copy_from_slice(&self.buf[..out_len - first]);
        }
    }

    fn grow(&mut self, needed: usize) {
        let new_size = (self.buf.len() * 2)
            .max(self.buf.len() + needed)
            .max(MIN_CAPACITY);
        let mut new_buf = vec![0; new_size];
        let len = self.len();
        let (first, second) = self.peek_all();
        new_buf[..first.len()].copy_from_slice(first);
        new_buf[first.len()..first.len() + second.len()].copy_from_slice(second);
        self.buf = new_buf;
        self.r = 0;
        self.vr = self.v_count;
        self.w = len;
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let mut rb = RingBuffer::new(16);
        rb.write(b"hello");
        assert_eq!(rb.len(), 5);
        let mut out = [0u8; 5];
        assert_eq!(rb.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert!(rb.is_empty());
    }

    #[test]
    fn peek_all_returns_wrapped_halves() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcdef");
        rb.retrieve(4);
        rb.write(b"ghij");
        let (first, second) = rb.peek_all();
        assert_eq!(first, b"efgh");
        assert_eq!(second, b"ij");
        assert_eq!(rb.len(), 6);
    }

    #[test]
    fn retrieve_past_end_empties_buffer() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abc");
        rb.retrieve(100);
        assert!(rb.is_empty());
        assert_eq!(rb.len(), 0);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"abcd");
        rb.retrieve(2);
        rb.write(b"efghij");
        assert_eq!(rb.len(), 8);
        let mut out = [0u8; 8];
        rb.read(&mut out);
        assert_eq!(&out, b"cdefghij");
    }

    #[test]
    fn grows_from_zero_capacity() {
        let mut rb = RingBuffer::default();
        rb.write(b"xyz");
        assert_eq!(rb.len(), 3);
        assert!(rb.capacity() >= MIN_CAPACITY);
    }

    #[test]
    fn with_data_is_exactly_full() {
        let rb = RingBuffer::with_data(b"full");
        assert_eq!(rb.len(), 4);
        assert_eq!(rb.capacity(), 4);
        let (first, second) = rb.peek_all();
        assert_eq!(first, b"full");
        assert!(second.is_empty());
    }

    #[test]
    fn virtual_read_does_not_consume_until_flush() {
        let mut rb = RingBuffer::new(16);
        rb.write(b"abcdef");
        let mut hdr = [0u8; 2];
        assert_eq!(rb.virtual_read(&mut hdr), 2);
        assert_eq!(&hdr, b"ab");
        assert_eq!(rb.virtual_len(), 4);
        assert_eq!(rb.len(), 6);
        rb.virtual_flush();
        assert_eq!(rb.len(), 4);
        let (first, _) = rb.peek_all();
        assert_eq!(first, b"cdef");
    }

    #[test]
    fn virtual_revert_rewinds_cursor() {
        let mut rb = RingBuffer::new(16);
        rb.write(b"abcdef");
        let mut hdr = [0u8; 4];
        rb.virtual_read(&mut hdr);
        rb.virtual_revert();
        assert_eq!(rb.virtual_len(), 6);
        assert_eq!(rb.len(), 6);
        let mut again = [0u8; 4];
        rb.virtual_read(&mut again);
        assert_eq!(again, hdr);
    }

    #[test]
    fn virtual_flush_of_everything_empties_buffer() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abc");
        let mut out = [0u8; 3];
        rb.virtual_read(&mut out);
        rb.virtual_flush();
        assert!(rb.is_empty());
    }

    #[test]
    fn virtual_cursor_survives_growth() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"abcd");
        let mut hdr = [0u8; 2];
        rb.virtual_read(&mut hdr);
        rb.write(b"efgh");
        assert_eq!(rb.virtual_len(), 6);
        let mut rest = [0u8; 6];
        rb.virtual_read(&mut rest);
        assert_eq!(&rest, b"cdefgh");
    }

    #[test]
    fn wrapped_virtual_read() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcdef");
        rb.retrieve(5);
        rb.write(b"ghijk");
        assert_eq!(rb.len(), 6);
        let mut out = [0u8; 6];
        assert_eq!(rb.virtual_read(&mut out), 6);
        assert_eq!(&out, b"fghijk");
    }
}
