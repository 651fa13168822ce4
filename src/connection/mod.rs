//! Connection lifecycle: the per-connection state machine.
//!
//! A [`Connection`] couples poller readiness events, two ring buffers, a
//! framing [`Protocol`](crate::Protocol), an idle-timeout check on the timing
//! wheel, and the owning loop's task queue. All non-atomic state is mutated
//! only on the owning loop; other threads interact through the cheap-clone
//! [`Conn`] handle, which touches nothing but atomics and the task queue.
//!
//! Lifecycle: construction marks the connection live and acquires its buffers
//! from the pool. Readiness events drive the read and write paths, toggling
//! poller write interest to match pending output. The terminal transition
//! runs exactly once, whatever combination of fatal I/O errors, explicit
//! closes, and idle timeouts races to trigger it: it fires
//! [`Handler::on_close`], closes the socket, and returns both buffers to
//! the pool.

mod context;
mod socket;

pub use context::KvContext;
pub(crate) use socket::Socket;

use crate::atomic;
use crate::buffer::{BufferPool, RingBuffer};
use crate::error::Error;
use crate::eventloop::{LoopCtx, LoopHandle, LoopTask};
use crate::protocol::{Frame, Protocol};
use crate::timer::TimingWheel;
use mio::{Interest, Registry, Token};
use std::any::Any;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, instrument, trace, warn};

/// Application callback surface.
///
/// One handler instance is shared by every connection of a server, so
/// per-connection state belongs in the connection's context slots, not in the
/// handler.
pub trait Handler: Send + Sync {
    /// Called on the owning loop right after the connection is registered.
    fn on_connect(&self, _conn: &mut Connection) {}

    /// Called once per completed inbound frame, in wire-arrival order.
    ///
    /// Returning `Some(reply)` sends the reply back through
    /// [`Protocol::pack`]; replies for frame *n* are queued for the wire
    /// before any work for frame *n + 1*.
    fn on_message(&self, conn: &mut Connection, frame: Frame) -> Option<Vec<u8>>;

    /// Called exactly once when the connection reaches its terminal state.
    fn on_close(&self, conn: &mut Connection);
}

// Readiness indicator bits delivered by the poller.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) error: bool,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

// Outcome of a loop-side handler; `Closed` tells the loop to drop the
// connection from its table, which closes the socket.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EventResult {
    Ok,
    Closed,
}

// State reachable from other threads. Everything else about a connection is
// owned by the loop.
struct ConnShared {
    id: usize,
    peer_addr: SocketAddr,
    connected: atomic::Bool,
    // Terminal-transition guard, distinct from `connected`: shutdown_write
    // clears `connected` while the connection keeps draining, and on_close
    // must still fire exactly once later.
    closed: atomic::Bool,
    active_time: atomic::Int64,
    idle_time: Duration,
    loop_handle: LoopHandle,
}

/// Thread-safe connection handle.
///
/// Obtained from [`Connection::handle`]; may be cloned and moved freely
/// across threads. All operations defer their work to the connection's owning
/// loop.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<ConnShared>,
}

impl Conn {
    /// The connection's id, unique within its owning loop.
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Whether the connection is still usable for sending.
    pub fn connected(&self) -> bool {
        self.shared.connected.get()
    }

    /// Queues `payload` for sending.
    ///
    /// The owning loop shapes the payload with [`Protocol::pack`] and writes
    /// it out, buffering whatever the socket does not accept. Payloads from
    /// concurrent senders go out in the order the loop's queue accepted them.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), Error> {
        if !self.shared.connected.get() {
            return Err(Error::ConnectionClosed);
        }
        self.shared.loop_handle.queue(LoopTask::Send {
            id: self.shared.id,
            payload,
        })
    }

    /// Queues the terminal transition and returns immediately.
    pub fn close(&self) -> Result<(), Error> {
        if !self.shared.connected.get() {
            return Err(Error::ConnectionClosed);
        }
        self.shared
            .loop_handle
            .queue(LoopTask::Close { id: self.shared.id })
    }

    /// Half-closes the write side.
    ///
    /// Subsequent [`Conn::send`] calls fail immediately; inbound bytes keep
    /// being delivered until the peer closes or errors, which triggers the
    /// terminal transition.
    pub fn shutdown_write(&self) -> Result<(), Error> {
        if self.shared.closed.get() {
            return Err(Error::ConnectionClosed);
        }
        self.shared.connected.set(false);
        self.shared
            .loop_handle
            .queue(LoopTask::ShutdownWrite { id: self.shared.id })
    }
}

/// A TCP connection owned by its event loop.
///
/// Handlers and protocols receive `&mut Connection` while running on the
/// owning loop; use [`Connection::handle`] to keep a reference beyond the
/// callback.
pub struct Connection {
    id: usize,
    socket: Box<dyn Socket>,
    interest: Interest,
    in_buffer: RingBuffer,
    out_buffer: RingBuffer,
    handler: Arc<dyn Handler>,
    protocol: Arc<dyn Protocol>,
    user_ctx: Option<Box<dyn Any + Send>>,
    kv_ctx: KvContext,
    shared: Arc<ConnShared>,
}

// ============================================================================
// Construction
// ============================================================================

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        mut socket: Box<dyn Socket>,
        peer_addr: SocketAddr,
        handler: Arc<dyn Handler>,
        protocol: Arc<dyn Protocol>,
        loop_handle: LoopHandle,
        registry: &Registry,
        pool: &BufferPool,
        wheel: &TimingWheel,
        idle_time: Duration,
    ) -> std::io::Result<Self> {
        // Register before anything else: a socket the poller rejects never
        // becomes connected, owns no pooled buffers, and has no idle timer.
        let interest = Interest::READABLE;
        registry.register(socket.as_mut(), Token(id), interest)?;

        let shared = Arc::new(ConnShared {
            id,
            peer_addr,
            connected: atomic::Bool::new(true),
            closed: atomic::Bool::new(false),
            active_time: atomic::Int64::new(now_millis()),
            idle_time,
            loop_handle,
        });

        if idle_time > Duration::ZERO {
            schedule_idle_check(
                wheel.clone(),
                Conn {
                    shared: Arc::clone(&shared),
                },
                idle_time,
            );
        }

        Ok(Self {
            id,
            socket,
            interest,
            in_buffer: pool.acquire(),
            out_buffer: pool.acquire(),
            handler,
            protocol,
            user_ctx: None,
            kv_ctx: KvContext::default(),
            shared,
        })
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl Connection {
    /// The connection's id, unique within its owning loop.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Whether the connection is still usable for sending.
    pub fn connected(&self) -> bool {
        self.shared.connected.get()
    }

    /// Returns a thread-safe handle to this connection.
    pub fn handle(&self) -> Conn {
        Conn {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Queues `payload` for sending; see [`Conn::send`].
    pub fn send(&self, payload: Vec<u8>) -> Result<(), Error> {
        self.handle().send(payload)
    }

    /// Queues the terminal transition; see [`Conn::close`].
    pub fn close(&self) -> Result<(), Error> {
        self.handle().close()
    }

    /// Half-closes the write side; see [`Conn::shutdown_write`].
    pub fn shutdown_write(&self) -> Result<(), Error> {
        self.handle().shutdown_write()
    }

    /// The application's opaque per-connection slot.
    pub fn context(&self) -> Option<&(dyn Any + Send)> {
        self.user_ctx.as_deref()
    }

    pub fn set_context(&mut self, ctx: Box<dyn Any + Send>) {
        self.user_ctx = Some(ctx);
    }

    /// Key/value bag for protocol state.
    pub fn kv(&self) -> &KvContext {
        &self.kv_ctx
    }

    pub fn kv_mut(&mut self) -> &mut KvContext {
        &mut self.kv_ctx
    }

    #[cfg(test)]
    pub(crate) fn interest(&self) -> Interest {
        self.interest
    }

    #[cfg(test)]
    pub(crate) fn in_buffer_len(&self) -> usize {
        self.in_buffer.len()
    }

    #[cfg(test)]
    pub(crate) fn out_buffer_len(&self) -> usize {
        self.out_buffer.len()
    }
}

// ============================================================================
// Readiness Dispatch
// ============================================================================

impl Connection {
    /// Handles one readiness event. Invoked only on the owning loop.
    pub(crate) fn handle_event(
        &mut self,
        ctx: &mut LoopCtx<'_>,
        readiness: Readiness,
    ) -> EventResult {
        if self.shared.idle_time > Duration::ZERO {
            self.shared.active_time.swap(now_millis());
        }

        if readiness.error {
            return self.handle_close(ctx);
        }

        if self.out_buffer.len() > 0 {
            // Drain backed-up output before taking on new inbound work; the
            // read path only runs when the kernel reported readability alone.
            if readiness.writable {
                self.handle_write(ctx)
            } else if readiness.readable {
                self.handle_read(ctx)
            } else {
                EventResult::Ok
            }
        } else if readiness.readable {
            self.handle_read(ctx)
        } else {
            EventResult::Ok
        }
    }
}

// ============================================================================
// Read Path
// ============================================================================

impl Connection {
    #[instrument(skip_all, fields(id = self.id))]
    pub(crate) fn handle_read(&mut self, ctx: &mut LoopCtx<'_>) -> EventResult {
        // Readiness is edge-triggered: the socket must be drained before
        // returning or the next readable event may never arrive.
        loop {
            let n = match self.socket.read(ctx.packet_buf) {
                Ok(0) => {
                    debug!(peer_addr = %self.shared.peer_addr, "Connection closed by peer");
                    return self.handle_close(ctx);
                }
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return EventResult::Ok,
                Err(err) => {
                    self.log_io_error(&err, "reading from");
                    return self.handle_close(ctx);
                }
            };
            trace!(len = n, "Read data from socket");

            let framed = if self.in_buffer.is_empty() {
                // Fast path: frame straight out of the scratch bytes, sparing
                // the copy into in_buffer when whole frames arrive in one
                // read.
                let mut scratch = RingBuffer::with_data(&ctx.packet_buf[..n]);
                let framed = self.run_protocol(&mut scratch);
                if framed.is_ok() && !scratch.is_empty() {
                    let (first, second) = scratch.peek_all();
                    self.in_buffer.write(first);
                    self.in_buffer.write(second);
                }
                framed
            } else {
                self.in_buffer.write(&ctx.packet_buf[..n]);
                let mut in_buffer = std::mem::take(&mut self.in_buffer);
                let framed = self.run_protocol(&mut in_buffer);
                self.in_buffer = in_buffer;
                framed
            };
            let out = match framed {
                Ok(out) => out,
                Err(_) => return self.handle_close(ctx),
            };

            if !out.is_empty() && self.send_in_loop(ctx, &out) == EventResult::Closed {
                return EventResult::Closed;
            }

            if n < ctx.packet_buf.len() {
                // Short read: nothing left in the socket right now.
                return EventResult::Ok;
            }
        }
    }

    // The framing loop: unpack frames until the protocol needs more bytes,
    // handing each to the handler and collecting packed replies. A protocol
    // error fails the connection.
    fn run_protocol(&mut self, buf: &mut RingBuffer) -> Result<Vec<u8>, Error> {
        let protocol = Arc::clone(&self.protocol);
        let handler = Arc::clone(&self.handler);
        let mut out = Vec::new();
        loop {
            match protocol.unpack(self, buf) {
                Ok(Some(frame)) => {
                    if let Some(reply) = handler.on_message(self, frame) {
                        if !reply.is_empty() {
                            out.extend_from_slice(&protocol.pack(self, &reply));
                        }
                    }
                }
                Ok(None) => return Ok(out),
                Err(err) => {
                    error!(
                        id = self.id,
                        peer_addr = %self.shared.peer_addr,
                        %err,
                        "Protocol error, closing connection"
                    );
                    return Err(err);
                }
            }
        }
    }
}

// ============================================================================
// Write Path
// ============================================================================

impl Connection {
    pub(crate) fn pack_and_send(&mut self, ctx: &mut LoopCtx<'_>, payload: &[u8]) -> EventResult {
        let protocol = Arc::clone(&self.protocol);
        let data = protocol.pack(self, payload);
        self.send_in_loop(ctx, &data)
    }

    /// Write path for bytes already shaped by the protocol.
    ///
    /// Appends behind pending output to preserve FIFO order; otherwise tries
    /// one nonblocking write and buffers the remainder, arming write
    /// readiness whenever output is left pending.
    #[instrument(skip_all, fields(id = self.id, len = data.len()))]
    pub(crate) fn send_in_loop(&mut self, ctx: &mut LoopCtx<'_>, data: &[u8]) -> EventResult {
        if self.out_buffer.len() > 0 {
            self.out_buffer.write(data);
            return EventResult::Ok;
        }

        match self.socket.write(data) {
            Ok(n) if n == data.len() => {
                trace!(len = n, "Wrote to socket");
                return EventResult::Ok;
            }
            Ok(n) => {
                trace!(len = n, remaining = data.len() - n, "Partial write to socket");
                self.out_buffer.write(&data[n..]);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                self.out_buffer.write(data);
            }
            Err(err) => {
                self.log_io_error(&err, "writing to");
                return self.handle_close(ctx);
            }
        }

        if self.out_buffer.len() > 0 {
            self.enable_read_write(ctx);
        }
        EventResult::Ok
    }

    /// Drains `out_buffer` while the socket accepts bytes, then reverts
    /// poller interest to read-only once nothing is pending.
    #[instrument(skip_all, fields(id = self.id, pending = self.out_buffer.len()))]
    pub(crate) fn handle_write(&mut self, ctx: &mut LoopCtx<'_>) -> EventResult {
        let (n, first_done) = {
            let (first, _) = self.out_buffer.peek_all();
            match self.socket.write(first) {
                Ok(n) => (n, n == first.len()),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return EventResult::Ok,
                Err(err) => {
                    self.log_io_error(&err, "writing to");
                    return self.handle_close(ctx);
                }
            }
        };
        self.out_buffer.retrieve(n);
        trace!(len = n, "Wrote to socket");

        if first_done && !self.out_buffer.is_empty() {
            let n = {
                let (second, _) = self.out_buffer.peek_all();
                match self.socket.write(second) {
                    Ok(n) => n,
                    Err(err) if err.kind() == ErrorKind::WouldBlock => return EventResult::Ok,
                    Err(err) => {
                        self.log_io_error(&err, "writing to");
                        return self.handle_close(ctx);
                    }
                }
            };
            self.out_buffer.retrieve(n);
            trace!(len = n, "Wrote to socket");
        }

        if self.out_buffer.is_empty() {
            // Failure here is non-fatal; the next event retries.
            self.enable_read(ctx);
        }
        EventResult::Ok
    }
}

// ============================================================================
// Terminal Transition
// ============================================================================

impl Connection {
    /// The terminal transition, executed at most once per connection.
    ///
    /// Concurrent close requests, error events, and idle timeouts may all
    /// schedule this; the `closed` check-and-set lets only the first one
    /// through.
    #[instrument(skip_all, fields(id = self.id))]
    pub(crate) fn handle_close(&mut self, ctx: &mut LoopCtx<'_>) -> EventResult {
        if self.shared.closed.swap(true) {
            return EventResult::Closed;
        }
        self.shared.connected.set(false);

        if let Err(err) = ctx.registry.deregister(self.socket.as_mut()) {
            warn!(?err, "Failed to deregister connection");
        }

        let handler = Arc::clone(&self.handler);
        handler.on_close(self);

        self.release_buffers(ctx.pool);
        debug!(peer_addr = %self.shared.peer_addr, "Connection closed");
        EventResult::Closed
    }

    pub(crate) fn shutdown_write_in_loop(&mut self) {
        if let Err(err) = self.socket.shutdown(Shutdown::Write) {
            warn!(id = self.id, ?err, "Error shutting down connection");
        }
    }

    fn release_buffers(&mut self, pool: &BufferPool) {
        pool.release(std::mem::take(&mut self.in_buffer));
        pool.release(std::mem::take(&mut self.out_buffer));
    }
}

// ============================================================================
// Poller Interest
// ============================================================================

impl Connection {
    fn enable_read(&mut self, ctx: &LoopCtx<'_>) {
        self.set_interest(ctx, Interest::READABLE);
    }

    fn enable_read_write(&mut self, ctx: &LoopCtx<'_>) {
        self.set_interest(ctx, Interest::READABLE | Interest::WRITABLE);
    }

    fn set_interest(&mut self, ctx: &LoopCtx<'_>, interest: Interest) {
        if self.interest == interest {
            return;
        }
        match ctx
            .registry
            .reregister(self.socket.as_mut(), Token(self.id), interest)
        {
            Ok(()) => self.interest = interest,
            Err(err) => warn!(id = self.id, ?err, "Failed to update poller interest"),
        }
    }

    fn log_io_error(&self, err: &std::io::Error, op: &str) {
        let peer_addr = &self.shared.peer_addr;
        match err.kind() {
            ErrorKind::BrokenPipe => warn!(%peer_addr, "Broken pipe"),
            ErrorKind::ConnectionReset => warn!(%peer_addr, "Connection reset"),
            _ => error!(%peer_addr, ?err, "Error {op} socket"),
        }
    }
}

// ============================================================================
// Idle Timeout
// ============================================================================

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// Re-arms itself on the wheel until the connection has been quiet for
// `idle_time`, then schedules a normal close on the owning loop. Runs on the
// wheel thread: reads atomics and queues work, nothing else.
fn schedule_idle_check(wheel: TimingWheel, conn: Conn, idle_time: Duration) {
    schedule_idle_check_after(wheel, conn, idle_time, idle_time);
}

fn schedule_idle_check_after(wheel: TimingWheel, conn: Conn, idle_time: Duration, delay: Duration) {
    let rearm_wheel = wheel.clone();
    wheel.after(delay, move || {
        if conn.shared.closed.get() {
            return;
        }
        let idle_millis = (now_millis() - conn.shared.active_time.get()).max(0) as u64;
        let elapsed = Duration::from_millis(idle_millis);
        if elapsed >= idle_time {
            debug!(id = conn.id(), "Idle timeout, closing connection");
            let _ = conn.close();
        } else {
            schedule_idle_check_after(rearm_wheel, conn, idle_time, idle_time - elapsed);
        }
    });
}

// ============================================================================
// Test Support
// ============================================================================


#[cfg(test)]
mod tests {
    use super::testing::{self, TestConn};
    use super::*;
    use crate::protocol::{LengthPrefixProtocol, LineProtocol};
    use std::io;
    use std::thread;

    fn messages(t: &TestConn) -> Vec<Vec<u8>> {
        t.handler.messages.lock().unwrap().clone()
    }

    #[test]
    fn echo_single_frame() {
        let mut t = testing::connection();
        t.push_read(b"PING\r\n");

        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.handle_read(&mut ctx), EventResult::Ok);

        assert_eq!(messages(&t), vec![b"PING".to_vec()]);
        assert_eq!(t.written(), b"PING\r\n");
        assert_eq!(t.conn.out_buffer_len(), 0);
        assert_eq!(t.conn.interest(), Interest::READABLE);
    }

    #[test]
    fn partial_frame_across_reads() {
        let mut t = testing::connection();

        t.push_read(b"PI");
        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.handle_read(&mut ctx), EventResult::Ok);
        assert!(messages(&t).is_empty());
        assert_eq!(t.conn.in_buffer_len(), 2);

        t.push_read(b"NG\r\n");
        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.handle_read(&mut ctx), EventResult::Ok);
        assert_eq!(messages(&t), vec![b"PING".to_vec()]);
        assert_eq!(t.conn.in_buffer_len(), 0);
        assert_eq!(t.written(), b"PING\r\n");
    }

    #[test]
    fn multiple_frames_in_one_read() {
        let mut t = testing::connection();
        t.push_read(b"ONE\r\nTWO\r\nTH");

        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        t.conn.handle_read(&mut ctx);

        assert_eq!(messages(&t), vec![b"ONE".to_vec(), b"TWO".to_vec()]);
        assert_eq!(t.conn.in_buffer_len(), 2);
        assert_eq!(t.written(), b"ONE\r\nTWO\r\n");
    }

    #[test]
    fn backpressure_partial_write_then_drain() {
        let mut t = testing::connection();
        t.socket.lock().unwrap().write_quota = 16;

        let payload = [7u8; 64];
        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.send_in_loop(&mut ctx, &payload), EventResult::Ok);

        assert_eq!(t.written().len(), 16);
        assert_eq!(t.conn.out_buffer_len(), 48);
        assert_eq!(t.conn.interest(), Interest::READABLE | Interest::WRITABLE);

        t.socket.lock().unwrap().write_quota = usize::MAX;
        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.handle_write(&mut ctx), EventResult::Ok);

        assert_eq!(t.written(), payload.to_vec());
        assert_eq!(t.conn.out_buffer_len(), 0);
        assert_eq!(t.conn.interest(), Interest::READABLE);
    }

    #[test]
    fn would_block_on_empty_out_buffer_arms_write_interest() {
        let mut t = testing::connection();
        t.socket.lock().unwrap().write_quota = 0;

        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.send_in_loop(&mut ctx, &[1u8; 64]), EventResult::Ok);

        assert!(t.written().is_empty());
        assert_eq!(t.conn.out_buffer_len(), 64);
        assert_eq!(t.conn.interest(), Interest::READABLE | Interest::WRITABLE);
    }

    #[test]
    fn pending_output_prefers_drain_over_read() {
        let mut t = testing::connection();
        t.socket.lock().unwrap().write_quota = 0;

        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        t.conn.send_in_loop(&mut ctx, b"QUEUED\r\n");
        assert_eq!(t.conn.out_buffer_len(), 8);

        // Readable and writable at once: the drain wins, the read is skipped.
        t.push_read(b"PING\r\n");
        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        let readiness = Readiness {
            error: false,
            readable: true,
            writable: true,
        };
        assert_eq!(t.conn.handle_event(&mut ctx, readiness), EventResult::Ok);
        assert!(messages(&t).is_empty());
        assert_eq!(t.conn.out_buffer_len(), 8);

        // Readability alone reaches the read path; the reply queues behind
        // the pending output.
        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        let readiness = Readiness {
            error: false,
            readable: true,
            writable: false,
        };
        assert_eq!(t.conn.handle_event(&mut ctx, readiness), EventResult::Ok);
        assert_eq!(messages(&t), vec![b"PING".to_vec()]);
        assert_eq!(t.conn.out_buffer_len(), 8 + 6);
    }

    #[test]
    fn fatal_write_error_during_drain_is_terminal() {
        let mut t = testing::connection();
        t.socket.lock().unwrap().write_quota = 4;

        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        t.conn.send_in_loop(&mut ctx, &[2u8; 64]);
        assert_eq!(t.conn.out_buffer_len(), 60);

        t.socket.lock().unwrap().write_error = Some(io::ErrorKind::ConnectionReset);
        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.handle_write(&mut ctx), EventResult::Closed);

        assert_eq!(t.handler.closes.get(), 1);
        assert!(!t.conn.connected());
        assert_eq!(t.pool.outstanding(), 0);
    }

    #[test]
    fn protocol_error_is_terminal() {
        let mut t = testing::connection_with(
            Arc::new(LengthPrefixProtocol::new(8)),
            Duration::ZERO,
        );
        let mut wire = 1000u32.to_be_bytes().to_vec();
        wire.extend_from_slice(&[0; 16]);
        t.push_read(&wire);

        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.handle_read(&mut ctx), EventResult::Closed);
        assert_eq!(t.handler.closes.get(), 1);
        assert_eq!(t.pool.outstanding(), 0);
        assert!(!t.conn.connected());
    }

    #[test]
    fn read_eof_is_terminal() {
        let mut t = testing::connection();
        t.push_read(b"");

        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.handle_read(&mut ctx), EventResult::Closed);
        assert_eq!(t.handler.closes.get(), 1);
        assert_eq!(t.pool.outstanding(), 0);
    }

    #[test]
    fn error_event_is_terminal() {
        let mut t = testing::connection();
        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        let readiness = Readiness {
            error: true,
            readable: false,
            writable: false,
        };
        assert_eq!(t.conn.handle_event(&mut ctx, readiness), EventResult::Closed);
        assert_eq!(t.handler.closes.get(), 1);
    }

    #[test]
    fn terminal_transition_runs_once() {
        let mut t = testing::connection();

        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.handle_close(&mut ctx), EventResult::Closed);
        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.handle_close(&mut ctx), EventResult::Closed);

        assert_eq!(t.handler.closes.get(), 1);
        assert_eq!(t.pool.outstanding(), 0);
    }

    #[test]
    fn send_and_close_fail_after_terminal_transition() {
        let mut t = testing::connection();
        let handle = t.conn.handle();

        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        t.conn.handle_close(&mut ctx);

        assert!(matches!(
            handle.send(b"late".to_vec()),
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(handle.close(), Err(Error::ConnectionClosed)));
        assert!(!handle.connected());
    }

    #[test]
    fn send_queues_pack_task_in_fifo_order() {
        let t = testing::connection();
        let handle = t.conn.handle();

        handle.send(b"A".to_vec()).unwrap();
        handle.send(b"B".to_vec()).unwrap();

        match t.tasks.try_recv().unwrap() {
            LoopTask::Send { id, payload } => {
                assert_eq!(id, 1);
                assert_eq!(payload, b"A");
            }
            other => panic!("unexpected task: {other:?}"),
        }
        match t.tasks.try_recv().unwrap() {
            LoopTask::Send { payload, .. } => assert_eq!(payload, b"B"),
            other => panic!("unexpected task: {other:?}"),
        }
    }

    #[test]
    fn shutdown_write_half_closes_and_rejects_sends() {
        let mut t = testing::connection();
        let handle = t.conn.handle();

        handle.shutdown_write().unwrap();
        assert!(!handle.connected());
        assert!(matches!(
            handle.send(b"x".to_vec()),
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(
            t.tasks.try_recv(),
            Ok(LoopTask::ShutdownWrite { id: 1 })
        ));

        t.conn.shutdown_write_in_loop();
        assert_eq!(t.socket.lock().unwrap().shutdowns, vec![Shutdown::Write]);

        // The draining connection still reaches its terminal transition, and
        // on_close still fires exactly once.
        t.push_read(b"");
        let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
        assert_eq!(t.conn.handle_read(&mut ctx), EventResult::Closed);
        assert_eq!(t.handler.closes.get(), 1);
        assert_eq!(t.pool.outstanding(), 0);
    }

    #[test]
    fn idle_timeout_schedules_close() {
        let t = testing::connection_with(Arc::new(LineProtocol), Duration::from_millis(50));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            match t.tasks.try_recv() {
                Ok(LoopTask::Close { id: 1 }) => break,
                Ok(other) => panic!("unexpected task: {other:?}"),
                Err(_) => {
                    assert!(
                        std::time::Instant::now() < deadline,
                        "Idle close was never scheduled"
                    );
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    #[test]
    fn recent_activity_defers_idle_close() {
        let mut t = testing::connection_with(Arc::new(LineProtocol), Duration::from_millis(200));

        // Keep refreshing active_time past several idle windows.
        for _ in 0..6 {
            thread::sleep(Duration::from_millis(60));
            let mut ctx = testing::ctx(&t.poll, &mut t.scratch, &t.pool);
            let readiness = Readiness {
                error: false,
                readable: false,
                writable: false,
            };
            t.conn.handle_event(&mut ctx, readiness);
            assert!(t.tasks.try_recv().is_err(), "Closed while still active");
        }
    }
}
