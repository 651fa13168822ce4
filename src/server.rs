//! The listener/acceptor and the worker-loop pool.
//!
//! A [`Server`] binds one TCP listener and runs the accept loop on the
//! calling thread. Accepted sockets are handed round-robin to a pool of
//! worker event loops; a connection stays on its loop for life. The server
//! owns the shared buffer pool and the timing wheel, and stopping it drives
//! every remaining connection through the normal terminal transition.

use crate::atomic;
use crate::buffer::BufferPool;
use crate::config::{get_namespaced_duration_ms, get_namespaced_usize};
use crate::connection::Handler;
use crate::error::Error;
use crate::eventloop::{EventLoop, LoopHandle, LoopTask, WAKE_TOKEN};
use crate::protocol::Protocol;
use crate::timer::TimingWheel;
use ::config::Config;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, instrument, warn};

const LISTENER_TOKEN: Token = Token(1);

const DEFAULT_POLL_CAPACITY: usize = 256;
const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;
const DEFAULT_TIMER_TICK: Duration = Duration::from_millis(100);

/// A reactor TCP server: one acceptor, a pool of event loops.
///
/// # Configuration Keys
///
/// | Key | Description |
/// |-----|-------------|
/// | `num_loops` | Worker event loops (default: available parallelism) |
/// | `max_read_size` | Per-loop scratch read buffer size in bytes |
/// | `poll_capacity` | Event polling capacity for mio |
/// | `idle_timeout_ms` | Idle close timeout in milliseconds (0 disables) |
/// | `timer_tick_ms` | Timing-wheel tick in milliseconds |
/// | `buffer_size` | Initial capacity of pooled ring buffers |
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    poll: Poll,
    waker: Arc<Waker>,
    poll_capacity: usize,
    loops: Vec<LoopHandle>,
    loop_threads: Vec<JoinHandle<()>>,
    next_loop: usize,
    wheel: TimingWheel,
    conn_count: Arc<atomic::Int32>,
    shutdown: Arc<atomic::Bool>,
}

/// Thread-safe handle for stopping a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    waker: Arc<Waker>,
    shutdown: Arc<atomic::Bool>,
}

impl ServerHandle {
    /// Requests a stop. [`Server::run`] returns after closing every
    /// connection through its normal terminal transition.
    pub fn stop(&self) {
        self.shutdown.set(true);
        if let Err(err) = self.waker.wake() {
            warn!(?err, "Failed to wake acceptor");
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Server {
    /// Creates a server listening on `addr` with default configuration
    /// namespacing.
    pub fn new<A: ToSocketAddrs>(
        config: &Config,
        addr: A,
        handler: Arc<dyn Handler>,
        protocol: Arc<dyn Protocol>,
    ) -> Result<Self, Error> {
        Self::new_named(config, "", addr, handler, protocol)
    }

    /// Creates a named server with configuration namespacing.
    ///
    /// Configuration lookup tries `{name}.{key}` first, then `{key}`, then
    /// the built-in default.
    pub fn new_named<A: ToSocketAddrs>(
        config: &Config,
        name: &str,
        addr: A,
        handler: Arc<dyn Handler>,
        protocol: Arc<dyn Protocol>,
    ) -> Result<Self, Error> {
        let num_loops = get_namespaced_usize(config, name, "num_loops")
            .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .max(1);
        let poll_capacity =
            get_namespaced_usize(config, name, "poll_capacity").unwrap_or(DEFAULT_POLL_CAPACITY);
        let buffer_size =
            get_namespaced_usize(config, name, "buffer_size").unwrap_or(DEFAULT_BUFFER_SIZE);
        let timer_tick =
            get_namespaced_duration_ms(config, name, "timer_tick_ms").unwrap_or(DEFAULT_TIMER_TICK);

        let requested_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let mut listener = TcpListener::bind(requested_addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let pool = Arc::new(BufferPool::new(buffer_size));
        let wheel = TimingWheel::start(timer_tick);
        let conn_count = Arc::new(atomic::Int32::default());

        let mut loops = Vec::with_capacity(num_loops);
        let mut loop_threads = Vec::with_capacity(num_loops);
        for i in 0..num_loops {
            let mut event_loop = EventLoop::new(
                config,
                name,
                Arc::clone(&handler),
                Arc::clone(&protocol),
                Arc::clone(&pool),
                wheel.clone(),
                Arc::clone(&conn_count),
            )?;
            loops.push(event_loop.handle());
            loop_threads.push(
                thread::Builder::new()
                    .name(format!("netloop-worker-{i}"))
                    .spawn(move || {
                        if let Err(err) = event_loop.run() {
                            error!(?err, "Event loop terminated with error");
                        }
                    })?,
            );
        }

        info!(%local_addr, num_loops, "Server listening");
        Ok(Self {
            listener,
            local_addr,
            poll,
            waker,
            poll_capacity,
            loops,
            loop_threads,
            next_loop: 0,
            wheel,
            conn_count,
            shutdown: Arc::new(atomic::Bool::default()),
        })
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl Server {
    /// The actual address being listened on (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Gets a thread-safe handle for stopping the server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            waker: Arc::clone(&self.waker),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Number of currently open connections across all loops.
    pub fn connection_count(&self) -> i32 {
        self.conn_count.get()
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

impl Server {
    /// Runs the accept loop until [`ServerHandle::stop`] is called.
    ///
    /// Blocks the calling thread. On return, all worker loops have shut down
    /// and every connection has been closed.
    #[instrument(skip(self), fields(local_addr = %self.local_addr))]
    pub fn run(mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(self.poll_capacity);
        while !self.shutdown.get() {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                self.stop_loops();
                return Err(err.into());
            }
            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_connections();
                }
            }
        }
        info!("Server stopping");
        self.stop_loops();
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((socket, peer_addr)) => {
                    if let Err(err) = socket.set_nodelay(true) {
                        warn!(%peer_addr, ?err, "Failed to set TCP_NODELAY");
                    }
                    let handle = &self.loops[self.next_loop];
                    self.next_loop = (self.next_loop + 1) % self.loops.len();
                    if let Err(err) = handle.queue(LoopTask::Register { socket, peer_addr }) {
                        error!(%peer_addr, ?err, "Failed to hand connection to event loop");
                    }
                }
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => {
                        // Further accepting would block, so we are done
                        break;
                    }
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, "Error accepting connection");
                        break;
                    }
                },
            }
        }
    }

    fn stop_loops(&mut self) {
        for handle in &self.loops {
            // The loop may already be gone.
            let _ = handle.queue(LoopTask::Shutdown);
        }
        for thread in self.loop_threads.drain(..) {
            if thread.join().is_err() {
                error!("Event loop thread panicked");
            }
        }
        self.wheel.stop();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop_loops();
    }
}
