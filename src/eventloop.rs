//! Single-threaded event loops.
//!
//! Each [`EventLoop`] runs on one OS thread and owns every connection
//! assigned to it: the loop's poll instance, its connection table, and a
//! loop-scoped scratch read buffer shared by all of its connections within a
//! tick. Other threads never touch a connection directly; they queue a
//! [`LoopTask`] through the loop's [`LoopHandle`] and wake the poll. The loop
//! cycle is poll, dispatch readiness, drain queued tasks, repeat.

use crate::atomic;
use crate::buffer::BufferPool;
use crate::config::{get_namespaced_duration_ms, get_namespaced_usize};
use crate::connection::{Connection, EventResult, Handler, Readiness};
use crate::error::Error;
use crate::protocol::Protocol;
use crate::timer::TimingWheel;
use ::config::Config;
use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

pub(crate) const WAKE_TOKEN: Token = Token(0);
const CONNECTION_TOKEN_RANGE_START: usize = 1;

const DEFAULT_MAX_READ_SIZE: usize = 64 * 1024;
const DEFAULT_POLL_CAPACITY: usize = 256;

// Deferred operations executed on the owning loop between polls.
#[derive(Debug)]
pub(crate) enum LoopTask {
    Register {
        socket: TcpStream,
        peer_addr: SocketAddr,
    },
    Send {
        id: usize,
        payload: Vec<u8>,
    },
    Close {
        id: usize,
    },
    ShutdownWrite {
        id: usize,
    },
    Shutdown,
}

/// Thread-safe handle for queueing work onto an event loop.
///
/// Tasks are executed in the order the queue accepted them.
#[derive(Debug, Clone)]
pub(crate) struct LoopHandle {
    pub(crate) sender: Sender<LoopTask>,
    pub(crate) waker: Arc<Waker>,
}

impl LoopHandle {
    pub(crate) fn queue(&self, task: LoopTask) -> Result<(), Error> {
        self.sender.send(task).map_err(|_| Error::LoopTerminated)?;
        self.waker.wake()?;
        Ok(())
    }
}

// Loop-scoped resources a connection handler borrows for the duration of one
// dispatch. The scratch buffer must not be retained past the handler.
pub(crate) struct LoopCtx<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) packet_buf: &'a mut [u8],
    pub(crate) pool: &'a BufferPool,
}

/// A single-threaded event loop owning a set of connections.
pub(crate) struct EventLoop {
    poll: Poll,
    connections: HashMap<usize, Connection>,
    receiver: Receiver<LoopTask>,
    handle: LoopHandle,
    next_token: usize,
    packet_buf: Vec<u8>,
    poll_capacity: usize,
    idle_time: Duration,
    handler: Arc<dyn Handler>,
    protocol: Arc<dyn Protocol>,
    pool: Arc<BufferPool>,
    wheel: TimingWheel,
    conn_count: Arc<atomic::Int32>,
}

impl EventLoop {
    pub(crate) fn new(
        config: &Config,
        name: &str,
        handler: Arc<dyn Handler>,
        protocol: Arc<dyn Protocol>,
        pool: Arc<BufferPool>,
        wheel: TimingWheel,
        conn_count: Arc<atomic::Int32>,
    ) -> Result<Self, Error> {
        let max_read_size =
            get_namespaced_usize(config, name, "max_read_size").unwrap_or(DEFAULT_MAX_READ_SIZE);
        let poll_capacity =
            get_namespaced_usize(config, name, "poll_capacity").unwrap_or(DEFAULT_POLL_CAPACITY);
        let idle_time =
            get_namespaced_duration_ms(config, name, "idle_timeout_ms").unwrap_or(Duration::ZERO);

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (sender, receiver) = channel();

        Ok(Self {
            poll,
            connections: HashMap::new(),
            receiver,
            handle: LoopHandle { sender, waker },
            next_token: CONNECTION_TOKEN_RANGE_START,
            packet_buf: vec![0; max_read_size],
            poll_capacity,
            idle_time,
            handler,
            protocol,
            pool,
            wheel,
            conn_count,
        })
    }

    pub(crate) fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Runs the poll, dispatch, drain-tasks cycle until shutdown is queued.
    ///
    /// On shutdown every remaining connection goes through the normal
    /// terminal transition, so `on_close` and buffer-pool balance hold.
    pub(crate) fn run(&mut self) -> Result<(), Error> {
        let mut events = Events::with_capacity(self.poll_capacity);
        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                self.close_all();
                return Err(err.into());
            }

            for event in events.iter() {
                let Token(id) = event.token();
                if id == WAKE_TOKEN.0 {
                    continue;
                }
                self.dispatch(
                    id,
                    Readiness {
                        error: event.is_error(),
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                    },
                );
            }

            if !self.process_tasks() {
                break;
            }
        }
        info!("Event loop shutting down");
        self.close_all();
        Ok(())
    }

    fn dispatch(&mut self, id: usize, readiness: Readiness) {
        let Some(conn) = self.connections.get_mut(&id) else {
            // The connection may have closed earlier in this same cycle.
            trace!(id, "Event for unknown connection");
            return;
        };
        let mut ctx = LoopCtx {
            registry: self.poll.registry(),
            packet_buf: &mut self.packet_buf,
            pool: &self.pool,
        };
        if conn.handle_event(&mut ctx, readiness) == EventResult::Closed {
            self.remove_connection(id);
        }
    }

    // Drains queued tasks. Returns false once shutdown has been requested.
    fn process_tasks(&mut self) -> bool {
        let tasks: Vec<LoopTask> = self.receiver.try_iter().collect();
        for task in tasks {
            match task {
                LoopTask::Register { socket, peer_addr } => {
                    self.register_connection(socket, peer_addr);
                }
                LoopTask::Send { id, payload } => self.send_in_loop(id, payload),
                LoopTask::Close { id } => self.close_in_loop(id),
                LoopTask::ShutdownWrite { id } => {
                    if let Some(conn) = self.connections.get_mut(&id) {
                        conn.shutdown_write_in_loop();
                    }
                }
                LoopTask::Shutdown => return false,
            }
        }
        true
    }

    #[instrument(skip(self, socket))]
    fn register_connection(&mut self, socket: TcpStream, peer_addr: SocketAddr) {
        let id = self.allocate_token();
        let mut conn = match Connection::new(
            id,
            Box::new(socket),
            peer_addr,
            Arc::clone(&self.handler),
            Arc::clone(&self.protocol),
            self.handle.clone(),
            self.poll.registry(),
            &self.pool,
            &self.wheel,
            self.idle_time,
        ) {
            Ok(conn) => conn,
            Err(err) => {
                // The socket drops here; it never became a connection.
                error!(id, %peer_addr, ?err, "Failed to register connection");
                return;
            }
        };
        self.conn_count.add(1);

        let handler = Arc::clone(&self.handler);
        handler.on_connect(&mut conn);
        info!(id, %peer_addr, "Registered connection");
        self.connections.insert(id, conn);
    }

    fn send_in_loop(&mut self, id: usize, payload: Vec<u8>) {
        let Some(conn) = self.connections.get_mut(&id) else {
            warn!(id, "Connection not found when sending");
            return;
        };
        let mut ctx = LoopCtx {
            registry: self.poll.registry(),
            packet_buf: &mut self.packet_buf,
            pool: &self.pool,
        };
        if conn.pack_and_send(&mut ctx, &payload) == EventResult::Closed {
            self.remove_connection(id);
        }
    }

    fn close_in_loop(&mut self, id: usize) {
        let Some(conn) = self.connections.get_mut(&id) else {
            // Close may race the loop observing an error on the same fd.
            debug!(id, "Connection not found when closing");
            return;
        };
        let mut ctx = LoopCtx {
            registry: self.poll.registry(),
            packet_buf: &mut self.packet_buf,
            pool: &self.pool,
        };
        if conn.handle_close(&mut ctx) == EventResult::Closed {
            self.remove_connection(id);
        }
    }

    // Dropping the connection closes the socket; this is the only place a
    // connection leaves the table.
    fn remove_connection(&mut self, id: usize) {
        if self.connections.remove(&id).is_some() {
            self.conn_count.add(-1);
            debug!(id, "Removed connection");
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<usize> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_in_loop(id);
        }
    }

    // Hands out the next free poller token, stepping over the waker token
    // and any ids still present in the table.
    fn allocate_token(&mut self) -> usize {
        let mut token = self.next_token;
        while token == WAKE_TOKEN.0 || self.connections.contains_key(&token) {
            token = token.wrapping_add(1);
        }
        self.next_token = token.wrapping_add(1);
        token
    }
}
