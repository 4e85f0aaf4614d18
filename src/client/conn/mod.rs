//! Downstream connections.
//!
//! Each connection is a socket driven by its own task (see [`driver`]). The
//! rest of the crate only ever holds a [`Connection`] handle, which can queue
//! commands for that task and read the connection's shared flags, but never
//! touches the socket itself.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::client::pipeline::CallParams;
use crate::codec::{BodyChunk, CodecProbe};
use crate::error::Error;

pub mod dns;
pub(crate) mod driver;
pub(crate) mod tcp;
pub(crate) mod timeout;
pub(crate) mod tls;
pub(crate) mod transport;

use self::timeout::IdleLifecycle;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a downstream connection in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        ConnectionId(CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State shared between a connection's task and its handles.
#[derive(Debug)]
pub(crate) struct Shared {
    id: ConnectionId,
    address: SocketAddr,
    broken: AtomicBool,
    open: AtomicBool,
    lifecycle: IdleLifecycle,
    probe: CodecProbe,
}

impl Shared {
    pub(crate) fn new(address: SocketAddr) -> Self {
        Self {
            id: ConnectionId::next(),
            address,
            broken: AtomicBool::new(false),
            open: AtomicBool::new(true),
            lifecycle: IdleLifecycle::new(),
            probe: CodecProbe::new(),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.open.store(false, Ordering::Release);
        self.lifecycle.close();
    }

    pub(crate) fn lifecycle(&self) -> &IdleLifecycle {
        &self.lifecycle
    }

    pub(crate) fn probe(&self) -> &CodecProbe {
        &self.probe
    }
}

/// Work queued for a connection's task, processed strictly in order.
pub(crate) enum Command {
    /// Prepare the pipeline for a new call and write its request head.
    Begin {
        params: Box<CallParams>,
        reply: oneshot::Sender<Result<(), Error>>,
    },

    /// Write one request body chunk for `call`.
    Stream {
        chunk: BodyChunk,
        call: Arc<CallState>,
        reply: oneshot::Sender<Result<(), Error>>,
    },

    /// Close the connection if `call` is still the active call.
    CloseDueToError { call: Arc<CallState>, cause: String },

    /// Arm the idle timer, if the connection is still idle at `epoch`.
    EnterIdle { epoch: u64 },

    /// Close the connection.
    Close,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Begin { .. } => f.write_str("Begin"),
            Command::Stream { chunk, .. } => f
                .debug_struct("Stream")
                .field("len", &chunk.data().len())
                .field("last", &chunk.is_last())
                .finish(),
            Command::CloseDueToError { cause, .. } => f
                .debug_struct("CloseDueToError")
                .field("cause", cause)
                .finish(),
            Command::EnterIdle { epoch } => {
                f.debug_struct("EnterIdle").field("epoch", epoch).finish()
            }
            Command::Close => f.write_str("Close"),
        }
    }
}

/// A handle to a downstream connection.
#[derive(Debug, Clone)]
pub(crate) struct Connection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<Shared>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { shared, commands }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.shared.id()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn probe(&self) -> &CodecProbe {
        self.shared.probe()
    }

    pub(crate) fn mark_broken(&self) {
        self.shared.mark_broken();
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.shared.is_broken()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.shared.is_open() && !self.commands.is_closed()
    }

    /// Unhealthy if marked broken, otherwise healthy while the socket is open.
    pub(crate) fn is_healthy(&self) -> bool {
        !self.is_broken() && self.is_open()
    }

    /// Queue a command for the connection's task.
    pub(crate) fn send(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .map_err(|_| Error::ConnectionClosed(self.id()))
    }

    /// Ask the connection's task to close the socket. Closing twice is harmless.
    pub(crate) fn close(&self) {
        if self.commands.send(Command::Close).is_err() {
            tracing::trace!(conn = %self.id(), "connection task already gone");
        }
    }
}

/// Flags for one call on a connection.
///
/// A fresh `CallState` is created for every call, so nothing from a finished
/// call can leak into the next one on the same connection.
#[derive(Debug)]
pub(crate) struct CallState {
    active: AtomicBool,
    terminal_chunk_sent: AtomicBool,
    closed_due_to_error: AtomicBool,
    logged_ignored_close: AtomicBool,
}

impl CallState {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            terminal_chunk_sent: AtomicBool::new(false),
            closed_due_to_error: AtomicBool::new(false),
            logged_ignored_close: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flip the call to inactive. Returns `true` for exactly one caller.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn terminal_chunk_sent(&self) -> bool {
        self.terminal_chunk_sent.load(Ordering::Acquire)
    }

    pub(crate) fn set_terminal_chunk_sent(&self) {
        self.terminal_chunk_sent.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed_due_to_error(&self) -> bool {
        self.closed_due_to_error.load(Ordering::Acquire)
    }

    /// Mark the channel closed; returns the previous value.
    pub(crate) fn set_closed_due_to_error(&self) -> bool {
        self.closed_due_to_error.swap(true, Ordering::AcqRel)
    }

    /// Returns `true` the first time it is called.
    pub(crate) fn first_ignored_close(&self) -> bool {
        !self.logged_ignored_close.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Connection: Send, Sync, Clone);
    assert_impl_all!(CallState: Send, Sync);

    #[test]
    fn connection_id_display() {
        let id = ConnectionId(7);
        assert_eq!(id.to_string(), "conn-7");
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }

    #[test]
    fn deactivate_exactly_once() {
        let call = Arc::new(CallState::new());

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let call = call.clone();
                    scope.spawn(move || call.deactivate())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(winners, 1);
        assert!(!call.is_active());
        assert!(!call.deactivate());
    }

    #[tokio::test]
    async fn health_follows_flags() {
        let shared = Arc::new(Shared::new("127.0.0.1:80".parse().unwrap()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::new(shared.clone(), tx);

        assert!(conn.is_healthy());
        conn.close();
        assert!(matches!(rx.recv().await, Some(Command::Close)));

        conn.mark_broken();
        assert!(!conn.is_healthy());

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(Arc::new(Shared::new("127.0.0.1:80".parse().unwrap())), tx);
        drop(rx);
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(Command::Close),
            Err(Error::ConnectionClosed(_))
        ));
    }
}
