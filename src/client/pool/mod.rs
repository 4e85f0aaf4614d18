//! Connection pooling keyed by resolved address.
//!
//! The pool map holds one [`AddressPool`] per resolved socket address, created
//! the first time that address is used and kept for the life of the map. Each
//! address pool keeps a LIFO set of idle connections. Leasing prefers an idle
//! connection which passes the codec inspection, the idle-guard disarm, and
//! the health check, in that order; otherwise a new socket is opened.
//!
//! Connections are returned with [`AddressPool::release`], which either parks
//! them (arming their idle guard) or closes them when they are broken.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, trace};

mod idle;
mod weakopt;

use self::idle::IdleConnections;
pub(crate) use self::weakopt::WeakOpt;

use super::conn::{driver, tcp, Command, Connection};
use super::pipeline::PipelineSettings;
use crate::codec::inspect;
use crate::config::TcpConfig;
use crate::error::Error;

static FALLBACK_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// A connection which can sit in the idle set.
pub(crate) trait PoolableConnection {
    /// Returns `true` while the underlying socket is open.
    fn is_open(&self) -> bool;
}

impl PoolableConnection for Connection {
    fn is_open(&self) -> bool {
        Connection::is_open(self)
    }
}

/// Settings shared by every address pool in a map.
#[derive(Debug)]
pub(crate) struct PoolSettings {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) tcp: TcpConfig,
    pub(crate) max_idle_per_host: usize,
    pub(crate) pipeline: Arc<PipelineSettings>,
}

/// Connection counts for one resolved address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStats {
    /// New sockets opened.
    pub created: u64,

    /// Leases served by an idle connection.
    pub reused: u64,

    /// Connections handed back to the pool.
    pub released: u64,

    /// Connections the pool closed instead of keeping.
    pub closed: u64,

    /// Connections currently idle.
    pub idle: usize,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
    closed: AtomicU64,
}

/// The pool map: one [`AddressPool`] per resolved address.
#[derive(Debug)]
pub(crate) struct ConnectionPool {
    pools: Mutex<HashMap<SocketAddr, Arc<AddressPool>>>,
    settings: Arc<PoolSettings>,
    runtime: OnceLock<Handle>,
}

impl ConnectionPool {
    pub(crate) fn new(settings: PoolSettings) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            settings: Arc::new(settings),
            runtime: OnceLock::new(),
        }
    }

    /// The runtime which drives this map's connections, selected on first use.
    pub(crate) fn runtime(&self) -> Result<Handle, Error> {
        if let Some(handle) = self.runtime.get() {
            return Ok(handle.clone());
        }

        let handle = select_runtime()?;
        Ok(self.runtime.get_or_init(|| handle).clone())
    }

    /// The pool for `address`, created if this is the first time it is used.
    pub(crate) fn get(&self, address: SocketAddr) -> Result<Arc<AddressPool>, Error> {
        let runtime = self.runtime()?;
        let mut pools = self.pools.lock();
        let pool = pools.entry(address).or_insert_with(|| {
            debug!(%address, "creating connection pool for address");
            Arc::new(AddressPool::new(address, self.settings.clone(), runtime))
        });
        Ok(pool.clone())
    }

    pub(crate) fn stats(&self, address: SocketAddr) -> Option<PoolStats> {
        self.pools.lock().get(&address).map(|pool| pool.stats())
    }
}

fn select_runtime() -> Result<Handle, Error> {
    if let Ok(handle) = Handle::try_current() {
        info!(
            flavor = ?handle.runtime_flavor(),
            "downstream connections will run on the current tokio runtime"
        );
        return Ok(handle);
    }

    if let Some(runtime) = FALLBACK_RUNTIME.get() {
        return Ok(runtime.handle().clone());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("edgewire-downstream")
        .enable_all()
        .build()
        .map_err(|error| Error::setup("unable to start downstream connection runtime", error))?;
    info!("no tokio runtime is running, downstream connections will run on a dedicated runtime");
    Ok(FALLBACK_RUNTIME.get_or_init(|| runtime).handle().clone())
}

/// Connections to a single resolved address.
#[derive(Debug)]
pub(crate) struct AddressPool {
    address: SocketAddr,
    idle: Mutex<IdleConnections<Connection>>,
    settings: Arc<PoolSettings>,
    runtime: Handle,
    counters: Counters,
}

impl AddressPool {
    fn new(address: SocketAddr, settings: Arc<PoolSettings>, runtime: Handle) -> Self {
        Self {
            address,
            idle: Mutex::new(IdleConnections::default()),
            settings,
            runtime,
            counters: Counters::default(),
        }
    }

    /// Lease a connection, reusing an idle one when possible.
    #[tracing::instrument(skip(self), fields(address = %self.address), level = "debug")]
    pub(crate) async fn lease(&self) -> Result<Connection, Error> {
        loop {
            let candidate = self.idle.lock().pop();
            let Some((conn, idle_for)) = candidate else {
                break;
            };

            if inspect(conn.probe()).is_stuck() {
                conn.mark_broken();
            }

            if !conn.shared().lifecycle().disarm() {
                trace!(conn = %conn.id(), "idle connection already expired");
                self.discard(conn);
                continue;
            }

            if !conn.is_healthy() {
                trace!(conn = %conn.id(), broken = conn.is_broken(), "idle connection failed health check");
                self.discard(conn);
                continue;
            }

            self.counters.reused.fetch_add(1, Ordering::Relaxed);
            let idle_ms = u64::try_from(idle_for.as_millis()).unwrap_or(u64::MAX);
            debug!(conn = %conn.id(), idle_ms, "reusing idle connection");
            return Ok(conn);
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<Connection, Error> {
        let address = self.address;
        let timeout = self.settings.connect_timeout;
        let config = self.settings.tcp.clone();

        let connected = self
            .runtime
            .spawn(async move { tcp::connect(&address, timeout, &config)?.await })
            .await
            .map_err(|error| Error::Connect {
                host: address.to_string(),
                source: error.into(),
            })?;

        let stream = connected.map_err(|error| Error::Connect {
            host: address.to_string(),
            source: error.into(),
        })?;

        let conn = driver::spawn(
            &self.runtime,
            stream,
            address,
            self.settings.pipeline.clone(),
        );
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(conn = %conn.id(), "opened new downstream connection");
        Ok(conn)
    }

    /// Return a connection to the pool.
    ///
    /// Broken, closed, or stuck connections are closed. Healthy ones have
    /// their idle guard armed and join the idle set, unless it is full.
    pub(crate) fn release(&self, conn: Connection) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        if inspect(conn.probe()).is_stuck() {
            conn.mark_broken();
        }

        if !conn.is_healthy() {
            trace!(conn = %conn.id(), "closing unhealthy connection on release");
            self.discard(conn);
            return;
        }

        let Some(epoch) = conn.shared().lifecycle().arm() else {
            self.discard(conn);
            return;
        };

        let mut idle = self.idle.lock();
        if idle.len() >= self.settings.max_idle_per_host {
            drop(idle);
            trace!(conn = %conn.id(), "idle set is full");
            self.discard(conn);
            return;
        }

        if conn.send(Command::EnterIdle { epoch }).is_err() {
            drop(idle);
            self.discard(conn);
            return;
        }

        trace!(conn = %conn.id(), epoch, "connection returned to idle set");
        idle.push(conn);
    }

    /// Mark a connection broken and return it, so the pool closes it.
    pub(crate) fn release_and_close(&self, conn: Connection) {
        conn.mark_broken();
        self.release(conn);
    }

    fn discard(&self, conn: Connection) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        conn.close();
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
        }
    }
}
