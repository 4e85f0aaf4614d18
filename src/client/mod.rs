//! Streaming downstream client.
//!
//! [`StreamingClient::stream_downstream_call`] resolves the downstream host,
//! leases a pooled connection for the chosen address, prepares the
//! connection's pipeline for the call and writes the request head. The
//! returned [`StreamingChannel`] streams the request body, while the response
//! is relayed to a [`StreamingCallback`] from the connection's own task.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use edgewire::{DownstreamCall, StreamingCallback, StreamingClient, ResponseChunk, Error};
//! # struct Printer;
//! # impl StreamingCallback for Printer {
//! #     fn message_received(&self, chunk: ResponseChunk) { println!("{chunk:?}") }
//! #     fn unrecoverable_error_occurred(&self, error: Error, _: bool) { eprintln!("{error}") }
//! # }
//! # async fn run() -> Result<(), Error> {
//! let client = StreamingClient::builder().build();
//! let head = http::Request::get("/status").body(()).unwrap();
//! let channel = client
//!     .stream_downstream_call(DownstreamCall::new("example.com", 80, head), Arc::new(Printer))
//!     .await?;
//! channel.stream_chunk(edgewire::BodyChunk::empty_last()).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::{HeaderValue, HOST};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tower::{Service, ServiceExt as _};
use tracing::debug;

use self::conn::dns::{GaiResolver, Name, RandomAddrResolver, SocketAddrs};
use self::conn::tls::TlsConfigs;
use self::conn::{CallState, Command, Connection};
use self::pipeline::{CallParams, CallRelay, CallSetup, Lease, PipelineSettings};
use self::pool::{AddressPool, ConnectionPool, PoolSettings, WeakOpt};
use self::streaming::StreamingCallback;
use crate::breaker::{CircuitBreaker, Outcome};
use crate::config::ClientConfig;
use crate::context::{CallContext, Tracer};
use crate::error::Error;
use crate::StreamingChannel;

pub mod conn;
pub(crate) mod pipeline;
pub(crate) mod pool;
pub mod streaming;

pub use self::pool::PoolStats;

/// One downstream call: where it goes, its request head, and how to run it.
#[derive(Debug)]
pub struct DownstreamCall {
    host: String,
    port: u16,
    head: http::Request<()>,
    is_secure: bool,
    relaxed_tls: bool,
    call_timeout: Option<Duration>,
    want_subspan: Option<bool>,
    context: CallContext,
}

impl DownstreamCall {
    /// A plain HTTP call to `host:port`.
    ///
    /// The caller's current context is captured here, and is the context the
    /// call runs in.
    pub fn new(host: impl Into<String>, port: u16, head: http::Request<()>) -> Self {
        Self {
            host: host.into(),
            port,
            head,
            is_secure: false,
            relaxed_tls: false,
            call_timeout: None,
            want_subspan: None,
            context: CallContext::capture(),
        }
    }

    /// Use TLS for this call.
    pub fn secure(mut self, is_secure: bool) -> Self {
        self.is_secure = is_secure;
        self
    }

    /// Skip certificate chain and hostname validation for this call's TLS handshake.
    pub fn relaxed_tls(mut self, relaxed: bool) -> Self {
        self.relaxed_tls = relaxed;
        self
    }

    /// Fail the call if it sees no traffic for `timeout`. Zero disables the timeout.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Override the client's [`perform_subspan`][ClientConfig::perform_subspan] setting.
    pub fn want_subspan(mut self, want: bool) -> Self {
        self.want_subspan = Some(want);
        self
    }

    /// Run the call in `context` instead of the one captured by [`DownstreamCall::new`].
    pub fn with_context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }
}

/// A builder for a [`StreamingClient`].
#[derive(Debug)]
pub struct Builder<R = GaiResolver> {
    config: ClientConfig,
    resolver: R,
    breaker: Option<Arc<dyn CircuitBreaker>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// A builder with the default configuration and the system resolver.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            resolver: GaiResolver::new(),
            breaker: None,
        }
    }
}

impl<R> Builder<R> {
    /// Use the provided configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve hostnames with `resolver` instead of the system resolver.
    ///
    /// The resolver returns every address for a name; the client picks one
    /// of them at random for each call.
    pub fn with_resolver<R2>(self, resolver: R2) -> Builder<R2> {
        Builder {
            config: self.config,
            resolver,
            breaker: self.breaker,
        }
    }

    /// Consult `breaker` before every call, and report each call's outcome to it.
    pub fn with_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Build the client.
    pub fn build(self) -> StreamingClient<R> {
        let config = Arc::new(self.config);
        let pipeline = Arc::new(PipelineSettings {
            debug_logging: config.debug_pipeline_logging,
            idle_timeout: config.effective_idle_timeout(),
            tls: Arc::new(TlsConfigs::new(config.tls_roots.clone())),
        });

        let pool = ConnectionPool::new(PoolSettings {
            connect_timeout: config.connect_timeout,
            tcp: config.tcp.clone(),
            max_idle_per_host: config.max_idle_per_host,
            pipeline,
        });

        StreamingClient {
            inner: Arc::new(ClientRef {
                resolver: RandomAddrResolver::new(self.resolver),
                pool,
                config,
                breaker: self.breaker,
            }),
        }
    }
}

struct ClientRef<R> {
    resolver: RandomAddrResolver<R>,
    pool: ConnectionPool,
    config: Arc<ClientConfig>,
    breaker: Option<Arc<dyn CircuitBreaker>>,
}

/// A client for streaming calls to downstream HTTP/1.1 hosts.
///
/// Cloning the client is cheap, and clones share the same connection pools.
pub struct StreamingClient<R = GaiResolver> {
    inner: Arc<ClientRef<R>>,
}

impl<R> Clone for StreamingClient<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> fmt::Debug for StreamingClient<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingClient")
            .field("config", &self.inner.config)
            .field("breaker", &self.inner.breaker)
            .finish()
    }
}

impl Default for StreamingClient {
    fn default() -> Self {
        Builder::new().build()
    }
}

impl StreamingClient {
    /// Create a new builder with default settings applied.
    pub fn builder() -> Builder {
        Builder::new()
    }
}

impl<R> StreamingClient<R>
where
    R: Service<Name, Response = SocketAddrs, Error = io::Error> + Clone + Send + Sync + 'static,
    R::Future: Send,
{
    /// Start a streaming call to a downstream host.
    ///
    /// Resolves the host, leases a connection for the chosen address, prepares
    /// its pipeline and writes the request head. The returned channel streams
    /// the request body; response chunks go to `callback`.
    ///
    /// If this future is dropped before it completes, the leased connection is
    /// closed.
    pub async fn stream_downstream_call(
        &self,
        call: DownstreamCall,
        callback: Arc<dyn StreamingCallback>,
    ) -> Result<StreamingChannel, Error> {
        let started = Instant::now();
        let DownstreamCall {
            host,
            port,
            mut head,
            is_secure,
            relaxed_tls,
            call_timeout,
            want_subspan,
            context: caller,
        } = call;

        set_host_header(&mut head, &host, port, is_secure)?;

        if let Some(breaker) = &self.inner.breaker {
            breaker.allow()?;
        }

        let runtime = self.inner.pool.runtime()?;
        let address = self.resolve(&host, port, &runtime).await?;
        let pool = self.inner.pool.get(address)?;
        let conn = pool.lease().await?;
        let id = conn.id();

        let call_state = Arc::new(CallState::new());
        let guard = LeaseGuard::new(conn.clone(), call_state.clone(), pool.clone());

        let performed_subspan = want_subspan.unwrap_or(self.inner.config.perform_subspan);
        let context = caller.in_scope(|| {
            if performed_subspan {
                let name = format!(
                    "async_downstream_call-{}_{}:{}{}",
                    head.method(),
                    host,
                    port,
                    head.uri()
                );
                if Tracer::current_span().is_some() {
                    Tracer::start_sub_span(name);
                } else {
                    Tracer::start_request_with_root_span(name);
                }
            }

            if let Some(span) = Tracer::current_span() {
                span.propagate(head.headers_mut());
            }

            let span = tracing::debug_span!(
                "downstream_call",
                conn = %id,
                method = %head.method(),
                uri = %head.uri(),
                %host,
                port
            );
            CallContext::new(Tracer::current_span_stack_copy(), span)
        });

        let relay = CallRelay::new(
            call_state.clone(),
            Lease::new(conn.clone(), WeakOpt::downgrade(&pool)),
            callback,
            context.clone(),
            performed_subspan,
            self.inner.breaker.clone(),
            self.inner.config.log_messages_after_call_finishes,
        );

        let params = CallParams {
            setup: CallSetup {
                host,
                is_secure,
                relaxed_tls,
                call_timeout,
            },
            head,
            relay,
        };

        match begin(&conn, params).await {
            Ok(()) => {
                guard.keep();
                context.in_scope(|| {
                    debug!(
                        setup_micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
                        "downstream call set up"
                    )
                });
                Ok(StreamingChannel::new(conn, call_state, context))
            }
            Err(error) => {
                context.in_scope(|| {
                    if performed_subspan {
                        pipeline::finish_call_span();
                    }
                    debug!("unable to set up downstream call: {error}");
                });
                if let Some(breaker) = &self.inner.breaker {
                    breaker.report(Outcome::Failure);
                }
                drop(guard);
                Err(error)
            }
        }
    }

    /// Connection counts for a resolved address, if the client has connected to it.
    pub fn pool_stats(&self, address: SocketAddr) -> Option<PoolStats> {
        self.inner.pool.stats(address)
    }

    async fn resolve(&self, host: &str, port: u16, runtime: &Handle) -> Result<SocketAddr, Error> {
        let failed = |source| Error::HostnameResolution {
            hostname: host.to_owned(),
            source,
        };

        let mut resolver = self.inner.resolver.clone();
        let resolver = resolver.ready().await.map_err(failed)?;

        // The system resolver spawns its lookup, so it needs a runtime context.
        let lookup = {
            let _entered = runtime.enter();
            resolver.call(Name::new(host, port))
        };

        let address = lookup.await.map_err(failed)?;
        debug!(%host, %address, "resolved downstream host");
        Ok(address)
    }
}

/// Send the call's setup to the connection task and wait for the head to be written.
async fn begin(conn: &Connection, params: CallParams) -> Result<(), Error> {
    let (reply, receiver) = oneshot::channel();
    conn.send(Command::Begin {
        params: Box::new(params),
        reply,
    })?;

    receiver
        .await
        .unwrap_or(Err(Error::ConnectionClosed(conn.id())))
}

/// Holds a leased connection until setup succeeds.
///
/// Dropped without [`LeaseGuard::keep`], the guard deactivates the call. If
/// that deactivation wins, nothing else released the connection, so it is
/// marked broken and released here and the pool closes it.
struct LeaseGuard {
    conn: Option<Connection>,
    call: Arc<CallState>,
    pool: Arc<AddressPool>,
}

impl LeaseGuard {
    fn new(conn: Connection, call: Arc<CallState>, pool: Arc<AddressPool>) -> Self {
        Self {
            conn: Some(conn),
            call,
            pool,
        }
    }

    fn keep(mut self) {
        self.conn = None;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.call.deactivate() {
                self.pool.release_and_close(conn);
            }
        }
    }
}

fn set_host_header(
    head: &mut http::Request<()>,
    host: &str,
    port: u16,
    is_secure: bool,
) -> Result<(), Error> {
    let value = host_header_value(host, port, is_secure);
    let value = HeaderValue::from_str(&value)
        .map_err(|error| Error::setup("invalid downstream host for Host header", error))?;
    head.headers_mut().insert(HOST, value);
    Ok(())
}

fn host_header_value(host: &str, port: u16, is_secure: bool) -> String {
    let default_port = if is_secure { 443 } else { 80 };
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_owned()
    };

    if port == default_port {
        host
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::breaker::BreakerOpen;
    use crate::codec::ResponseChunk;

    assert_impl_all!(StreamingClient: Send, Sync, Clone);
    assert_impl_all!(DownstreamCall: Send);

    #[test]
    fn host_header_omits_default_port() {
        assert_eq!(host_header_value("example.com", 80, false), "example.com");
        assert_eq!(host_header_value("example.com", 443, true), "example.com");
        assert_eq!(host_header_value("example.com", 443, false), "example.com:443");
        assert_eq!(host_header_value("example.com", 8080, true), "example.com:8080");
        assert_eq!(host_header_value("::1", 8080, false), "[::1]:8080");
        assert_eq!(host_header_value("[::1]", 80, false), "[::1]");
    }

    #[test]
    fn host_header_replaces_existing() {
        let mut head = http::Request::get("/")
            .header(HOST, "stale.example")
            .body(())
            .unwrap();
        set_host_header(&mut head, "fresh.example", 8443, true).unwrap();
        assert_eq!(head.headers()[HOST], "fresh.example:8443");
        assert_eq!(head.headers().get_all(HOST).iter().count(), 1);
    }

    struct Ignore;

    impl StreamingCallback for Ignore {
        fn message_received(&self, _chunk: ResponseChunk) {}
        fn unrecoverable_error_occurred(&self, _error: Error, _guaranteed: bool) {}
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn call_future_is_send() {
        let client = StreamingClient::builder().build();
        let head = http::Request::get("/").body(()).unwrap();
        let future = client.stream_downstream_call(DownstreamCall::new("localhost", 80, head), Arc::new(Ignore));
        assert_send(&future);
    }

    #[tokio::test]
    async fn empty_resolution_fails() {
        let _ = tracing_subscriber::fmt::try_init();
        let lookups = Arc::new(AtomicUsize::new(0));
        let counter = lookups.clone();
        let resolver = tower::service_fn(move |_name: Name| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, io::Error>(SocketAddrs::default()) }
        });

        let client = StreamingClient::builder().with_resolver(resolver).build();
        let head = http::Request::get("/").body(()).unwrap();
        let result = client
            .stream_downstream_call(DownstreamCall::new("nowhere.invalid", 80, head), Arc::new(Ignore))
            .await;

        assert!(matches!(result, Err(Error::HostnameResolution { ref hostname, .. }) if hostname == "nowhere.invalid"));
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug)]
    struct Open;

    impl CircuitBreaker for Open {
        fn allow(&self) -> Result<(), BreakerOpen> {
            Err(BreakerOpen::new("too many failures"))
        }

        fn report(&self, _outcome: Outcome) {}
    }

    #[tokio::test]
    async fn open_breaker_skips_resolution() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let counter = lookups.clone();
        let resolver = tower::service_fn(move |_name: Name| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, io::Error>(SocketAddrs::default()) }
        });

        let client = StreamingClient::builder()
            .with_resolver(resolver)
            .with_breaker(Arc::new(Open))
            .build();
        let head = http::Request::get("/").body(()).unwrap();
        let result = client
            .stream_downstream_call(DownstreamCall::new("example.com", 80, head), Arc::new(Ignore))
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen(_))));
        assert_eq!(lookups.load(Ordering::SeqCst), 0);
    }

    async fn leased() -> (Arc<AddressPool>, Connection) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let map = ConnectionPool::new(PoolSettings {
            connect_timeout: Some(Duration::from_secs(1)),
            tcp: crate::config::TcpConfig::default(),
            max_idle_per_host: 4,
            pipeline: Arc::new(PipelineSettings {
                debug_logging: false,
                idle_timeout: None,
                tls: Arc::new(TlsConfigs::new(None)),
            }),
        });
        let pool = map.get(addr).unwrap();
        let conn = pool.lease().await.unwrap();
        (pool, conn)
    }

    #[tokio::test]
    async fn lease_guard_closes_abandoned_setup() {
        let _ = tracing_subscriber::fmt::try_init();
        let (pool, conn) = leased().await;
        let call = Arc::new(CallState::new());

        drop(LeaseGuard::new(conn.clone(), call.clone(), pool.clone()));

        assert!(!call.is_active());
        assert!(conn.is_broken());
        let stats = pool.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.closed, 1);
    }

    #[tokio::test]
    async fn lease_guard_leaves_release_to_whoever_deactivated() {
        let _ = tracing_subscriber::fmt::try_init();
        let (pool, conn) = leased().await;
        let call = Arc::new(CallState::new());
        assert!(call.deactivate());

        drop(LeaseGuard::new(conn.clone(), call, pool.clone()));

        assert!(!conn.is_broken());
        assert_eq!(pool.stats().released, 0);
    }

    #[tokio::test]
    async fn kept_lease_guard_releases_nothing() {
        let (pool, conn) = leased().await;
        let call = Arc::new(CallState::new());

        LeaseGuard::new(conn, call.clone(), pool.clone()).keep();

        assert!(call.is_active());
        assert_eq!(pool.stats().released, 0);
    }
}
