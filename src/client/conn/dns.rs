//! DNS resolution for downstream hosts.
//!
//! Resolution is never cached: every call performs a fresh lookup, and when
//! a host resolves to several addresses one of them is picked uniformly at
//! random, which spreads load across all of a host's addresses.

use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::{fmt, io};

use pin_project::{pin_project, pinned_drop};
use rand::seq::SliceRandom as _;
use tokio::task::JoinHandle;

/// A hostname and port to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name {
    host: Box<str>,
    port: u16,
}

impl Name {
    /// Create a new name to resolve.
    pub fn new(host: impl Into<Box<str>>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The hostname, without IPv6 brackets.
    pub fn host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// All of the addresses a name resolved to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketAddrs(Vec<SocketAddr>);

impl SocketAddrs {
    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no addresses.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pick one address uniformly at random.
    pub fn choose<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Option<SocketAddr> {
        self.0.choose(rng).copied()
    }
}

impl FromIterator<SocketAddr> for SocketAddrs {
    fn from_iter<T: IntoIterator<Item = SocketAddr>>(iter: T) -> Self {
        SocketAddrs(iter.into_iter().collect())
    }
}

impl From<Vec<SocketAddr>> for SocketAddrs {
    fn from(addrs: Vec<SocketAddr>) -> Self {
        SocketAddrs(addrs)
    }
}

impl IntoIterator for SocketAddrs {
    type Item = SocketAddr;
    type IntoIter = std::vec::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// GetAddrInfo based resolver.
///
/// This resolver uses the `getaddrinfo` system call on tokio's blocking
/// worker pool, so it must be called from within a tokio runtime context.
#[derive(Debug, Default, Clone)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl tower::Service<Name> for GaiResolver {
    type Response = SocketAddrs;
    type Error = io::Error;
    type Future = JoinHandleFuture<SocketAddrs>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let span = tracing::Span::current();
        JoinHandleFuture {
            handle: tokio::task::spawn_blocking(move || {
                tracing::trace_span!(parent: &span, "getaddrinfo", %name).in_scope(|| {
                    tracing::trace!("dns resolution starting");
                    (name.host(), name.port())
                        .to_socket_addrs()
                        .map(SocketAddrs::from_iter)
                })
            }),
        }
    }
}

/// Future returned by [`GaiResolver`], which aborts the lookup when dropped.
#[pin_project(PinnedDrop)]
pub struct JoinHandleFuture<Addr> {
    #[pin]
    handle: JoinHandle<Result<Addr, io::Error>>,
}

impl<Addr> fmt::Debug for JoinHandleFuture<Addr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaiFuture").finish()
    }
}

impl<Addr> Future for JoinHandleFuture<Addr> {
    type Output = Result<Addr, io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().handle.poll(cx)) {
            Ok(Ok(addrs)) => Poll::Ready(Ok(addrs)),
            Ok(Err(error)) => Poll::Ready(Err(error)),
            Err(join_err) => {
                if join_err.is_cancelled() {
                    Poll::Ready(Err(io::Error::new(io::ErrorKind::Interrupted, join_err)))
                } else {
                    Poll::Ready(Err(io::Error::other(join_err)))
                }
            }
        }
    }
}

#[pinned_drop]
impl<Addr> PinnedDrop for JoinHandleFuture<Addr> {
    fn drop(self: Pin<&mut Self>) {
        self.handle.abort()
    }
}

/// Wraps a resolver which returns every address for a name, and picks one
/// of them uniformly at random.
#[derive(Debug, Clone)]
pub struct RandomAddrResolver<R> {
    inner: R,
}

impl<R> RandomAddrResolver<R> {
    /// Create a new `RandomAddrResolver`.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R> tower::Service<Name> for RandomAddrResolver<R>
where
    R: tower::Service<Name, Response = SocketAddrs, Error = io::Error>,
{
    type Response = SocketAddr;
    type Error = io::Error;
    type Future = RandomAddrFuture<R::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        RandomAddrFuture {
            inner: self.inner.call(name),
        }
    }
}

/// Future returned by [`RandomAddrResolver`].
#[pin_project]
#[derive(Debug)]
pub struct RandomAddrFuture<F> {
    #[pin]
    inner: F,
}

impl<F> Future for RandomAddrFuture<F>
where
    F: Future<Output = Result<SocketAddrs, io::Error>>,
{
    type Output = Result<SocketAddr, io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let addrs = ready!(self.project().inner.poll(cx))?;
        if addrs.len() > 1 {
            tracing::trace!(candidates = addrs.len(), "choosing random address");
        }
        Poll::Ready(addrs.choose(&mut rand::thread_rng()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address found")
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tower::ServiceExt as _;

    use super::*;

    fn addrs(n: u8) -> SocketAddrs {
        (1..=n)
            .map(|i| SocketAddr::from(([10, 0, 0, i], 8080)))
            .collect()
    }

    #[tokio::test]
    async fn gai_resolves_localhost() {
        let addrs = GaiResolver::new()
            .oneshot(Name::new("localhost", 8080))
            .await
            .unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.into_iter().all(|addr| addr.port() == 8080));
    }

    #[tokio::test]
    async fn gai_strips_brackets() {
        let name = Name::new("[::1]", 443);
        assert_eq!(name.host(), "::1");

        let addrs = GaiResolver::new().oneshot(name).await.unwrap();
        assert_eq!(addrs.len(), 1);
    }

    #[tokio::test]
    async fn empty_result_is_an_error() {
        let resolver = RandomAddrResolver::new(tower::service_fn(|_: Name| async {
            Ok::<_, io::Error>(SocketAddrs::default())
        }));
        let error = resolver
            .oneshot(Name::new("nowhere.invalid", 80))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[tokio::test]
    async fn spreads_load_across_addresses() {
        let candidates = addrs(4);
        let resolver = RandomAddrResolver::new(tower::service_fn(move |_: Name| {
            let candidates = candidates.clone();
            async move { Ok::<_, io::Error>(candidates) }
        }));

        let mut seen: HashMap<SocketAddr, usize> = HashMap::new();
        for _ in 0..4000 {
            let addr = resolver
                .clone()
                .oneshot(Name::new("multi.example", 8080))
                .await
                .unwrap();
            *seen.entry(addr).or_default() += 1;
        }

        assert_eq!(seen.len(), 4);
        for count in seen.values() {
            assert!((700..=1300).contains(count), "uneven spread: {seen:?}");
        }
    }
}
