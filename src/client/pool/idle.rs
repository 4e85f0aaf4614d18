use std::time::{Duration, Instant};

use tracing::trace;

use super::PoolableConnection;

#[derive(Debug)]
struct Idle<T> {
    at: Instant,
    inner: T,
}

impl<T> Idle<T> {
    fn new(inner: T) -> Self {
        Self {
            at: Instant::now(),
            inner,
        }
    }
}

/// Idle connections for one address, most recently returned last.
#[derive(Debug)]
pub(super) struct IdleConnections<T> {
    inner: Vec<Idle<T>>,
}

impl<T> Default for IdleConnections<T> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}

impl<T> IdleConnections<T> {
    pub(super) fn push(&mut self, inner: T) {
        self.inner.push(Idle::new(inner));
    }

    /// Pop the most recently returned connection which is still open.
    ///
    /// Closed connections found along the way are dropped.
    pub(super) fn pop(&mut self) -> Option<(T, Duration)>
    where
        T: PoolableConnection,
    {
        if !self.is_empty() {
            trace!("checking {} idle connections", self.len());
        }

        while let Some(entry) = self.inner.pop() {
            if entry.inner.is_open() {
                trace!("found idle connection");
                return Some((entry.inner, entry.at.elapsed()));
            }
            trace!("found closed connection");
        }

        None
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
