//! Idle and call timeouts for a connection.
//!
//! The idle timer runs only while a connection sits in the pool. Leasing the
//! connection and the idle timer firing race each other, so both go through
//! [`IdleLifecycle`]: a single atomic word holding the lifecycle state and a
//! generation number which changes every time the connection is returned to
//! the pool. An expiry carries the generation it was armed for, and only wins
//! if the connection is still idle in that same generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

const LEASED: u64 = 0;
const IDLE: u64 = 1;
const CLOSED: u64 = 2;
const STATE_MASK: u64 = 0b11;

fn pack(generation: u64, state: u64) -> u64 {
    (generation << 2) | state
}

fn generation(word: u64) -> u64 {
    word >> 2
}

fn state(word: u64) -> u64 {
    word & STATE_MASK
}

#[derive(Debug)]
pub(crate) struct IdleLifecycle {
    word: AtomicU64,
}

impl IdleLifecycle {
    /// New connections start out leased.
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU64::new(pack(0, LEASED)),
        }
    }

    /// Move into the idle state under a new generation, returned as the epoch.
    ///
    /// Returns `None` once the connection is closed.
    pub(crate) fn arm(&self) -> Option<u64> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if state(current) == CLOSED {
                return None;
            }

            let epoch = generation(current) + 1;
            match self.word.compare_exchange_weak(
                current,
                pack(epoch, IDLE),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(epoch),
                Err(actual) => current = actual,
            }
        }
    }

    /// Take the connection out of the idle state for a lease.
    ///
    /// Returns `false` if the connection was not idle, which means the idle
    /// timer already claimed it.
    pub(crate) fn disarm(&self) -> bool {
        let current = self.word.load(Ordering::Acquire);
        if state(current) != IDLE {
            return false;
        }

        self.word
            .compare_exchange(
                current,
                pack(generation(current), LEASED),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claim an idle connection for closing on behalf of the timer armed at `epoch`.
    pub(crate) fn expire(&self, epoch: u64) -> bool {
        self.word
            .compare_exchange(
                pack(epoch, IDLE),
                pack(epoch, CLOSED),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn is_idle_at(&self, epoch: u64) -> bool {
        self.word.load(Ordering::Acquire) == pack(epoch, IDLE)
    }

    pub(crate) fn close(&self) {
        let mut current = self.word.load(Ordering::Acquire);
        while state(current) != CLOSED {
            match self.word.compare_exchange_weak(
                current,
                pack(generation(current), CLOSED),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// The idle timer stage, armed for one idle generation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IdleTimer {
    pub(crate) epoch: u64,
    pub(crate) timeout: Duration,
    pub(crate) deadline: Instant,
}

impl IdleTimer {
    pub(crate) fn new(epoch: u64, timeout: Duration) -> Self {
        Self {
            epoch,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }
}

/// The call timer stage. Measures inactivity: every read and write restarts it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallTimer {
    pub(crate) timeout: Duration,
    pub(crate) deadline: Instant,
}

impl CallTimer {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }
}
