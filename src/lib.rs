//! Edgewire
//!
//! Pooled, streaming downstream HTTP/1.1 connections for edge proxies.
//!
//! The entry point is [`StreamingClient::stream_downstream_call`], which leases a
//! connection for a resolved address, prepares its pipeline for the call, writes
//! the request head, and hands back a [`StreamingChannel`] for the request body.
//! Response chunks are relayed to a [`StreamingCallback`] from the connection's
//! own task.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod breaker;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
mod error;

pub use client::streaming::{StreamingCallback, StreamingChannel};
pub use client::{DownstreamCall, StreamingClient};
pub use codec::{BodyChunk, ResponseChunk};
pub use config::ClientConfig;
pub use error::Error;

/// Boxed error type used for dynamic error sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
