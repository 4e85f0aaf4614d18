use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::breaker::BreakerOpen;
use crate::client::conn::ConnectionId;
use crate::codec::CodecError;
use crate::BoxError;

/// Downstream client error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The hostname could not be resolved into any IP address.
    #[error("unable to resolve hostname into IP address(es). hostname={hostname}")]
    HostnameResolution {
        /// The hostname which failed to resolve.
        hostname: String,

        /// The underlying lookup failure.
        #[source]
        source: io::Error,
    },

    /// A connection to the downstream host could not be established.
    #[error("unable to connect to downstream host: {host}")]
    Connect {
        /// The downstream host.
        host: String,

        /// The underlying connection failure.
        #[source]
        source: BoxError,
    },

    /// Preparing the leased connection for the call, or writing the request head, failed.
    #[error("{message}")]
    Setup {
        /// What was being done when the failure occured.
        message: &'static str,

        /// The underlying failure.
        #[source]
        source: BoxError,
    },

    /// A chunk was streamed after the downstream call finished.
    #[error("unable to stream chunk - downstream call is no longer active")]
    CallInactive,

    /// A chunk was streamed after the channel was closed due to an unrecoverable error.
    #[error("unable to stream chunks downstream - the channel was closed previously due to an unrecoverable error")]
    ClosedDueToUnrecoverableError,

    /// The connection task is gone, so nothing more can be written.
    #[error("downstream connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The active downstream call saw no traffic for longer than its timeout.
    #[error("downstream call timed out after {}ms without activity", .0.as_millis())]
    DownstreamCallTimeout(Duration),

    /// A pooled connection sat unused for longer than the idle timeout.
    #[error("downstream connection idle for longer than {}ms", .0.as_millis())]
    DownstreamIdleChannelTimeout(Duration),

    /// The downstream peer closed the connection while the call was still active.
    #[error("downstream connection {0} closed unexpectedly while the call was active")]
    DownstreamChannelClosedUnexpectedly(ConnectionId),

    /// An operating-system level I/O error surfaced from the socket.
    #[error("{message}")]
    NativeIo {
        /// Description of where the error was caught.
        message: &'static str,

        /// The raw I/O error.
        #[source]
        source: io::Error,
    },

    /// A non-OS I/O error surfaced from the transport (for example, a TLS failure).
    #[error("transport: {0}")]
    Transport(#[source] io::Error),

    /// The HTTP codec rejected a message.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// The circuit breaker refused the call.
    #[error(transparent)]
    CircuitOpen(#[from] BreakerOpen),
}

impl Error {
    pub(crate) fn setup<E>(message: &'static str, error: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Setup {
            message,
            source: error.into(),
        }
    }

    /// Classify an I/O error raised inside the connection pipeline.
    ///
    /// Errors carrying an OS error code are wrapped so they read as a downstream
    /// failure rather than an opaque socket fault.
    pub(crate) fn from_pipeline_io(error: io::Error) -> Self {
        if error.raw_os_error().is_some() {
            Error::NativeIo {
                message: "caught a native I/O error in the downstream streaming call pipeline",
                source: error,
            }
        } else {
            Error::Transport(error)
        }
    }

    /// Returns `true` if this error came from one of the connection timeout guards.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::DownstreamCallTimeout(_) | Error::DownstreamIdleChannelTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: std::error::Error, Send, Sync, Into<BoxError>);

    #[test]
    fn os_errors_are_wrapped() {
        let error = Error::from_pipeline_io(io::Error::from_raw_os_error(104));
        assert!(matches!(error, Error::NativeIo { .. }));
        assert!(std::error::Error::source(&error).is_some());

        let error = Error::from_pipeline_io(io::Error::new(io::ErrorKind::InvalidData, "tls"));
        assert!(matches!(error, Error::Transport(_)));
    }

    #[test]
    fn timeout_display() {
        let error = Error::DownstreamCallTimeout(Duration::from_millis(250));
        assert_eq!(
            error.to_string(),
            "downstream call timed out after 250ms without activity"
        );
        assert!(error.is_timeout());
        assert!(!Error::CallInactive.is_timeout());
    }
}
