//! Configuration for the downstream client.

use std::sync::Arc;
use std::time::Duration;

/// Configuration for a [`StreamingClient`][crate::StreamingClient].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    /// How long a pooled connection may sit unused before it is closed.
    ///
    /// `None` (or a zero duration) disables the idle timeout.
    pub idle_timeout: Option<Duration>,

    /// The timeout for establishing a TCP connection to the downstream host.
    pub connect_timeout: Option<Duration>,

    /// Log every read and write on downstream connections at debug level.
    pub debug_pipeline_logging: bool,

    /// Wrap each downstream call in a trace sub-span unless the call overrides it.
    pub perform_subspan: bool,

    /// Log (at warn) response messages which arrive after the call finished.
    pub log_messages_after_call_finishes: bool,

    /// The maximum number of idle connections kept per resolved address.
    pub max_idle_per_host: usize,

    /// TCP socket options for new connections.
    pub tcp: TcpConfig,

    /// Trusted roots used for strict TLS validation.
    ///
    /// When `None`, the platform's native certificates are loaded.
    pub tls_roots: Option<Arc<rustls::RootCertStore>>,
}

impl ClientConfig {
    /// The idle timeout, treating a zero duration as disabled.
    pub(crate) fn effective_idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout.filter(|timeout| !timeout.is_zero())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(5)),
            connect_timeout: Some(Duration::from_secs(10)),
            debug_pipeline_logging: false,
            perform_subspan: true,
            log_messages_after_call_finishes: false,
            max_idle_per_host: 32,
            tcp: TcpConfig::default(),
            tls_roots: None,
        }
    }
}

/// Socket options applied to downstream TCP connections.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TcpConfig {
    /// The keep-alive idle time for the socket.
    pub keep_alive: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            keep_alive: Some(Duration::from_secs(90)),
            nodelay: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_idle_timeout_disables() {
        let mut config = ClientConfig::default();
        assert_eq!(config.effective_idle_timeout(), Some(Duration::from_secs(5)));

        config.idle_timeout = Some(Duration::ZERO);
        assert_eq!(config.effective_idle_timeout(), None);

        config.idle_timeout = None;
        assert_eq!(config.effective_idle_timeout(), None);
    }
}
