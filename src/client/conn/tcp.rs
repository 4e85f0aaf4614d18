//! Opening TCP sockets to downstream addresses.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tracing::{warn, Instrument};

use crate::config::TcpConfig;

/// Open a socket to `addr` with `config` applied, returning a future which
/// resolves once the connection is established.
#[tracing::instrument(skip(connect_timeout, config), level = "debug")]
pub(crate) fn connect(
    addr: &SocketAddr,
    connect_timeout: Option<Duration>,
    config: &TcpConfig,
) -> io::Result<impl Future<Output = io::Result<TcpStream>>> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let domain = Domain::for_address(*addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    tracing::trace!("tcp socket opened");

    let guard = tracing::trace_span!("socket_options").entered();

    // Tokio requires O_NONBLOCK on sockets it adopts.
    socket.set_nonblocking(true)?;

    if let Some(dur) = config.keep_alive {
        let conf = TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket.set_tcp_keepalive(&conf) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    if let Err(e) = socket.set_nodelay(config.nodelay) {
        warn!("tcp set_nodelay error: {}", e);
    }

    let socket = TcpSocket::from_std_stream(std::net::TcpStream::from(socket));

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_recv_buffer_size error: {}", e);
        }
    }

    drop(guard);

    let span = tracing::trace_span!("tcp", remote.addr = %addr);
    let connect = socket.connect(*addr).instrument(span);
    Ok(async move {
        match connect_timeout {
            Some(dur) => match tokio::time::timeout(dur, connect).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::trace!(timeout=?dur, "connection timed out");
                    Err(io::Error::new(io::ErrorKind::TimedOut, e))
                }
            },
            None => connect.await,
        }
    })
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn connect_applies_nodelay() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = TcpConfig::default();
        let connecting = connect(&addr, Some(Duration::from_secs(1)), &config).unwrap();
        let (stream, accepted) = tokio::join!(connecting, listener.accept());

        let stream = stream.unwrap();
        assert!(accepted.is_ok());
        assert!(stream.nodelay().unwrap());
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(&addr, Some(Duration::from_secs(1)), &TcpConfig::default())
            .unwrap()
            .await;
        assert!(result.is_err());
    }
}
