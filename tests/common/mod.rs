//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use edgewire::client::conn::dns::{Name, SocketAddrs};
use edgewire::{Error, ResponseChunk, StreamingCallback};
use http_body_util::{BodyExt as _, Full};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a [`Recorder`] saw.
#[derive(Debug)]
pub enum Event {
    Message(ResponseChunk),
    Error(Error, bool),
}

/// A callback which forwards everything it sees to a channel.
#[derive(Debug)]
pub struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, Events) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events }), Events { rx })
    }
}

impl StreamingCallback for Recorder {
    fn message_received(&self, chunk: ResponseChunk) {
        let _ = self.events.send(Event::Message(chunk));
    }

    fn unrecoverable_error_occurred(&self, error: Error, guaranteed: bool) {
        let _ = self.events.send(Event::Error(error, guaranteed));
    }
}

#[derive(Debug)]
pub struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    pub async fn next(&mut self) -> Event {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a callback")
            .expect("callback dropped")
    }

    /// Collect a whole response: its head, and the concatenated body.
    pub async fn response(&mut self) -> (http::Response<()>, Bytes) {
        let head = match self.next().await {
            Event::Message(ResponseChunk::Full(head)) => return (head, Bytes::new()),
            Event::Message(ResponseChunk::Head(head)) => head,
            other => panic!("expected a response head, got {other:?}"),
        };

        let mut body = BytesMut::new();
        loop {
            match self.next().await {
                Event::Message(ResponseChunk::Data(data)) => body.extend_from_slice(&data),
                Event::Message(ResponseChunk::Last { data, .. }) => {
                    body.extend_from_slice(&data);
                    return (head, body.freeze());
                }
                other => panic!("expected response body, got {other:?}"),
            }
        }
    }

    /// Count the errors reported until nothing arrives for a short while.
    pub async fn count_errors(&mut self) -> usize {
        let mut errors = 0;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await {
            if let Event::Error(..) = event {
                errors += 1;
            }
        }
        errors
    }

    /// Asserts nothing else arrives for a short while.
    pub async fn assert_quiet(&mut self) {
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await {
            panic!("unexpected callback: {event:?}");
        }
    }
}

/// Poll `check` until it holds, or panic after [`WAIT`].
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// A resolver which always answers with `addr`.
pub fn fixed_resolver(
    addr: SocketAddr,
) -> impl tower::Service<
    Name,
    Response = SocketAddrs,
    Error = std::io::Error,
    Future = impl Future<Output = Result<SocketAddrs, std::io::Error>> + Send,
> + Clone
       + Send
       + Sync
       + 'static {
    tower::service_fn(move |_name: Name| async move {
        Ok::<_, std::io::Error>(SocketAddrs::from(vec![addr]))
    })
}

/// Answers every request on a connection, with keep-alive.
///
/// `GET` gets an empty 200. Anything else gets its body echoed back. Every
/// `x-b3-*` request header is copied onto the response, and the request's
/// `Host` comes back as `x-seen-host`.
async fn echo(request: http::Request<hyper::body::Incoming>) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let mut response = http::Response::builder().status(200);
    for (name, value) in request.headers() {
        if name.as_str().starts_with("x-b3-") {
            response = response.header(name, value);
        }
    }
    if let Some(host) = request.headers().get(http::header::HOST) {
        response = response.header("x-seen-host", host);
    }

    let body = if request.method() == http::Method::GET {
        Bytes::new()
    } else {
        match request.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        }
    };

    Ok(response.body(Full::new(body)).unwrap())
}

pub async fn serve_http<S>(stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), hyper::service::service_fn(echo))
        .await;
}

/// A well-behaved HTTP/1.1 server.
pub async fn http_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_http(stream));
        }
    });
    addr
}

/// Read from `stream` until a full request head has arrived.
///
/// Returns `None` if the client closes the connection first.
pub async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Read until the client closes the connection, returning how many bytes arrived.
pub async fn read_to_close(stream: &mut TcpStream) -> usize {
    let mut total = 0;
    let mut chunk = [0u8; 1024];
    while let Ok(n) = stream.read(&mut chunk).await {
        if n == 0 {
            break;
        }
        total += n;
    }
    total
}

/// A server which runs `handler` on each accepted connection.
pub async fn raw_server<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handler(stream));
        }
    });
    addr
}
