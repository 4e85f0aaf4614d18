use std::time::Duration;

use bytes::Bytes;
use edgewire::context::{Tracer, PARENT_SPAN_ID, SPAN_ID, SPAN_NAME, TRACE_ID, TRACE_SAMPLED};
use edgewire::{BodyChunk, ClientConfig, DownstreamCall, Error, ResponseChunk, StreamingClient};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

mod common;

use common::{eventually, http_server, init_tracing, raw_server, read_head, Event, Recorder};

#[tokio::test]
async fn get_without_body_completes_and_returns_connection() {
    init_tracing();
    let addr = http_server().await;
    let client = StreamingClient::builder().build();
    let (recorder, mut events) = Recorder::new();

    let head = http::Request::get("/status").body(()).unwrap();
    let channel = client
        .stream_downstream_call(DownstreamCall::new("127.0.0.1", addr.port(), head), recorder)
        .await
        .unwrap();

    match events.next().await {
        Event::Message(ResponseChunk::Full(response)) => assert_eq!(response.status(), 200),
        other => panic!("expected a complete response, got {other:?}"),
    }

    eventually(|| !channel.is_active()).await;
    eventually(|| client.pool_stats(addr).is_some_and(|stats| stats.idle == 1)).await;
    events.assert_quiet().await;

    let stats = client.pool_stats(addr).unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(stats.closed, 0);
}

#[tokio::test]
async fn dropped_channel_still_returns_connection() {
    init_tracing();
    let addr = http_server().await;
    let client = StreamingClient::builder().build();

    let (recorder, mut events) = Recorder::new();
    let head = http::Request::get("/fire-and-forget").body(()).unwrap();
    let channel = client
        .stream_downstream_call(DownstreamCall::new("127.0.0.1", addr.port(), head), recorder)
        .await
        .unwrap();
    let first = channel.connection_id();
    drop(channel);

    let (response, _) = events.response().await;
    assert_eq!(response.status(), 200);
    eventually(|| client.pool_stats(addr).is_some_and(|stats| stats.idle == 1)).await;

    let stats = client.pool_stats(addr).unwrap();
    assert_eq!(stats.released, 1);
    assert_eq!(stats.closed, 0);

    let (recorder, mut events) = Recorder::new();
    let head = http::Request::get("/again").body(()).unwrap();
    let channel = client
        .stream_downstream_call(DownstreamCall::new("127.0.0.1", addr.port(), head), recorder)
        .await
        .unwrap();
    assert_eq!(channel.connection_id(), first);
    let (response, _) = events.response().await;
    assert_eq!(response.status(), 200);
    assert_eq!(client.pool_stats(addr).unwrap().reused, 1);
}

#[tokio::test]
async fn finished_call_absorbs_empty_terminal_chunk() {
    init_tracing();
    let addr = http_server().await;
    let client = StreamingClient::builder().build();
    let (recorder, mut events) = Recorder::new();

    let head = http::Request::get("/").body(()).unwrap();
    let channel = client
        .stream_downstream_call(DownstreamCall::new("127.0.0.1", addr.port(), head), recorder)
        .await
        .unwrap();
    let _ = events.response().await;
    eventually(|| !channel.is_active()).await;

    channel.stream_chunk(BodyChunk::empty_last()).await.unwrap();
    assert!(matches!(
        channel.stream_chunk(Bytes::from_static(b"late")).await,
        Err(Error::CallInactive)
    ));
}

#[tokio::test]
async fn second_call_reuses_pooled_connection() {
    init_tracing();
    let addr = http_server().await;
    let client = StreamingClient::builder().build();

    let mut ids = Vec::new();
    for path in ["/first", "/second"] {
        let (recorder, mut events) = Recorder::new();
        let head = http::Request::get(path).body(()).unwrap();
        let channel = client
            .stream_downstream_call(DownstreamCall::new("127.0.0.1", addr.port(), head), recorder)
            .await
            .unwrap();
        ids.push(channel.connection_id());

        let (response, body) = events.response().await;
        assert_eq!(response.status(), 200);
        assert!(body.is_empty());
        eventually(|| client.pool_stats(addr).is_some_and(|stats| stats.idle == 1)).await;
    }

    assert_eq!(ids[0], ids[1]);
    let stats = client.pool_stats(addr).unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 1);
}

#[tokio::test]
async fn chunks_are_written_in_call_order() {
    init_tracing();
    let addr = http_server().await;
    let client = StreamingClient::builder().build();
    let (recorder, mut events) = Recorder::new();

    let head = http::Request::post("/echo")
        .header(http::header::TRANSFER_ENCODING, "chunked")
        .body(())
        .unwrap();
    let channel = client
        .stream_downstream_call(DownstreamCall::new("127.0.0.1", addr.port(), head), recorder)
        .await
        .unwrap();

    let pieces: Vec<String> = (0..64).map(|i| format!("{i:02},")).collect();
    let writes: Vec<_> = pieces
        .iter()
        .map(|piece| channel.stream_chunk(Bytes::from(piece.clone())))
        .collect();
    let last = channel.stream_chunk(BodyChunk::empty_last());

    // Awaiting in reverse does not change the order on the wire.
    for write in writes.into_iter().rev() {
        write.await.unwrap();
    }
    last.await.unwrap();

    let (response, body) = events.response().await;
    assert_eq!(response.status(), 200);
    assert_eq!(body, pieces.concat());
}

#[tokio::test]
async fn fixed_length_body_absorbs_trailing_empty_chunk() {
    init_tracing();
    let addr = http_server().await;
    let client = StreamingClient::builder().build();
    let (recorder, mut events) = Recorder::new();

    let head = http::Request::put("/upload")
        .header(http::header::CONTENT_LENGTH, "5")
        .body(())
        .unwrap();
    let channel = client
        .stream_downstream_call(DownstreamCall::new("127.0.0.1", addr.port(), head), recorder)
        .await
        .unwrap();

    channel.stream_chunk(Bytes::from_static(b"he")).await.unwrap();
    channel.stream_chunk(Bytes::from_static(b"llo")).await.unwrap();
    // The body was already complete, so nothing more is written.
    channel.stream_chunk(BodyChunk::empty_last()).await.unwrap();

    let (_, body) = events.response().await;
    assert_eq!(body, "hello");

    eventually(|| client.pool_stats(addr).is_some_and(|stats| stats.idle == 1)).await;
    assert_eq!(client.pool_stats(addr).unwrap().closed, 0);
}

#[tokio::test]
async fn trace_headers_are_propagated() {
    init_tracing();
    let addr = http_server().await;
    let client = StreamingClient::builder().build();
    let (recorder, mut events) = Recorder::new();

    Tracer::unregister_from_thread();
    let root = Tracer::start_request_with_root_span("inbound");
    let head = http::Request::get("/trace").body(()).unwrap();
    let call = DownstreamCall::new("127.0.0.1", addr.port(), head);
    Tracer::unregister_from_thread();

    let _channel = client.stream_downstream_call(call, recorder).await.unwrap();
    let (response, _) = events.response().await;
    let headers = response.headers();

    assert_eq!(headers[&TRACE_ID], root.trace_id());
    assert_eq!(headers[&PARENT_SPAN_ID], root.span_id());
    assert_ne!(headers[&SPAN_ID], root.span_id());
    assert_eq!(
        headers[&SPAN_NAME],
        format!("async_downstream_call-GET_127.0.0.1:{}/trace", addr.port()).as_str()
    );
    assert_eq!(headers[&TRACE_SAMPLED], "true");
    assert_eq!(headers["x-seen-host"], format!("127.0.0.1:{}", addr.port()).as_str());
}

#[tokio::test]
async fn no_trace_headers_without_a_trace() {
    init_tracing();
    let addr = http_server().await;
    let client = StreamingClient::builder().build();
    let (recorder, mut events) = Recorder::new();

    Tracer::unregister_from_thread();
    let head = http::Request::get("/").body(()).unwrap();
    let call = DownstreamCall::new("127.0.0.1", addr.port(), head).want_subspan(false);

    let _channel = client.stream_downstream_call(call, recorder).await.unwrap();
    let (response, _) = events.response().await;

    assert!(!response.headers().contains_key(&TRACE_ID));
    assert!(!response.headers().contains_key(&SPAN_ID));
    assert!(!response.headers().contains_key(&PARENT_SPAN_ID));
}

#[tokio::test]
async fn debug_pipeline_logging() {
    init_tracing();
    let addr = http_server().await;
    let mut config = ClientConfig::default();
    config.debug_pipeline_logging = true;
    config.perform_subspan = false;
    let client = StreamingClient::builder().with_config(config).build();

    let (recorder, mut events) = Recorder::new();
    let head = http::Request::post("/echo")
        .header(http::header::CONTENT_LENGTH, "4")
        .body(())
        .unwrap();
    let channel = client
        .stream_downstream_call(DownstreamCall::new("127.0.0.1", addr.port(), head), recorder)
        .await
        .unwrap();
    channel
        .stream_chunk(BodyChunk::last(Bytes::from_static(b"ping")))
        .await
        .unwrap();

    let (_, body) = events.response().await;
    assert_eq!(body, "ping");
}

#[tokio::test]
async fn response_streams_while_request_is_still_being_written() {
    init_tracing();
    const CHUNK: usize = 256 * 1024;
    const CHUNKS: usize = 64;
    let total = CHUNK * CHUNKS;

    // Answers at once, then echoes the request body back as it arrives. The
    // echo stops reading whenever the client stops reading the response.
    let addr = raw_server(move |mut stream| async move {
        let Some(head) = read_head(&mut stream).await else {
            return;
        };
        let early = head.split_once("\r\n\r\n").map_or(0, |(_, rest)| rest.len());

        let (mut reader, mut writer) = stream.split();
        if writer.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.is_err() {
            return;
        }
        if writer.write_all(&vec![b'x'; early]).await.is_err() {
            return;
        }
        let mut rest = (&mut reader).take((total - early) as u64);
        let _ = tokio::io::copy(&mut rest, &mut writer).await;
        let _ = writer.shutdown().await;
    })
    .await;

    let client = StreamingClient::builder().build();
    let (recorder, mut events) = Recorder::new();
    let head = http::Request::post("/duplex")
        .header(http::header::CONTENT_LENGTH, total.to_string())
        .body(())
        .unwrap();
    let channel = client
        .stream_downstream_call(DownstreamCall::new("127.0.0.1", addr.port(), head), recorder)
        .await
        .unwrap();

    let (response, body) = tokio::time::timeout(Duration::from_secs(30), async {
        for _ in 0..CHUNKS {
            channel
                .stream_chunk(Bytes::from(vec![b'x'; CHUNK]))
                .await
                .unwrap();
        }
        events.response().await
    })
    .await
    .expect("request and response stopped making progress");

    assert_eq!(response.status(), 200);
    assert_eq!(body.len(), total);
    assert!(body.iter().all(|&byte| byte == b'x'));
}
