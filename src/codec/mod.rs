//! HTTP/1.1 client codec.
//!
//! The codec is a pair of small state machines: a [`RequestEncoder`] which
//! frames outbound request heads and body chunks, and a [`ResponseDecoder`]
//! which turns inbound bytes into [`ResponseChunk`]s. Both publish their
//! current state to a [`CodecProbe`], so a connection's codec can be checked
//! for desynchronization (see [`inspect`]) without reaching into the codec
//! itself.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

mod decoder;
mod encoder;
pub mod inspect;

pub use self::decoder::{DecoderState, ResponseDecoder};
pub use self::encoder::{EncoderState, RequestEncoder};
pub use self::inspect::{inspect, CodecHealth};

/// One piece of an outbound request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyChunk {
    /// A piece of body data.
    Data(Bytes),

    /// The terminal piece of the body, with optional trailers.
    Last {
        /// Final body data, possibly empty.
        data: Bytes,

        /// Trailer headers. Only sent for chunked bodies.
        trailers: http::HeaderMap,
    },
}

impl BodyChunk {
    /// A terminal chunk carrying `data` and no trailers.
    pub fn last(data: impl Into<Bytes>) -> Self {
        BodyChunk::Last {
            data: data.into(),
            trailers: http::HeaderMap::new(),
        }
    }

    /// An empty terminal chunk.
    pub fn empty_last() -> Self {
        BodyChunk::last(Bytes::new())
    }

    /// Returns `true` if this is the terminal chunk of the body.
    pub fn is_last(&self) -> bool {
        matches!(self, BodyChunk::Last { .. })
    }

    /// Returns `true` if this is a terminal chunk with no data and no trailers.
    pub fn is_empty_last(&self) -> bool {
        matches!(self, BodyChunk::Last { data, trailers } if data.is_empty() && trailers.is_empty())
    }

    /// The data carried by this chunk.
    pub fn data(&self) -> &Bytes {
        match self {
            BodyChunk::Data(data) => data,
            BodyChunk::Last { data, .. } => data,
        }
    }
}

impl From<Bytes> for BodyChunk {
    fn from(data: Bytes) -> Self {
        BodyChunk::Data(data)
    }
}

/// One piece of an inbound response.
#[derive(Debug)]
pub enum ResponseChunk {
    /// The response head. Body chunks follow.
    Head(http::Response<()>),

    /// A response which carries no body at all. This is both head and terminal chunk.
    Full(http::Response<()>),

    /// A piece of body data.
    Data(Bytes),

    /// The terminal piece of the body, with any trailers.
    Last {
        /// Final body data, possibly empty.
        data: Bytes,

        /// Trailer headers.
        trailers: http::HeaderMap,
    },
}

impl ResponseChunk {
    /// Returns `true` if no more chunks of this response will follow.
    pub fn is_last(&self) -> bool {
        matches!(self, ResponseChunk::Full(_) | ResponseChunk::Last { .. })
    }

    /// The response head, if this chunk carries one.
    pub fn head(&self) -> Option<&http::Response<()>> {
        match self {
            ResponseChunk::Head(head) | ResponseChunk::Full(head) => Some(head),
            _ => None,
        }
    }

    pub(crate) fn empty_last() -> Self {
        ResponseChunk::Last {
            data: Bytes::new(),
            trailers: http::HeaderMap::new(),
        }
    }
}

/// Errors raised while framing or parsing HTTP/1.1 messages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// A request head was written while the previous request body was still open.
    #[error("unexpected request head while encoder is in state {0:?}")]
    UnexpectedHead(EncoderState),

    /// Body data was written with no open request body.
    #[error("unexpected body content while encoder is in state {0:?}")]
    UnexpectedContent(EncoderState),

    /// More body data was written than the request's Content-Length allows.
    #[error("request body exceeds content-length by {0} bytes")]
    BodyOverflow(u64),

    /// A header value could not be used to frame the message.
    #[error("invalid {0} header")]
    InvalidHeader(&'static str),

    /// The response head could not be parsed.
    #[error("invalid response head: {0}")]
    Parse(#[from] httparse::Error),

    /// The response head did not fit within the configured limit.
    #[error("response head larger than {0} bytes")]
    HeadTooLarge(usize),

    /// A chunk-size line could not be parsed.
    #[error("invalid chunk size line")]
    InvalidChunkSize,
}

/// A view onto a codec's encoder and decoder state.
///
/// The probe is shared between a connection and whichever codec is currently
/// installed on it; installing a fresh codec resets the published state.
#[derive(Debug, Clone, Default)]
pub struct CodecProbe {
    inner: Arc<ProbeState>,
}

#[derive(Debug, Default)]
struct ProbeState {
    installed: AtomicBool,
    decoder: AtomicU8,
    encoder: AtomicU8,
}

impl CodecProbe {
    /// Create a probe with no codec installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a codec is installed.
    pub fn is_installed(&self) -> bool {
        self.inner.installed.load(Ordering::Acquire)
    }

    /// The decoder state last published by the installed codec.
    pub fn decoder_state(&self) -> DecoderState {
        DecoderState::from_ordinal(self.inner.decoder.load(Ordering::Acquire))
    }

    /// The encoder state last published by the installed codec.
    pub fn encoder_state(&self) -> EncoderState {
        EncoderState::from_ordinal(self.inner.encoder.load(Ordering::Acquire))
    }

    fn install(&self) {
        self.inner.decoder.store(0, Ordering::Release);
        self.inner.encoder.store(0, Ordering::Release);
        self.inner.installed.store(true, Ordering::Release);
    }

    pub(crate) fn uninstall(&self) {
        self.inner.installed.store(false, Ordering::Release);
    }

    fn publish_decoder(&self, state: DecoderState) {
        self.inner.decoder.store(state.ordinal(), Ordering::Release);
    }

    fn publish_encoder(&self, state: EncoderState) {
        self.inner.encoder.store(state.ordinal(), Ordering::Release);
    }
}

/// What happened when an outbound message was encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Encoded {
    /// The request message is complete, and the encoder is ready for a new one.
    pub message_complete: bool,
}

/// Combined request encoder and response decoder for one connection.
///
/// The encoder records each request's method so the decoder can frame
/// responses to `HEAD` requests, which never carry a body.
#[derive(Debug)]
pub struct HttpClientCodec {
    encoder: RequestEncoder,
    decoder: ResponseDecoder,
}

impl HttpClientCodec {
    /// Create a fresh codec publishing to `probe`.
    pub fn new(probe: CodecProbe) -> Self {
        probe.install();
        Self {
            encoder: RequestEncoder::new(probe.clone()),
            decoder: ResponseDecoder::new(probe),
        }
    }

    /// Encode a request head into `dst`.
    pub fn encode_head(
        &mut self,
        head: &http::Request<()>,
        dst: &mut BytesMut,
    ) -> Result<Encoded, CodecError> {
        let encoded = self.encoder.encode_head(head, dst)?;
        self.decoder.expect_response_to(head.method().clone());
        Ok(encoded)
    }

    /// Encode a body chunk into `dst`.
    pub fn encode_body(
        &mut self,
        chunk: BodyChunk,
        dst: &mut BytesMut,
    ) -> Result<Encoded, CodecError> {
        self.encoder.encode_body(chunk, dst)
    }

    /// Decode the next response chunk from `src`, if one is available.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ResponseChunk>, CodecError> {
        self.decoder.decode(src)
    }

    /// Decode the next response chunk once the peer has closed its side.
    pub fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ResponseChunk>, CodecError> {
        self.decoder.decode_eof(src)
    }

    /// The encoder's current state.
    pub fn encoder_state(&self) -> EncoderState {
        self.encoder.state()
    }

    /// The decoder's current state.
    pub fn decoder_state(&self) -> DecoderState {
        self.decoder.state()
    }
}
