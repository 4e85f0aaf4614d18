use bytes::{Buf as _, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode};

use super::encoder::is_chunked;
use super::{CodecError, CodecProbe, ResponseChunk};

const MAX_HEAD_SIZE: usize = 12 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_CHUNK_SIZE_LINE: usize = 4096;
const MAX_CONTENT_CHUNK: usize = 8 * 1024;

/// Response decoder states.
///
/// `SkipControlChars` is the resting state between messages. Every other
/// state means a response is partially read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DecoderState {
    /// Between messages, skipping stray whitespace before the next status line.
    SkipControlChars = 0,
    /// Reading the status line and headers.
    ReadHead = 1,
    /// Reading a body delimited by connection close.
    ReadVariableLengthContent = 2,
    /// Reading a body framed by Content-Length.
    ReadFixedLengthContent = 3,
    /// Reading a chunk-size line.
    ReadChunkSize = 4,
    /// Reading chunk data.
    ReadChunkedContent = 5,
    /// Reading the CRLF after chunk data.
    ReadChunkDelimiter = 6,
    /// Reading trailers after the last chunk.
    ReadChunkFooter = 7,
    /// The stream could not be parsed; all further input is discarded.
    BadMessage = 8,
}

impl DecoderState {
    /// Numeric position of this state; `0` means between messages.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 => DecoderState::SkipControlChars,
            1 => DecoderState::ReadHead,
            2 => DecoderState::ReadVariableLengthContent,
            3 => DecoderState::ReadFixedLengthContent,
            4 => DecoderState::ReadChunkSize,
            5 => DecoderState::ReadChunkedContent,
            6 => DecoderState::ReadChunkDelimiter,
            7 => DecoderState::ReadChunkFooter,
            _ => DecoderState::BadMessage,
        }
    }
}

/// Parses inbound HTTP/1.1 responses into [`ResponseChunk`]s.
#[derive(Debug)]
pub struct ResponseDecoder {
    state: DecoderState,
    remaining: u64,
    method: Option<Method>,
    probe: CodecProbe,
}

impl ResponseDecoder {
    pub(super) fn new(probe: CodecProbe) -> Self {
        Self {
            state: DecoderState::SkipControlChars,
            remaining: 0,
            method: None,
            probe,
        }
    }

    /// The current decoder state.
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Record the method of the request the next response answers.
    pub(super) fn expect_response_to(&mut self, method: Method) {
        self.method = Some(method);
    }

    fn set_state(&mut self, state: DecoderState) {
        self.state = state;
        self.probe.publish_decoder(state);
    }

    fn finish_message(&mut self) {
        self.remaining = 0;
        self.method = None;
        self.set_state(DecoderState::SkipControlChars);
    }

    fn fail<T>(&mut self, error: CodecError) -> Result<T, CodecError> {
        self.set_state(DecoderState::BadMessage);
        Err(error)
    }

    /// Decode the next chunk from `src`.
    ///
    /// Returns `Ok(None)` when more input is needed.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ResponseChunk>, CodecError> {
        loop {
            match self.state {
                DecoderState::SkipControlChars => {
                    let skip = src
                        .iter()
                        .take_while(|b| b.is_ascii_control() || b.is_ascii_whitespace())
                        .count();
                    src.advance(skip);
                    if src.is_empty() {
                        return Ok(None);
                    }
                    self.set_state(DecoderState::ReadHead);
                }
                DecoderState::ReadHead => {
                    let parsed = match parse_head(&src[..]) {
                        Ok(parsed) => parsed,
                        Err(error) => return self.fail(error),
                    };

                    let Some((length, head)) = parsed else {
                        if src.len() > MAX_HEAD_SIZE {
                            return self.fail(CodecError::HeadTooLarge(MAX_HEAD_SIZE));
                        }
                        return Ok(None);
                    };
                    src.advance(length);

                    return self.frame(head).map(Some);
                }
                DecoderState::ReadVariableLengthContent => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let n = src.len().min(MAX_CONTENT_CHUNK);
                    return Ok(Some(ResponseChunk::Data(src.split_to(n).freeze())));
                }
                DecoderState::ReadFixedLengthContent => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let data = self.take_remaining(src);
                    if self.remaining == 0 {
                        self.finish_message();
                        return Ok(Some(ResponseChunk::Last {
                            data,
                            trailers: HeaderMap::new(),
                        }));
                    }
                    return Ok(Some(ResponseChunk::Data(data)));
                }
                DecoderState::ReadChunkSize => {
                    let Some(end) = find_line(&src[..]) else {
                        if src.len() > MAX_CHUNK_SIZE_LINE {
                            return self.fail(CodecError::InvalidChunkSize);
                        }
                        return Ok(None);
                    };

                    let size = match parse_chunk_size(&src[..end]) {
                        Some(size) => size,
                        None => return self.fail(CodecError::InvalidChunkSize),
                    };
                    src.advance(end + 1);

                    if size == 0 {
                        self.set_state(DecoderState::ReadChunkFooter);
                    } else {
                        self.remaining = size;
                        self.set_state(DecoderState::ReadChunkedContent);
                    }
                }
                DecoderState::ReadChunkedContent => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let data = self.take_remaining(src);
                    if self.remaining == 0 {
                        self.set_state(DecoderState::ReadChunkDelimiter);
                    }
                    return Ok(Some(ResponseChunk::Data(data)));
                }
                DecoderState::ReadChunkDelimiter => match src.first() {
                    None => return Ok(None),
                    Some(b'\n') => {
                        src.advance(1);
                        self.set_state(DecoderState::ReadChunkSize);
                    }
                    Some(b'\r') => {
                        if src.len() < 2 {
                            return Ok(None);
                        }
                        if src[1] != b'\n' {
                            return self.fail(CodecError::InvalidChunkSize);
                        }
                        src.advance(2);
                        self.set_state(DecoderState::ReadChunkSize);
                    }
                    Some(_) => return self.fail(CodecError::InvalidChunkSize),
                },
                DecoderState::ReadChunkFooter => {
                    let parsed = match parse_trailers(&src[..]) {
                        Ok(parsed) => parsed,
                        Err(error) => return self.fail(error),
                    };

                    let Some((length, trailers)) = parsed else {
                        if src.len() > MAX_HEAD_SIZE {
                            return self.fail(CodecError::HeadTooLarge(MAX_HEAD_SIZE));
                        }
                        return Ok(None);
                    };
                    src.advance(length);

                    self.finish_message();
                    return Ok(Some(ResponseChunk::Last {
                        data: Bytes::new(),
                        trailers,
                    }));
                }
                DecoderState::BadMessage => {
                    src.clear();
                    return Ok(None);
                }
            }
        }
    }

    /// Decode after the peer closed its side of the connection.
    ///
    /// A body delimited by connection close ends here. Any other partially read
    /// message stays partial, and the decoder keeps its state.
    pub fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ResponseChunk>, CodecError> {
        if let Some(chunk) = self.decode(src)? {
            return Ok(Some(chunk));
        }

        if self.state == DecoderState::ReadVariableLengthContent {
            self.finish_message();
            return Ok(Some(ResponseChunk::empty_last()));
        }

        Ok(None)
    }

    fn take_remaining(&mut self, src: &mut BytesMut) -> Bytes {
        let n = (src.len() as u64)
            .min(self.remaining)
            .min(MAX_CONTENT_CHUNK as u64) as usize;
        self.remaining -= n as u64;
        src.split_to(n).freeze()
    }

    fn frame(&mut self, head: http::Response<()>) -> Result<ResponseChunk, CodecError> {
        let status = head.status();

        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            self.set_state(DecoderState::SkipControlChars);
            return Ok(ResponseChunk::Head(head));
        }

        let bodiless = self.method.as_ref() == Some(&Method::HEAD)
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        if bodiless {
            self.finish_message();
            return Ok(ResponseChunk::Full(head));
        }

        if is_chunked(head.headers()) {
            self.set_state(DecoderState::ReadChunkSize);
            return Ok(ResponseChunk::Head(head));
        }

        match content_length(head.headers()) {
            Ok(Some(0)) => {
                self.finish_message();
                Ok(ResponseChunk::Full(head))
            }
            Ok(Some(length)) => {
                self.remaining = length;
                self.set_state(DecoderState::ReadFixedLengthContent);
                Ok(ResponseChunk::Head(head))
            }
            Ok(None) => {
                self.set_state(DecoderState::ReadVariableLengthContent);
                Ok(ResponseChunk::Head(head))
            }
            Err(error) => self.fail(error),
        }
    }
}

fn parse_head(src: &[u8]) -> Result<Option<(usize, http::Response<()>)>, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let length = match response.parse(src)? {
        httparse::Status::Complete(length) => length,
        httparse::Status::Partial => return Ok(None),
    };

    let status = response
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(CodecError::InvalidHeader("status"))?;
    let version = match response.version {
        Some(0) => http::Version::HTTP_10,
        _ => http::Version::HTTP_11,
    };

    let mut head = http::Response::new(());
    *head.status_mut() = status;
    *head.version_mut() = version;
    *head.headers_mut() = header_map(response.headers)?;

    Ok(Some((length, head)))
}

fn parse_trailers(src: &[u8]) -> Result<Option<(usize, HeaderMap)>, CodecError> {
    if src.starts_with(b"\r\n") {
        return Ok(Some((2, HeaderMap::new())));
    }
    if src.starts_with(b"\n") {
        return Ok(Some((1, HeaderMap::new())));
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(src, &mut headers)? {
        httparse::Status::Complete((length, headers)) => {
            Ok(Some((length, header_map(headers)?)))
        }
        httparse::Status::Partial => Ok(None),
    }
}

fn header_map(headers: &[httparse::Header<'_>]) -> Result<HeaderMap, CodecError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| CodecError::InvalidHeader("header name"))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| CodecError::InvalidHeader("header value"))?;
        map.append(name, value);
    }
    Ok(map)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, CodecError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(CodecError::InvalidHeader("content-length"))?;
        if length.is_some_and(|existing| existing != parsed) {
            return Err(CodecError::InvalidHeader("content-length"));
        }
        length = Some(parsed);
    }
    Ok(length)
}

fn find_line(src: &[u8]) -> Option<usize> {
    src.iter().position(|b| *b == b'\n')
}

fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let line = std::str::from_utf8(line).ok()?;
    let size = line
        .trim_end_matches('\r')
        .split(';')
        .next()?
        .trim();
    if size.is_empty() {
        return None;
    }
    u64::from_str_radix(size, 16).ok()
}
