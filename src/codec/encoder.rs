use std::fmt::Write as _;

use bytes::{BufMut as _, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};

use super::{BodyChunk, CodecError, CodecProbe, Encoded};

/// Request encoder states.
///
/// `Init` is the only state in which a new request head may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncoderState {
    /// Ready for a new request head.
    Init = 0,

    /// Writing a body framed by Content-Length.
    ContentNonChunk = 1,

    /// Writing a chunked body.
    ContentChunk = 2,
}

impl EncoderState {
    /// Numeric position of this state; `0` means ready for a new message.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_ordinal(ordinal: u8) -> Self {
        match ordinal {
            0 => EncoderState::Init,
            1 => EncoderState::ContentNonChunk,
            _ => EncoderState::ContentChunk,
        }
    }
}

/// Frames outbound HTTP/1.1 requests.
#[derive(Debug)]
pub struct RequestEncoder {
    state: EncoderState,
    remaining: u64,
    probe: CodecProbe,
}

impl RequestEncoder {
    pub(super) fn new(probe: CodecProbe) -> Self {
        Self {
            state: EncoderState::Init,
            remaining: 0,
            probe,
        }
    }

    /// The current encoder state.
    pub fn state(&self) -> EncoderState {
        self.state
    }

    fn set_state(&mut self, state: EncoderState) {
        self.state = state;
        self.probe.publish_encoder(state);
    }

    /// Write a request line and headers.
    ///
    /// Requests with neither Content-Length nor chunked Transfer-Encoding carry no
    /// body, so the message is complete as soon as the head is written.
    pub fn encode_head(
        &mut self,
        head: &http::Request<()>,
        dst: &mut BytesMut,
    ) -> Result<Encoded, CodecError> {
        if self.state != EncoderState::Init {
            return Err(CodecError::UnexpectedHead(self.state));
        }

        let framing = Framing::of(head.headers())?;

        let target = head
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");
        let version = if head.version() == http::Version::HTTP_10 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        };

        dst.reserve(64 + head.headers().len() * 32);
        dst.put_slice(head.method().as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(target.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(version.as_bytes());
        dst.put_slice(b"\r\n");
        put_headers(head.headers(), dst);
        dst.put_slice(b"\r\n");

        match framing {
            Framing::Chunked => {
                self.set_state(EncoderState::ContentChunk);
                Ok(Encoded {
                    message_complete: false,
                })
            }
            Framing::Length(length) if length > 0 => {
                self.remaining = length;
                self.set_state(EncoderState::ContentNonChunk);
                Ok(Encoded {
                    message_complete: false,
                })
            }
            Framing::Length(_) | Framing::Empty => Ok(Encoded {
                message_complete: true,
            }),
        }
    }

    /// Write a body chunk.
    ///
    /// An empty terminal chunk with no open body is accepted and writes nothing.
    pub fn encode_body(
        &mut self,
        chunk: BodyChunk,
        dst: &mut BytesMut,
    ) -> Result<Encoded, CodecError> {
        match self.state {
            EncoderState::Init => {
                if chunk.data().is_empty() {
                    Ok(Encoded {
                        message_complete: false,
                    })
                } else {
                    Err(CodecError::UnexpectedContent(self.state))
                }
            }
            EncoderState::ContentNonChunk => {
                let is_last = chunk.is_last();
                let data = match chunk {
                    BodyChunk::Data(data) => data,
                    BodyChunk::Last { data, .. } => data,
                };

                let length = data.len() as u64;
                if length > self.remaining {
                    return Err(CodecError::BodyOverflow(length - self.remaining));
                }

                dst.put_slice(&data);
                self.remaining -= length;

                if self.remaining == 0 || is_last {
                    self.remaining = 0;
                    self.set_state(EncoderState::Init);
                    Ok(Encoded {
                        message_complete: true,
                    })
                } else {
                    Ok(Encoded {
                        message_complete: false,
                    })
                }
            }
            EncoderState::ContentChunk => match chunk {
                BodyChunk::Data(data) => {
                    put_chunk(&data, dst);
                    Ok(Encoded {
                        message_complete: false,
                    })
                }
                BodyChunk::Last { data, trailers } => {
                    put_chunk(&data, dst);
                    dst.put_slice(b"0\r\n");
                    put_headers(&trailers, dst);
                    dst.put_slice(b"\r\n");
                    self.set_state(EncoderState::Init);
                    Ok(Encoded {
                        message_complete: true,
                    })
                }
            },
        }
    }
}

enum Framing {
    Chunked,
    Length(u64),
    Empty,
}

impl Framing {
    fn of(headers: &http::HeaderMap) -> Result<Self, CodecError> {
        if is_chunked(headers) {
            return Ok(Framing::Chunked);
        }

        match headers.get(CONTENT_LENGTH) {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Framing::Length)
                .ok_or(CodecError::InvalidHeader("content-length")),
            None => Ok(Framing::Empty),
        }
    }
}

pub(super) fn is_chunked(headers: &http::HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .last()
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit(',').next())
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn put_headers(headers: &http::HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
}

fn put_chunk(data: &[u8], dst: &mut BytesMut) {
    if data.is_empty() {
        return;
    }

    let mut size = String::with_capacity(8);
    let _ = write!(size, "{:x}\r\n", data.len());
    dst.reserve(size.len() + data.len() + 2);
    dst.put_slice(size.as_bytes());
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn encoder() -> RequestEncoder {
        RequestEncoder::new(CodecProbe::new())
    }

    #[test]
    fn get_without_body_completes_with_head() {
        let mut encoder = encoder();
        let head = http::Request::get("http://example.com/path?q=1")
            .header(http::header::HOST, "example.com")
            .body(())
            .unwrap();

        let mut dst = BytesMut::new();
        let encoded = encoder.encode_head(&head, &mut dst).unwrap();

        assert!(encoded.message_complete);
        assert_eq!(encoder.state(), EncoderState::Init);
        assert_eq!(
            &dst[..],
            b"GET /path?q=1 HTTP/1.1\r\nhost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn chunked_body() {
        let mut encoder = encoder();
        let head = http::Request::post("/")
            .header(TRANSFER_ENCODING, "chunked")
            .body(())
            .unwrap();

        let mut dst = BytesMut::new();
        let _ = encoder.encode_head(&head, &mut dst).unwrap();
        assert_eq!(encoder.state(), EncoderState::ContentChunk);
        dst.clear();

        let encoded = encoder
            .encode_body(BodyChunk::Data(Bytes::from_static(b"hello world")), &mut dst)
            .unwrap();
        assert!(!encoded.message_complete);

        let mut trailers = http::HeaderMap::new();
        trailers.insert("x-sum", http::HeaderValue::from_static("42"));
        let encoded = encoder
            .encode_body(
                BodyChunk::Last {
                    data: Bytes::new(),
                    trailers,
                },
                &mut dst,
            )
            .unwrap();
        assert!(encoded.message_complete);
        assert_eq!(encoder.state(), EncoderState::Init);
        assert_eq!(&dst[..], b"b\r\nhello world\r\n0\r\nx-sum: 42\r\n\r\n");
    }

    #[test]
    fn content_length_overflow() {
        let mut encoder = encoder();
        let head = http::Request::put("/")
            .header(CONTENT_LENGTH, "2")
            .body(())
            .unwrap();

        let mut dst = BytesMut::new();
        let _ = encoder.encode_head(&head, &mut dst).unwrap();

        let error = encoder
            .encode_body(BodyChunk::Data(Bytes::from_static(b"abc")), &mut dst)
            .unwrap_err();
        assert!(matches!(error, CodecError::BodyOverflow(1)));
        assert_eq!(encoder.state(), EncoderState::ContentNonChunk);
    }

    #[test]
    fn head_while_body_open_is_rejected() {
        let mut encoder = encoder();
        let head = http::Request::post("/")
            .header(CONTENT_LENGTH, "10")
            .body(())
            .unwrap();

        let mut dst = BytesMut::new();
        let _ = encoder.encode_head(&head, &mut dst).unwrap();
        assert!(matches!(
            encoder.encode_head(&head, &mut dst),
            Err(CodecError::UnexpectedHead(EncoderState::ContentNonChunk))
        ));
    }

    #[test]
    fn content_without_open_body() {
        let mut encoder = encoder();
        let mut dst = BytesMut::new();

        let encoded = encoder.encode_body(BodyChunk::empty_last(), &mut dst).unwrap();
        assert!(!encoded.message_complete);
        assert!(dst.is_empty());

        assert!(matches!(
            encoder.encode_body(BodyChunk::Data(Bytes::from_static(b"x")), &mut dst),
            Err(CodecError::UnexpectedContent(EncoderState::Init))
        ));
    }

    #[test]
    fn chunked_detection() {
        let mut headers = http::HeaderMap::new();
        assert!(!is_chunked(&headers));

        headers.insert(TRANSFER_ENCODING, "gzip, chunked".parse().unwrap());
        assert!(is_chunked(&headers));

        headers.insert(TRANSFER_ENCODING, "chunked, gzip".parse().unwrap());
        assert!(!is_chunked(&headers));
    }
}
