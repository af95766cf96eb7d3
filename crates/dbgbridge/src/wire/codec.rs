//! Framing codecs for both sides of the bridge.
//!
//! - **ContentLengthCodec**: `Content-Length: N\r\n\r\n` header followed by N bytes
//!   of JSON (front-end side, stdin/stdout)
//! - **NulDelimitedCodec**: JSON terminated by a single NUL byte (target side,
//!   socket or child protocol stream)
//!
//! Decoders yield raw payload bytes. JSON parsing happens in the coordinator so a
//! malformed payload drops one message instead of terminating the stream.

use serde::Serialize;
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";
const NUL: u8 = 0;

/// Largest body a `Content-Length` header may announce (same default as
/// `LengthDelimitedCodec`).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;
/// Bytes buffered while looking for the end of a header block.
const MAX_HEADER_LENGTH: usize = 4096;

/// Codec for `Content-Length` framed messages.
#[derive(Debug)]
pub struct ContentLengthCodec {
    /// Body length announced by a header that has already been consumed.
    expected: Option<usize>,
    max_frame_length: usize,
}

impl Default for ContentLengthCodec {
    fn default() -> Self {
        Self {
            expected: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ContentLengthCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_SEPARATOR.len())
        .position(|window| window == HEADER_SEPARATOR)
}

/// Extract the body length from a header block (without the trailing separator).
///
/// Header lines other than `Content-Length` are ignored.
fn parse_header(block: &[u8]) -> Result<usize, CodecError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| CodecError::framing("header block is not valid UTF-8"))?;

    let mut length = None;
    for line in text.split("\r\n") {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::framing(format!("invalid header line {line:?}")))?;
        if name == CONTENT_LENGTH {
            let value = value.trim();
            let parsed = value.parse::<usize>().map_err(|_| {
                CodecError::framing(format!("invalid {CONTENT_LENGTH} value {value:?}"))
            })?;
            length = Some(parsed);
        }
    }

    length.ok_or_else(|| CodecError::framing(format!("missing {CONTENT_LENGTH} header")))
}

impl Decoder for ContentLengthCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.expected {
            Some(len) => len,
            None => {
                let Some(end) = find_separator(src) else {
                    if src.len() > MAX_HEADER_LENGTH {
                        return Err(CodecError::framing(format!(
                            "no header terminator within {MAX_HEADER_LENGTH} bytes"
                        )));
                    }
                    return Ok(None);
                };
                let len = parse_header(&src[..end])?;
                if len > self.max_frame_length {
                    return Err(CodecError::framing(format!(
                        "{CONTENT_LENGTH} {len} exceeds the limit of {} bytes",
                        self.max_frame_length
                    )));
                }
                src.advance(end + HEADER_SEPARATOR.len());
                tracing::trace!(content_length = len, "Parsed frame header");
                self.expected = Some(len);
                len
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.expected = None;
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() || self.expected.is_some() {
                    tracing::debug!(
                        buffered_bytes = src.len(),
                        "Input closed with an incomplete frame, discarding"
                    );
                    src.clear();
                    self.expected = None;
                }
                Ok(None)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for ContentLengthCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", json.len());
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(header.len() + json.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&json);
        Ok(())
    }
}

/// Codec for NUL-terminated messages.
#[derive(Debug, Default)]
pub struct NulDelimitedCodec {
    /// Bytes of the buffer already known not to contain a NUL.
    scanned: usize,
}

impl NulDelimitedCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for NulDelimitedCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == NUL) else {
                self.scanned = src.len();
                return Ok(None);
            };
            let end = self.scanned + offset;
            self.scanned = 0;

            let message = src.split_to(end);
            src.advance(1);

            // A NUL at the start of the buffer terminates nothing.
            if message.is_empty() {
                continue;
            }
            return Ok(Some(message.freeze()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None => {
                if !src.is_empty() {
                    tracing::warn!(
                        buffered_bytes = src.len(),
                        "Target closed with an unterminated message, discarding"
                    );
                    src.clear();
                    self.scanned = 0;
                }
                Ok(None)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for NulDelimitedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(NUL);
        Ok(())
    }
}

/// Decoder turning a raw output pipe into text.
///
/// A multi-byte character split across reads is held back until its remaining
/// bytes arrive. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8TextCodec;

impl Utf8TextCodec {
    pub fn new() -> Self {
        Self
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        // Skip continuation bytes back to the lead byte.
        if bytes[i] & 0xC0 == 0x80 {
            continue;
        }
        let tail = &bytes[i..];
        return match std::str::from_utf8(tail) {
            Err(e) if e.valid_up_to() == 0 && e.error_len().is_none() => tail.len(),
            _ => 0,
        };
    }
    0
}

impl Decoder for Utf8TextCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let ready = src.len() - incomplete_tail(src);
        if ready == 0 {
            return Ok(None);
        }
        let chunk = src.split_to(ready);
        Ok(Some(String::from_utf8_lossy(&chunk).into_owned()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(text) = self.decode(src)? {
            return Ok(Some(text));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    fn decode_all<D: Decoder<Item = Bytes, Error = CodecError>>(
        codec: &mut D,
        buf: &mut BytesMut,
    ) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(item) = codec.decode(buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn content_length_decodes_single_frame() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&frame(r#"{"seq":1,"command":"initialize"}"#)[..]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], br#"{"seq":1,"command":"initialize"}"#);
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn content_length_decodes_every_frame_in_one_read() {
        let mut codec = ContentLengthCodec::new();
        let mut bytes = frame(r#"{"seq":1}"#);
        bytes.extend(frame(r#"{"seq":2}"#));
        bytes.extend(frame(r#"{"seq":3}"#));
        let mut buf = BytesMut::from(&bytes[..]);

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[2][..], br#"{"seq":3}"#);
    }

    #[test]
    fn content_length_is_independent_of_chunk_boundaries() {
        let mut bytes = frame(r#"{"seq":1,"command":"initialize"}"#);
        bytes.extend(frame(r#"{"seq":2,"command":"launch","arguments":{"noDebug":true}}"#));
        bytes.extend(frame(r#"{"seq":3,"command":"ünïcode"}"#));

        let mut whole = ContentLengthCodec::new();
        let expected = decode_all(&mut whole, &mut BytesMut::from(&bytes[..]));
        assert_eq!(expected.len(), 3);

        for chunk_size in [1, 2, 3, 7, 16, 29, bytes.len()] {
            let mut codec = ContentLengthCodec::new();
            let mut buf = BytesMut::new();
            let mut got = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                got.extend(decode_all(&mut codec, &mut buf));
            }
            assert_eq!(got, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn content_length_ignores_other_headers() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(
            &b"Content-Type: application/json\r\nContent-Length: 2\r\n\r\n{}"[..],
        );
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"{}");
    }

    #[test]
    fn content_length_missing_header_is_framing_error() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&b"Content-Type: application/json\r\n\r\n{}"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Framing(_)), "{err:?}");
    }

    #[test]
    fn content_length_malformed_value_is_framing_error() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: twelve\r\n\r\n{}"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Framing(_)), "{err:?}");
    }

    #[test]
    fn content_length_rejects_oversized_frame() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: 18446744073709551615\r\n\r\n{}"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Framing(_)), "{err:?}");

        let mut codec = ContentLengthCodec::new().with_max_frame_length(16);
        let mut buf = BytesMut::from(&b"Content-Length: 17\r\n\r\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("exceeds the limit of 16 bytes"), "{err}");

        let mut buf = BytesMut::from(&b"Content-Length: 16\r\n\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn content_length_rejects_unterminated_header() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: 2"[..]);
        buf.extend_from_slice(&[b' '; MAX_HEADER_LENGTH]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Framing(_)), "{err:?}");
    }

    #[test]
    fn content_length_waits_for_separator() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: 2\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Nothing consumed until the separator arrives.
        assert_eq!(&buf[..], b"Content-Length: 2\r\n");
    }

    #[test]
    fn content_length_eof_discards_partial_frame() {
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::from(&b"Content-Length: 10\r\n\r\n{\"se"[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn content_length_roundtrip_is_byte_identical() {
        let message = json!({
            "seq": 4,
            "type": "request",
            "command": "setBreakpoints",
            "arguments": {"source": {"path": "/tmp/main.src"}, "lines": [3, 9]}
        });
        let mut codec = ContentLengthCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&message, &mut buf).unwrap();

        let header_end = find_separator(&buf).unwrap();
        assert_eq!(
            &buf[..header_end],
            format!("Content-Length: {}", serde_json::to_vec(&message).unwrap().len()).as_bytes()
        );

        let payload = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&payload[..], &serde_json::to_vec(&message).unwrap()[..]);
    }

    #[test]
    fn nul_decodes_multiple_messages() {
        let mut codec = NulDelimitedCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\0{\"b\":2}\0{\"c\""[..]);

        let messages = decode_all(&mut codec, &mut buf);
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[0][..], br#"{"a":1}"#);
        assert_eq!(&messages[1][..], br#"{"b":2}"#);
        assert_eq!(&buf[..], br#"{"c""#);

        buf.extend_from_slice(b":3}\0");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], br#"{"c":3}"#);
    }

    #[test]
    fn nul_skips_empty_messages() {
        let mut codec = NulDelimitedCodec::new();
        let mut buf = BytesMut::from(&b"\0\0{}\0"[..]);
        let messages = decode_all(&mut codec, &mut buf);
        assert_eq!(messages, vec![Bytes::from_static(b"{}")]);
    }

    #[test]
    fn nul_is_independent_of_chunk_boundaries() {
        let bytes = b"{\"event\":\"stopped\"}\0not-json\0{\"event\":\"output\"}\0";
        for chunk_size in 1..bytes.len() {
            let mut codec = NulDelimitedCodec::new();
            let mut buf = BytesMut::new();
            let mut got = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                got.extend(decode_all(&mut codec, &mut buf));
            }
            assert_eq!(got.len(), 3, "chunk size {chunk_size}");
            assert_eq!(&got[1][..], b"not-json");
        }
    }

    #[test]
    fn nul_encode_appends_terminator() {
        let mut codec = NulDelimitedCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(json!({"command": "threads", "seq": 2}), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"{\"command\":\"threads\",\"seq\":2}\0");
    }

    #[test]
    fn text_holds_back_split_character() {
        let mut codec = Utf8TextCodec::new();
        let mut buf = BytesMut::from(&b"caf\xC3"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("caf"));
        assert_eq!(&buf[..], b"\xC3");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\xA9!");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("\u{e9}!"));
        assert!(buf.is_empty());
    }

    #[test]
    fn text_four_byte_character_in_single_bytes() {
        let mut codec = Utf8TextCodec::new();
        let crab = "\u{1F980}".as_bytes();
        let mut buf = BytesMut::new();
        let mut text = String::new();
        for byte in crab {
            buf.put_u8(*byte);
            if let Some(part) = codec.decode(&mut buf).unwrap() {
                text.push_str(&part);
            }
        }
        assert_eq!(text, "\u{1F980}");
    }

    #[test]
    fn text_replaces_invalid_bytes() {
        let mut codec = Utf8TextCodec::new();
        let mut buf = BytesMut::from(&b"a\xFFb"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("a\u{FFFD}b"));
    }

    #[test]
    fn text_eof_flushes_truncated_character() {
        let mut codec = Utf8TextCodec::new();
        let mut buf = BytesMut::from(&b"\xE2\x82"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("\u{FFFD}"));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn text_reassembles_character_split_across_reads() {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let (mut remote, local) = tokio::io::duplex(64);
        let mut reader = tokio_util::codec::FramedRead::new(local, Utf8TextCodec::new());

        let bytes = "a\u{e9}".as_bytes();
        remote.write_all(&bytes[..2]).await.unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap(), "a");
        remote.write_all(&bytes[2..]).await.unwrap();
        drop(remote);

        let rest: Vec<String> = reader.map(|text| text.unwrap()).collect().await;
        assert_eq!(rest.concat(), "\u{e9}");
    }
}
