//! Length-prefixed message framing: `Content-Length: N\r\n\r\n` + N bytes of
//! UTF-8 JSON. See §4.1. The decoder is a stateful byte-stream transformer
//! fed incrementally (e.g. as `AsyncRead` chunks arrive); the encoder is a
//! pure function from JSON value to bytes.

use serde_json::Value;

use crate::error::{Error, Result};

const DELIMITER: &[u8] = b"\r\n\r\n";
const HEADER_LINE_SEP: &str = "\r\n";
const CONTENT_LENGTH_PREFIX: &str = "content-length:";

/// Encode a JSON value as one `Content-Length` framed byte run.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(value)?;
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderLimits {
    pub max_header_bytes: usize,
    pub max_message_bytes: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self { max_header_bytes: 64 * 1024, max_message_bytes: 16 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingHeader,
    ReadingBody { content_length: usize },
}

/// One decoded item: a successfully parsed JSON object, or a non-fatal parse
/// error for an individual message body (the surrounding framing was valid).
#[derive(Debug)]
pub enum Decoded {
    Message(Value),
    BodyParseError(Error),
}

/// Stateful decoder. Feed bytes with [`FrameDecoder::push`]; drain ready
/// messages with [`FrameDecoder::next_message`]. Once a fatal framing error
/// has occurred the decoder latches and will not produce further messages.
pub struct FrameDecoder {
    limits: DecoderLimits,
    buffer: Vec<u8>,
    state: State,
    latched: bool,
}

impl FrameDecoder {
    pub fn new(limits: DecoderLimits) -> Self {
        Self { limits, buffer: Vec::new(), state: State::ReadingHeader, latched: false }
    }

    /// Append newly received bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.latched {
            return Ok(());
        }
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > self.limits.max_message_bytes {
            self.latched = true;
            return Err(Error::framing(format!(
                "buffered bytes {} exceed maxMessageBytes {}",
                self.buffer.len(),
                self.limits.max_message_bytes
            )));
        }
        Ok(())
    }

    /// Try to pull the next fully-buffered message out of the decoder.
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Decoded>> {
        if self.latched {
            return Ok(None);
        }
        loop {
            match self.state {
                State::ReadingHeader => {
                    let Some(pos) = find_subslice(&self.buffer, DELIMITER) else {
                        if self.buffer.len() > self.limits.max_header_bytes {
                            self.latched = true;
                            return Err(Error::framing(format!(
                                "header exceeds maxHeaderBytes {} without terminator",
                                self.limits.max_header_bytes
                            )));
                        }
                        return Ok(None);
                    };

                    let header_bytes = &self.buffer[..pos];
                    let header_str = match std::str::from_utf8(header_bytes) {
                        Ok(s) => s,
                        Err(e) => {
                            self.latched = true;
                            return Err(Error::from(e));
                        }
                    };

                    let content_length = header_str
                        .split(HEADER_LINE_SEP)
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix(CONTENT_LENGTH_PREFIX)
                                .map(|v| v.trim().to_string())
                        })
                        .ok_or_else(|| {
                            self.latched = true;
                            Error::framing("missing Content-Length header")
                        });
                    let content_length = match content_length {
                        Ok(v) => v,
                        Err(e) => return Err(e),
                    };
                    let content_length: usize = match content_length.parse() {
                        Ok(n) => n,
                        Err(_) => {
                            self.latched = true;
                            return Err(Error::framing(format!(
                                "unparseable Content-Length value: {content_length}"
                            )));
                        }
                    };

                    if content_length > self.limits.max_message_bytes {
                        self.latched = true;
                        return Err(Error::framing(format!(
                            "Content-Length {} exceeds maxMessageBytes {}",
                            content_length, self.limits.max_message_bytes
                        )));
                    }

                    self.buffer.drain(..pos + DELIMITER.len());
                    self.state = State::ReadingBody { content_length };
                }
                State::ReadingBody { content_length } => {
                    if self.buffer.len() < content_length {
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buffer.drain(..content_length).collect();
                    self.state = State::ReadingHeader;

                    return match String::from_utf8(body) {
                        Ok(s) => match serde_json::from_str::<Value>(&s) {
                            Ok(v) => Ok(Some(Decoded::Message(v))),
                            Err(e) => Ok(Some(Decoded::BodyParseError(Error::from(e)))),
                        },
                        Err(e) => Ok(Some(Decoded::BodyParseError(Error::from(e)))),
                    };
                }
            }
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(bytes: &[u8], limits: DecoderLimits) -> Result<Vec<Value>> {
        let mut decoder = FrameDecoder::new(limits);
        decoder.push(bytes)?;
        let mut out = Vec::new();
        while let Some(item) = decoder.next_message()? {
            match item {
                Decoded::Message(v) => out.push(v),
                Decoded::BodyParseError(e) => return Err(e),
            }
        }
        Ok(out)
    }

    #[test]
    fn round_trips_a_single_message() {
        let msg = json!({"jsonrpc":"2.0","id":"1","method":"ping"});
        let bytes = encode(&msg).unwrap();
        let decoded = decode_all(&bytes, DecoderLimits::default()).unwrap();
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn concatenated_messages_decode_regardless_of_chunking() {
        let m1 = json!({"a": 1});
        let m2 = json!({"b": 2});
        let mut bytes = encode(&m1).unwrap();
        bytes.extend(encode(&m2).unwrap());

        // whole buffer at once
        assert_eq!(decode_all(&bytes, DecoderLimits::default()).unwrap(), vec![m1.clone(), m2.clone()]);

        // one byte at a time
        let mut decoder = FrameDecoder::new(DecoderLimits::default());
        let mut out = Vec::new();
        for b in &bytes {
            decoder.push(&[*b]).unwrap();
            while let Some(Decoded::Message(v)) = decoder.next_message().unwrap() {
                out.push(v);
            }
        }
        assert_eq!(out, vec![m1, m2]);
    }

    #[test]
    fn unicode_byte_length_is_utf8_not_char_count() {
        let msg = json!({"text": "Hello, 世界! 🌍"});
        let bytes = encode(&msg).unwrap();
        let decoded = decode_all(&bytes, DecoderLimits::default()).unwrap();
        assert_eq!(decoded, vec![msg]);
    }

    #[test]
    fn body_exceeding_max_message_bytes_is_fatal() {
        let limits = DecoderLimits { max_header_bytes: 1024, max_message_bytes: 16 };
        let msg = json!({"text": "this body is definitely longer than sixteen bytes"});
        let bytes = encode(&msg).unwrap();
        let err = decode_all(&bytes, limits).unwrap_err();
        assert!(matches!(err, Error::Framing { .. }));
    }

    #[test]
    fn incremental_chunks_exceeding_max_message_bytes_are_fatal_even_if_small() {
        let limits = DecoderLimits { max_header_bytes: 1024, max_message_bytes: 10 };
        let mut decoder = FrameDecoder::new(limits);
        for _ in 0..20 {
            if decoder.push(b"x").is_err() {
                return;
            }
        }
        panic!("expected a fatal framing error before 20 single-byte chunks");
    }

    #[test]
    fn header_without_terminator_past_max_header_bytes_is_fatal() {
        let limits = DecoderLimits { max_header_bytes: 8, max_message_bytes: 1024 };
        let mut decoder = FrameDecoder::new(limits);
        decoder.push(b"Content-Length: ").unwrap();
        let err = decoder.next_message().unwrap_err();
        assert!(matches!(err, Error::Framing { .. }));
    }

    #[test]
    fn decoder_latches_after_fatal_error() {
        let limits = DecoderLimits { max_header_bytes: 1024, max_message_bytes: 4 };
        let mut decoder = FrameDecoder::new(limits);
        assert!(decoder.push(b"abcdefgh").is_err());
        // further pushes/pulls are inert, not panics, and yield no messages
        assert!(decoder.push(b"more").is_ok());
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let body = br#"{"a":1}"#;
        let mut bytes = format!("CONTENT-LENGTH: {}\r\n\r\n", body.len()).into_bytes();
        bytes.extend_from_slice(body);
        let decoded = decode_all(&bytes, DecoderLimits::default()).unwrap();
        assert_eq!(decoded, vec![json!({"a": 1})]);
    }

    #[test]
    fn body_parse_error_does_not_stop_the_stream() {
        let mut decoder = FrameDecoder::new(DecoderLimits::default());
        let bad = b"Content-Length: 7\r\n\r\nnotjson";
        decoder.push(bad).unwrap();
        let first = decoder.next_message().unwrap().unwrap();
        assert!(matches!(first, Decoded::BodyParseError(_)));

        let good = encode(&json!({"ok": true})).unwrap();
        decoder.push(&good).unwrap();
        let second = decoder.next_message().unwrap().unwrap();
        assert!(matches!(second, Decoded::Message(_)));
    }
}
