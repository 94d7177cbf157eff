//! Response accumulator (spec §3 "HTTP request/response"): header buffer
//! until CRLF-CRLF, then a content-length or chunked body accumulator,
//! optionally gzip/deflate-wrapped. Status, body-offset, and encoding are
//! determined exactly once, at the point the header finishes parsing.

use crate::compression::{self, Encoding};
use crate::error::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    ContentLength(usize),
    Chunked,
    /// No body expected at all (e.g. a HEAD-like ping response).
    None,
}

/// A response whose header has finished parsing.
struct Parsed {
    status: u16,
    content_encoding: Option<Encoding>,
    accept_encoding_header: Option<String>,
    mode: BodyMode,
}

/// Accumulates bytes off the wire into a complete HTTP response.
///
/// Grounded on `goma-net`'s TLS engine in its incremental, feed-bytes-as-
/// they-arrive shape: callers repeatedly call [`feed`](Self::feed) as more
/// bytes arrive from the reactor and check [`is_complete`](Self::is_complete).
pub struct HttpResponse {
    raw: Vec<u8>,
    parsed: Option<Parsed>,
    /// Cursor used while accumulating chunked bodies; advances past each
    /// chunk's framing as it's consumed.
    body_start: usize,
    /// The header-parse offset, fixed once at parse time and never
    /// mutated by chunk bookkeeping — used to re-walk the dechunked
    /// stream when assembling the final body.
    header_end: usize,
    complete: bool,
    /// Bytes still needed to finish the current chunk (chunked mode only).
    chunk_remaining: usize,
}

impl HttpResponse {
    pub fn new() -> Self {
        HttpResponse { raw: Vec::new(), parsed: None, body_start: 0, header_end: 0, complete: false, chunk_remaining: 0 }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        self.raw.extend_from_slice(bytes);
        if self.parsed.is_none() {
            self.try_parse_header()?;
        }
        if self.parsed.is_some() && !self.complete {
            self.advance_body()?;
        }
        Ok(())
    }

    fn try_parse_header(&mut self) -> Result<(), RpcError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut response = httparse::Response::new(&mut headers);
        let parse_result = response
            .parse(&self.raw)
            .map_err(|err| RpcError::MalformedResponse(err.to_string()))?;

        let httparse::Status::Complete(offset) = parse_result else { return Ok(()) };

        let status = response.code.ok_or_else(|| RpcError::MalformedResponse("missing status code".into()))?;

        let mut content_length: Option<usize> = None;
        let mut chunked = false;
        let mut content_encoding = None;
        let mut accept_encoding_header = None;
        for header in response.headers.iter() {
            let name = header.name.to_ascii_lowercase();
            let value = String::from_utf8_lossy(header.value).to_string();
            match name.as_str() {
                "content-length" => content_length = value.trim().parse().ok(),
                "transfer-encoding" => chunked = value.to_ascii_lowercase().contains("chunked"),
                "content-encoding" => content_encoding = Encoding::from_header_value(&value),
                "accept-encoding" => accept_encoding_header = Some(value),
                _ => {}
            }
        }

        let mode = if chunked {
            BodyMode::Chunked
        } else if let Some(len) = content_length {
            BodyMode::ContentLength(len)
        } else {
            BodyMode::None
        };

        self.body_start = offset;
        self.header_end = offset;
        self.parsed = Some(Parsed { status, content_encoding, accept_encoding_header, mode });
        if matches!(mode, BodyMode::None) {
            self.complete = true;
        }
        Ok(())
    }

    fn advance_body(&mut self) -> Result<(), RpcError> {
        let mode = self.parsed.as_ref().expect("header already parsed").mode;
        match mode {
            BodyMode::None => self.complete = true,
            BodyMode::ContentLength(len) => {
                if self.raw.len() - self.body_start >= len {
                    self.complete = true;
                }
            }
            BodyMode::Chunked => self.advance_chunked()?,
        }
        Ok(())
    }

    /// Consumes as many complete chunks as are available; a chunked body
    /// is only complete once the terminating zero-length chunk is seen
    /// (spec §3 invariant).
    fn advance_chunked(&mut self) -> Result<(), RpcError> {
        loop {
            let buf = &self.raw[self.body_start..];
            if self.chunk_remaining > 0 {
                let take = self.chunk_remaining.min(buf.len());
                self.chunk_remaining -= take;
                self.body_start += take;
                if self.chunk_remaining > 0 {
                    return Ok(());
                }
                // Skip the trailing CRLF after the chunk data, if present.
                if self.raw[self.body_start..].starts_with(b"\r\n") {
                    self.body_start += 2;
                }
                continue;
            }

            let buf = &self.raw[self.body_start..];
            let Some(line_end) = find_crlf(buf) else { return Ok(()) };
            let size_line = std::str::from_utf8(&buf[..line_end]).map_err(|_| RpcError::MalformedResponse("bad chunk size".into()))?;
            let size_hex = size_line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_hex, 16).map_err(|_| RpcError::MalformedResponse(format!("bad chunk size {size_hex:?}")))?;
            self.body_start += line_end + 2;

            if size == 0 {
                self.complete = true;
                return Ok(());
            }
            self.chunk_remaining = size;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn status(&self) -> Option<u16> {
        self.parsed.as_ref().map(|p| p.status)
    }

    pub fn accept_encoding_header(&self) -> Option<&str> {
        self.parsed.as_ref().and_then(|p| p.accept_encoding_header.as_deref())
    }

    /// The declared `Content-Length`, if the response used that framing
    /// (used to size the adaptive read-timeout; chunked/unknown-length
    /// responses have no declared size to estimate from).
    pub fn declared_len(&self) -> Option<usize> {
        match self.parsed.as_ref()?.mode {
            BodyMode::ContentLength(len) => Some(len),
            _ => None,
        }
    }

    /// Returns the fully assembled, decompressed body. Only meaningful
    /// once [`is_complete`](Self::is_complete) is true.
    pub fn body(&self) -> Result<Vec<u8>, RpcError> {
        let parsed = self.parsed.as_ref().expect("response not yet complete");
        let raw_body = self.raw_body_bytes(parsed.mode);
        match parsed.content_encoding {
            Some(enc) => compression::decode(enc, &raw_body).map_err(|err| RpcError::MalformedResponse(err.to_string())),
            None => Ok(raw_body),
        }
    }

    fn raw_body_bytes(&self, mode: BodyMode) -> Vec<u8> {
        match mode {
            BodyMode::None => Vec::new(),
            BodyMode::ContentLength(len) => self.raw[self.body_start..self.body_start + len].to_vec(),
            BodyMode::Chunked => {
                // Re-walk the dechunked stream to strip framing from the copy
                // returned to callers; `advance_chunked` already validated it.
                let mut out = Vec::new();
                let mut cursor = self.header_end;
                loop {
                    let buf = &self.raw[cursor..];
                    let Some(line_end) = find_crlf(buf) else { break };
                    let size_hex = std::str::from_utf8(&buf[..line_end]).unwrap_or("0").split(';').next().unwrap_or("0").trim();
                    let Ok(size) = usize::from_str_radix(size_hex, 16) else { break };
                    cursor += line_end + 2;
                    if size == 0 {
                        break;
                    }
                    out.extend_from_slice(&self.raw[cursor..cursor + size]);
                    cursor += size;
                    if self.raw[cursor..].starts_with(b"\r\n") {
                        cursor += 2;
                    }
                }
                out
            }
        }
    }

}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_body_completes_once_all_bytes_arrive() {
        let mut resp = HttpResponse::new();
        resp.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel").unwrap();
        assert!(!resp.is_complete());
        resp.feed(b"lo").unwrap();
        assert!(resp.is_complete());
        assert_eq!(resp.status(), Some(200));
        assert_eq!(resp.body().unwrap(), b"hello");
    }

    #[test]
    fn chunked_body_is_not_complete_until_the_zero_chunk() {
        let mut resp = HttpResponse::new();
        resp.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        resp.feed(b"5\r\nhello\r\n").unwrap();
        assert!(!resp.is_complete());
        resp.feed(b"0\r\n\r\n").unwrap();
        assert!(resp.is_complete());
        assert_eq!(resp.body().unwrap(), b"hello");
    }

    #[test]
    fn gzip_content_encoding_is_decompressed_in_body() {
        let payload = compression::encode(Encoding::Gzip, b"compressed payload").unwrap();
        let mut resp = HttpResponse::new();
        let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Encoding: gzip\r\n\r\n", payload.len());
        resp.feed(header.as_bytes()).unwrap();
        resp.feed(&payload).unwrap();
        assert!(resp.is_complete());
        assert_eq!(resp.body().unwrap(), b"compressed payload");
    }

    #[test]
    fn no_content_length_or_chunked_header_completes_with_empty_body() {
        let mut resp = HttpResponse::new();
        resp.feed(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert!(resp.is_complete());
        assert_eq!(resp.body().unwrap(), Vec::<u8>::new());
    }
}
