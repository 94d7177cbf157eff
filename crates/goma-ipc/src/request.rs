//! Server-side HTTP/1.1 request accumulator for the local transport (spec
//! §4.H: "Request framing is HTTP/1.1 over the local transport so the same
//! HTTP server logic serves status pages over TCP"). Local requests are
//! always `Content-Length`-framed — a gomacc-style client never streams a
//! chunked body to the daemon — so unlike `goma-rpc`'s response parser,
//! chunked transfer encoding isn't handled here.

use crate::error::IpcError;

pub struct IncomingRequest {
    raw: Vec<u8>,
    header_end: Option<usize>,
    content_length: usize,
    path: String,
    complete: bool,
}

impl IncomingRequest {
    pub fn new() -> Self {
        IncomingRequest { raw: Vec::new(), header_end: None, content_length: 0, path: String::new(), complete: false }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), IpcError> {
        self.raw.extend_from_slice(bytes);
        if self.header_end.is_none() {
            self.try_parse_header()?;
        }
        if let Some(header_end) = self.header_end {
            if self.raw.len() - header_end >= self.content_length {
                self.complete = true;
            }
        }
        Ok(())
    }

    fn try_parse_header(&mut self) -> Result<(), IpcError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut headers);
        let parse_result = request
            .parse(&self.raw)
            .map_err(|err| IpcError::MalformedRequest(err.to_string()))?;

        let httparse::Status::Complete(offset) = parse_result else { return Ok(()) };

        self.path = request.path.unwrap_or("/").to_string();
        self.content_length = request
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        self.header_end = Some(offset);
        if self.content_length == 0 {
            self.complete = true;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> &[u8] {
        match self.header_end {
            Some(offset) => &self.raw[offset..offset + self.content_length],
            None => &[],
        }
    }
}

impl Default for IncomingRequest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_once_the_declared_body_length_arrives() {
        let mut req = IncomingRequest::new();
        req.feed(b"POST /e HTTP/1.1\r\nContent-Length: 4\r\n\r\nab").unwrap();
        assert!(!req.is_complete());
        req.feed(b"cd").unwrap();
        assert!(req.is_complete());
        assert_eq!(req.path(), "/e");
        assert_eq!(req.body(), b"abcd");
    }

    #[test]
    fn request_with_no_body_completes_as_soon_as_headers_parse() {
        let mut req = IncomingRequest::new();
        req.feed(b"GET /pingz HTTP/1.1\r\nHost: local\r\n\r\n").unwrap();
        assert!(req.is_complete());
        assert_eq!(req.path(), "/pingz");
        assert!(req.body().is_empty());
    }
}
