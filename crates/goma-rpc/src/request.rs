//! Request side of the HTTP request/response data model (spec §3).

use std::collections::BTreeMap;

use crate::compression::Encoding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// The body a request sends. Large bodies are restartable streams so a
/// retry after a connection failure doesn't require buffering (spec §4.E
/// "callers supply a streamed body that can be restarted for retry").
/// Modeled as a sum type over a small closed set (spec §9), not an
/// open-ended trait object: there is exactly one streaming shape the core
/// needs, a pre-materialized byte buffer.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Vec<u8>),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Bytes(b) => b,
        }
    }
}

/// An HTTP request under construction (spec §4.E `init`).
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub host: String,
    pub user_agent: String,
    pub content_type: String,
    pub cookie: Option<String>,
    pub authorization: Option<String>,
    pub content_encoding: Option<Encoding>,
    pub accept_encoding: Vec<Encoding>,
    pub extra_headers: BTreeMap<String, String>,
    pub body: Body,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>, host: impl Into<String>) -> Self {
        HttpRequest {
            method,
            path: path.into(),
            host: host.into(),
            user_agent: "goma-compiler-proxy/0.1".to_string(),
            content_type: "binary/x-protocol-buffer".to_string(),
            cookie: None,
            authorization: None,
            content_encoding: None,
            accept_encoding: Vec::new(),
            extra_headers: BTreeMap::new(),
            body: Body::Empty,
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Body::Bytes(body);
        self
    }

    pub fn with_authorization(mut self, auth: impl Into<String>) -> Self {
        self.authorization = Some(auth.into());
        self
    }

    /// Serializes the request line + headers + body into wire bytes,
    /// applying `content_encoding` to the body if set.
    pub fn to_wire_bytes(&self) -> std::io::Result<Vec<u8>> {
        let body_bytes = match self.content_encoding {
            Some(enc) => crate::compression::encode(enc, self.body.as_bytes())?,
            None => self.body.as_bytes().to_vec(),
        };

        let mut out = Vec::with_capacity(body_bytes.len() + 256);
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method.as_str(), self.path).as_bytes());
        out.extend_from_slice(format!("Host: {}\r\n", self.host).as_bytes());
        out.extend_from_slice(format!("User-Agent: {}\r\n", self.user_agent).as_bytes());
        out.extend_from_slice(format!("Content-Type: {}\r\n", self.content_type).as_bytes());
        out.extend_from_slice(format!("Content-Length: {}\r\n", body_bytes.len()).as_bytes());
        if let Some(enc) = self.content_encoding {
            out.extend_from_slice(format!("Content-Encoding: {}\r\n", enc.header_name()).as_bytes());
        }
        if !self.accept_encoding.is_empty() {
            let names: Vec<&str> = self.accept_encoding.iter().map(|e| e.header_name()).collect();
            out.extend_from_slice(format!("Accept-Encoding: {}\r\n", names.join(", ")).as_bytes());
        }
        if let Some(cookie) = &self.cookie {
            out.extend_from_slice(format!("Cookie: {cookie}\r\n").as_bytes());
        }
        if let Some(auth) = &self.authorization {
            out.extend_from_slice(format!("Authorization: {auth}\r\n").as_bytes());
        }
        for (key, value) in &self.extra_headers {
            out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&body_bytes);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_bytes_include_content_length_of_the_compressed_body() {
        let req = HttpRequest::new(Method::Post, "/e", "goma.example.com")
            .with_body(b"hello".to_vec());
        let wire = req.to_wire_bytes().expect("serialize");
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("POST /e HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn authorization_header_is_included_when_set() {
        let req = HttpRequest::new(Method::Post, "/e", "h").with_authorization("Bearer t0k3n");
        let wire = req.to_wire_bytes().expect("serialize");
        assert!(String::from_utf8_lossy(&wire).contains("Authorization: Bearer t0k3n\r\n"));
    }
}
