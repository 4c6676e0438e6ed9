use super::{Headers, StatusCode, Version};
use crate::error::{default_error_body, ServerError};
use std::time::SystemTime;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// HEAD omits the body bytes on the wire but keeps every header,
    /// including the Content-Length the GET response would have carried.
    pub omit_body: bool,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        let mut headers = Headers::new();
        headers.insert("server".to_string(), "webserv/0.1".to_string());
        headers.insert("date".to_string(), httpdate::fmt_http_date(SystemTime::now()));
        headers.insert("connection".to_string(), "close".to_string());

        Self {
            version: Version::default(),
            status,
            headers,
            body: Vec::new(),
            omit_body: false,
        }
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.set_header("content-length", &body.len().to_string());
        self.body = body;
    }

    pub fn no_content() -> Self {
        let mut resp = Self::new(StatusCode::NoContent);
        resp.set_header("content-length", "0");
        resp
    }

    pub fn redirect(status: StatusCode, location: &str) -> Self {
        let mut resp = Self::new(status);
        resp.set_header("location", location);
        resp.set_body(Vec::new());
        resp
    }

    /// Builds a canned error response. `custom_body` is whatever the
    /// Location-then-ServerConfig error-page lookup resolved to, falling
    /// back to the built-in default body for this status.
    pub fn error(err: &ServerError, custom_body: Option<Vec<u8>>) -> Self {
        let status = err.status_code();
        let mut resp = Self::new(status);
        if let Some(allow) = err.allow_header() {
            resp.set_header("allow", &allow);
        }
        let body = custom_body.unwrap_or_else(|| default_error_body(status as u16).as_bytes().to_vec());
        resp.set_header("content-type", "text/html");
        resp.set_body(body);
        resp
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(format!("{} {}\r\n", self.version, self.status).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if !self.omit_body {
            out.extend_from_slice(&self.body);
        }
        out
    }

    pub fn content_type_for_extension(extension: &str) -> &'static str {
        match extension.to_ascii_lowercase().as_str() {
            "html" | "htm" => "text/html",
            "txt" => "text/plain",
            "css" => "text/css",
            "js" => "application/javascript",
            "json" => "application/json",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            _ => "application/octet-stream",
        }
    }
}

