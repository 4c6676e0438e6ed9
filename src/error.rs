use crate::http::status::StatusCode;
use lazy_static::lazy_static;
use std::collections::HashMap;
use thiserror::Error;

/// Failure taxonomy for a single request/response cycle. Every handler
/// either advances connection state or returns one of these; the event
/// loop never sees anything else bubble up as fatal for a connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("malformed request: {0}")]
    ProtocolMalformed(String),

    #[error("method not allowed")]
    MethodNotAllowed { allowed: Vec<String> },

    #[error("method not implemented")]
    NotImplemented,

    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("unsupported media type")]
    UnsupportedMediaType,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("length required")]
    LengthRequired,

    #[error("cgi failure: {0}")]
    CgiFailure(String),

    #[error("cgi timed out")]
    CgiTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Maps a failure kind to the status code it surfaces to the client.
    /// `Io` is only ever constructed for genuinely fatal I/O (the
    /// would-block case is filtered out by callers before this type is
    /// built), so it surfaces as 500.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::ProtocolMalformed(_) => StatusCode::BadRequest,
            ServerError::MethodNotAllowed { .. } => StatusCode::MethodNotAllowed,
            ServerError::NotImplemented => StatusCode::NotImplemented,
            ServerError::NotFound => StatusCode::NotFound,
            ServerError::Forbidden => StatusCode::Forbidden,
            ServerError::UnsupportedMediaType => StatusCode::UnsupportedMediaType,
            ServerError::PayloadTooLarge => StatusCode::PayloadTooLarge,
            ServerError::LengthRequired => StatusCode::LengthRequired,
            ServerError::CgiFailure(_) => StatusCode::InternalServerError,
            ServerError::CgiTimeout => StatusCode::GatewayTimeout,
            ServerError::Io(_) => StatusCode::InternalServerError,
        }
    }

    pub fn allow_header(&self) -> Option<String> {
        match self {
            ServerError::MethodNotAllowed { allowed } => Some(allowed.join(", ")),
            _ => None,
        }
    }
}

lazy_static! {
    /// Built-in default bodies per status, used when neither the matched
    /// Location nor its ServerConfig configure a custom error page.
    static ref DEFAULT_ERROR_BODIES: HashMap<u16, &'static str> = {
        let mut m = HashMap::new();
        m.insert(400, "<html><body><h1>400 Bad Request</h1></body></html>");
        m.insert(403, "<html><body><h1>403 Forbidden</h1></body></html>");
        m.insert(404, "<html><body><h1>404 Not Found</h1></body></html>");
        m.insert(405, "<html><body><h1>405 Method Not Allowed</h1></body></html>");
        m.insert(411, "<html><body><h1>411 Length Required</h1></body></html>");
        m.insert(413, "<html><body><h1>413 Payload Too Large</h1></body></html>");
        m.insert(415, "<html><body><h1>415 Unsupported Media Type</h1></body></html>");
        m.insert(500, "<html><body><h1>500 Internal Server Error</h1></body></html>");
        m.insert(501, "<html><body><h1>501 Not Implemented</h1></body></html>");
        m.insert(502, "<html><body><h1>502 Bad Gateway</h1></body></html>");
        m.insert(504, "<html><body><h1>504 Gateway Timeout</h1></body></html>");
        m
    };
}

/// Default body for a status with no configured error page. Every status
/// in the taxonomy has an entry; statuses outside it (e.g. 200/204) are
/// never looked up here.
pub fn default_error_body(status: u16) -> &'static str {
    DEFAULT_ERROR_BODIES
        .get(&status)
        .copied()
        .unwrap_or("<html><body><h1>Error</h1></body></html>")
}
