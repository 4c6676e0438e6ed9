use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub mod request;
pub mod response;
pub mod status;

pub use request::{ParseOutcome, Request};
pub use response::HttpResponse;
pub use status::StatusCode;

/// Methods this server understands at the protocol level. `{GET, HEAD,
/// POST, DELETE}` are implemented; `PUT`/`OPTIONS` parse successfully but
/// never appear in any Location's method set, so routing surfaces them
/// as 501 Not Implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Delete,
    Put,
    Options,
}

impl Method {
    pub fn is_implemented(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Post | Method::Delete)
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            "PUT" => Ok(Method::Put),
            "OPTIONS" => Ok(Method::Options),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Put => "PUT",
            Method::Options => "OPTIONS",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    /// Only HTTP/1.0 and HTTP/1.1 are accepted.
    pub fn is_supported(&self) -> bool {
        self.major == 1 && (self.minor == 0 || self.minor == 1)
    }
}

impl Default for Version {
    fn default() -> Self {
        Version { major: 1, minor: 1 }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("HTTP/").ok_or(())?;
        let mut parts = rest.splitn(2, '.');
        let major = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let minor = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        Ok(Version { major, minor })
    }
}

/// Header names are stored lowercased; reads go through `get_ci`, which
/// lowercases the lookup key.
pub type Headers = HashMap<String, String>;

pub trait HeadersExt {
    fn get_ci(&self, name: &str) -> Option<&str>;
}

impl HeadersExt for Headers {
    fn get_ci(&self, name: &str) -> Option<&str> {
        self.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}
