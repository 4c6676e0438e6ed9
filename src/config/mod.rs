use crate::http::Method;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub root: PathBuf,
    pub error_pages: HashMap<u16, PathBuf>,
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone)]
pub struct Location {
    /// Original (non-normalized) prefix as written in the config, so
    /// downstream path-building can strip exactly what the admin typed.
    pub prefix: String,
    pub root: Option<PathBuf>,
    pub index: Option<String>,
    pub autoindex: bool,
    pub methods: HashSet<Method>,
    pub upload_path: Option<PathBuf>,
    pub cgi_interpreter: Option<PathBuf>,
    /// Extension (including the leading dot, e.g. `.php`) a request URI
    /// must end in for this Location to be treated as CGI. Both this and
    /// `cgi_interpreter` must be set for the CGI trigger to fire.
    pub cgi_extension: Option<String>,
    /// 0 means unlimited.
    pub max_body_size: u64,
    pub redirects: HashMap<u16, String>,
    pub error_pages: HashMap<u16, PathBuf>,
}

impl Location {
    fn new(prefix: String) -> Self {
        Self {
            prefix,
            root: None,
            index: None,
            autoindex: false,
            methods: HashSet::new(),
            upload_path: None,
            cgi_interpreter: None,
            cgi_extension: None,
            max_body_size: 0,
            redirects: HashMap::new(),
            error_pages: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip = if self.host.is_empty() || self.host == "0.0.0.0" {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            self.host
                .parse()
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            root: PathBuf::from("."),
            error_pages: HashMap::new(),
            locations: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path))?;
        let config = Self::parse(&content).with_context(|| format!("parsing {}", path))?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let mut servers = Vec::new();
        let mut current_server: Option<ServerConfig> = None;
        let mut current_location: Option<Location> = None;
        // 0 = top level, 1 = inside server{}, 2 = inside location{}
        let mut depth = 0u8;

        for (lineno, raw_line) in content.lines().enumerate() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }

            if line == "server {" {
                if depth != 0 {
                    bail!("line {}: nested 'server' block", lineno + 1);
                }
                current_server = Some(ServerConfig::default());
                depth = 1;
                continue;
            }

            if let Some(prefix) = line
                .strip_prefix("location ")
                .and_then(|rest| rest.strip_suffix('{'))
            {
                if depth != 1 {
                    bail!("line {}: 'location' outside a server block", lineno + 1);
                }
                current_location = Some(Location::new(prefix.trim().to_string()));
                depth = 2;
                continue;
            }

            if line == "}" {
                match depth {
                    2 => {
                        let location = current_location
                            .take()
                            .ok_or_else(|| anyhow!("line {}: unmatched '}}'", lineno + 1))?;
                        current_server
                            .as_mut()
                            .ok_or_else(|| anyhow!("line {}: location outside server", lineno + 1))?
                            .locations
                            .push(location);
                        depth = 1;
                    }
                    1 => {
                        let server = current_server
                            .take()
                            .ok_or_else(|| anyhow!("line {}: unmatched '}}'", lineno + 1))?;
                        servers.push(server);
                        depth = 0;
                    }
                    _ => bail!("line {}: unmatched '}}'", lineno + 1),
                }
                continue;
            }

            match depth {
                1 => parse_server_directive(
                    current_server.as_mut().expect("depth 1 implies current_server"),
                    line,
                )
                .with_context(|| format!("line {}", lineno + 1))?,
                2 => parse_location_directive(
                    current_location.as_mut().expect("depth 2 implies current_location"),
                    line,
                )
                .with_context(|| format!("line {}", lineno + 1))?,
                _ => bail!("line {}: directive outside any block: {}", lineno + 1, line),
            }
        }

        if depth != 0 {
            bail!("unterminated block at end of file");
        }

        Ok(Config { servers })
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.port == 0 {
                bail!("server port must be non-zero");
            }
            if server.root.as_os_str().is_empty() {
                bail!("server root must be non-empty");
            }
            let addr = server.socket_addr()?;
            if !seen.insert(addr) {
                bail!("duplicate listen endpoint {}", addr);
            }
        }
        Ok(())
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn parse_server_directive(server: &mut ServerConfig, line: &str) -> Result<()> {
    let line = line.trim_end_matches(';');
    let mut parts = line.split_whitespace();
    let key = parts.next().ok_or_else(|| anyhow!("empty directive"))?;
    let rest: Vec<&str> = parts.collect();

    match key {
        "listen" => server.port = rest.first().ok_or_else(|| anyhow!("listen needs a port"))?.parse()?,
        "host" => server.host = rest.first().ok_or_else(|| anyhow!("host needs a value"))?.to_string(),
        "root" => server.root = PathBuf::from(rest.first().ok_or_else(|| anyhow!("root needs a path"))?),
        "error_page" => {
            if rest.len() < 2 {
                bail!("error_page needs a status and a path");
            }
            let status: u16 = rest[0].parse()?;
            server.error_pages.insert(status, PathBuf::from(rest[1]));
        }
        _ => {} // unrecognized server-level directive: ignored
    }
    Ok(())
}

fn parse_location_directive(location: &mut Location, line: &str) -> Result<()> {
    let line = line.trim_end_matches(';');
    let mut parts = line.split_whitespace();
    let key = parts.next().ok_or_else(|| anyhow!("empty directive"))?;
    let rest: Vec<&str> = parts.collect();

    match key {
        "root" => location.root = Some(PathBuf::from(rest.first().ok_or_else(|| anyhow!("root needs a path"))?)),
        "index" => location.index = Some(rest.first().ok_or_else(|| anyhow!("index needs a filename"))?.to_string()),
        "autoindex" => location.autoindex = rest.first() == Some(&"on"),
        "upload_path" | "upload_store" => {
            location.upload_path = Some(PathBuf::from(rest.first().ok_or_else(|| anyhow!("upload_path needs a path"))?))
        }
        "cgi_path" | "cgi_pass" => {
            location.cgi_interpreter =
                Some(PathBuf::from(rest.first().ok_or_else(|| anyhow!("cgi_path needs a path"))?))
        }
        "cgi_extension" | "cgi_ext" => {
            location.cgi_extension =
                Some(rest.first().ok_or_else(|| anyhow!("cgi_extension needs a value"))?.to_string())
        }
        "max_body_size" => location.max_body_size = parse_size(rest.first().ok_or_else(|| anyhow!("max_body_size needs a value"))?)?,
        "method" => {
            for m in rest {
                let method = Method::from_str(m).map_err(|_| anyhow!("unknown method '{}'", m))?;
                location.methods.insert(method);
            }
        }
        "return" => {
            if rest.len() < 2 {
                bail!("return needs a status and a target");
            }
            let status: u16 = rest[0].parse()?;
            location.redirects.insert(status, rest[1].to_string());
        }
        "error_page" => {
            if rest.len() < 2 {
                bail!("error_page needs a status and a path");
            }
            let status: u16 = rest[0].parse()?;
            location.error_pages.insert(status, PathBuf::from(rest[1]));
        }
        _ => {} // unrecognized location-level directive: ignored
    }
    Ok(())
}

fn parse_size(raw: &str) -> Result<u64> {
    let upper = raw.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(d) = upper.strip_suffix('K') {
        (d, 1024)
    } else if let Some(d) = upper.strip_suffix('M') {
        (d, 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix('G') {
        (d, 1024 * 1024 * 1024)
    } else {
        (upper.as_str(), 1)
    };
    let n: u64 = digits.parse().with_context(|| format!("invalid size '{}'", raw))?;
    Ok(n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_server() {
        let cfg = Config::parse(
            "server {\n  listen 8080;\n  root ./www;\n  location / {\n    method GET;\n    index index.html;\n  }\n}\n",
        )
        .unwrap();
        assert_eq!(cfg.servers.len(), 1);
        let server = &cfg.servers[0];
        assert_eq!(server.port, 8080);
        assert_eq!(server.locations.len(), 1);
        assert!(server.locations[0].methods.contains(&Method::Get));
    }

    #[test]
    fn parses_size_suffixes() {
        assert_eq!(parse_size("10").unwrap(), 10);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
    }

    #[test]
    fn duplicate_listen_endpoint_is_rejected() {
        let cfg = Config::parse(
            "server {\n listen 80;\n root ./a;\n}\nserver {\n listen 80;\n root ./b;\n}\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
