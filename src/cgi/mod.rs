use crate::config::Location;
use crate::error::ServerError;
use crate::http::{HttpResponse, Request, StatusCode};
use libc::{fcntl, F_SETFL, O_NONBLOCK};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_millis(5000);
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// What the event loop should watch next for a given `CgiProcess`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiInterest {
    WriteStdinPending,
    ReadOnly,
}

/// Why a `CgiProcess` stopped being driven.
pub enum CgiOutcome {
    Response(HttpResponse),
    Error(ServerError),
}

/// One live child process. Owned by the event loop's CGI map, keyed by
/// `stdout_fd`. Every method here is non-blocking: callers only invoke
/// `drive_write`/`drive_read` after epoll reports readiness on the
/// matching fd, and `check_timeout` once per loop slice.
pub struct CgiProcess {
    child: Child,
    stdin_fd: Option<RawFd>,
    stdout_fd: RawFd,
    input_buffer: Vec<u8>,
    output_buffer: Vec<u8>,
    started_at: Instant,
    deadline: Duration,
    pub client_fd: RawFd,
    /// Index into the owning `ServerConfig.locations`, carried so a late
    /// failure (timeout, non-zero exit, oversized output) can still
    /// resolve a Location-specific error page.
    pub location_index: usize,
}

impl CgiProcess {
    pub fn stdout_fd(&self) -> RawFd {
        self.stdout_fd
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin_fd
    }

    pub fn interest(&self) -> CgiInterest {
        if self.stdin_fd.is_some() && !self.input_buffer.is_empty() {
            CgiInterest::WriteStdinPending
        } else {
            CgiInterest::ReadOnly
        }
    }

    /// Writes as much of `input_buffer` as the pipe accepts right now.
    /// Closes the parent's write end (EOF to the child) once drained.
    pub fn drive_write(&mut self) {
        let Some(stdin) = self.child.stdin.as_mut() else { return };
        match stdin.write(&self.input_buffer) {
            Ok(0) => {}
            Ok(n) => {
                self.input_buffer.drain(..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => {
                self.input_buffer.clear();
            }
        }
        if self.input_buffer.is_empty() {
            self.child.stdin.take();
            self.stdin_fd = None;
        }
    }

    /// Reads available bytes from the child's stdout. Returns `true` once
    /// the child has hit EOF (or the 1 MiB cap), at which point the
    /// caller should call `finalize`.
    pub fn drive_read(&mut self) -> bool {
        let Some(stdout) = self.child.stdout.as_mut() else { return true };
        let mut chunk = [0u8; 8192];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) => return true,
                Ok(n) => {
                    self.output_buffer.extend_from_slice(&chunk[..n]);
                    if self.output_buffer.len() > MAX_OUTPUT_BYTES {
                        return true;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(_) => return true,
            }
        }
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.started_at.elapsed() >= self.deadline
    }

    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Reaps the child and turns whatever is in `output_buffer` into a
    /// response, or a failure. Called after `drive_read` reports EOF, or
    /// after the descriptor hangs up / errors.
    pub fn finalize(mut self) -> CgiOutcome {
        if self.output_buffer.len() > MAX_OUTPUT_BYTES {
            self.kill();
            return CgiOutcome::Error(ServerError::CgiFailure("output exceeded 1 MiB cap".to_string()));
        }
        match self.child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                return CgiOutcome::Error(ServerError::CgiFailure(format!("child exited with {}", status)));
            }
            Ok(None) => {
                // Stdout already hit EOF, which means the write end is
                // closed; the process is exiting and this wait returns
                // promptly rather than blocking the loop indefinitely.
                match self.child.wait() {
                    Ok(status) if !status.success() => {
                        return CgiOutcome::Error(ServerError::CgiFailure(format!("child exited with {}", status)));
                    }
                    Err(e) => return CgiOutcome::Error(ServerError::Io(e)),
                    Ok(_) => {}
                }
            }
            Err(e) => return CgiOutcome::Error(ServerError::Io(e)),
            Ok(Some(_)) => {}
        }
        CgiOutcome::Response(assemble_response(&self.output_buffer))
    }
}

/// Spawns CGI children with a configurable wall-clock deadline. The event
/// loop holds one long-lived instance built with the default (5000 ms)
/// deadline; tests build a second instance with a short deadline so
/// scenario 6 (CGI timeout) doesn't need a real multi-second sleep.
pub struct CgiSupervisor {
    timeout: Duration,
}

impl CgiSupervisor {
    pub fn new() -> Self {
        Self { timeout: TIMEOUT }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Spawns the CGI interpreter for `script_path`, wiring its stdin/stdout
    /// into non-blocking pipes the event loop can drive. `client_fd` is
    /// carried along so the loop can route the eventual response (or a 504
    /// on timeout) back to the right connection; `location_index` lets it
    /// resolve a Location-specific error page on a late failure.
    pub fn spawn(
        &self,
        request: &Request,
        location: &Location,
        script_path: &Path,
        client_fd: RawFd,
        location_index: usize,
    ) -> Result<CgiProcess, ServerError> {
        let interpreter = location
            .cgi_interpreter
            .as_ref()
            .ok_or_else(|| ServerError::CgiFailure("no cgi interpreter configured".to_string()))?;

        let env = build_environment(request, script_path);

        let mut child = Command::new(interpreter)
            .arg(script_path)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ServerError::CgiFailure(format!("spawn failed: {}", e)))?;

        let stdin_fd = child.stdin.as_ref().map(|s| s.as_raw_fd());
        let stdout_fd = child
            .stdout
            .as_ref()
            .map(|s| s.as_raw_fd())
            .ok_or_else(|| ServerError::CgiFailure("no stdout pipe".to_string()))?;

        if let Some(fd) = stdin_fd {
            set_nonblocking(fd);
        }
        set_nonblocking(stdout_fd);

        let input_buffer = request.body.clone();
        if input_buffer.is_empty() {
            child.stdin.take();
        }

        Ok(CgiProcess {
            child,
            stdin_fd: if input_buffer.is_empty() { None } else { stdin_fd },
            stdout_fd,
            input_buffer,
            output_buffer: Vec::new(),
            started_at: Instant::now(),
            deadline: self.timeout,
            client_fd,
            location_index,
        })
    }
}

impl Default for CgiSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        fcntl(fd, F_SETFL, O_NONBLOCK);
    }
}

/// Only the stable subset named in the external interfaces: method,
/// content length, query string, script path, and a fixed redirect
/// status so PHP-CGI-style interpreters don't treat this as a redirect.
fn build_environment(request: &Request, script_path: &Path) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("REQUEST_METHOD".to_string(), request.method.to_string());
    env.insert(
        "CONTENT_LENGTH".to_string(),
        request.content_length().unwrap_or(request.body.len()).to_string(),
    );
    env.insert(
        "QUERY_STRING".to_string(),
        request.query_string.clone().unwrap_or_default(),
    );
    env.insert(
        "SCRIPT_FILENAME".to_string(),
        script_path.to_string_lossy().into_owned(),
    );
    env.insert("REDIRECT_STATUS".to_string(), "200".to_string());
    if let Some(ct) = request.get_header("content-type") {
        env.insert("CONTENT_TYPE".to_string(), ct.to_string());
    }
    env
}

/// Converts "CGI headers + blank line + body" into an HTTP response. A
/// missing blank line means the whole stream is the body with a default
/// 200 status and `text/html` content type.
fn assemble_response(output: &[u8]) -> HttpResponse {
    let (header_end, sep_len) = match find_blank_line(output) {
        Some(found) => found,
        None => {
            let mut resp = HttpResponse::new(StatusCode::Ok);
            resp.set_header("content-type", "text/html");
            resp.set_body(output.to_vec());
            return resp;
        }
    };

    let header_block = String::from_utf8_lossy(&output[..header_end]);
    let body = output[header_end + sep_len..].to_vec();

    let mut status = StatusCode::Ok;
    let mut content_type_set = false;
    let mut resp = HttpResponse::new(status);

    for line in header_block.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.find(':') else { continue };
        let name = line[..colon].trim();
        let value = line[colon + 1..].trim();

        if name.eq_ignore_ascii_case("status") {
            if let Some(code) = value.split_whitespace().next().and_then(|s| s.parse::<u16>().ok()) {
                status = StatusCode::from(code);
            }
        } else {
            if name.eq_ignore_ascii_case("content-type") {
                content_type_set = true;
            }
            resp.set_header(name, value);
        }
    }

    resp.status = status;
    if !content_type_set {
        resp.set_header("content-type", "text/html");
    }
    resp.set_body(body);
    resp
}

fn find_blank_line(output: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = output.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, 4));
    }
    output.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_response_with_status_header() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmissing";
        let resp = assemble_response(raw);
        assert_eq!(resp.status, StatusCode::NotFound);
        assert_eq!(resp.body, b"missing");
    }

    #[test]
    fn defaults_to_200_and_html_without_status() {
        let raw = b"Content-Type: text/plain\r\n\r\nhello bob";
        let resp = assemble_response(raw);
        assert_eq!(resp.status, StatusCode::Ok);
        assert_eq!(resp.body, b"hello bob");
    }

    #[test]
    fn missing_content_type_defaults_to_html() {
        let raw = b"X-Custom: 1\r\n\r\n<p>hi</p>";
        let resp = assemble_response(raw);
        assert_eq!(resp.headers.get("content-type").map(|s| s.as_str()), Some("text/html"));
    }

    #[test]
    fn no_blank_line_treats_everything_as_body() {
        let raw = b"just some raw bytes with no header block";
        let resp = assemble_response(raw);
        assert_eq!(resp.body, raw);
        assert_eq!(resp.status, StatusCode::Ok);
    }

    /// Exercises a short deadline directly against a real child, so
    /// scenario 6 (CGI timeout) doesn't have to wait out the production
    /// 5000 ms deadline to prove the sweep logic works.
    #[test]
    fn with_timeout_shortens_the_deadline() {
        let supervisor = CgiSupervisor::with_timeout(Duration::from_millis(50));
        let request = Request {
            method: crate::http::Method::Get,
            uri: "/cgi/slow.sh".to_string(),
            query_string: None,
            version: crate::http::Version::default(),
            headers: std::collections::HashMap::new(),
            body: Vec::new(),
            parsed_length: 0,
        };
        let location = Location {
            prefix: "/cgi/".to_string(),
            root: None,
            index: None,
            autoindex: false,
            methods: std::collections::HashSet::new(),
            upload_path: None,
            cgi_interpreter: Some(std::path::PathBuf::from("/bin/sh")),
            cgi_extension: Some(".sh".to_string()),
            max_body_size: 0,
            redirects: std::collections::HashMap::new(),
            error_pages: std::collections::HashMap::new(),
        };
        let script = std::env::temp_dir().join("cgi_supervisor_timeout_test.sh");
        std::fs::write(&script, "sleep 1\n").unwrap();

        let mut process = supervisor.spawn(&request, &location, &script, -1, 0).expect("spawn should succeed");
        assert!(!process.deadline_exceeded());
        std::thread::sleep(Duration::from_millis(80));
        assert!(process.deadline_exceeded());
        process.kill();

        let _ = std::fs::remove_file(&script);
    }
}
