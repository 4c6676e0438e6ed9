use crate::cgi::{CgiInterest, CgiOutcome, CgiProcess, CgiSupervisor};
use crate::config::Config;
use crate::error::ServerError;
use crate::error_pages;
use crate::http::{HttpResponse, Method, ParseOutcome, Request, StatusCode};
use crate::post;
use crate::router;
use crate::static_handler;
use crate::utils::epoll::{EpollManager, Interest};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

const LOOP_SLICE: Duration = Duration::from_millis(100);
const RECV_CHUNK: usize = 8192;

/// Per-client state, keyed by the connection's socket descriptor. Exactly
/// one of `recv_buffer`/`send_buffer`/an in-flight `CgiProcess` is active
/// at a time; a connection awaiting a CGI child has `awaiting_cgi = true`
/// and is not driven by `handle_readable`/`handle_writable` until the
/// child finalizes and queues a response.
struct Connection {
    stream: TcpStream,
    server_index: usize,
    recv_buffer: Vec<u8>,
    send_buffer: Vec<u8>,
    received_body_size: usize,
    close_after_drain: bool,
    awaiting_cgi: bool,
}

impl Connection {
    fn new(stream: TcpStream, server_index: usize) -> Self {
        Self {
            stream,
            server_index,
            recv_buffer: Vec::new(),
            send_buffer: Vec::new(),
            received_body_size: 0,
            close_after_drain: false,
            awaiting_cgi: false,
        }
    }
}

/// What a routed request resolves to, before it becomes bytes in a
/// connection's send buffer (or a spawned child in the CGI map).
enum RequestOutcome {
    Response(HttpResponse),
    SpawnCgi { location_index: usize },
}

pub struct Server {
    config: Config,
    listeners: Vec<TcpListener>,
    listener_server_index: HashMap<RawFd, usize>,
    epoll: EpollManager,
    connections: HashMap<RawFd, Connection>,
    cgi_processes: HashMap<RawFd, CgiProcess>,
    /// CGI stdin descriptor -> the stdout descriptor keying `cgi_processes`,
    /// since a write-readiness event arrives on a different fd than the
    /// one the process is stored under.
    cgi_stdin_index: HashMap<RawFd, RawFd>,
    cgi_supervisor: CgiSupervisor,
}

impl Server {
    pub fn new(config: Config) -> io::Result<Self> {
        Ok(Self {
            config,
            listeners: Vec::new(),
            listener_server_index: HashMap::new(),
            epoll: EpollManager::new()?,
            connections: HashMap::new(),
            cgi_processes: HashMap::new(),
            cgi_stdin_index: HashMap::new(),
            cgi_supervisor: CgiSupervisor::new(),
        })
    }

    /// Overrides the CGI wall-clock deadline. Production always uses the
    /// default 5000 ms; tests use this to exercise the timeout sweep
    /// without waiting it out.
    pub fn with_cgi_timeout(mut self, timeout: Duration) -> Self {
        self.cgi_supervisor = CgiSupervisor::with_timeout(timeout);
        self
    }

    pub fn run(&mut self) -> io::Result<()> {
        self.setup_listeners()?;
        self.event_loop()
    }

    fn setup_listeners(&mut self) -> io::Result<()> {
        let mut seen: HashMap<SocketAddr, usize> = HashMap::new();
        for (index, server) in self.config.servers.iter().enumerate() {
            let addr = server
                .socket_addr()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
            if let Some(&first) = seen.get(&addr) {
                log::warn!("server {} shares listen endpoint {} with server {}", index, addr, first);
            }
            seen.insert(addr, index);

            let listener = TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            let fd = listener.as_raw_fd();
            self.epoll.add(fd, Interest::readable())?;
            log::info!("listening on {}", addr);
            self.listener_server_index.insert(fd, index);
            self.listeners.push(listener);
        }
        Ok(())
    }

    fn event_loop(&mut self) -> io::Result<()> {
        loop {
            let events = match self.epoll.wait(LOOP_SLICE) {
                Ok(events) => events,
                Err(e) => {
                    log::error!("epoll_wait failed: {}", e);
                    continue;
                }
            };

            for event in events {
                if let Some(&server_index) = self.listener_server_index.get(&event.fd) {
                    self.accept_connections(event.fd, server_index);
                    continue;
                }
                if self.cgi_processes.contains_key(&event.fd) {
                    self.drive_cgi_stdout(event.fd, event.hup_or_err);
                    continue;
                }
                if let Some(&stdout_fd) = self.cgi_stdin_index.get(&event.fd) {
                    self.drive_cgi_stdin(stdout_fd);
                    continue;
                }
                if self.connections.contains_key(&event.fd) {
                    // Readable before writable for the same descriptor.
                    if event.readable || event.hup_or_err {
                        self.handle_readable(event.fd);
                    }
                    if event.writable && self.connections.contains_key(&event.fd) {
                        self.handle_writable(event.fd);
                    }
                }
            }

            self.sweep_cgi_timeouts();
        }
    }

    fn accept_connections(&mut self, listener_fd: RawFd, server_index: usize) {
        let listener = match self.listeners.iter().find(|l| l.as_raw_fd() == listener_fd) {
            Some(l) => l,
            None => return,
        };
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("failed to set client nonblocking: {}", e);
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    if let Err(e) = self.epoll.add(fd, Interest::readable()) {
                        log::warn!("failed to register client fd: {}", e);
                        continue;
                    }
                    self.connections.insert(fd, Connection::new(stream, server_index));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, fd: RawFd) {
        let max_body_size = self.max_body_size_hint(fd);
        let read_result = {
            let conn = match self.connections.get_mut(&fd) {
                Some(c) => c,
                None => return,
            };
            let mut chunk = [0u8; RECV_CHUNK];
            match conn.stream.read(&mut chunk) {
                Ok(0) => None,
                Ok(n) => {
                    conn.recv_buffer.extend_from_slice(&chunk[..n]);
                    conn.received_body_size += n;
                    Some(())
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Some(()),
                Err(_) => None,
            }
        };

        if read_result.is_none() {
            self.close_connection(fd);
            return;
        }

        if let Some(limit) = max_body_size {
            let conn = self.connections.get(&fd).unwrap();
            if limit != 0 && conn.received_body_size as u64 > limit {
                if let Some(conn) = self.connections.get_mut(&fd) {
                    conn.recv_buffer.clear();
                }
                self.queue_error_response(fd, None, &ServerError::PayloadTooLarge, true);
                return;
            }
        }

        self.try_extract_request(fd);
    }

    /// A rough cap used while bytes are still accumulating, before a
    /// Location is known: the largest `max_body_size` configured anywhere
    /// on this connection's server (0 anywhere means unlimited).
    fn max_body_size_hint(&self, fd: RawFd) -> Option<u64> {
        let conn = self.connections.get(&fd)?;
        let server = &self.config.servers[conn.server_index];
        if server.locations.iter().any(|l| l.max_body_size == 0) {
            return Some(0);
        }
        server.locations.iter().map(|l| l.max_body_size).max().or(Some(0))
    }

    fn try_extract_request(&mut self, fd: RawFd) {
        loop {
            let conn = match self.connections.get_mut(&fd) {
                Some(c) => c,
                None => return,
            };
            if conn.awaiting_cgi || !conn.send_buffer.is_empty() {
                return;
            }
            if !Request::is_complete(&conn.recv_buffer) {
                return;
            }

            let outcome = Request::parse(&conn.recv_buffer);
            let request = match outcome {
                ParseOutcome::Malformed => {
                    conn.recv_buffer.clear();
                    self.queue_error_response(fd, None, &ServerError::ProtocolMalformed("parse failure".to_string()), true);
                    return;
                }
                ParseOutcome::LengthRequired => {
                    conn.recv_buffer.clear();
                    self.queue_error_response(fd, None, &ServerError::LengthRequired, true);
                    return;
                }
                ParseOutcome::Complete(r) => r,
            };

            let conn = self.connections.get_mut(&fd).unwrap();
            conn.recv_buffer.drain(..request.parsed_length);
            conn.received_body_size = 0;
            let server_index = conn.server_index;

            match self.route_request(&request, server_index) {
                Ok(RequestOutcome::Response(response)) => {
                    self.queue_response(fd, response, true);
                }
                Ok(RequestOutcome::SpawnCgi { location_index }) => {
                    self.spawn_cgi(fd, server_index, location_index, &request);
                }
                Err((location_index, e)) => self.queue_error_response(fd, location_index, &e, true),
            }
        }
    }

    /// Resolves `request` against the matched Location, returning either
    /// the outcome or the error paired with the matched Location's index
    /// (if any was matched) so the caller can resolve a Location-specific
    /// error page.
    fn route_request(&self, request: &Request, server_index: usize) -> Result<RequestOutcome, (Option<usize>, ServerError)> {
        let server = &self.config.servers[server_index];
        let location = match router::match_location(server, &request.uri) {
            Some(l) => l,
            None => return Err((None, ServerError::NotFound)),
        };
        let location_index = server.locations.iter().position(|l| std::ptr::eq(l, location)).unwrap();

        if let Err(e) = router::check_method(location, request.method) {
            return Err((Some(location_index), e));
        }

        if let Some((&status, target)) = location.redirects.iter().next() {
            let status_code = StatusCode::from(status);
            return Ok(RequestOutcome::Response(HttpResponse::redirect(status_code, target)));
        }

        if router::is_cgi_request(location, &request.uri) {
            return Ok(RequestOutcome::SpawnCgi { location_index });
        }

        let result = if request.method == Method::Post {
            post::handle(request, location)
        } else {
            static_handler::handle(request, server, location)
        };
        result.map(RequestOutcome::Response).map_err(|e| (Some(location_index), e))
    }

    fn spawn_cgi(&mut self, client_fd: RawFd, server_index: usize, location_index: usize, request: &Request) {
        let server = &self.config.servers[server_index];
        let location = &server.locations[location_index];
        let script_path = match static_handler::resolve_physical_path(&request.uri, server, location) {
            Ok(p) => p,
            Err(e) => {
                self.queue_error_response(client_fd, Some(location_index), &e, true);
                return;
            }
        };

        match self.cgi_supervisor.spawn(request, location, &script_path, client_fd, location_index) {
            Ok(process) => {
                let stdout_fd = process.stdout_fd();
                if let Err(e) = self.epoll.add(stdout_fd, Interest::readable()) {
                    log::warn!("failed to register cgi stdout: {}", e);
                }
                if let CgiInterest::WriteStdinPending = process.interest() {
                    if let Some(stdin_fd) = process.stdin_fd() {
                        if let Err(e) = self.epoll.add(stdin_fd, Interest { readable: false, writable: true }) {
                            log::warn!("failed to register cgi stdin: {}", e);
                        }
                        self.cgi_stdin_index.insert(stdin_fd, stdout_fd);
                    }
                }
                if let Some(conn) = self.connections.get_mut(&client_fd) {
                    conn.awaiting_cgi = true;
                }
                self.cgi_processes.insert(stdout_fd, process);
            }
            Err(e) => self.queue_error_response(client_fd, Some(location_index), &e, true),
        }
    }

    fn drive_cgi_stdin(&mut self, stdout_fd: RawFd) {
        let Some(process) = self.cgi_processes.get_mut(&stdout_fd) else { return };
        process.drive_write();
        match process.interest() {
            CgiInterest::ReadOnly => {
                if let Some((&stdin_fd, _)) = self.cgi_stdin_index.iter().find(|(_, &out)| out == stdout_fd) {
                    let _ = self.epoll.remove(stdin_fd);
                    self.cgi_stdin_index.remove(&stdin_fd);
                }
            }
            CgiInterest::WriteStdinPending => {}
        }
    }

    fn drive_cgi_stdout(&mut self, stdout_fd: RawFd, hup_or_err: bool) {
        let done = {
            let Some(process) = self.cgi_processes.get_mut(&stdout_fd) else { return };
            if hup_or_err {
                true
            } else {
                process.drive_read()
            }
        };
        if !done {
            return;
        }

        let Some(process) = self.cgi_processes.remove(&stdout_fd) else { return };
        let client_fd = process.client_fd;
        let location_index = process.location_index;
        if let Some(stdin_fd) = process.stdin_fd() {
            let _ = self.epoll.remove(stdin_fd);
            self.cgi_stdin_index.remove(&stdin_fd);
        }
        let _ = self.epoll.remove(stdout_fd);

        match process.finalize() {
            CgiOutcome::Response(response) => self.queue_response(client_fd, response, true),
            CgiOutcome::Error(e) => self.queue_error_response(client_fd, Some(location_index), &e, true),
        }
    }

    fn sweep_cgi_timeouts(&mut self) {
        let timed_out: Vec<RawFd> = self
            .cgi_processes
            .iter()
            .filter(|(_, p)| p.deadline_exceeded())
            .map(|(&fd, _)| fd)
            .collect();

        for stdout_fd in timed_out {
            let Some(mut process) = self.cgi_processes.remove(&stdout_fd) else { continue };
            let client_fd = process.client_fd;
            let location_index = process.location_index;
            process.kill();
            if let Some(stdin_fd) = process.stdin_fd() {
                let _ = self.epoll.remove(stdin_fd);
                self.cgi_stdin_index.remove(&stdin_fd);
            }
            let _ = self.epoll.remove(stdout_fd);
            self.queue_error_response(client_fd, Some(location_index), &ServerError::CgiTimeout, true);
        }
    }

    /// Resolves a custom error body against `location_index`'s Location (if
    /// one was matched before `err` was raised), falling back to the
    /// ServerConfig's own map, then the compiled-in default.
    fn queue_error_response(&mut self, fd: RawFd, location_index: Option<usize>, err: &ServerError, close_after: bool) {
        let custom_body = self.connections.get(&fd).and_then(|conn| {
            let server = &self.config.servers[conn.server_index];
            let location = location_index.map(|i| &server.locations[i]);
            error_pages::resolve(location, server, err.status_code() as u16)
        });
        let response = HttpResponse::error(err, custom_body);
        self.queue_response(fd, response, close_after);
    }

    fn queue_response(&mut self, fd: RawFd, response: HttpResponse, close_after: bool) {
        let Some(conn) = self.connections.get_mut(&fd) else { return };
        conn.awaiting_cgi = false;
        conn.send_buffer.extend_from_slice(&response.to_bytes());
        conn.close_after_drain = close_after;
        if let Err(e) = self.epoll.modify(fd, Interest::read_write()) {
            log::warn!("failed to arm writable interest for fd {}: {}", fd, e);
        }
    }

    fn handle_writable(&mut self, fd: RawFd) {
        let (drained, should_close) = {
            let Some(conn) = self.connections.get_mut(&fd) else { return };
            match conn.stream.write(&conn.send_buffer) {
                Ok(n) => {
                    conn.send_buffer.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    return self.close_connection(fd);
                }
            }
            let drained = conn.send_buffer.is_empty();
            (drained, drained && conn.close_after_drain)
        };

        if should_close {
            self.close_connection(fd);
        } else if drained {
            let _ = self.epoll.modify(fd, Interest::readable());
        }
    }

    fn close_connection(&mut self, fd: RawFd) {
        if let Some(conn) = self.connections.remove(&fd) {
            let _ = self.epoll.remove(fd);
            if conn.awaiting_cgi {
                self.kill_cgi_for_client(fd);
            }
        }
    }

    /// Client disconnected (or was torn down) while its CGI child was
    /// still running: kill and reap it so it doesn't outlive the
    /// connection it was answering.
    fn kill_cgi_for_client(&mut self, client_fd: RawFd) {
        let Some(&stdout_fd) = self
            .cgi_processes
            .iter()
            .find(|(_, p)| p.client_fd == client_fd)
            .map(|(fd, _)| fd)
        else {
            return;
        };
        if let Some(mut process) = self.cgi_processes.remove(&stdout_fd) {
            process.kill();
            if let Some(stdin_fd) = process.stdin_fd() {
                let _ = self.epoll.remove(stdin_fd);
                self.cgi_stdin_index.remove(&stdin_fd);
            }
            let _ = self.epoll.remove(stdout_fd);
        }
    }
}
