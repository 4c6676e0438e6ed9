use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use webserv::config::{Config, Location, ServerConfig};
use webserv::http::Method;
use webserv::server::Server;

fn unique_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("webserv_e2e_{}_{}", label, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn bare_location(prefix: &str) -> Location {
    Location {
        prefix: prefix.to_string(),
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

fn server_config(port: u16, root: PathBuf, locations: Vec<Location>) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port,
        root,
        error_pages: HashMap::new(),
        locations,
    }
}

fn spawn_server(config: ServerConfig) {
    thread::spawn(move || {
        let mut server = Server::new(Config { servers: vec![config] }).expect("server should bind");
        server.run().expect("event loop should not error out");
    });
    thread::sleep(Duration::from_millis(200));
}

fn request(port: u16, raw: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect should succeed");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(raw.as_bytes()).unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[test]
fn static_get_serves_index() {
    let root = unique_dir("static_get");
    fs::write(root.join("index.html"), "hi\n").unwrap();

    let mut loc = bare_location("/");
    loc.methods.insert(Method::Get);
    loc.index = Some("index.html".to_string());
    spawn_server(server_config(18081, root, vec![loc]));

    let response = request(18081, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.contains("Content-Length: 3"), "{}", response);
    assert!(response.ends_with("hi\n"), "{}", response);
}

#[test]
fn traversal_is_rejected() {
    let root = unique_dir("traversal");
    fs::write(root.join("index.html"), "hi\n").unwrap();

    let mut loc = bare_location("/");
    loc.methods.insert(Method::Get);
    loc.index = Some("index.html".to_string());
    spawn_server(server_config(18082, root, vec![loc]));

    let response = request(18082, "GET /../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 403 Forbidden"), "{}", response);
    assert!(!response.trim_end().ends_with("\r\n\r\n"), "{}", response);
}

#[test]
fn delete_removes_file() {
    let root = unique_dir("delete");
    fs::write(root.join("x.txt"), "gone soon").unwrap();

    let mut loc = bare_location("/u/");
    loc.methods.insert(Method::Delete);
    spawn_server(server_config(18083, root.clone(), vec![loc]));

    let response = request(18083, "DELETE /u/x.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 204 No Content"), "{}", response);
    assert!(response.contains("Content-Length: 0"), "{}", response);
    assert!(!root.join("x.txt").exists());
}

#[test]
fn body_over_limit_is_rejected() {
    let root = unique_dir("body_limit");
    let upload_dir = root.join("up");
    fs::create_dir_all(&upload_dir).unwrap();

    let mut loc = bare_location("/up/");
    loc.methods.insert(Method::Post);
    loc.max_body_size = 10;
    loc.upload_path = Some(upload_dir);
    spawn_server(server_config(18084, root, vec![loc]));

    let response = request(
        18084,
        "POST /up/ HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nAAAAAAAAAAA",
    );
    assert!(response.starts_with("HTTP/1.1 413"), "{}", response);
}

#[test]
fn cgi_with_query_string_runs_script() {
    let root = unique_dir("cgi_query");
    let script = root.join("test.sh");
    fs::write(
        &script,
        "#!/bin/sh\nname=${QUERY_STRING#name=}\nprintf 'Content-Type: text/plain\\r\\n\\r\\nhello %s' \"$name\"\n",
    )
    .unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&script, perms).unwrap();

    let mut loc = bare_location("/cgi/");
    loc.methods.insert(Method::Get);
    loc.cgi_interpreter = Some(PathBuf::from("/bin/sh"));
    loc.cgi_extension = Some(".sh".to_string());
    spawn_server(server_config(18085, root, vec![loc]));

    let response = request(18085, "GET /cgi/test.sh?name=bob HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.contains("Content-Type: text/plain"), "{}", response);
    assert!(response.contains("Content-Length: 9"), "{}", response);
    assert!(response.ends_with("hello bob"), "{}", response);
}

#[test]
fn cgi_timeout_yields_504() {
    let root = unique_dir("cgi_timeout");
    let script = root.join("slow.sh");
    fs::write(&script, "#!/bin/sh\nsleep 2\n").unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    fs::set_permissions(&script, perms).unwrap();

    let mut loc = bare_location("/cgi/");
    loc.methods.insert(Method::Get);
    loc.cgi_interpreter = Some(PathBuf::from("/bin/sh"));
    loc.cgi_extension = Some(".sh".to_string());

    let config = server_config(18086, root, vec![loc]);
    thread::spawn(move || {
        let mut server = Server::new(Config { servers: vec![config] })
            .expect("server should bind")
            .with_cgi_timeout(Duration::from_millis(200));
        server.run().expect("event loop should not error out");
    });
    thread::sleep(Duration::from_millis(200));

    let mut stream = TcpStream::connect(("127.0.0.1", 18086)).expect("connect should succeed");
    stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    stream.write_all(b"GET /cgi/slow.sh HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    let response = String::from_utf8_lossy(&buf);
    assert!(response.starts_with("HTTP/1.1 504"), "{}", response);
}
