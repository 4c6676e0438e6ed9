use crate::config::{Location, ServerConfig};
use crate::error::ServerError;
use crate::http::{HttpResponse, Method, Request, StatusCode};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Serves GET/HEAD/DELETE against the effective root for `location`.
/// Redirects and CGI dispatch are decided by the caller before this is
/// reached; this module only ever sees the static-file branch.
pub fn handle(request: &Request, server: &ServerConfig, location: &Location) -> Result<HttpResponse, ServerError> {
    let physical = resolve_physical_path(&request.uri, server, location)?;

    match request.method {
        Method::Delete => handle_delete(&physical),
        Method::Get | Method::Head => handle_get(&physical, location, request.method == Method::Head),
        _ => Err(ServerError::NotImplemented),
    }
}

/// Resolves a request URI to a physical path under the Location's
/// effective root, rejecting traversal. Shared by the GET/HEAD/DELETE
/// handlers here and by the CGI spawn path, which needs the same
/// root-merge-then-join resolution for `SCRIPT_FILENAME`.
pub fn resolve_physical_path(uri: &str, server: &ServerConfig, location: &Location) -> Result<PathBuf, ServerError> {
    if contains_traversal(uri) {
        return Err(ServerError::Forbidden);
    }
    let effective_root = location.root.clone().unwrap_or_else(|| server.root.clone());
    let relative = strip_prefix(uri, &location.prefix);
    Ok(join_under_root(&effective_root, relative))
}

fn contains_traversal(uri: &str) -> bool {
    let lower = uri.to_ascii_lowercase();
    lower.split('/').any(|seg| seg == "..") || lower.contains("%2e%2e")
}

fn strip_prefix<'a>(uri: &'a str, prefix: &str) -> &'a str {
    uri.strip_prefix(prefix).unwrap_or(uri).trim_start_matches('/')
}

fn join_under_root(root: &Path, relative: &str) -> PathBuf {
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

fn handle_get(physical: &Path, location: &Location, head_only: bool) -> Result<HttpResponse, ServerError> {
    match fs::metadata(physical) {
        Ok(meta) if meta.is_dir() => handle_directory(physical, location, head_only),
        Ok(_) => serve_file(physical, head_only),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ServerError::NotFound),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(ServerError::Forbidden),
        Err(e) => Err(ServerError::Io(e)),
    }
}

fn handle_directory(dir: &Path, location: &Location, head_only: bool) -> Result<HttpResponse, ServerError> {
    if let Some(index) = &location.index {
        let index_path = dir.join(index);
        if index_path.is_file() {
            return serve_file(&index_path, head_only);
        }
    }
    if location.autoindex {
        return Ok(render_autoindex(dir, head_only));
    }
    Err(ServerError::Forbidden)
}

fn serve_file(path: &Path, head_only: bool) -> Result<HttpResponse, ServerError> {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(ServerError::NotFound),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => return Err(ServerError::Forbidden),
        Err(e) => return Err(ServerError::Io(e)),
    };
    let content_type = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(HttpResponse::content_type_for_extension)
        .unwrap_or("application/octet-stream");

    let mut response = HttpResponse::new(StatusCode::Ok);
    response.set_header("content-type", content_type);
    response.set_body(content);
    response.omit_body = head_only;
    Ok(response)
}

fn render_autoindex(dir: &Path, head_only: bool) -> HttpResponse {
    let mut html = String::from("<html><head><title>Index</title></head><body><ul>");
    if let Ok(entries) = fs::read_dir(dir) {
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        for name in names {
            let is_dir = dir.join(&name).is_dir();
            let display = if is_dir { format!("{}/", name) } else { name.clone() };
            html.push_str(&format!("<li><a href=\"{}\">{}</a></li>", display, display));
        }
    }
    html.push_str("</ul></body></html>");

    let mut response = HttpResponse::new(StatusCode::Ok);
    response.set_header("content-type", "text/html");
    response.set_body(html.into_bytes());
    response.omit_body = head_only;
    response
}

fn handle_delete(physical: &Path) -> Result<HttpResponse, ServerError> {
    match fs::metadata(physical) {
        Ok(meta) if meta.is_dir() => return Err(ServerError::Forbidden),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(ServerError::NotFound),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => return Err(ServerError::Forbidden),
        Err(e) => return Err(ServerError::Io(e)),
    }
    match fs::remove_file(physical) {
        Ok(()) => Ok(HttpResponse::no_content()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(ServerError::Forbidden),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ServerError::NotFound),
        Err(e) => Err(ServerError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_dotdot_segment() {
        assert!(contains_traversal("/../etc/passwd"));
        assert!(contains_traversal("/a/../b"));
        assert!(!contains_traversal("/a/..b"));
    }

    #[test]
    fn detects_encoded_dotdot() {
        assert!(contains_traversal("/%2e%2e/etc/passwd"));
        assert!(contains_traversal("/%2E%2E/etc/passwd"));
    }

    #[test]
    fn strips_location_prefix() {
        assert_eq!(strip_prefix("/u/x.txt", "/u/"), "x.txt");
        assert_eq!(strip_prefix("/x.txt", "/"), "x.txt");
    }
}
