use crate::config::Location;
use crate::error::ServerError;
use crate::http::{HttpResponse, Request, StatusCode};
use rand::Rng;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Dispatches a POST body by its `Content-Type`. Body-size enforcement
/// happens in the event loop (only it sees per-recv increments); this
/// function assumes the body already passed that check.
pub fn handle(request: &Request, location: &Location) -> Result<HttpResponse, ServerError> {
    let upload_dir = location.upload_path.as_deref().unwrap_or_else(|| Path::new("."));
    let content_type = request.get_header("content-type").unwrap_or("");

    if let Some(boundary) = multipart_boundary(content_type) {
        let saved = save_multipart(&request.body, &boundary, upload_dir)?;
        return Ok(upload_ack(&saved));
    }

    if content_type
        .split(';')
        .next()
        .map(|t| t.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        .unwrap_or(false)
    {
        let decoded = decode_form_fields(&request.body);
        let name = save_form_fields(&decoded, upload_dir)?;
        return Ok(upload_ack(&[name]));
    }

    Err(ServerError::UnsupportedMediaType)
}

fn upload_ack(saved_names: &[String]) -> HttpResponse {
    let mut response = HttpResponse::new(StatusCode::Ok);
    response.set_header("content-type", "text/plain");
    response.set_body(format!("uploaded: {}\n", saved_names.join(", ")).into_bytes());
    response
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    if !content_type
        .split(';')
        .next()
        .map(|t| t.trim().eq_ignore_ascii_case("multipart/form-data"))
        .unwrap_or(false)
    {
        return None;
    }
    content_type.split(';').skip(1).find_map(|part| {
        let part = part.trim();
        part.strip_prefix("boundary=").map(|b| b.trim_matches('"').to_string())
    })
}

/// `key=value` pairs from a URL-encoded body, URL-decoded on both sides.
fn decode_form_fields(body: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(body);
    text.split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (url_decode(k), url_decode(v)),
            None => (url_decode(pair), String::new()),
        })
        .collect()
}

pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() || i + 2 == bytes.len() => {
                if i + 2 < bytes.len() {
                    if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
                out.push(b'%');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn save_form_fields(fields: &[(String, String)], upload_dir: &Path) -> Result<String, ServerError> {
    fs::create_dir_all(upload_dir)?;
    let name = format!("form-{}.txt", unique_token());
    let mut file = fs::File::create(upload_dir.join(&name))?;
    for (k, v) in fields {
        writeln!(file, "{}={}", k, v)?;
    }
    Ok(name)
}

struct MultipartPart {
    filename: Option<String>,
    content: Vec<u8>,
}

fn split_multipart(body: &[u8], boundary: &str) -> Vec<MultipartPart> {
    let marker = format!("--{}", boundary);
    let text = String::from_utf8_lossy(body);
    let mut parts = Vec::new();

    for raw_part in text.split(&marker) {
        if raw_part.trim() == "--" || raw_part.trim().is_empty() {
            continue;
        }
        let part = raw_part.strip_prefix("\r\n").unwrap_or(raw_part);
        let header_end = match part.find("\r\n\r\n") {
            Some(p) => p,
            None => continue,
        };
        let headers = &part[..header_end];
        let filename = headers.find("filename=\"").map(|start| {
            let rest = &headers[start + "filename=\"".len()..];
            let end = rest.find('"').unwrap_or(rest.len());
            rest[..end].to_string()
        });
        if filename.is_none() {
            // Not a file part (a plain form field) — only file parts get saved.
            continue;
        }
        let data_start = header_end + 4;
        let data = part[data_start..].trim_end_matches("\r\n").as_bytes().to_vec();
        parts.push(MultipartPart { filename, content: data });
    }
    parts
}

fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c == '.' && base.matches('.').count() > 1 { '_' } else { c })
        .collect();
    let cleaned = cleaned.replace("..", "_");
    if cleaned.is_empty() {
        "upload.bin".to_string()
    } else {
        cleaned
    }
}

fn unique_token() -> String {
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}-{:x}-{:x}", pid, nanos, suffix)
}

fn save_multipart(body: &[u8], boundary: &str, upload_dir: &Path) -> Result<Vec<String>, ServerError> {
    let parts = split_multipart(body, boundary);
    fs::create_dir_all(upload_dir)?;
    let mut saved = Vec::new();
    for part in parts {
        let raw_name = part.filename.unwrap_or_else(|| "upload.bin".to_string());
        let sanitized = sanitize_filename(&raw_name);
        let unique_name = format!("{}-{}", unique_token(), sanitized);
        let path: PathBuf = upload_dir.join(&unique_name);
        let mut file = fs::File::create(&path)?;
        file.write_all(&part.content)?;
        saved.push(unique_name);
    }
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_round_trip() {
        let original = "hello world/safe-chars_99.~";
        assert_eq!(url_decode(&url_encode(original)), original);
    }

    #[test]
    fn decodes_plus_and_percent() {
        assert_eq!(url_decode("a+b%20c"), "a b c");
    }

    #[test]
    fn extracts_multipart_boundary() {
        let ct = "multipart/form-data; boundary=----WebKitFormBoundaryXYZ";
        assert_eq!(multipart_boundary(ct).as_deref(), Some("----WebKitFormBoundaryXYZ"));
    }

    #[test]
    fn sanitizes_traversal_in_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert!(!sanitize_filename("../../etc/passwd").contains(".."));
        assert!(!sanitize_filename("a/b/c.txt").contains('/'));
    }

    #[test]
    fn collapses_embedded_dotdot_in_basename() {
        assert_eq!(sanitize_filename("..passwd"), "__passwd");
    }

    #[test]
    fn splits_multipart_file_part() {
        let boundary = "X";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\nhello\r\n--{b}--\r\n",
            b = boundary
        );
        let parts = split_multipart(body.as_bytes(), boundary);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].filename.as_deref(), Some("a.txt"));
        assert_eq!(parts[0].content, b"hello");
    }
}
