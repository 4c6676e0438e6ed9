use crate::config::{Location, ServerConfig};
use std::fs;

/// Resolves a status to a custom error body by trying, in order, the
/// matched Location's own `error_page` map, then the ServerConfig's.
/// Returns `None` if neither configures a page for this status (or the
/// configured file can't be read), in which case the caller falls back
/// to the built-in default body.
pub fn resolve(location: Option<&Location>, server: &ServerConfig, status: u16) -> Option<Vec<u8>> {
    if let Some(loc) = location {
        if let Some(path) = loc.error_pages.get(&status) {
            if let Ok(content) = fs::read(path) {
                return Some(content);
            }
        }
    }
    if let Some(path) = server.error_pages.get(&status) {
        if let Ok(content) = fs::read(path) {
            return Some(content);
        }
    }
    None
}
