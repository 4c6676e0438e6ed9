use crate::config::{Location, ServerConfig};
use crate::error::ServerError;
use crate::http::Method;

/// Strips a single trailing slash, except for the root `"/"` itself, so
/// `/a/` and `/a` compare equal during prefix matching.
fn normalize(path: &str) -> &str {
    if path == "/" {
        path
    } else {
        path.strip_suffix('/').unwrap_or(path)
    }
}

/// Selects the Location whose prefix is the longest match for `uri`.
/// Ties are impossible because the config grammar rejects duplicate
/// prefixes within one server.
pub fn match_location<'a>(server: &'a ServerConfig, uri: &str) -> Option<&'a Location> {
    let normalized_uri = normalize(uri);
    server
        .locations
        .iter()
        .filter(|loc| normalized_uri.starts_with(normalize(&loc.prefix)))
        .max_by_key(|loc| normalize(&loc.prefix).len())
}

/// True iff `uri` (already stripped of any query string) ends in the
/// Location's registered CGI extension and the Location has a configured
/// interpreter. Both conditions are required: a CGI-enabled Location with
/// no matching extension serves the request statically instead.
pub fn is_cgi_request(location: &Location, uri: &str) -> bool {
    if location.cgi_interpreter.is_none() {
        return false;
    }
    match &location.cgi_extension {
        Some(ext) if !ext.is_empty() => uri.ends_with(ext.as_str()),
        _ => false,
    }
}

/// Method-allowed check for an already-matched Location. `Ok(())` if the
/// method may proceed; otherwise the `ServerError` that should be
/// returned (405 with an `Allow:` header, or 501 for a method this
/// server never implements).
pub fn check_method(location: &Location, method: Method) -> Result<(), ServerError> {
    if !method.is_implemented() {
        return Err(ServerError::NotImplemented);
    }
    if !location.methods.is_empty() && !location.methods.contains(&method) {
        let allowed: Vec<String> = location.methods.iter().map(|m| m.to_string()).collect();
        return Err(ServerError::MethodNotAllowed { allowed });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;

    fn loc(prefix: &str) -> Location {
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

    fn server_with(locations: Vec<Location>) -> ServerConfig {
        ServerConfig {
            host: "0.0.0.0".into(),
            port: 80,
            root: PathBuf::from("."),
            error_pages: HashMap::new(),
            locations,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let server = server_with(vec![loc("/"), loc("/api/"), loc("/api/v2/")]);
        let matched = match_location(&server, "/api/v2/users").unwrap();
        assert_eq!(matched.prefix, "/api/v2/");
    }

    #[test]
    fn no_match_returns_none() {
        let server = server_with(vec![loc("/api/")]);
        assert!(match_location(&server, "/other").is_none());
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let server = server_with(vec![loc("/api")]);
        assert!(match_location(&server, "/api/").is_some());
    }

    #[test]
    fn cgi_trigger_requires_both_extension_and_interpreter() {
        let mut cgi_loc = loc("/cgi/");
        cgi_loc.cgi_interpreter = Some(PathBuf::from("/usr/bin/php-cgi"));
        cgi_loc.cgi_extension = Some(".php".to_string());

        assert!(is_cgi_request(&cgi_loc, "/cgi/test.php"));
        assert!(!is_cgi_request(&cgi_loc, "/cgi/image.png"));

        let mut no_interpreter = loc("/cgi/");
        no_interpreter.cgi_extension = Some(".php".to_string());
        assert!(!is_cgi_request(&no_interpreter, "/cgi/test.php"));

        let mut no_extension = loc("/cgi/");
        no_extension.cgi_interpreter = Some(PathBuf::from("/usr/bin/php-cgi"));
        assert!(!is_cgi_request(&no_extension, "/cgi/test.php"));
    }
}
