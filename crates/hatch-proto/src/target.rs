//! Local target URLs
//!
//! The relay tells the owner exactly which local URL to call: the registered local base
//! URL followed by the public request's path and query.

use url::Url;

/// Normalizes a local base URL for storage: trailing slashes are removed.
pub fn normalize_base(local_url: &str) -> String {
    local_url.trim().trim_end_matches('/').to_string()
}

/// Joins a local base URL with a public path-and-query.
pub fn join(base: &str, path_and_query: &str) -> String {
    let base = base.trim_end_matches('/');
    if path_and_query.is_empty() || path_and_query == "/" {
        return format!("{}/", base);
    }
    if path_and_query.starts_with('/') {
        format!("{}{}", base, path_and_query)
    } else {
        format!("{}/{}", base, path_and_query)
    }
}

/// Converts an http(s) URL to its ws(s) counterpart. Other schemes are left alone.
pub fn to_websocket(target: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(target)?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Ok(url.into()),
    };
    // Switching between special schemes always succeeds.
    let _ = url.set_scheme(scheme);
    Ok(url.into())
}
