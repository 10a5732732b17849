//! Host header parsing and subdomain generation

use rand::Rng;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Default length of generated subdomains
pub const SUBDOMAIN_LENGTH: usize = 8;

/// Random lowercase alphanumeric subdomain.
pub fn generate_subdomain(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Lowercases and validates a caller-supplied subdomain label.
///
/// A label is 1-63 characters of `[a-z0-9-]` and neither starts nor ends with `-`.
pub fn validate_subdomain(label: &str) -> Option<String> {
    let label = label.trim().to_ascii_lowercase();
    if label.is_empty() || label.len() > 63 {
        return None;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return None;
    }
    if !label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return None;
    }
    Some(label)
}

/// Host without its `:port` suffix. Bracketed IPv6 literals are kept intact.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rfind(':') {
        Some(idx) if host[idx + 1..].bytes().all(|b| b.is_ascii_digit()) => &host[..idx],
        _ => host,
    }
}

/// Lowercased first DNS label of a Host header value.
pub fn first_label(host: &str) -> String {
    let host = strip_port(host.trim());
    host.split('.').next().unwrap_or(host).to_ascii_lowercase()
}
