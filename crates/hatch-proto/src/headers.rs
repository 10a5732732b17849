//! Header conventions of the HTTP pull/push side-channel
//!
//! Headers of the tunneled request or response travel as headers of the side-channel call,
//! renamed with a reserved prefix so they cannot collide with the side-channel's own
//! framing headers. Content headers use `X-TC-`, every other header `X-TR-`.

/// Method of the tunneled request, set on the pull response
pub const METHOD_HEADER: &str = "x-t-method";

/// Status of the tunneled response, set on the push request
pub const STATUS_HEADER: &str = "x-t-status";

/// Prefix for pass-through headers
pub const HEADER_PREFIX: &str = "x-tr-";

/// Prefix for pass-through content headers
pub const CONTENT_HEADER_PREFIX: &str = "x-tc-";

/// Hop-by-hop headers, never forwarded in either direction
pub const HOP_BY_HOP: [&str; 5] = [
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-connection",
];

const CONTENT_HEADERS: [&str; 5] = [
    "content-type",
    "content-encoding",
    "content-language",
    "content-disposition",
    "content-range",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

pub fn is_content_header(name: &str) -> bool {
    CONTENT_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Whether a header of the tunneled message is dropped instead of forwarded.
///
/// Bodies are re-framed on every hop, so `Content-Length` is dropped along with the
/// hop-by-hop set. `Host` is dropped because the local call addresses its own host.
pub fn is_stripped(name: &str) -> bool {
    is_hop_by_hop(name)
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("host")
}

/// Side-channel name for a tunneled header, `None` when the header is not forwarded.
pub fn wrap(name: &str) -> Option<String> {
    if is_stripped(name) {
        return None;
    }
    let prefix = if is_content_header(name) {
        CONTENT_HEADER_PREFIX
    } else {
        HEADER_PREFIX
    };
    Some(format!("{}{}", prefix, name.to_ascii_lowercase()))
}

/// Original header name of a prefixed side-channel header.
///
/// Returns `None` for unprefixed headers and for prefixed headers that must not be
/// forwarded.
pub fn unwrap(name: &str) -> Option<&str> {
    let original = strip_prefix_ignore_case(name, HEADER_PREFIX)
        .or_else(|| strip_prefix_ignore_case(name, CONTENT_HEADER_PREFIX))?;
    if original.is_empty() || is_stripped(original) {
        return None;
    }
    Some(original)
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    if name.len() >= prefix.len()
        && name.is_char_boundary(prefix.len())
        && name[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&name[prefix.len()..])
    } else {
        None
    }
}
