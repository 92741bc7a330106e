use std::borrow::Cow;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use url::Url;

/// Table of the 127 ASCII values that are valid in a header field name
/// (RFC 7230 token characters).
const fn build_token_table() -> [bool; 127] {
    let mut table = [false; 127];
    let mut i = 0;
    while i < 127 {
        table[i] = (i as u8).is_ascii_alphanumeric();
        i += 1;
    }
    let extra = b"!#$%&'*+-.^_`|~";
    let mut j = 0;
    while j < extra.len() {
        table[extra[j] as usize] = true;
        j += 1;
    }
    table
}

pub(crate) const TOKEN_TABLE: [bool; 127] = build_token_table();

pub(crate) fn is_token_byte(b: u8) -> bool {
    (b as usize) < TOKEN_TABLE.len() && TOKEN_TABLE[b as usize]
}

/// Whether `name` is a valid header field name.
pub(crate) fn valid_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(is_token_byte)
}

/// Whether `value` is a valid header field value: no control bytes,
/// except horizontal tab.
pub(crate) fn valid_header_value(value: &[u8]) -> bool {
    value
        .iter()
        .all(|&b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}

/// The canonical format of a header key: the first letter and any letter
/// following a hyphen upper case, the rest lower case. Keys containing
/// bytes outside the token table are returned unchanged.
///
/// `canonical_header_key("accept-encoding")` is `"Accept-Encoding"`.
pub(crate) fn canonical_header_key(name: &str) -> Cow<'_, str> {
    let mut upper = true;
    let mut changed = false;
    for &b in name.as_bytes() {
        if !is_token_byte(b) {
            return Cow::Borrowed(name);
        }
        let want = if upper {
            b.to_ascii_uppercase()
        } else {
            b.to_ascii_lowercase()
        };
        if want != b {
            changed = true;
        }
        upper = b == b'-';
    }
    if !changed {
        return Cow::Borrowed(name);
    }
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for &b in name.as_bytes() {
        let c = if upper {
            b.to_ascii_uppercase()
        } else {
            b.to_ascii_lowercase()
        };
        out.push(c as char);
        upper = b == b'-';
    }
    Cow::Owned(out)
}

/// Whether `sub` is `parent` or a subdomain of `parent`.
///
/// Both are expected in canonical (lowercase, punycoded) form, which is
/// what `Url::host_str` produces.
pub(crate) fn is_domain_or_subdomain(sub: &str, parent: &str) -> bool {
    if sub.eq_ignore_ascii_case(parent) {
        return true;
    }
    // If sub is "foo.example.com" and parent is "example.com", the byte
    // before the suffix match must be a dot.
    if sub.len() <= parent.len() {
        return false;
    }
    let tail = &sub[sub.len() - parent.len()..];
    let dot = sub.as_bytes()[sub.len() - parent.len() - 1];
    dot == b'.' && tail.eq_ignore_ascii_case(parent)
}

pub(crate) fn basic_auth(user: &str, pass: &str) -> String {
    // a colon in the username would break the encoding.
    let safe = match user.find(':') {
        Some(idx) => &user[..idx],
        None => user,
    };
    BASE64_STANDARD.encode(format!("{}:{}", safe, pass))
}

pub(crate) fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

/// `host:port` for dialing, with the default port filled in.
pub(crate) fn host_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url.port().unwrap_or_else(|| default_port(url.scheme()));
    format!("{}:{}", host, port)
}

/// The host part for the Host header: the port is included only when it
/// differs from the scheme default.
pub(crate) fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) if port != default_port(url.scheme()) => format!("{}:{}", host, port),
        _ => host.to_string(),
    }
}
