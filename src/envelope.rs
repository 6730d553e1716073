//! The textual envelope agents use to carry HTTP headers and binary bytes
//! inside a response body.
//!
//! Successful fetches come back as:
//!
//! ```text
//! Headers:
//! Content-Type: text/plain
//! Content-Length: 2
//!
//! Body-Base64:
//! aGk=
//! ```
//!
//! Everything between `Headers:` and the blank line is one `Name: Value` pair
//! per line; the remainder after `Body-Base64:` is the raw response bytes,
//! base64-encoded so binary payloads (PDFs, images) survive the string-typed
//! wire message. A body that does not start with `Headers:\n` is not an
//! envelope and is passed through to the HTTP caller verbatim.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const HEADERS_MARKER: &str = "Headers:\n";
const BODY_MARKER: &str = "\nBody-Base64:\n";

/// Encode headers and raw bytes into the envelope form.
///
/// Used by test agents and by anyone implementing the agent side in Rust;
/// the gateway itself only parses.
pub fn encode(headers: &[(String, String)], body: &[u8]) -> String {
    let mut out = String::from(HEADERS_MARKER);
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out.push_str("\nBody-Base64:\n");
    out.push_str(&BASE64.encode(body));
    out
}

/// Parse an envelope body into `(headers, bytes)`.
///
/// Returns `None` when the body is not an envelope (missing markers or
/// undecodable base64); callers then treat the body as plain text. Header
/// lines without a `": "` separator are skipped.
pub fn parse(body: &str) -> Option<(Vec<(String, String)>, Vec<u8>)> {
    let rest = body.strip_prefix(HEADERS_MARKER)?;
    let marker = rest.find(BODY_MARKER)?;
    let header_block = &rest[..marker];
    let b64 = rest[marker + BODY_MARKER.len()..].trim();

    let mut headers = Vec::new();
    for line in header_block.lines() {
        if line.is_empty() {
            continue;
        }
        // Split on the first ": " — header values may themselves contain it
        if let Some((name, value)) = line.split_once(": ") {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let bytes = BASE64.decode(b64).ok()?;
    Some((headers, bytes))
}
