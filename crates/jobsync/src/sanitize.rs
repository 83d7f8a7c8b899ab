//! Helpers for sanitizing data before it enters log lines or error records.
//!
//! Feed URLs can carry API keys in userinfo or the query string, and response
//! bodies can be arbitrarily large. These functions keep both out of logs.

/// Query parameters whose values are masked by [`redact_url`].
const SENSITIVE_PARAMS: &[&str] = &[
    "key",
    "api_key",
    "apikey",
    "token",
    "access_token",
    "secret",
    "password",
    "auth",
];

/// Maximum number of characters kept by [`body_sample`].
pub const BODY_SAMPLE_CHARS: usize = 500;

/// Strips credentials from a feed URL.
///
/// - `https://user:pw@host/rss` → `https://****@host/rss`
/// - `https://host/rss?token=abc&page=2` → `https://host/rss?token=****&page=2`
/// - `https://host/rss` → unchanged
pub fn redact_url(url: &str) -> String {
    let mut out = url.to_string();

    // Userinfo: scheme://USER@host/...
    if let Some(scheme_end) = out.find("://") {
        let after_scheme = &out[scheme_end + 3..];
        let authority_end = after_scheme
            .find(['/', '?', '#'])
            .unwrap_or(after_scheme.len());
        if let Some(at_pos) = after_scheme[..authority_end].rfind('@') {
            let scheme = &out[..scheme_end + 3];
            let after_at = &after_scheme[at_pos + 1..];
            out = format!("{}****@{}", scheme, after_at);
        }
    }

    let Some(q) = out.find('?') else {
        return out;
    };
    let (base, query) = out.split_at(q + 1);
    let (query, fragment) = match query.find('#') {
        Some(h) => query.split_at(h),
        None => (query, ""),
    };

    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((name, _)) if SENSITIVE_PARAMS.contains(&name.to_lowercase().as_str()) => {
                format!("{}=****", name)
            }
            _ => pair.to_string(),
        })
        .collect();

    format!("{}{}{}", base, redacted.join("&"), fragment)
}

/// Returns the first [`BODY_SAMPLE_CHARS`] characters of a response body
/// with whitespace collapsed, for diagnostics.
pub fn body_sample(body: &str) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let sample: String = chars.by_ref().take(BODY_SAMPLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", sample)
    } else {
        sample
    }
}
