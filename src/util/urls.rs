use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors raised when a URL is not acceptable as a podcast feed source.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("Private or loopback address not allowed: {0}")]
    PrivateHost(String),
}

/// Normalize a URL found inside feed content.
///
/// Scheme-less values (`example.com/ep1.mp3`, `//cdn.example.com/a.mp3`) get an
/// `http://` prefix. Anything that still does not parse as an http(s) URL with a
/// host is rejected and yields `None`.
pub fn normalize_url(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let candidate = if value.contains("://") {
        value.to_owned()
    } else {
        format!("http://{}", value.trim_start_matches('/'))
    };

    let url = Url::parse(&candidate).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some_and(|h| !h.is_empty()) => Some(url.into()),
        _ => None,
    }
}

/// SEC: Validate a URL submitted by an operator as a new podcast feed.
///
/// Rejects non-HTTP(S) schemes and hosts that resolve to loopback, private,
/// link-local or unspecified addresses, so the poller cannot be pointed at
/// internal services.
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if let Some(host) = url.host_str() {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(UrlValidationError::PrivateHost(host.to_owned()));
        }

        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = bare.parse::<IpAddr>() {
            if is_private_ip(&ip) {
                return Err(UrlValidationError::PrivateHost(ip.to_string()));
            }
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // unique local
                || (first & 0xffc0) == 0xfe80 // link-local
        }
    }
}
