//! Event recorders: network request/response tables and WebSocket
//! connection state, both fed from the session dispatch loop.

pub mod network;
pub mod websocket;

use crate::cdp::HeaderList;
use crate::har;

pub use network::{NetworkRecorder, RecorderStats};
pub use websocket::{FrameFilter, WebSocketRecorder, WsDirection};

/// First header value matching `name`, case-insensitively.
pub fn header_value<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// All values for `name`, preserving order. Used for Set-Cookie.
pub fn header_values<'a>(headers: &'a HeaderList, name: &str) -> Vec<&'a str> {
    headers
        .iter()
        .filter(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
        .collect()
}

pub fn to_har_headers(headers: &HeaderList) -> Vec<har::Header> {
    headers
        .iter()
        .map(|(name, value)| har::Header {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Parses a request `Cookie` header: `a=1; b=2`. Fragments without an `=`
/// are skipped individually.
pub fn parse_cookie_header(raw: &str) -> Vec<har::Cookie> {
    raw.split(';')
        .filter_map(|fragment| {
            let fragment = fragment.trim();
            let (name, value) = fragment.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(har::Cookie::pair(name, value.trim()))
        })
        .collect()
}

/// Parses one `Set-Cookie` response header value with its attributes.
pub fn parse_set_cookie(raw: &str) -> Option<har::Cookie> {
    let mut parts = raw.split(';');
    let pair = parts.next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = har::Cookie::pair(name, value.trim());
    for attribute in parts {
        let attribute = attribute.trim();
        let (key, val) = match attribute.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (attribute, None),
        };
        match key.to_ascii_lowercase().as_str() {
            "domain" => cookie.domain = val.map(str::to_string),
            "path" => cookie.path = val.map(str::to_string),
            "expires" => cookie.expires = val.map(str::to_string),
            "httponly" => cookie.http_only = Some(true),
            "secure" => cookie.secure = Some(true),
            "samesite" => cookie.same_site = val.map(str::to_string),
            _ => {}
        }
    }
    Some(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_parsing_skips_bad_fragments() {
        let cookies = parse_cookie_header("a=1; broken; b=2; =nameless; c=x=y");
        let pairs: Vec<(String, String)> = cookies
            .into_iter()
            .map(|c| (c.name, c.value))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "x=y".to_string()),
            ]
        );
    }

    #[test]
    fn cookie_pairs_survive_reserialization() {
        let raw = "b=2; a=1; c=3";
        let mut parsed: Vec<String> = parse_cookie_header(raw)
            .into_iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        parsed.sort();
        assert_eq!(parsed, vec!["a=1", "b=2", "c=3"]);
    }

    #[test]
    fn set_cookie_attributes() {
        let cookie =
            parse_set_cookie("sid=abc123; Domain=example.com; Path=/; HttpOnly; Secure; SameSite=Lax")
                .unwrap();
        assert_eq!(cookie.name, "sid");
        assert_eq!(cookie.value, "abc123");
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
        assert_eq!(cookie.path.as_deref(), Some("/"));
        assert_eq!(cookie.http_only, Some(true));
        assert_eq!(cookie.secure, Some(true));
        assert_eq!(cookie.same_site.as_deref(), Some("Lax"));
    }

    #[test]
    fn set_cookie_without_pair_is_skipped() {
        assert!(parse_set_cookie("garbage").is_none());
        assert!(parse_set_cookie("=oops; Path=/").is_none());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let headers = vec![
            ("Content-Type".to_string(), "text/html".to_string()),
            ("set-cookie".to_string(), "a=1".to_string()),
            ("Set-Cookie".to_string(), "b=2".to_string()),
        ];
        assert_eq!(header_value(&headers, "content-type"), Some("text/html"));
        assert_eq!(header_values(&headers, "Set-Cookie"), vec!["a=1", "b=2"]);
    }
}
