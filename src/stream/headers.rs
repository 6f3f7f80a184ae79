// Streamshelf - Offline Video Downloads for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! HTTP header policy for streaming CDNs
//!
//! Many CDNs reject requests that don't look like they come from the embedding web
//! player. Every request made for a stream goes through [`ensure_streaming_headers`],
//! which fills in Origin, Referer and a desktop browser User-Agent when the caller
//! didn't provide them.
//!
//! # Precedence (highest first)
//! 1. Headers attached to a specific quality variant
//! 2. Headers of the master manifest / download request
//! 3. Defaults derived from the URL

use std::collections::HashMap;
use url::Url;

/// Header name -> value. Names are matched case-insensitively.
pub type HeaderMap = HashMap<String, String>;

/// Desktop browser User-Agent sent when none is provided
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Permissive browser headers layered under everything else
const PERMISSIVE_DEFAULTS: &[(&str, &str)] = &[
    ("Accept", "*/*"),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Sec-Fetch-Dest", "empty"),
    ("Sec-Fetch-Mode", "cors"),
    ("Sec-Fetch-Site", "cross-site"),
];

fn find_key<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a String> {
    headers.keys().find(|k| k.eq_ignore_ascii_case(name))
}

/// Whether `headers` carries `name` in any letter case
pub fn has_header(headers: &HeaderMap, name: &str) -> bool {
    find_key(headers, name).is_some()
}

/// Case-insensitive lookup
pub fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    find_key(headers, name)
        .and_then(|k| headers.get(k))
        .map(String::as_str)
}

/// Insert or replace `name`, dropping any existing spelling of the same key
fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let Some(existing) = find_key(headers, name).cloned() {
        headers.remove(&existing);
    }
    headers.insert(name.to_string(), value.to_string());
}

fn insert_if_absent(headers: &mut HeaderMap, name: &str, value: &str) {
    if !has_header(headers, name) {
        headers.insert(name.to_string(), value.to_string());
    }
}

/// `scheme://host[:port]` for an http(s) URL
pub fn origin_for(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    // Url::origin serializes opaque origins as "null"
    match parsed.origin() {
        origin @ url::Origin::Tuple(..) => Some(origin.ascii_serialization()),
        url::Origin::Opaque(_) => None,
    }
}

/// Guarantee Origin, Referer and User-Agent plus the permissive browser defaults.
///
/// Existing values are never overwritten, so the function is idempotent.
pub fn ensure_streaming_headers(headers: &HeaderMap, url: &str) -> HeaderMap {
    let mut result = headers.clone();

    if let Some(origin) = origin_for(url) {
        insert_if_absent(&mut result, "Origin", &origin);
        insert_if_absent(&mut result, "Referer", &format!("{}/", origin));
    }

    insert_if_absent(&mut result, "User-Agent", DESKTOP_USER_AGENT);

    for (name, value) in PERMISSIVE_DEFAULTS {
        insert_if_absent(&mut result, name, value);
    }

    result
}

/// Merge master-level and stream-specific headers, then fill defaults for `url`.
///
/// Stream-specific values win over original values for the same key.
pub fn combine_streaming_headers(original: &HeaderMap, per_stream: &HeaderMap, url: &str) -> HeaderMap {
    let mut merged = original.clone();
    for (name, value) in per_stream {
        set_header(&mut merged, name, value);
    }
    ensure_streaming_headers(&merged, url)
}

/// Referer/Origin derived from a source module's base URL.
///
/// Used as the lowest tier under explicit request headers when a download names the
/// module it came from.
pub fn source_default_headers(base_url: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(origin) = origin_for(base_url) {
        headers.insert("Origin".to_string(), origin);
        let referer = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        headers.insert("Referer".to_string(), referer);
    }
    headers
}

/// Build a reqwest header map, skipping names or values reqwest rejects
pub fn to_reqwest_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let parsed_name = reqwest::header::HeaderName::from_bytes(name.as_bytes());
        let parsed_value = reqwest::header::HeaderValue::from_str(value);
        match (parsed_name, parsed_value) {
            (Ok(n), Ok(v)) => {
                map.insert(n, v);
            }
            _ => tracing::warn!(header = %name, "Skipping invalid request header"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_derived_from_url() {
        let result = ensure_streaming_headers(&HeaderMap::new(), "https://cdn.example.com:8443/v/master.m3u8");

        assert_eq!(header_value(&result, "Origin"), Some("https://cdn.example.com:8443"));
        assert_eq!(header_value(&result, "Referer"), Some("https://cdn.example.com:8443/"));
        assert_eq!(header_value(&result, "User-Agent"), Some(DESKTOP_USER_AGENT));
        assert_eq!(header_value(&result, "Sec-Fetch-Mode"), Some("cors"));
    }

    #[test]
    fn test_existing_values_kept_case_insensitively() {
        let input = headers(&[("referer", "https://site.example/watch"), ("user-agent", "AppleCoreMedia")]);
        let result = ensure_streaming_headers(&input, "https://cdn.example.com/a.m3u8");

        assert_eq!(header_value(&result, "Referer"), Some("https://site.example/watch"));
        assert_eq!(header_value(&result, "User-Agent"), Some("AppleCoreMedia"));
        assert_eq!(result.keys().filter(|k| k.eq_ignore_ascii_case("referer")).count(), 1);
    }

    #[test]
    fn test_idempotent() {
        let input = headers(&[("Cookie", "a=b")]);
        let once = ensure_streaming_headers(&input, "https://cdn.example.com/a.mp4");
        let twice = ensure_streaming_headers(&once, "https://cdn.example.com/a.mp4");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unparseable_url_skips_origin() {
        let result = ensure_streaming_headers(&HeaderMap::new(), "not a url");
        assert!(!has_header(&result, "Origin"));
        assert!(!has_header(&result, "Referer"));
        assert!(has_header(&result, "User-Agent"));
    }

    #[test]
    fn test_stream_headers_override_original() {
        let original = headers(&[("Referer", "A"), ("Cookie", "session=1")]);
        let per_stream = headers(&[("referer", "B")]);
        let result = combine_streaming_headers(&original, &per_stream, "https://cdn.example.com/720.m3u8");

        assert_eq!(header_value(&result, "Referer"), Some("B"));
        assert_eq!(header_value(&result, "Cookie"), Some("session=1"));
    }

    #[test]
    fn test_empty_tiers_fall_back_to_url() {
        let result = combine_streaming_headers(&HeaderMap::new(), &HeaderMap::new(), "https://media.example.org/x.m3u8");
        assert_eq!(header_value(&result, "Referer"), Some("https://media.example.org/"));
    }

    #[test]
    fn test_source_default_headers() {
        let result = source_default_headers("https://anime.example.net");
        assert_eq!(header_value(&result, "Origin"), Some("https://anime.example.net"));
        assert_eq!(header_value(&result, "Referer"), Some("https://anime.example.net/"));
        assert!(source_default_headers("").is_empty());
    }
}
