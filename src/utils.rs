//! Utility helpers used across the crate.
//!
//! Filename extraction from URLs and the small pieces of HTTP header
//! interpretation the transport needs for range resumption.
use percent_encoding::percent_decode_str;
use reqwest::header::{ACCEPT_RANGES, CONTENT_RANGE, ETAG, HeaderMap, LAST_MODIFIED};
use sanitize_filename::sanitize;
use url::Url;

/// Extracts a clean filename from a URL.
///
/// 1. Parses the URL.
/// 2. Extracts the last segment of the path.
/// 3. URL-decodes it (converts %20 to space, etc.).
/// 4. Sanitizes it to remove characters invalid for the OS.
/// 5. Falls back to "output.bin" if no valid filename is found.
pub fn get_filename_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .map(|mut s| s.next_back().unwrap_or("").to_string())
        })
        .map(|s| percent_decode_str(&s).decode_utf8_lossy().to_string())
        .map(sanitize)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "output.bin".to_string())
}

/// Whether the server advertised `Accept-Ranges: bytes`.
pub fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
}

/// Total resource length from a `Content-Range: bytes a-b/total` header.
///
/// Returns `None` for a missing header or an unknown (`*`) length.
pub fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    rest.rsplit_once('/')?.1.trim().parse().ok()
}

/// The value to send back in `If-Range` when resuming.
///
/// Weak ETags are not allowed in `If-Range`, so those fall through to
/// `Last-Modified`.
pub fn range_validator(headers: &HeaderMap) -> Option<String> {
    let etag = headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.starts_with("W/"));

    etag.or_else(|| headers.get(LAST_MODIFIED).and_then(|v| v.to_str().ok()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(reqwest::header::HeaderName, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_filename_extraction() {
        // Simple case
        assert_eq!(
            get_filename_from_url("https://example.com/archive.zip"),
            "archive.zip"
        );

        // With query parameters (should ignore ?id=123)
        assert_eq!(
            get_filename_from_url("https://example.com/image.png?id=123&quality=high"),
            "image.png"
        );

        // With URL encoding (%20)
        assert_eq!(
            get_filename_from_url("https://example.com/my%20vacation%20photo.jpg"),
            "my vacation photo.jpg"
        );

        // Edge case: No filename (ends in slash)
        assert_eq!(get_filename_from_url("https://example.com/"), "output.bin");
    }

    #[test]
    fn test_accept_ranges() {
        assert!(accepts_byte_ranges(&headers(&[(ACCEPT_RANGES, "bytes")])));
        assert!(accepts_byte_ranges(&headers(&[(ACCEPT_RANGES, "Bytes")])));
        assert!(!accepts_byte_ranges(&headers(&[(ACCEPT_RANGES, "none")])));
        assert!(!accepts_byte_ranges(&HeaderMap::new()));
    }

    #[test]
    fn test_content_range_total() {
        let h = headers(&[(CONTENT_RANGE, "bytes 50000-99999/100000")]);
        assert_eq!(content_range_total(&h), Some(100_000));

        let h = headers(&[(CONTENT_RANGE, "bytes 0-9/*")]);
        assert_eq!(content_range_total(&h), None);

        assert_eq!(content_range_total(&HeaderMap::new()), None);
    }

    #[test]
    fn test_range_validator_prefers_strong_etag() {
        let h = headers(&[
            (ETAG, "\"abc\""),
            (LAST_MODIFIED, "Wed, 21 Oct 2015 07:28:00 GMT"),
        ]);
        assert_eq!(range_validator(&h).as_deref(), Some("\"abc\""));

        let h = headers(&[
            (ETAG, "W/\"weak\""),
            (LAST_MODIFIED, "Wed, 21 Oct 2015 07:28:00 GMT"),
        ]);
        assert_eq!(
            range_validator(&h).as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );

        assert_eq!(range_validator(&HeaderMap::new()), None);
    }
}
