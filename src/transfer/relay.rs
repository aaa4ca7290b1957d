//! Header translation between an inbound client request and the outbound
//! request issued to a network-backed medium.

use axum::http::{header, HeaderMap, HeaderName};

use super::range::parse_range;

/// Conditional headers copied verbatim onto outbound requests.
pub static CONDITIONAL_HEADERS: [HeaderName; 5] = [
    header::IF_MODIFIED_SINCE,
    header::IF_UNMODIFIED_SINCE,
    header::IF_NONE_MATCH,
    header::IF_MATCH,
    header::IF_RANGE,
];

/// Headers relayed to the client when the medium answers with a redirect.
pub static REDIRECT_HEADERS: [HeaderName; 3] =
    [header::LOCATION, header::ETAG, header::LAST_MODIFIED];

/// Headers relayed to the client when the medium answers with content.
pub static CONTENT_HEADERS: [HeaderName; 4] = [
    header::ETAG,
    header::LAST_MODIFIED,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
];

/// Copy `name` from `src` to `dst` when present and non-empty.
pub fn copy_header(name: &HeaderName, dst: &mut HeaderMap, src: &HeaderMap) {
    if let Some(value) = src.get(name) {
        if !value.is_empty() {
            dst.insert(name.clone(), value.clone());
        }
    }
}

pub fn copy_headers(names: &[HeaderName], dst: &mut HeaderMap, src: &HeaderMap) {
    for name in names {
        copy_header(name, dst, src);
    }
}

/// Headers to send upstream for an inbound request: its `Range` plus every
/// conditional header.
pub fn forwarded_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    copy_header(&header::RANGE, &mut out, inbound);
    copy_headers(&CONDITIONAL_HEADERS, &mut out, inbound);
    out
}

/// The inbound `Range` header as text, if any.
pub fn range_header(inbound: &HeaderMap) -> Option<&str> {
    inbound
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Bytes a redirected client is expected to fetch.
///
/// Without a usable `Range` this is the full size. Otherwise it is the summed
/// length of the satisfiable ranges, capped at the full size. Multipart
/// framing overhead is not counted.
pub fn redirect_size(range: Option<&str>, size: u64) -> u64 {
    let Some(range) = range else {
        return size;
    };
    match parse_range(range, size) {
        Ok(ranges) if !ranges.is_empty() => ranges.iter().map(|r| r.length).sum::<u64>().min(size),
        _ => size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_forwarded_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::RANGE, HeaderValue::from_static("bytes=0-10"));
        inbound.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"abc\""));
        inbound.insert(header::IF_RANGE, HeaderValue::from_static("\"abc\""));
        inbound.insert(header::COOKIE, HeaderValue::from_static("session=1"));
        inbound.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));

        let out = forwarded_headers(&inbound);
        assert_eq!(out.len(), 3);
        assert_eq!(out[header::RANGE], "bytes=0-10");
        assert_eq!(out[header::IF_NONE_MATCH], "\"abc\"");
        assert!(out.get(header::COOKIE).is_none());
        assert!(out.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_empty_headers_are_not_copied() {
        let mut src = HeaderMap::new();
        src.insert(header::ETAG, HeaderValue::from_static(""));
        src.insert(header::LOCATION, HeaderValue::from_static("https://cdn/x"));
        let mut dst = HeaderMap::new();
        copy_headers(&REDIRECT_HEADERS, &mut dst, &src);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst[header::LOCATION], "https://cdn/x");
    }

    #[test]
    fn test_redirect_size() {
        assert_eq!(redirect_size(None, 1000), 1000);
        assert_eq!(redirect_size(Some("bytes=0-99,200-299"), 1000), 200);
        assert_eq!(redirect_size(Some("bytes=-5000"), 1000), 1000);
        // Overlapping ranges never report more than the entity
        assert_eq!(redirect_size(Some("bytes=0-999,0-999"), 1000), 1000);
        // Unusable headers fall back to the full size
        assert_eq!(redirect_size(Some("bytes=5000-"), 1000), 1000);
        assert_eq!(redirect_size(Some("garbage"), 1000), 1000);
    }
}
