//! Conditional request evaluation for media that answer requests themselves.

use axum::http::{header, HeaderMap, Method};
use chrono::{DateTime, Utc};

/// Outcome of evaluating the precondition headers of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Proceed,
    NotModified,
    Failed,
}

/// Format a timestamp as an HTTP-date (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Strong ETag of a content-addressed blob.
pub fn blob_etag(hash: &str) -> String {
    format!("\"{}\"", hash)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn etag_list_matches(list: &str, etag: &str, weak: bool) -> bool {
    list.split(',').map(str::trim).any(|candidate| {
        if candidate == "*" {
            return true;
        }
        if weak {
            candidate.trim_start_matches("W/") == etag.trim_start_matches("W/")
        } else {
            !candidate.starts_with("W/") && candidate == etag
        }
    })
}

/// Evaluate `If-Match`, `If-Unmodified-Since`, `If-None-Match` and
/// `If-Modified-Since` against the current representation.
pub fn evaluate(method: &Method, headers: &HeaderMap, etag: &str, modified: DateTime<Utc>) -> Precondition {
    if let Some(list) = header_str(headers, &header::IF_MATCH) {
        if !etag_list_matches(list, etag, false) {
            return Precondition::Failed;
        }
    } else if let Some(since) = header_str(headers, &header::IF_UNMODIFIED_SINCE).and_then(parse_http_date) {
        if modified.timestamp() > since.timestamp() {
            return Precondition::Failed;
        }
    }

    let safe = method == Method::GET || method == Method::HEAD;
    if let Some(list) = header_str(headers, &header::IF_NONE_MATCH) {
        if etag_list_matches(list, etag, true) {
            return if safe {
                Precondition::NotModified
            } else {
                Precondition::Failed
            };
        }
    } else if safe {
        if let Some(since) = header_str(headers, &header::IF_MODIFIED_SINCE).and_then(parse_http_date) {
            if modified.timestamp() <= since.timestamp() {
                return Precondition::NotModified;
            }
        }
    }
    Precondition::Proceed
}

/// Whether a `Range` header may be honored given the request's `If-Range`.
pub fn if_range_allows(headers: &HeaderMap, etag: &str, modified: DateTime<Utc>) -> bool {
    let Some(value) = header_str(headers, &header::IF_RANGE) else {
        return true;
    };
    if value.starts_with('"') || value.starts_with("W/") {
        return etag_list_matches(value, etag, false);
    }
    parse_http_date(value).is_some_and(|t| t.timestamp() == modified.timestamp())
}
