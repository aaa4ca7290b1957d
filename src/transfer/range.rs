//! HTTP `Range` header parsing.
//!
//! Supports `bytes=start-end`, `bytes=start-` and `bytes=-suffix`, comma separated.
//! Ranges are clamped against the full entity size; ranges starting past the end
//! are dropped, and if nothing else remains the header is unsatisfiable.

use crate::error::{StorageError, StorageResult};

/// One satisfiable byte range, `[start, start + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    /// Value for a `Content-Range` header describing this range of a `size`-byte entity.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.start + self.length - 1, size)
    }
}

/// Parse a `Range` header against an entity of `size` bytes.
///
/// An empty header yields no ranges. A malformed header, or one whose ranges
/// all start at or past `size`, is an `InvalidRange` error.
pub fn parse_range(header: &str, size: u64) -> StorageResult<Vec<ByteRange>> {
    if header.is_empty() {
        return Ok(Vec::new());
    }
    let specs = header
        .strip_prefix("bytes=")
        .ok_or_else(|| StorageError::InvalidRange(header.to_string()))?;

    let invalid = || StorageError::InvalidRange(header.to_string());
    let mut ranges = Vec::new();
    let mut no_overlap = false;

    for spec in specs.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let (start, end) = spec.split_once('-').ok_or_else(invalid)?;
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            // Suffix range: the last `end` bytes.
            if end.is_empty() || end.starts_with('-') {
                return Err(invalid());
            }
            let suffix = end.parse::<u64>().map_err(|_| invalid())?.min(size);
            ranges.push(ByteRange {
                start: size - suffix,
                length: suffix,
            });
            continue;
        }

        let first = start.parse::<u64>().map_err(|_| invalid())?;
        if first >= size {
            no_overlap = true;
            continue;
        }
        let length = if end.is_empty() {
            size - first
        } else {
            let last = end.parse::<u64>().map_err(|_| invalid())?;
            if first > last {
                return Err(invalid());
            }
            last.min(size - 1) - first + 1
        };
        ranges.push(ByteRange { start: first, length });
    }

    if no_overlap && ranges.is_empty() {
        return Err(StorageError::InvalidRange(format!(
            "{} does not overlap {} bytes",
            header, size
        )));
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_ranges() {
        assert_eq!(
            parse_range("bytes=0-99", 1000).unwrap(),
            vec![ByteRange { start: 0, length: 100 }]
        );
        assert_eq!(
            parse_range("bytes=900-", 1000).unwrap(),
            vec![ByteRange { start: 900, length: 100 }]
        );
        assert_eq!(
            parse_range("bytes=-300", 1000).unwrap(),
            vec![ByteRange { start: 700, length: 300 }]
        );
    }

    #[test]
    fn test_clamping() {
        // End past the entity is clamped to the last byte
        assert_eq!(
            parse_range("bytes=500-5000", 1000).unwrap(),
            vec![ByteRange { start: 500, length: 500 }]
        );
        // Suffix longer than the entity selects everything
        assert_eq!(
            parse_range("bytes=-5000", 1000).unwrap(),
            vec![ByteRange { start: 0, length: 1000 }]
        );
    }

    #[test]
    fn test_multiple_ranges() {
        let ranges = parse_range("bytes=0-99, 200-299 ,", 1000).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges.iter().map(|r| r.length).sum::<u64>(), 200);

        // Unsatisfiable parts are dropped when others remain
        let ranges = parse_range("bytes=0-9,2000-3000", 1000).unwrap();
        assert_eq!(ranges, vec![ByteRange { start: 0, length: 10 }]);
    }

    #[test]
    fn test_unsatisfiable_and_malformed() {
        assert!(parse_range("bytes=1000-", 1000).is_err());
        assert!(parse_range("items=0-1", 1000).is_err());
        assert!(parse_range("bytes=5-1", 1000).is_err());
        assert!(parse_range("bytes=abc", 1000).is_err());
        assert!(parse_range("bytes=-", 1000).is_err());
        assert!(parse_range("bytes=--5", 1000).is_err());
        assert!(parse_range("", 1000).unwrap().is_empty());
    }

    #[test]
    fn test_content_range() {
        let range = ByteRange { start: 2, length: 3 };
        assert_eq!(range.content_range(10), "bytes 2-4/10");
    }
}
