//! HTTP Range header handling (RFC 7233, single range)

use depot_common::{Error, Result};

/// Parsed byte range, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range: bytes a-b/total` value
    #[must_use]
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{total}", self.start, self.end)
    }
}

/// Parse a `Range` header against an object of `total_size` bytes.
///
/// - `Ok(None)`: the header is syntactically malformed and per RFC 7233
///   is ignored (the full object is served).
/// - `Err(invalid_range)`: well-formed but unsatisfiable, e.g.
///   `bytes=size-`.
/// - `Ok(Some(range))`: satisfiable; `end` is clamped to the last byte.
pub fn parse_range_header(header: &str, total_size: u64) -> Result<Option<ByteRange>> {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };

    let parts: Vec<&str> = spec.split('-').collect();
    if parts.len() != 2 {
        return Ok(None);
    }
    let (start_str, end_str) = (parts[0].trim(), parts[1].trim());

    if start_str.is_empty() && end_str.is_empty() {
        return Ok(None);
    }

    let unsatisfiable = |reason: String| {
        Error::invalid_range(reason).with_detail("total_size", total_size.to_string())
    };

    // Suffix range: bytes=-N means the last N bytes
    if start_str.is_empty() {
        let Ok(suffix_len) = end_str.parse::<u64>() else {
            return Ok(None);
        };
        if suffix_len == 0 || total_size == 0 {
            return Err(unsatisfiable(format!("suffix range of {suffix_len} bytes")));
        }
        let suffix_len = suffix_len.min(total_size);
        return Ok(Some(ByteRange {
            start: total_size - suffix_len,
            end: total_size - 1,
        }));
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return Ok(None);
    };
    if start >= total_size {
        return Err(unsatisfiable(format!("start {start} is at or past the end")));
    }

    // Open-ended range: bytes=N- reads to EOF
    if end_str.is_empty() {
        return Ok(Some(ByteRange {
            start,
            end: total_size - 1,
        }));
    }

    let Ok(end) = end_str.parse::<u64>() else {
        return Ok(None);
    };
    if start > end {
        return Ok(None);
    }

    Ok(Some(ByteRange {
        start,
        end: end.min(total_size - 1),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_common::ErrorKind;

    #[test]
    fn test_simple_range() {
        let range = parse_range_header("bytes=1-3", 5).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 1, end: 3 });
        assert_eq!(range.length(), 3);
        assert_eq!(range.content_range(5), "bytes 1-3/5");
    }

    #[test]
    fn test_single_byte_range() {
        let range = parse_range_header("bytes=0-0", 5).unwrap().unwrap();
        assert_eq!(range.length(), 1);
        assert_eq!(range.content_range(5), "bytes 0-0/5");
    }

    #[test]
    fn test_open_ended_range() {
        let range = parse_range_header("bytes=2-", 5).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 2, end: 4 });
    }

    #[test]
    fn test_suffix_range() {
        let range = parse_range_header("bytes=-2", 5).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 3, end: 4 });

        // Oversized suffix covers the whole object
        let range = parse_range_header("bytes=-100", 5).unwrap().unwrap();
        assert_eq!(range, ByteRange { start: 0, end: 4 });
    }

    #[test]
    fn test_end_clamped_to_size() {
        let range = parse_range_header("bytes=1-100", 5).unwrap().unwrap();
        assert_eq!(range.end, 4);
    }

    #[test]
    fn test_start_at_eof_is_unsatisfiable() {
        let err = parse_range_header("bytes=5-", 5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRange);
        assert!(parse_range_header("bytes=9-10", 5).is_err());
    }

    #[test]
    fn test_malformed_headers_are_ignored() {
        assert_eq!(parse_range_header("bites=0-1", 5).unwrap(), None);
        assert_eq!(parse_range_header("bytes=a-b", 5).unwrap(), None);
        assert_eq!(parse_range_header("bytes=-", 5).unwrap(), None);
        assert_eq!(parse_range_header("bytes=3-1", 5).unwrap(), None);
        assert_eq!(parse_range_header("bytes=0-1-2", 5).unwrap(), None);
    }
}
