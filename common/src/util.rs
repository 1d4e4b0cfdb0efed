//! Byte-range utilities shared by the KV substrate and its callers.

use std::ops::{Bound, RangeBounds};

use bytes::Bytes;

/// An owned range of byte keys.
///
/// Scan APIs take `BytesRange` instead of a generic `impl RangeBounds` so the
/// range can be stored in trait objects and moved into iterators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesRange {
    start: Bound<Bytes>,
    end: Bound<Bytes>,
}

impl BytesRange {
    pub fn new(start: Bound<Bytes>, end: Bound<Bytes>) -> Self {
        Self { start, end }
    }

    /// Range covering every key.
    pub fn all() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// Half-open range `[start, end)`.
    pub fn half_open(start: Bytes, end: Bytes) -> Self {
        Self::new(Bound::Included(start), Bound::Excluded(end))
    }

    /// Range `[start, ..)` with no upper bound.
    pub fn from_key(start: Bytes) -> Self {
        Self::new(Bound::Included(start), Bound::Unbounded)
    }

    pub fn contains(&self, key: &Bytes) -> bool {
        RangeBounds::contains(self, key)
    }
}

impl RangeBounds<Bytes> for BytesRange {
    fn start_bound(&self) -> Bound<&Bytes> {
        self.start.as_ref()
    }

    fn end_bound(&self) -> Bound<&Bytes> {
        self.end.as_ref()
    }
}
