//! Byte-range coalescing for bulk fetches.
//!
//! Nearby ranges on the same URL are merged into fewer, larger reads,
//! subject to an inter-range gap budget and a merged-block size budget.
//! Merging only ever widens a fetch; unbundling per-path payloads from the
//! merged bytes is the dispatcher's job.

use indexmap::IndexMap;

/// One requested (or merged) read. `None` endpoints mean "the whole
/// object" on that side; a range with both endpoints `None` is a
/// whole-file read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub url: String,
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(url: impl Into<String>, start: u64, end: u64) -> Self {
        ByteRange {
            url: url.into(),
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn whole(url: impl Into<String>) -> Self {
        ByteRange {
            url: url.into(),
            start: None,
            end: None,
        }
    }

    pub fn is_whole(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// True if this (merged) range fully contains the concrete range
    /// `[start, end)` of the same URL.
    pub fn covers(&self, url: &str, start: u64, end: u64) -> bool {
        if self.url != url {
            return false;
        }
        if self.is_whole() {
            return true;
        }
        matches!((self.start, self.end), (Some(s), Some(e)) if s <= start && end <= e)
    }
}

/// Merge neighboring ranges per URL.
///
/// Two ranges merge iff the gap between them is at most `max_gap` and the
/// widened block stays within `max_block`. A negative `max_gap` disables
/// merging entirely; `max_gap == 0` merges only touching or overlapping
/// ranges. A whole-file request subsumes every other range on its URL.
pub fn merge_ranges(ranges: &[ByteRange], max_gap: i64, max_block: u64) -> Vec<ByteRange> {
    let mut by_url: IndexMap<&str, Vec<&ByteRange>> = IndexMap::new();
    for r in ranges {
        by_url.entry(r.url.as_str()).or_default().push(r);
    }

    let mut out = Vec::with_capacity(ranges.len());
    for (url, group) in by_url {
        if group.iter().any(|r| r.is_whole()) {
            out.push(ByteRange::whole(url));
            continue;
        }

        let mut concrete: Vec<(u64, u64)> = Vec::with_capacity(group.len());
        for r in &group {
            match (r.start, r.end) {
                (Some(s), Some(e)) => concrete.push((s, e)),
                // Half-open on one side only: pass through unmerged.
                _ => out.push((*r).clone()),
            }
        }
        concrete.sort_unstable();

        let mut it = concrete.into_iter();
        let Some((mut s, mut e)) = it.next() else {
            continue;
        };
        for (s2, e2) in it {
            let widened = e.max(e2);
            if max_gap >= 0
                && s2 as i64 - e as i64 <= max_gap
                && widened - s <= max_block
            {
                e = widened;
            } else {
                out.push(ByteRange::new(url, s, e));
                (s, e) = (s2, e2);
            }
        }
        out.push(ByteRange::new(url, s, e));
    }
    out
}

// -- Tests --------------------------------------------------------------------
