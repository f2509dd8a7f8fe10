//! Stand-in for the host's unified buffer cache.
//!
//! A per-vnode store of non-overlapping byte ranges. Reads are satisfied
//! only when a single contiguous assembly covers the request; writes either
//! go through to the wire and land here clean, or (async-write mounts) land
//! here dirty until something pushes them. SIZE-changing SETATTR and
//! EXCHANGE must push and invalidate so stale pages are never observable.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Spans larger than this many pages are split on store so invalidation
/// stays granular.
const MAX_SPAN_PAGES: usize = 256;

#[derive(Debug)]
struct Span {
    data: Vec<u8>,
    dirty: bool,
}

/// Cached file content of one vnode.
#[derive(Debug, Default)]
pub(crate) struct PageCache {
    spans: Mutex<BTreeMap<u64, Span>>,
}

pub(crate) fn page_size() -> u64 {
    page_size::get() as u64
}

impl PageCache {
    pub(crate) fn new() -> PageCache {
        PageCache::default()
    }

    /// Caches `data` at `offset`, trimming whatever it overlaps.
    pub(crate) fn store(&self, offset: u64, data: &[u8], dirty: bool) {
        if data.is_empty() {
            return;
        }
        let mut spans = self.spans.lock();
        Self::carve(&mut spans, offset, data.len() as u64);
        let max_span = MAX_SPAN_PAGES * page_size() as usize;
        let mut at = offset;
        for chunk in data.chunks(max_span) {
            spans.insert(
                at,
                Span {
                    data: chunk.to_vec(),
                    dirty,
                },
            );
            at += chunk.len() as u64;
        }
    }

    /// Removes every byte of `[offset, offset + len)` from the cache,
    /// splitting boundary spans. Dirty boundary fragments stay dirty.
    fn carve(spans: &mut BTreeMap<u64, Span>, offset: u64, len: u64) {
        let end = offset.saturating_add(len);
        // A span starting before the range may reach into it.
        if let Some((&start, span)) = spans.range_mut(..offset).next_back() {
            let span_end = start + span.data.len() as u64;
            if span_end > offset {
                let keep = (offset - start) as usize;
                let tail = span.data.split_off(keep);
                let dirty = span.dirty;
                let tail_start = offset.max(start);
                if span_end > end {
                    let tail_keep = &tail[(end - tail_start) as usize..];
                    spans.insert(
                        end,
                        Span {
                            data: tail_keep.to_vec(),
                            dirty,
                        },
                    );
                }
            }
        }
        // Spans starting inside the range are dropped or trimmed.
        let inside: Vec<u64> = spans.range(offset..end).map(|(&s, _)| s).collect();
        for start in inside {
            let Some(span) = spans.remove(&start) else {
                continue;
            };
            let span_end = start + span.data.len() as u64;
            if span_end > end {
                spans.insert(
                    end,
                    Span {
                        data: span.data[(end - start) as usize..].to_vec(),
                        dirty: span.dirty,
                    },
                );
            }
        }
    }

    /// Assembles `[offset, offset + len)` when fully cached.
    pub(crate) fn read(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        if len == 0 {
            return Some(Vec::new());
        }
        let spans = self.spans.lock();
        let mut out = Vec::with_capacity(len);
        let mut at = offset;
        let end = offset + len as u64;
        // Start from the span covering `at`, if any.
        let mut iter = spans
            .range(..=at)
            .next_back()
            .into_iter()
            .chain(spans.range((
                std::ops::Bound::Excluded(at),
                std::ops::Bound::Unbounded,
            )));
        while at < end {
            let (&start, span) = iter.next()?;
            let span_end = start + span.data.len() as u64;
            if start > at || span_end <= at {
                return None;
            }
            let from = (at - start) as usize;
            let to = span.data.len().min((end - start) as usize);
            out.extend_from_slice(&span.data[from..to]);
            at = start + to as u64;
        }
        Some(out)
    }

    /// Updates cached bytes in place for a write-through write; ranges not
    /// already cached stay uncached.
    pub(crate) fn update(&self, offset: u64, data: &[u8]) {
        let mut spans = self.spans.lock();
        let end = offset + data.len() as u64;
        let starts: Vec<u64> = spans
            .range(..end)
            .filter(|&(&s, ref span)| s + span.data.len() as u64 > offset)
            .map(|(&s, _)| s)
            .collect();
        for start in starts {
            let Some(span) = spans.get_mut(&start) else {
                continue;
            };
            let span_end = start + span.data.len() as u64;
            let from = offset.max(start);
            let to = end.min(span_end);
            span.data[(from - start) as usize..(to - start) as usize]
                .copy_from_slice(&data[(from - offset) as usize..(to - offset) as usize]);
        }
    }

    /// Hands out the dirty ranges, marking them clean. The caller is
    /// responsible for getting them on the wire.
    pub(crate) fn take_dirty(&self) -> Vec<(u64, Vec<u8>)> {
        let mut spans = self.spans.lock();
        let mut out = Vec::new();
        for (&start, span) in spans.iter_mut() {
            if span.dirty {
                span.dirty = false;
                out.push((start, span.data.clone()));
            }
        }
        out
    }

    pub(crate) fn has_dirty(&self) -> bool {
        self.spans.lock().values().any(|s| s.dirty)
    }

    /// Drops everything.
    pub(crate) fn invalidate(&self) {
        self.spans.lock().clear();
    }

    /// Drops cached content at and beyond `size`.
    pub(crate) fn truncate(&self, size: u64) {
        let mut spans = self.spans.lock();
        let beyond: Vec<u64> = spans.range(size..).map(|(&s, _)| s).collect();
        for start in beyond {
            spans.remove(&start);
        }
        if let Some((&start, span)) = spans.range_mut(..size).next_back() {
            let span_end = start + span.data.len() as u64;
            if span_end > size {
                span.data.truncate((size - start) as usize);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.spans.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_read_back() {
        let cache = PageCache::new();
        cache.store(0, b"hello world", false);
        assert_eq!(cache.read(0, 11).unwrap(), b"hello world");
        assert_eq!(cache.read(6, 5).unwrap(), b"world");
        assert_eq!(cache.read(6, 6), None);
        assert_eq!(cache.read(100, 1), None);
    }

    #[test]
    fn adjacent_spans_assemble() {
        let cache = PageCache::new();
        cache.store(0, b"hello ", false);
        cache.store(6, b"world", false);
        assert_eq!(cache.read(0, 11).unwrap(), b"hello world");
        // A gap breaks assembly.
        cache.store(20, b"tail", false);
        assert_eq!(cache.read(0, 24), None);
    }

    #[test]
    fn overlapping_store_replaces() {
        let cache = PageCache::new();
        cache.store(0, b"aaaaaaaaaa", false);
        cache.store(3, b"BBB", false);
        assert_eq!(cache.read(0, 10).unwrap(), b"aaaBBBaaaa");
    }

    #[test]
    fn update_patches_cached_ranges_only() {
        let cache = PageCache::new();
        cache.store(0, b"0123456789", false);
        cache.update(4, b"xy");
        assert_eq!(cache.read(0, 10).unwrap(), b"0123xy6789");
        // Beyond the cached range: no effect, still a miss.
        cache.update(50, b"zz");
        assert_eq!(cache.read(50, 2), None);
    }

    #[test]
    fn dirty_ranges_drain_once() {
        let cache = PageCache::new();
        cache.store(0, b"clean", false);
        cache.store(10, b"dirty", true);
        assert!(cache.has_dirty());
        let dirty = cache.take_dirty();
        assert_eq!(dirty, vec![(10, b"dirty".to_vec())]);
        assert!(!cache.has_dirty());
        assert!(cache.take_dirty().is_empty());
        // Content survives the push.
        assert_eq!(cache.read(10, 5).unwrap(), b"dirty");
    }

    #[test]
    fn truncate_trims_tail() {
        let cache = PageCache::new();
        cache.store(0, b"0123456789", false);
        cache.store(20, b"beyond", false);
        cache.truncate(4);
        assert_eq!(cache.read(0, 4).unwrap(), b"0123");
        assert_eq!(cache.read(0, 5), None);
        assert_eq!(cache.read(20, 6), None);
    }

    #[test]
    fn invalidate_clears() {
        let cache = PageCache::new();
        cache.store(0, b"data", true);
        cache.invalidate();
        assert!(cache.is_empty());
        assert_eq!(cache.read(0, 4), None);
    }
}
