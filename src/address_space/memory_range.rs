use crate::remote_ptr::{RemotePtr, Void};
use std::cmp::{max, min, Ordering};
use std::fmt;

/// A half-open `[start, end)` range of tracee memory. The derived order is
/// (start, end); see MemoryRangeKey for the containment-lookup order used by
/// the address-space map.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MemoryRange {
    pub(crate) start: RemotePtr<Void>,
    pub(crate) end: RemotePtr<Void>,
}

impl MemoryRange {
    pub fn new() -> MemoryRange {
        MemoryRange {
            start: RemotePtr::null(),
            end: RemotePtr::null(),
        }
    }

    pub fn from_range(start: RemotePtr<Void>, end: RemotePtr<Void>) -> MemoryRange {
        let result = MemoryRange { start, end };
        debug_assert!(result.start <= result.end);
        result
    }

    pub fn new_range(start: RemotePtr<Void>, num_bytes: usize) -> MemoryRange {
        MemoryRange {
            start,
            end: start.byte_add(num_bytes),
        }
    }

    pub fn start(&self) -> RemotePtr<Void> {
        self.start
    }

    pub fn end(&self) -> RemotePtr<Void> {
        self.end
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True iff `other` lies entirely within self.
    pub fn contains(&self, other: &MemoryRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains_ptr(&self, p: RemotePtr<Void>) -> bool {
        self.start <= p && p < self.end
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        let start = max(self.start, other.start);
        let end = min(self.end, other.end);
        start < end
    }

    pub fn intersect(&self, other: &MemoryRange) -> MemoryRange {
        let start = max(self.start, other.start);
        let end = min(self.end, other.end);
        MemoryRange {
            start,
            end: max(start, end),
        }
    }
}

impl fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// The key type for the address-space map. Ordering compares start, then
/// end, EXCEPT that for lookup purposes any two intersecting ranges compare
/// equal, which is what lets a BTreeMap keyed this way answer "the mapping
/// containing address A" with an ordinary lookup of the 1-byte range at A.
/// Ranges stored in one map must never overlap or the order is inconsistent.
#[derive(Copy, Clone, Debug, Default)]
pub struct MemoryRangeKey(pub MemoryRange);

impl MemoryRangeKey {
    pub fn range(&self) -> &MemoryRange {
        &self.0
    }
}

impl PartialEq for MemoryRangeKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemoryRangeKey {}

impl PartialOrd for MemoryRangeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemoryRangeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.intersects(&other.0) {
            return Ordering::Equal;
        }
        self.0.start.cmp(&other.0.start)
    }
}

impl From<MemoryRange> for MemoryRangeKey {
    fn from(r: MemoryRange) -> Self {
        MemoryRangeKey(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: usize, end: usize) -> MemoryRange {
        MemoryRange::from_range(RemotePtr::from_val(start), RemotePtr::from_val(end))
    }

    #[test]
    fn sizes_and_containment() {
        let a = r(0x1000, 0x3000);
        assert_eq!(a.size(), 0x2000);
        assert!(a.contains(&r(0x1000, 0x2000)));
        assert!(a.contains(&r(0x2000, 0x3000)));
        assert!(!a.contains(&r(0x2000, 0x3001)));
        assert!(a.contains_ptr(RemotePtr::from_val(0x2fff)));
        assert!(!a.contains_ptr(RemotePtr::from_val(0x3000)));
    }

    #[test]
    fn intersection() {
        let a = r(0x1000, 0x3000);
        let b = r(0x2000, 0x4000);
        assert!(a.intersects(&b));
        assert_eq!(a.intersect(&b), r(0x2000, 0x3000));
        let c = r(0x3000, 0x4000);
        assert!(!a.intersects(&c));
        assert!(a.intersect(&c).is_empty());
    }

    #[test]
    fn key_equates_overlapping() {
        use std::collections::BTreeMap;
        let mut map: BTreeMap<MemoryRangeKey, u32> = BTreeMap::new();
        map.insert(MemoryRangeKey(r(0x1000, 0x2000)), 1);
        map.insert(MemoryRangeKey(r(0x2000, 0x4000)), 2);
        // A 1-byte probe range finds the containing mapping.
        assert_eq!(
            map.get(&MemoryRangeKey(r(0x1800, 0x1801))).copied(),
            Some(1)
        );
        assert_eq!(
            map.get(&MemoryRangeKey(r(0x3fff, 0x4000))).copied(),
            Some(2)
        );
        assert_eq!(map.get(&MemoryRangeKey(r(0x4000, 0x4001))), None);
    }
}
