/// A contiguous, inclusive byte range carved out of a registered device's
/// capacity (spec.md §3, "Byte range (`AllocRange`)").
///
/// `size` exists as a separate field from `begin`/`end` because the
/// allocator orders the free-set two different ways depending on what it is
/// doing: by `size` for best-fit lookup, by `(begin, end)` for coalescing
/// adjacency (spec.md §4.2). Keeping `size` denormalized avoids recomputing
/// it on every comparison in the hot best-fit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AllocRange {
    pub size: u64,
    pub begin: u64,
    pub end: u64,
}

impl AllocRange {
    /// A range covering `[0, size)`, the shape `Register` installs into the
    /// free-set for a freshly registered parent.
    pub fn whole(size: u64) -> Self {
        if size == 0 {
            return Self::default();
        }
        Self {
            size,
            begin: 0,
            end: size - 1,
        }
    }

    /// A zero-sized range carrying no position, used as the "no allocation"
    /// value in tests and as `is_empty`'s canonical true case.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether `self`'s range immediately precedes `other`'s (`self.end + 1
    /// == other.begin`).
    pub fn abuts_before(&self, other: &Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.end + 1 == other.begin
    }

    /// Whether `self`'s range immediately follows `other`'s (`other.end + 1
    /// == self.begin`).
    pub fn abuts_after(&self, other: &Self) -> bool {
        other.abuts_before(self)
    }

    /// Merge two adjacent ranges into the span covering both. Panics if the
    /// ranges are not adjacent; callers must check `abuts_before`/`abuts_after`
    /// first.
    pub fn merge(&self, other: &Self) -> Self {
        let (lower, upper) = if self.abuts_before(other) {
            (self, other)
        } else if other.abuts_before(self) {
            (other, self)
        } else {
            panic!("AllocRange::merge called on non-adjacent ranges");
        };
        Self {
            size: lower.size + upper.size,
            begin: lower.begin,
            end: upper.end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_covers_full_extent() {
        let r = AllocRange::whole(65535);
        assert_eq!(r.size, 65535);
        assert_eq!(r.begin, 0);
        assert_eq!(r.end, 65534);
    }

    #[test]
    fn adjacency_is_strict() {
        let a = AllocRange {
            size: 10,
            begin: 0,
            end: 9,
        };
        let b = AllocRange {
            size: 10,
            begin: 10,
            end: 19,
        };
        assert!(a.abuts_before(&b));
        assert!(!b.abuts_before(&a));
        assert!(b.abuts_after(&a));

        let merged = a.merge(&b);
        assert_eq!(merged, AllocRange { size: 20, begin: 0, end: 19 });
    }

    #[test]
    fn empty_range_never_abuts() {
        let empty = AllocRange::empty();
        let other = AllocRange::whole(4);
        assert!(!empty.abuts_before(&other));
        assert!(!other.abuts_before(&empty));
    }
}
