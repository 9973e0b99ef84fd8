//! A `RangeSet` which contains a sorted set of non-overlapping,
//! inclusive `usize` ranges. Ranges can be inserted and removed,
//! which makes it the right tool to describe the physical memory
//! that is reported by the firmware minus everything that is reserved.

use core::{cmp, fmt, slice};
use displaydoc_lite::displaydoc;

/// The number of ranges inside a fixed-size [`RangeSet`].
pub const RANGE_COUNT: usize = 32;

displaydoc! {
    /// Any error that can occurr while operating on a [`RangeSet`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Error {
        /// the range was invalid, meaning that `start > end`.
        InvalidRange,
        /// a given index was out of bounds.
        OutOfBounds,
        /// the range set has no space left for another range.
        Full,
    }
}

/// An inclusive range that implements [`Copy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// The start for this range.
    pub start: usize,
    /// The end for this range.
    pub end: usize,
}

impl Range {
    /// Create a new `Range` that goes from `start..=end`.
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Create the range that covers `size` bytes beginning at `start`.
    ///
    /// Returns `None` for empty ranges or ranges that would
    /// wrap around the address space.
    pub fn from_size(start: usize, size: usize) -> Option<Self> {
        let end = start.checked_add(size.checked_sub(1)?)?;
        Some(Self::new(start, end))
    }

    /// The number of bytes covered by this range.
    pub fn size(&self) -> usize {
        (self.end - self.start).saturating_add(1)
    }
}

/// A fixed-size set of inclusive [ranges](Range).
///
/// To effectively use a [`RangeSet`], [insert](RangeSet::insert) all reported
/// memory regions into this set, and [remove](RangeSet::remove_range) all ranges
/// that must not be handed to an allocator.
#[derive(Clone)]
pub struct RangeSet {
    /// The fixed array of ranges, sorted by their start.
    ranges: [Range; RANGE_COUNT],

    /// The number of ranges that are in use.
    idx: usize,
}

impl RangeSet {
    /// Create a new empty rangeset.
    pub const fn new() -> Self {
        Self {
            ranges: [Range { start: 0, end: 0 }; RANGE_COUNT],
            idx: 0,
        }
    }

    /// Get the range at the given index if there's one present.
    pub fn get(&self, idx: usize) -> Option<Range> {
        self.as_slice().get(idx).copied()
    }

    /// Remove the range at the given index.
    pub fn remove(&mut self, idx: usize) -> Result<Range, Error> {
        if idx >= self.idx {
            return Err(Error::OutOfBounds);
        }

        // move the removed range behind the used part of the array,
        // where it will be overwritten by the next insertion.
        let range = self.ranges[idx];
        self.ranges[idx..self.idx].rotate_left(1);
        self.idx -= 1;

        Ok(range)
    }

    /// Insert a new range into this rangeset.
    ///
    /// If the range overlaps or touches other ranges inside this set,
    /// all of them will be collapsed into a single range.
    pub fn insert(&mut self, range: Range) -> Result<(), Error> {
        if range.start > range.end {
            return Err(Error::InvalidRange);
        }

        // the ranges are sorted and never touch each other, so a single pass
        // collects every range that has to be merged.
        let mut merged = range;
        let mut idx = 0;
        while idx < self.idx {
            let other = self.ranges[idx];
            if touches(merged, other) {
                merged.start = cmp::min(merged.start, other.start);
                merged.end = cmp::max(merged.end, other.end);
                self.remove(idx)?;
            } else {
                idx += 1;
            }
        }

        if self.idx == RANGE_COUNT {
            return Err(Error::Full);
        }

        let pos = self.as_slice().partition_point(|r| r.start < merged.start);
        self.insert_at(pos, merged);
        Ok(())
    }

    /// Remove the given range from every range of this set.
    ///
    /// Ranges are trimmed, split into two, or removed entirely
    /// depending on how they overlap with `range`.
    pub fn remove_range(&mut self, range: Range) -> Result<(), Error> {
        if range.start > range.end {
            return Err(Error::InvalidRange);
        }

        let mut idx = 0;
        while idx < self.idx {
            let other = self.ranges[idx];
            if !overlaps(range, other) {
                idx += 1;
                continue;
            }

            match (range.start <= other.start, range.end >= other.end) {
                // [======`range`======]
                //    [==`other`==]
                (true, true) => {
                    self.remove(idx)?;
                }
                // [======`range`======]
                //                [=====`other`=====]
                (true, false) => {
                    self.ranges[idx].start = range.end + 1;
                    idx += 1;
                }
                // [====`other`====]
                //                [=====`range`=====]
                (false, true) => {
                    self.ranges[idx].end = range.start - 1;
                    idx += 1;
                }
                // [=========`other`=========]
                //    [=====`range`=====]
                (false, false) => {
                    if self.idx == RANGE_COUNT {
                        return Err(Error::Full);
                    }

                    self.ranges[idx].end = range.start - 1;
                    self.insert_at(idx + 1, Range::new(range.end + 1, other.end));
                    idx += 2;
                }
            }
        }

        Ok(())
    }

    fn insert_at(&mut self, pos: usize, range: Range) {
        self.ranges[pos..=self.idx].rotate_right(1);
        self.ranges[pos] = range;
        self.idx += 1;
    }

    /// Remove all ranges from this rangeset.
    pub fn clear(&mut self) {
        self.idx = 0;
    }

    /// Return a slice that contains all ranges.
    #[inline]
    pub fn as_slice(&self) -> &[Range] {
        &self.ranges[..self.idx]
    }

    /// Return an iterator over all ranges of this set.
    pub fn iter(&self) -> slice::Iter<'_, Range> {
        self.as_slice().iter()
    }

    /// Return the number of ranges inside this rangeset.
    pub fn len(&self) -> usize {
        self.idx
    }

    /// Check if this range set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RangeSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeSet")
            .field("ranges", &self.as_slice())
            .field("idx", &self.idx)
            .finish()
    }
}

/// Check if two ranges overlap.
fn overlaps(a: Range, b: Range) -> bool {
    a.start <= b.end && b.start <= a.end
}

/// Check if two ranges overlap or are directly next to each other.
fn touches(a: Range, b: Range) -> bool {
    a.start <= b.end.saturating_add(1) && b.start <= a.end.saturating_add(1)
}
