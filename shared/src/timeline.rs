//! Frame-indexed ordered store.
//!
//! A `Timeline` is a sparse map from frame to value kept as a sorted vector.
//! History is short (tens of seconds of frames), so binary search over a
//! contiguous array beats a tree and keeps iteration cache friendly.

use crate::error::TimelineError;
use crate::Frame;

#[derive(Debug, Clone)]
pub struct Timeline<V> {
    entries: Vec<(Frame, V)>,
}

impl<V> Default for Timeline<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Timeline<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn search(&self, frame: Frame) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&frame, |(f, _)| *f)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, frame: Frame) -> bool {
        self.search(frame).is_ok()
    }

    pub fn get(&self, frame: Frame) -> Option<&V> {
        self.search(frame).ok().map(|i| &self.entries[i].1)
    }

    pub fn get_mut(&mut self, frame: Frame) -> Option<&mut V> {
        match self.search(frame) {
            Ok(i) => Some(&mut self.entries[i].1),
            Err(_) => None,
        }
    }

    /// Returns the entry at `frame`, inserting `make()` first if absent.
    pub fn get_or_insert_with(&mut self, frame: Frame, make: impl FnOnce() -> V) -> &mut V {
        let index = match self.search(frame) {
            Ok(i) => i,
            Err(i) => {
                self.entries.insert(i, (frame, make()));
                i
            }
        };
        &mut self.entries[index].1
    }

    /// Inserts or overwrites without conflict checking.
    pub fn set(&mut self, frame: Frame, value: V) {
        match self.search(frame) {
            Ok(i) => self.entries[i].1 = value,
            Err(i) => self.entries.insert(i, (frame, value)),
        }
    }

    pub fn remove(&mut self, frame: Frame) -> Option<V> {
        self.search(frame).ok().map(|i| self.entries.remove(i).1)
    }

    pub fn first(&self) -> Option<(Frame, &V)> {
        self.entries.first().map(|(f, v)| (*f, v))
    }

    pub fn last(&self) -> Option<(Frame, &V)> {
        self.entries.last().map(|(f, v)| (*f, v))
    }

    /// Greatest entry with key `<= frame`.
    pub fn last_at_or_before(&self, frame: Frame) -> Option<(Frame, &V)> {
        let index = match self.search(frame) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let (f, v) = &self.entries[index];
        Some((*f, v))
    }

    /// Smallest entry with key `> frame`.
    pub fn first_after(&self, frame: Frame) -> Option<(Frame, &V)> {
        let index = match self.search(frame) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        self.entries.get(index).map(|(f, v)| (*f, v))
    }

    /// First frame at or after `frame` with no entry, treating the entries
    /// from `frame` onward as a sequence that must be contiguous.
    pub fn first_unknown_from(&self, frame: Frame) -> Frame {
        let mut expected = frame;
        let start = match self.search(frame) {
            Ok(i) => i,
            Err(_) => return frame,
        };
        for (f, _) in &self.entries[start..] {
            if *f != expected {
                break;
            }
            expected += 1;
        }
        expected
    }

    /// Drops entries strictly before `frame`, keeping the newest of them when
    /// `frame` itself has no entry so `last_at_or_before` answers for frames
    /// at or after the cut are unchanged.
    pub fn trim_before(&mut self, frame: Frame) {
        let cut = match self.search(frame) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        if cut > 0 {
            self.entries.drain(..cut);
        }
    }

    /// Removes `frame` and everything after it.
    pub fn drop_from(&mut self, frame: Frame) {
        let cut = match self.search(frame) {
            Ok(i) | Err(i) => i,
        };
        self.entries.truncate(cut);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (Frame, &V)> {
        self.entries.iter().map(|(f, v)| (*f, v))
    }

    /// Entries with keys in `from..=to`.
    pub fn range(&self, from: Frame, to: Frame) -> impl Iterator<Item = (Frame, &V)> {
        let start = match self.search(from) {
            Ok(i) | Err(i) => i,
        };
        self.entries[start..]
            .iter()
            .take_while(move |(f, _)| *f <= to)
            .map(|(f, v)| (*f, v))
    }
}

impl<V: PartialEq> Timeline<V> {
    /// Adds a value. Re-adding an identical value is tolerated since the
    /// transport below may redeliver; returns `Ok(false)` in that case.
    pub fn add(&mut self, frame: Frame, value: V) -> Result<bool, TimelineError> {
        match self.search(frame) {
            Ok(i) if self.entries[i].1 == value => Ok(false),
            Ok(_) => Err(TimelineError::ConflictingValue { frame }),
            Err(i) => {
                self.entries.insert(i, (frame, value));
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filled(frames: &[Frame]) -> Timeline<Frame> {
        let mut timeline = Timeline::new();
        for &f in frames {
            timeline.add(f, f * 10).unwrap();
        }
        timeline
    }

    #[test]
    fn test_negative_frames_are_ordinary_keys() {
        let timeline = filled(&[-20, -3, 4]);
        assert_eq!(timeline.last_at_or_before(-4), Some((-20, &-200)));
        assert_eq!(timeline.first_after(-20), Some((-3, &-30)));
        assert_eq!(timeline.last_at_or_before(-21), None);
    }

    #[test]
    fn test_add_keeps_sorted_order() {
        let timeline = filled(&[5, 1, 3]);
        let frames: Vec<Frame> = timeline.iter().map(|(f, _)| f).collect();
        assert_eq!(frames, vec![1, 3, 5]);
    }

    #[test]
    fn test_duplicate_same_value_tolerated() {
        let mut timeline = filled(&[1]);
        assert_eq!(timeline.add(1, 10), Ok(false));
        assert_eq!(
            timeline.add(1, 11),
            Err(TimelineError::ConflictingValue { frame: 1 })
        );
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_lookups() {
        let timeline = filled(&[2, 4, 6]);
        assert_eq!(timeline.last_at_or_before(1), None);
        assert_eq!(timeline.last_at_or_before(2), Some((2, &20)));
        assert_eq!(timeline.last_at_or_before(5), Some((4, &40)));
        assert_eq!(timeline.last_at_or_before(100), Some((6, &60)));
        assert_eq!(timeline.first_after(2), Some((4, &40)));
        assert_eq!(timeline.first_after(3), Some((4, &40)));
        assert_eq!(timeline.first_after(6), None);
    }

    #[test]
    fn test_first_unknown_from() {
        let timeline = filled(&[3, 4, 5, 7]);
        assert_eq!(timeline.first_unknown_from(3), 6);
        assert_eq!(timeline.first_unknown_from(2), 2);
        assert_eq!(timeline.first_unknown_from(7), 8);
        assert_eq!(timeline.first_unknown_from(6), 6);
    }

    #[test]
    fn test_trim_keeps_one_entry_before_cut() {
        let mut timeline = filled(&[1, 4, 8]);
        timeline.trim_before(6);
        assert_eq!(timeline.first(), Some((4, &40)));
        assert_eq!(timeline.last_at_or_before(6), Some((4, &40)));

        timeline.trim_before(8);
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.first(), Some((8, &80)));
    }

    #[test]
    fn test_drop_from() {
        let mut timeline = filled(&[1, 2, 3, 4]);
        timeline.drop_from(3);
        assert_eq!(timeline.last(), Some((2, &20)));
        timeline.drop_from(0);
        assert!(timeline.is_empty());
    }

    #[test]
    fn test_range_is_inclusive() {
        let timeline = filled(&[1, 2, 3, 4, 5]);
        let frames: Vec<Frame> = timeline.range(2, 4).map(|(f, _)| f).collect();
        assert_eq!(frames, vec![2, 3, 4]);
    }

    proptest! {
        #[test]
        fn prop_last_at_or_before_is_greatest_key(
            keys in proptest::collection::btree_set(-50i32..200, 0..40),
            query in -60i32..220,
        ) {
            let keys: Vec<Frame> = keys.into_iter().collect();
            let timeline = filled(&keys);
            let expected = keys.iter().copied().filter(|k| *k <= query).max();
            prop_assert_eq!(timeline.last_at_or_before(query).map(|(f, _)| f), expected);
        }

        #[test]
        fn prop_trim_never_changes_answers_past_cut(
            keys in proptest::collection::btree_set(0i32..200, 0..40),
            cut in 0i32..200,
        ) {
            let keys: Vec<Frame> = keys.into_iter().collect();
            let mut timeline = filled(&keys);
            let before: Vec<_> = (cut..210)
                .map(|f| timeline.last_at_or_before(f).map(|(k, v)| (k, *v)))
                .collect();
            timeline.trim_before(cut);
            let after: Vec<_> = (cut..210)
                .map(|f| timeline.last_at_or_before(f).map(|(k, v)| (k, *v)))
                .collect();
            prop_assert_eq!(before, after);
        }
    }
}
