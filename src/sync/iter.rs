use super::map::SegmentedMap;

/// A weakly consistent iterator over the entries of a
/// [`SegmentedMap`], yielding cloned pairs.
///
/// The iterator is a `(segment, slot)` cursor. Each step briefly takes the
/// current segment's shared lock, skips dead and unclaimed slots, and
/// clones the next live pair. There is no snapshot isolation: entries
/// inserted or erased while the iteration is in flight may or may not be
/// observed, and an entry that moves during a segment resize can be missed
/// or yielded twice.
pub struct Iter<'a, K, V, S> {
    map: &'a SegmentedMap<K, V, S>,
    segment_index: usize,
    slot_index: usize,
}

impl<'a, K, V, S> Iter<'a, K, V, S> {
    pub(super) fn new(map: &'a SegmentedMap<K, V, S>) -> Self {
        Self {
            map,
            segment_index: 0,
            slot_index: 0,
        }
    }
}

impl<K, V, S> Iterator for Iter<'_, K, V, S>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.segment_index < self.map.num_segments() {
            if let Some((index, pair)) = self.map.scan_segment(self.segment_index, self.slot_index)
            {
                self.slot_index = index + 1;
                return Some(pair);
            }

            self.segment_index += 1;
            self.slot_index = 0;
        }

        None
    }
}
