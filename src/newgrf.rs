//! Global NewGRF lookup table.
//!
//! Indices are assigned centrally by the database layer and are stable for
//! the life of the deployment; this module just holds an eventually
//! consistent in-process copy and serves snapshots/deltas to listing
//! responses.

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::protocol::NewGrfEntry;

#[derive(Default)]
pub struct NewGrfTable {
    entries: Mutex<IndexMap<u32, NewGrfEntry>>,
}

impl NewGrfTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry at a stable index, as driven by the
    /// database's `newgrf_added` callback.
    pub fn add(&self, index: u32, entry: NewGrfEntry) {
        self.entries.lock().insert(index, entry);
    }

    /// Remove the first entry matching `(grfid, md5sum)`, as driven by the
    /// database's `remove_newgrf_from_table` callback.
    pub fn drop_matching(&self, grfid: u32, md5sum: &str) {
        let mut entries = self.entries.lock();
        if let Some(index) = entries
            .iter()
            .find(|(_, e)| e.grfid == grfid && e.md5sum == md5sum)
            .map(|(index, _)| *index)
        {
            entries.shift_remove(&index);
        }
    }

    /// Full snapshot, index-ascending, for consumers that need the whole
    /// table (e.g. seeding a fresh coordinator instance).
    pub fn snapshot(&self) -> Vec<(u32, NewGrfEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(i, e)| (*i, e.clone()))
            .collect()
    }

    /// Entries the client hasn't seen yet, i.e. index strictly greater than
    /// its cursor, for `GC_NEWGRF_LOOKUP`.
    pub fn delta_since(&self, cursor: u32) -> Vec<(u32, NewGrfEntry)> {
        self.entries
            .lock()
            .iter()
            .filter(|(index, _)| **index > cursor)
            .map(|(i, e)| (*i, e.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(grfid: u32, md5: &str) -> NewGrfEntry {
        NewGrfEntry { grfid, md5sum: md5.to_string(), name: format!("grf-{grfid}") }
    }

    #[test]
    fn add_and_snapshot() {
        let table = NewGrfTable::new();
        table.add(5, entry(1, "aaaa"));
        table.add(2, entry(2, "bbbb"));
        let snap = table.snapshot();
        assert_eq!(snap, vec![(5, entry(1, "aaaa")), (2, entry(2, "bbbb"))]);
    }

    #[test]
    fn drop_matching_removes_first_hit_only() {
        let table = NewGrfTable::new();
        table.add(1, entry(42, "cccc"));
        table.add(2, entry(42, "cccc"));
        table.drop_matching(42, "cccc");
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot(), vec![(2, entry(42, "cccc"))]);
    }

    #[test]
    fn delta_since_cursor() {
        let table = NewGrfTable::new();
        table.add(1, entry(1, "a"));
        table.add(2, entry(2, "b"));
        table.add(3, entry(3, "c"));
        let delta = table.delta_since(1);
        assert_eq!(delta, vec![(2, entry(2, "b")), (3, entry(3, "c"))]);
    }
}
