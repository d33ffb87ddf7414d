use anyhow::Result;

use crate::command::LogEntry;
use crate::store::DurableStore;

/// Read-side summary of the persisted log. Caches `(lastIndex, lastTerm)`
/// so the hot path of the event loop (building the next heartbeat,
/// checking the up-to-date vote rule) doesn't round-trip through the
/// durable store on every tick. The cache is invalidated by any call
/// that appends to or truncates the log.
pub struct LogView {
    store: DurableStore,
    last_index: u64,
    last_term: u64,
}

impl LogView {
    pub fn new(store: DurableStore) -> Result<Self> {
        let mut view = Self { store, last_index: 0, last_term: 0 };
        view.invalidate()?;
        Ok(view)
    }

    /// Recomputes the cached `(lastIndex, lastTerm)` from the durable
    /// store. Call after any append or truncate.
    pub fn invalidate(&mut self) -> Result<()> {
        match self.store.last_log_entry()? {
            Some(entry) => {
                self.last_index = entry.index;
                self.last_term = entry.term;
            }
            None => {
                self.last_index = 0;
                self.last_term = 0;
            }
        }
        Ok(())
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn last_term(&self) -> u64 {
        self.last_term
    }

    pub fn term_at(&self, index: u64) -> Result<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        Ok(self.store.entry_at(index)?.map(|e| e.term))
    }

    pub fn slice(&self, from_index: u64, max_count: usize) -> Result<Vec<LogEntry>> {
        let mut entries = self.store.entries_from(from_index)?;
        entries.truncate(max_count);
        Ok(entries)
    }

    /// `matches(0, 0)` is true by convention (the empty prefix). Otherwise
    /// true iff an entry exists at `prev_index` with term `prev_term`.
    pub fn matches(&self, prev_index: u64, prev_term: u64) -> Result<bool> {
        if prev_index == 0 && prev_term == 0 {
            return Ok(true);
        }
        Ok(self.term_at(prev_index)?.map_or(false, |t| t == prev_term))
    }
}
