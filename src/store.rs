use anyhow::{anyhow, Context, Result};

use crate::command::LogEntry;

const KEY_CURRENT_TERM: &[u8] = b"m:current-term";
const KEY_VOTED_FOR: &[u8] = b"m:vote-for-peer";
const KEY_COMMIT_INDEX: &[u8] = b"m:commit-index";
const KEY_LAST_APPLIED: &[u8] = b"m:last-applied";
const LOG_PREFIX: &[u8] = b"l:log-entries:";

fn log_key(index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(LOG_PREFIX.len() + 8);
    key.extend_from_slice(LOG_PREFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn decode_entry(bytes: &[u8]) -> Result<LogEntry> {
    serde_json::from_slice(bytes).context("corrupt log entry")
}

fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>> {
    serde_json::to_vec(entry).context("failed to encode log entry")
}

/// Single-process, crash-safe store for persistent node state: the
/// metadata scalars (`currentTerm`, `votedFor`, `commitIndex`,
/// `lastApplied`) and the ordered log. Backed by `sled`, which gives us
/// a sorted key space (so big-endian log keys iterate in index order)
/// and durable batched writes.
///
/// Cloning is cheap: `sled::Db` is itself a handle around shared state,
/// so every clone of a `DurableStore` talks to the same on-disk tree.
#[derive(Clone)]
pub struct DurableStore {
    db: sled::Db,
}

impl DurableStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path).context("failed to open durable store")?;
        Ok(Self { db })
    }

    /// A store backed by a temporary on-disk tree, for tests.
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("failed to open temporary durable store")?;
        Ok(Self { db })
    }

    pub fn close(self) -> Result<()> {
        self.db.flush().context("failed to flush durable store on close")?;
        Ok(())
    }

    fn get_u64(&self, key: &[u8]) -> Result<Option<u64>> {
        match self.db.get(key).context("durable store read failed")? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| anyhow!("corrupt u64 value in durable store"))?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn put_u64(&self, key: &[u8], value: u64) -> Result<()> {
        self.db
            .insert(key, &value.to_le_bytes())
            .context("durable store write failed")?;
        self.db.flush().context("durable store flush failed")?;
        Ok(())
    }

    pub fn get_current_term(&self) -> Result<u64> {
        Ok(self.get_u64(KEY_CURRENT_TERM)?.unwrap_or(0))
    }

    pub fn put_current_term(&self, term: u64) -> Result<()> {
        self.put_u64(KEY_CURRENT_TERM, term)
    }

    pub fn get_commit_index(&self) -> Result<u64> {
        Ok(self.get_u64(KEY_COMMIT_INDEX)?.unwrap_or(0))
    }

    pub fn put_commit_index(&self, index: u64) -> Result<()> {
        self.put_u64(KEY_COMMIT_INDEX, index)
    }

    pub fn get_last_applied(&self) -> Result<u64> {
        Ok(self.get_u64(KEY_LAST_APPLIED)?.unwrap_or(0))
    }

    pub fn put_last_applied(&self, index: u64) -> Result<()> {
        self.put_u64(KEY_LAST_APPLIED, index)
    }

    pub fn get_vote_for(&self) -> Result<Option<String>> {
        match self.db.get(KEY_VOTED_FOR).context("durable store read failed")? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes.to_vec()).context("corrupt votedFor value")?,
            )),
            None => Ok(None),
        }
    }

    pub fn put_vote_for(&self, candidate: Option<&str>) -> Result<()> {
        match candidate {
            Some(id) => {
                self.db.insert(KEY_VOTED_FOR, id.as_bytes()).context("durable store write failed")?;
            }
            None => {
                self.db.remove(KEY_VOTED_FOR).context("durable store write failed")?;
            }
        }
        self.db.flush().context("durable store flush failed")?;
        Ok(())
    }

    /// Appends a batch of entries atomically. All entries must already
    /// be durable before the caller replies to whatever triggered them.
    pub fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        for entry in entries {
            batch.insert(log_key(entry.index), encode_entry(entry)?);
        }
        self.db.apply_batch(batch).context("durable store batch append failed")?;
        self.db.flush().context("durable store flush failed")?;
        Ok(())
    }

    /// Removes every log entry at or after `from_index`.
    pub fn truncate_suffix(&self, from_index: u64) -> Result<()> {
        let start = log_key(from_index);
        let mut batch = sled::Batch::default();
        for kv in self.db.range(start..) {
            let (key, _) = kv.context("durable store scan failed")?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            batch.remove(key);
        }
        self.db.apply_batch(batch).context("durable store batch truncate failed")?;
        self.db.flush().context("durable store flush failed")?;
        Ok(())
    }

    pub fn entry_at(&self, index: u64) -> Result<Option<LogEntry>> {
        match self.db.get(log_key(index)).context("durable store read failed")? {
            Some(bytes) => Ok(Some(decode_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All entries with index >= `from_index`, in index order. Relies on
    /// big-endian log keys sorting lexicographically in index order.
    pub fn entries_from(&self, from_index: u64) -> Result<Vec<LogEntry>> {
        let start = log_key(from_index);
        let mut out = Vec::new();
        for kv in self.db.range(start..) {
            let (key, value) = kv.context("durable store scan failed")?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            out.push(decode_entry(&value)?);
        }
        Ok(out)
    }

    pub fn last_log_entry(&self) -> Result<Option<LogEntry>> {
        match self.db.scan_prefix(LOG_PREFIX).next_back() {
            Some(kv) => {
                let (_, value) = kv.context("durable store scan failed")?;
                Ok(Some(decode_entry(&value)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry { index, term, command: Command::put("k", "v") }
    }

    #[test]
    fn metadata_roundtrips_and_defaults_to_zero() {
        let store = DurableStore::open_temporary().unwrap();
        assert_eq!(store.get_current_term().unwrap(), 0);
        store.put_current_term(7).unwrap();
        assert_eq!(store.get_current_term().unwrap(), 7);

        assert_eq!(store.get_vote_for().unwrap(), None);
        store.put_vote_for(Some("n2")).unwrap();
        assert_eq!(store.get_vote_for().unwrap(), Some("n2".to_string()));
        store.put_vote_for(None).unwrap();
        assert_eq!(store.get_vote_for().unwrap(), None);
    }

    #[test]
    fn append_and_scan_preserve_index_order() {
        let store = DurableStore::open_temporary().unwrap();
        store.append_entries(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();

        let all = store.entries_from(1).unwrap();
        assert_eq!(all.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2, 3]);

        let last = store.last_log_entry().unwrap().unwrap();
        assert_eq!(last.index, 3);
        assert_eq!(last.term, 2);

        let tail = store.entries_from(2).unwrap();
        assert_eq!(tail.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn truncate_suffix_removes_from_index_onward() {
        let store = DurableStore::open_temporary().unwrap();
        store.append_entries(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        store.truncate_suffix(2).unwrap();

        let remaining = store.entries_from(1).unwrap();
        assert_eq!(remaining.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1]);
        assert_eq!(store.last_log_entry().unwrap().unwrap().index, 1);
    }

    #[test]
    fn big_endian_log_keys_do_not_collide_with_metadata_keys() {
        // 'l' < 'm' lexicographically, so log keys always sort before
        // metadata keys regardless of index value.
        let store = DurableStore::open_temporary().unwrap();
        store.put_current_term(u64::MAX).unwrap();
        store.append_entries(&[entry(u64::MAX, 1)]).unwrap();
        assert_eq!(store.entries_from(0).unwrap().len(), 1);
        assert_eq!(store.get_current_term().unwrap(), u64::MAX);
    }
}
