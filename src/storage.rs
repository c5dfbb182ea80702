use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use memmap2::Mmap;
use rkyv::Deserialize;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::model::{LogEntry, OP_DELETE, OP_PUT};

/// Named key spaces sharing one segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    /// Primary track records, `name+uuid+unixSeconds`.
    Tracks = 0,
    /// Visits by reported time.
    Visits = 1,
    /// Visits by coordinates, then reported time.
    VisitsByCoord = 2,
    /// Single records such as `lastknown` and `metadata`.
    Meta = 3,
}

const KEYSPACE_COUNT: usize = 4;

impl Keyspace {
    pub const ALL: [Keyspace; KEYSPACE_COUNT] =
        [Keyspace::Tracks, Keyspace::Visits, Keyspace::VisitsByCoord, Keyspace::Meta];

    fn from_u8(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }

    fn slot(self) -> usize {
        self as usize
    }
}

type Indexes = [BTreeMap<Vec<u8>, u64>; KEYSPACE_COUNT];

#[derive(Debug)]
pub struct Segment {
    pub file_path: PathBuf,
    file: File,
    current_offset: u64,
    strict: bool,
}

impl Segment {
    pub fn new(path: &Path, strict: bool) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let current_offset = file.metadata()?.len();

        Ok(Self {
            file_path: path.to_path_buf(),
            file,
            current_offset,
            strict,
        })
    }

    pub fn len(&self) -> u64 {
        self.current_offset
    }

    pub fn is_empty(&self) -> bool {
        self.current_offset == 0
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<u64, StorageError> {
        let bytes = rkyv::to_bytes::<_, 4096>(entry)
            .map_err(|e| StorageError::Serialize(e.to_string()))?;

        let start = self.current_offset;

        // [Length (4b LE)][Data (N bytes)]
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(&bytes);
        self.file.write_all(&frame)?;
        if self.strict {
            self.file.sync_data()?;
        }

        self.current_offset += frame.len() as u64;
        Ok(start)
    }

    pub fn read(&self, offset: u64) -> Result<LogEntry, StorageError> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;

        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut bytes = vec![0u8; len];
        file.read_exact(&mut bytes)?;

        decode_entry(&bytes, offset)
    }

    pub fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Walks every complete frame in file order. A torn trailing frame ends
    /// the walk and is cut off so later appends start on a frame boundary.
    fn replay(&mut self) -> Result<Vec<(u64, LogEntry)>, StorageError> {
        if self.current_offset == 0 {
            return Ok(Vec::new());
        }
        let mmap = unsafe { Mmap::map(&self.file)? };

        let mut entries = Vec::new();
        let mut pos = 0usize;
        let end = mmap.len();
        while pos < end {
            let frame = frame_at(&mmap, pos).and_then(|data| decode_entry(data, pos as u64).ok());
            match frame {
                Some(entry) => {
                    let frame_len = 4 + u32::from_le_bytes([mmap[pos], mmap[pos + 1], mmap[pos + 2], mmap[pos + 3]]) as usize;
                    entries.push((pos as u64, entry));
                    pos += frame_len;
                }
                None => {
                    warn!(
                        path = %self.file_path.display(),
                        offset = pos,
                        dropped_bytes = end - pos,
                        "torn entry at segment tail, truncating"
                    );
                    drop(mmap);
                    self.file.set_len(pos as u64)?;
                    self.file.sync_data()?;
                    self.current_offset = pos as u64;
                    return Ok(entries);
                }
            }
        }
        Ok(entries)
    }
}

fn frame_at(buf: &[u8], pos: usize) -> Option<&[u8]> {
    let len_bytes: [u8; 4] = buf.get(pos..pos + 4)?.try_into().ok()?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    buf.get(pos + 4..pos + 4 + len)
}

fn decode_entry(bytes: &[u8], offset: u64) -> Result<LogEntry, StorageError> {
    let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    let archived = rkyv::check_archived_root::<LogEntry>(&aligned).map_err(|e| StorageError::Corrupt {
        offset,
        reason: format!("{:?}", e),
    })?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|e| StorageError::Corrupt { offset, reason: format!("{:?}", e) })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub live_entries: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Ordered key/value store over a single append-only segment.
///
/// Each keyspace keeps an ordered map of key to the offset of its latest
/// put. Lock order is segment, then indexes.
pub struct KeyValueStore {
    segment: Mutex<Segment>,
    indexes: RwLock<Indexes>,
}

impl std::fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<usize> = match self.indexes.read() {
            Ok(idx) => idx.iter().map(BTreeMap::len).collect(),
            Err(_) => Vec::new(),
        };
        f.debug_struct("KeyValueStore").field("key_counts", &counts).finish()
    }
}

impl KeyValueStore {
    pub fn open(path: &Path, strict_durability: bool) -> Result<Self, StorageError> {
        let mut segment = Segment::new(path, strict_durability)?;
        let entries = segment.replay()?;

        let mut indexes: Indexes = Default::default();
        let replayed = entries.len();
        for (offset, entry) in entries {
            let Some(ks) = Keyspace::from_u8(entry.keyspace) else {
                warn!(offset, keyspace = entry.keyspace, "skipping entry for unknown keyspace");
                continue;
            };
            let map = &mut indexes[ks.slot()];
            match entry.op {
                OP_PUT => {
                    map.insert(entry.key, offset);
                }
                OP_DELETE => {
                    map.remove(&entry.key);
                }
                other => warn!(offset, op = other, "skipping entry with unknown op"),
            }
        }

        info!(
            path = %path.display(),
            entries = replayed,
            live = indexes.iter().map(BTreeMap::len).sum::<usize>(),
            "segment replayed"
        );

        Ok(Self {
            segment: Mutex::new(segment),
            indexes: RwLock::new(indexes),
        })
    }

    pub fn put(&self, keyspace: Keyspace, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let entry = LogEntry {
            keyspace: keyspace as u8,
            op: OP_PUT,
            key: key.to_vec(),
            value: value.to_vec(),
        };
        let mut segment = self.segment.lock().map_err(|_| StorageError::Poisoned)?;
        let offset = segment.append(&entry)?;

        let mut idx = self.indexes.write().map_err(|_| StorageError::Poisoned)?;
        idx[keyspace.slot()].insert(entry.key, offset);
        Ok(())
    }

    /// Returns whether the key was present.
    pub fn delete(&self, keyspace: Keyspace, key: &[u8]) -> Result<bool, StorageError> {
        let mut segment = self.segment.lock().map_err(|_| StorageError::Poisoned)?;
        if !self.contains(keyspace, key)? {
            return Ok(false);
        }
        segment.append(&LogEntry {
            keyspace: keyspace as u8,
            op: OP_DELETE,
            key: key.to_vec(),
            value: Vec::new(),
        })?;

        let mut idx = self.indexes.write().map_err(|_| StorageError::Poisoned)?;
        idx[keyspace.slot()].remove(key);
        Ok(true)
    }

    pub fn get(&self, keyspace: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let segment = self.segment.lock().map_err(|_| StorageError::Poisoned)?;
        let offset = {
            let idx = self.indexes.read().map_err(|_| StorageError::Poisoned)?;
            match idx[keyspace.slot()].get(key) {
                Some(o) => *o,
                None => return Ok(None),
            }
        };
        Ok(Some(segment.read(offset)?.value))
    }

    pub fn contains(&self, keyspace: Keyspace, key: &[u8]) -> Result<bool, StorageError> {
        let idx = self.indexes.read().map_err(|_| StorageError::Poisoned)?;
        Ok(idx[keyspace.slot()].contains_key(key))
    }

    pub fn len(&self, keyspace: Keyspace) -> Result<usize, StorageError> {
        let idx = self.indexes.read().map_err(|_| StorageError::Poisoned)?;
        Ok(idx[keyspace.slot()].len())
    }

    /// Keys in `keyspace` starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, keyspace: Keyspace, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StorageError> {
        let idx = self.indexes.read().map_err(|_| StorageError::Poisoned)?;
        Ok(idx[keyspace.slot()]
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    pub fn cursor(&self, keyspace: Keyspace) -> Cursor<'_> {
        Cursor { store: self, keyspace, last: None }
    }

    pub fn size_bytes(&self) -> Result<u64, StorageError> {
        let segment = self.segment.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(segment.len())
    }

    pub fn sync(&self) -> Result<(), StorageError> {
        let segment = self.segment.lock().map_err(|_| StorageError::Poisoned)?;
        segment.sync()
    }

    /// Rewrites the segment keeping only the live entry of every key.
    pub fn compact(&self) -> Result<CompactionStats, StorageError> {
        // Stop-the-world: both locks held for the whole rewrite.
        let mut segment = self.segment.lock().map_err(|_| StorageError::Poisoned)?;
        let mut idx = self.indexes.write().map_err(|_| StorageError::Poisoned)?;

        let old_path = segment.file_path.clone();
        let new_path = old_path.with_extension("compacting");
        if new_path.exists() {
            fs::remove_file(&new_path)?;
        }
        let bytes_before = segment.len();
        let strict = segment.strict;

        let mut fresh = Segment::new(&new_path, false)?;
        let mut new_indexes: Indexes = Default::default();
        let mut live_entries = 0;
        for ks in Keyspace::ALL {
            for (key, &old_offset) in idx[ks.slot()].iter() {
                let entry = segment.read(old_offset)?;
                let new_offset = fresh.append(&entry)?;
                new_indexes[ks.slot()].insert(key.clone(), new_offset);
                live_entries += 1;
            }
        }
        fresh.sync()?;
        let bytes_after = fresh.len();
        drop(fresh);

        fs::rename(&new_path, &old_path)?;
        *segment = Segment::new(&old_path, strict)?;
        *idx = new_indexes;

        debug!(path = %old_path.display(), live_entries, bytes_before, bytes_after, "segment rewritten");
        Ok(CompactionStats { live_entries, bytes_before, bytes_after })
    }
}

/// Ordered walk over one keyspace.
///
/// Holds no lock between steps; each step re-reads the index and returns the
/// first key after the previous one, so concurrent writes are tolerated.
pub struct Cursor<'a> {
    store: &'a KeyValueStore,
    keyspace: Keyspace,
    last: Option<Vec<u8>>,
}

impl<'a> Cursor<'a> {
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.step(Bound::Unbounded)
    }

    /// Positions at the first key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.step(Bound::Included(key.to_vec()))
    }

    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        match self.last.take() {
            Some(k) => self.step(Bound::Excluded(k)),
            None => Ok(None),
        }
    }

    fn step(&mut self, lower: Bound<Vec<u8>>) -> Result<Option<(Vec<u8>, Vec<u8>)>, StorageError> {
        let segment = self.store.segment.lock().map_err(|_| StorageError::Poisoned)?;
        let found = {
            let idx = self.store.indexes.read().map_err(|_| StorageError::Poisoned)?;
            idx[self.keyspace.slot()]
                .range((lower, Bound::Unbounded))
                .next()
                .map(|(k, o)| (k.clone(), *o))
        };
        match found {
            Some((key, offset)) => {
                let value = segment.read(offset)?.value;
                self.last = Some(key.clone());
                Ok(Some((key, value)))
            }
            None => {
                self.last = None;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_overwrite_delete() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::open(&dir.path().join("t.db"), false).unwrap();

        store.put(Keyspace::Tracks, b"a", b"1").unwrap();
        store.put(Keyspace::Visits, b"a", b"other").unwrap();
        assert_eq!(store.get(Keyspace::Tracks, b"a").unwrap(), Some(b"1".to_vec()));

        store.put(Keyspace::Tracks, b"a", b"2").unwrap();
        assert_eq!(store.get(Keyspace::Tracks, b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.len(Keyspace::Tracks).unwrap(), 1);

        assert!(store.delete(Keyspace::Tracks, b"a").unwrap());
        assert!(!store.delete(Keyspace::Tracks, b"a").unwrap());
        assert_eq!(store.get(Keyspace::Tracks, b"a").unwrap(), None);
        assert_eq!(store.get(Keyspace::Visits, b"a").unwrap(), Some(b"other".to_vec()));
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let store = KeyValueStore::open(&path, true).unwrap();
            store.put(Keyspace::Meta, b"k1", b"v1").unwrap();
            store.put(Keyspace::Meta, b"k2", b"v2").unwrap();
            store.put(Keyspace::Meta, b"k1", b"v1b").unwrap();
            store.delete(Keyspace::Meta, b"k2").unwrap();
        }
        let store = KeyValueStore::open(&path, true).unwrap();
        assert_eq!(store.get(Keyspace::Meta, b"k1").unwrap(), Some(b"v1b".to_vec()));
        assert_eq!(store.get(Keyspace::Meta, b"k2").unwrap(), None);
        assert_eq!(store.len(Keyspace::Meta).unwrap(), 1);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let store = KeyValueStore::open(&path, false).unwrap();
            store.put(Keyspace::Tracks, b"x", b"1").unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let store = KeyValueStore::open(&path, false).unwrap();
        assert_eq!(store.get(Keyspace::Tracks, b"x").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.size_bytes().unwrap(), intact);

        store.put(Keyspace::Tracks, b"y", b"2").unwrap();
        drop(store);
        let store = KeyValueStore::open(&path, false).unwrap();
        assert_eq!(store.len(Keyspace::Tracks).unwrap(), 2);
    }

    #[test]
    fn test_cursor_walks_in_key_order() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::open(&dir.path().join("t.db"), false).unwrap();
        for k in [b"c", b"a", b"e", b"b"] {
            store.put(Keyspace::Visits, k, k).unwrap();
        }

        let mut c = store.cursor(Keyspace::Visits);
        let mut seen = Vec::new();
        let mut item = c.first().unwrap();
        while let Some((k, v)) = item {
            assert_eq!(k, v);
            seen.push(k);
            item = c.next_entry().unwrap();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"e".to_vec()]);

        let mut c = store.cursor(Keyspace::Visits);
        assert_eq!(c.seek(b"d").unwrap().map(|(k, _)| k), Some(b"e".to_vec()));
        assert_eq!(c.next_entry().unwrap(), None);
        assert_eq!(store.cursor(Keyspace::Tracks).first().unwrap(), None);
    }

    #[test]
    fn test_keys_with_prefix() {
        let dir = tempdir().unwrap();
        let store = KeyValueStore::open(&dir.path().join("t.db"), false).unwrap();
        for k in ["test-a", "test-b", "rye", "tesz"] {
            store.put(Keyspace::Tracks, k.as_bytes(), b"").unwrap();
        }
        let keys = store.keys_with_prefix(Keyspace::Tracks, b"test-").unwrap();
        assert_eq!(keys, vec![b"test-a".to_vec(), b"test-b".to_vec()]);
    }

    #[test]
    fn test_compaction_drops_dead_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let store = KeyValueStore::open(&path, false).unwrap();
        for i in 0..50u32 {
            store.put(Keyspace::Tracks, b"hot", &i.to_le_bytes()).unwrap();
        }
        store.put(Keyspace::Meta, b"gone", b"x").unwrap();
        store.delete(Keyspace::Meta, b"gone").unwrap();
        store.put(Keyspace::Visits, b"keep", b"y").unwrap();

        let stats = store.compact().unwrap();
        assert_eq!(stats.live_entries, 2);
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(store.get(Keyspace::Tracks, b"hot").unwrap(), Some(49u32.to_le_bytes().to_vec()));

        store.put(Keyspace::Meta, b"after", b"z").unwrap();
        drop(store);

        let store = KeyValueStore::open(&path, false).unwrap();
        assert_eq!(store.get(Keyspace::Visits, b"keep").unwrap(), Some(b"y".to_vec()));
        assert_eq!(store.get(Keyspace::Meta, b"after").unwrap(), Some(b"z".to_vec()));
        assert_eq!(store.get(Keyspace::Meta, b"gone").unwrap(), None);
        assert!(!path.with_extension("compacting").exists());
    }
}
