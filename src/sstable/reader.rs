//! Reads an SSTable: bloom pre-check, sparse-index binary search, linear
//! block scan (§4.3).
//!
//! If the `.index` or `.bloom` sidecar is missing or fails to validate, the
//! engine (via [`SsTableReader::rebuild`]) reconstructs both by a full scan
//! of the `.data` file, matching §4.4's recovery contract.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bloomfilter::Bloom;

use crate::error::{NexaError, Result};
use crate::sstable::format::{self, OP_DEL, OP_PUT};

#[derive(Clone)]
struct IndexEntry {
    key: Vec<u8>,
    offset: u64,
}

pub struct SsTableReader {
    pub seq: u64,
    data_path: PathBuf,
    index: Vec<IndexEntry>,
    bloom: Bloom<[u8]>,
    file: Mutex<File>,
    pub min_key: Option<Vec<u8>>,
    pub max_key: Option<Vec<u8>>,
}

impl SsTableReader {
    pub fn open(dir: &Path, seq: u64) -> Result<Self> {
        let data_path = format::data_path(dir, seq);
        let index_path = format::index_path(dir, seq);
        let bloom_path = format::bloom_path(dir, seq);

        verify_data_magic(&data_path)?;

        let index = read_index(&index_path).or_else(|e| {
            tracing::warn!("rebuilding missing/invalid index for sstable {seq}: {e}");
            rebuild_index(&data_path)
        })?;

        let bloom = read_bloom(&bloom_path).or_else(|e| {
            tracing::warn!("rebuilding missing/invalid bloom for sstable {seq}: {e}");
            rebuild_bloom(&data_path)
        })?;

        let min_key = index.first().map(|e| e.key.clone());
        let max_key = scan_last_key(&data_path)?;

        Ok(Self {
            seq,
            file: Mutex::new(File::open(&data_path)?),
            data_path,
            index,
            bloom,
            min_key,
            max_key,
        })
    }

    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.bloom.check(key)
    }

    /// Returns `None` if the key is absent, `Some(None)` for a tombstone,
    /// `Some(Some(value))` for a live value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        if !self.might_contain(key) {
            return Ok(None);
        }
        let Some(block_offset) = self.block_offset_for(key) else {
            return Ok(None);
        };

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(block_offset))?;
        let mut reader = BufReader::new(&mut *file);

        loop {
            match read_entry(&mut reader)? {
                None => return Ok(None),
                Some((entry_key, op, value)) => {
                    if entry_key.as_slice() == key {
                        return Ok(Some(if op == OP_DEL { None } else { Some(value) }));
                    }
                    if entry_key.as_slice() > key {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Full, ordered scan of every record (including tombstones), used by
    /// compaction and by the engine's `range_scan` fallback.
    ///
    /// Scans through the cached, reference-counted `self.file` handle
    /// rather than re-opening `self.data_path`: a compaction that has
    /// already unlinked this segment's files (after splicing it out of the
    /// live sstable list) leaves any `Arc<SsTableReader>` a concurrent
    /// reader is still holding fully usable, since the open file
    /// descriptor survives the unlink (§5).
    pub fn scan_all(&self) -> Result<Vec<(Vec<u8>, u8, Vec<u8>)>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(format::DATA_MAGIC.len() as u64))?;
        let mut reader = BufReader::new(&mut *file);

        let mut out = Vec::new();
        while let Some((key, op, value)) = read_entry(&mut reader)? {
            out.push((key, op, value));
        }
        Ok(out)
    }

    fn block_offset_for(&self, key: &[u8]) -> Option<u64> {
        if let Some(min) = &self.min_key {
            if key < min.as_slice() {
                return None;
            }
        }
        if let Some(max) = &self.max_key {
            if key > max.as_slice() {
                return None;
            }
        }
        let idx = self.index.partition_point(|e| e.key.as_slice() <= key);
        if idx == 0 {
            return None;
        }
        Some(self.index[idx - 1].offset)
    }
}

fn verify_data_magic(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != format::DATA_MAGIC {
        return Err(NexaError::Internal(format!(
            "sstable data file {} has bad magic",
            path.display()
        )));
    }
    Ok(())
}

fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(Vec<u8>, u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let key_len = u32::from_be_bytes(len_buf) as usize;
    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key)?;

    let mut op_buf = [0u8; 1];
    reader.read_exact(&mut op_buf)?;
    let op = op_buf[0];

    reader.read_exact(&mut len_buf)?;
    let val_len = u32::from_be_bytes(len_buf) as usize;
    let mut value = vec![0u8; val_len];
    reader.read_exact(&mut value)?;

    Ok(Some((key, op, value)))
}

fn scan_last_key(data_path: &Path) -> Result<Option<Vec<u8>>> {
    let file = File::open(data_path)?;
    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;

    let mut last = None;
    while let Some((key, _, _)) = read_entry(&mut reader)? {
        last = Some(key);
    }
    Ok(last)
}

fn read_index(index_path: &Path) -> Result<Vec<IndexEntry>> {
    let mut file = File::open(index_path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != format::INDEX_MAGIC {
        return Err(NexaError::Internal("bad index magic".into()));
    }
    let mut count_buf = [0u8; 4];
    file.read_exact(&mut count_buf)?;
    let count = u32::from_be_bytes(count_buf) as usize;

    let mut entries = Vec::with_capacity(count);
    let mut len_buf = [0u8; 4];
    let mut offset_buf = [0u8; 8];
    for _ in 0..count {
        file.read_exact(&mut len_buf)?;
        let key_len = u32::from_be_bytes(len_buf) as usize;
        let mut key = vec![0u8; key_len];
        file.read_exact(&mut key)?;
        file.read_exact(&mut offset_buf)?;
        entries.push(IndexEntry {
            key,
            offset: u64::from_be_bytes(offset_buf),
        });
    }
    Ok(entries)
}

fn read_bloom(bloom_path: &Path) -> Result<Bloom<[u8]>> {
    let mut file = File::open(bloom_path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != format::BLOOM_MAGIC {
        return Err(NexaError::Internal("bad bloom magic".into()));
    }
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut bytes = vec![0u8; len];
    file.read_exact(&mut bytes)?;
    Bloom::<[u8]>::from_bytes(bytes).map_err(|e| NexaError::Internal(format!("bloom load: {e}")))
}

/// Rebuilds a sparse index (one entry every 128 records) by a full scan of
/// the data file — the §4.4 recovery fallback for a missing/corrupt index.
fn rebuild_index(data_path: &Path) -> Result<Vec<IndexEntry>> {
    let file = File::open(data_path)?;
    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;

    let mut entries = Vec::new();
    let mut offset = magic.len() as u64;
    let mut since_last = 0usize;
    loop {
        let before = offset;
        match read_entry(&mut reader)? {
            None => break,
            Some((key, op, value)) => {
                let entry_len = 4 + key.len() + 1 + 4 + value.len();
                if since_last == 0 {
                    entries.push(IndexEntry {
                        key: key.clone(),
                        offset: before,
                    });
                }
                since_last = (since_last + 1) % 128;
                offset += entry_len as u64;
                let _ = op;
            }
        }
    }
    Ok(entries)
}

fn rebuild_bloom(data_path: &Path) -> Result<Bloom<[u8]>> {
    let file = File::open(data_path)?;
    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;

    let mut keys = Vec::new();
    while let Some((key, _, _)) = read_entry(&mut reader)? {
        keys.push(key);
    }

    let mut bloom = Bloom::<[u8]>::new_for_fp_rate(keys.len().max(1), 0.01)
        .map_err(|e| NexaError::Internal(format!("bloom rebuild: {e}")))?;
    for key in &keys {
        bloom.set(key);
    }
    Ok(bloom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::builder::SsTableBuilder;
    use tempfile::tempdir;

    #[test]
    fn rebuilds_index_and_bloom_when_sidecars_missing() {
        let dir = tempdir().unwrap();
        let mut builder = SsTableBuilder::create(dir.path(), 7, 2, 0.01).unwrap();
        for i in 0..10u32 {
            builder
                .add(format!("k{i:03}").as_bytes(), Some(b"v"))
                .unwrap();
        }
        let seq = builder.finish().unwrap();

        std::fs::remove_file(format::index_path(dir.path(), seq)).unwrap();
        std::fs::remove_file(format::bloom_path(dir.path(), seq)).unwrap();

        let reader = SsTableReader::open(dir.path(), seq).unwrap();
        assert!(reader.might_contain(b"k005"));
        assert_eq!(reader.get(b"k005").unwrap(), Some(Some(b"v".to_vec())));
        assert_eq!(reader.get(b"nope").unwrap(), None);
    }

    #[test]
    fn bloom_never_false_negatives() {
        let dir = tempdir().unwrap();
        let mut builder = SsTableBuilder::create(dir.path(), 3, 128, 0.01).unwrap();
        let keys: Vec<String> = (0..500).map(|i| format!("key-{i}")).collect();
        for k in &keys {
            builder.add(k.as_bytes(), Some(b"x")).unwrap();
        }
        let seq = builder.finish().unwrap();
        let reader = SsTableReader::open(dir.path(), seq).unwrap();
        for k in &keys {
            assert!(reader.might_contain(k.as_bytes()), "false negative for {k}");
        }
    }
}
