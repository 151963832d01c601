//! The LSM engine (§4.4): coordinates the write-ahead log, the active and
//! frozen MemTables, and the registered SSTables behind `put`/`delete`/
//! `get`/`range_scan`, with a background flush worker and a background
//! single-level compaction worker — each a dedicated OS thread, matching
//! the hybrid concurrency model the spec calls for (async at the network
//! edge, synchronous workers for disk I/O).
//!
//! A MemTable seal rotates the WAL to a fresh generation file
//! (`wal_<gen>.log`) rather than truncating the live one in place: the
//! active MemTable keeps accepting writes against its own WAL generation
//! while the sealed generation is flushed in the background, and the
//! sealed file is only deleted once its SSTable is durable on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{NexaError, Result};
use crate::memtable::{MemTable, MemValue};
use crate::sstable::{self, SsTableBuilder, SsTableReader};
use crate::wal::{self, WalRecord, WriteAheadLog};

struct Inner {
    data_dir: PathBuf,
    config: EngineConfig,
    wal: Mutex<WriteAheadLog>,
    /// Serializes the WAL-append + MemTable-insert sequence against
    /// concurrent seals, so a seal never splits a single write across the
    /// old and new generation.
    ingest: Mutex<()>,
    active: Mutex<MemTable>,
    frozen: Mutex<Option<Arc<MemTable>>>,
    sstables: RwLock<Vec<Arc<SsTableReader>>>,
    next_seq: AtomicU64,
    wal_gen: AtomicU64,
    degraded: AtomicBool,
    shutdown: AtomicBool,
    pending_old_wal: Mutex<Vec<PathBuf>>,
    flush_tx: Sender<()>,
    compaction_tx: Sender<()>,
}

pub struct LsmEngine {
    inner: Arc<Inner>,
    flush_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    compaction_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl LsmEngine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let data_dir = config.data_dir.clone();

        let (sstables, next_seq, any_sstable_failed) = load_sstables(&data_dir)?;
        let (recovered, sealed_wal_paths, max_wal_gen) = load_wal_generations(&data_dir, &config)?;

        let active_gen = max_wal_gen + 1;
        let active_wal_path = data_dir.join(format!("wal_{active_gen}.log"));
        let active_wal = WriteAheadLog::open_at(
            &active_wal_path,
            config.wal_batch_max_records,
            config.wal_batch_linger,
        )?;

        let has_recovered_data = !recovered.is_empty();
        let frozen = if has_recovered_data {
            Some(Arc::new(recovered))
        } else {
            None
        };

        let (flush_tx, flush_rx) = mpsc::channel();
        let (compaction_tx, compaction_rx) = mpsc::channel();

        let inner = Arc::new(Inner {
            data_dir,
            wal: Mutex::new(active_wal),
            ingest: Mutex::new(()),
            active: Mutex::new(MemTable::new(config.memtable_max_bytes)),
            frozen: Mutex::new(frozen),
            sstables: RwLock::new(sstables),
            next_seq: AtomicU64::new(next_seq),
            wal_gen: AtomicU64::new(active_gen),
            degraded: AtomicBool::new(any_sstable_failed),
            shutdown: AtomicBool::new(false),
            pending_old_wal: Mutex::new(sealed_wal_paths),
            flush_tx: flush_tx.clone(),
            compaction_tx: compaction_tx.clone(),
            config,
        });

        if any_sstable_failed {
            warn!("engine starting in degraded mode: one or more sstables failed to open");
        }

        let flush_inner = Arc::clone(&inner);
        let flush_handle = std::thread::spawn(move || run_flush_worker(flush_inner, flush_rx));

        let compaction_inner = Arc::clone(&inner);
        let compaction_handle =
            std::thread::spawn(move || run_compaction_worker(compaction_inner, compaction_rx));

        if has_recovered_data {
            let _ = flush_tx.send(());
        }

        Ok(Self {
            inner,
            flush_handle: Mutex::new(Some(flush_handle)),
            compaction_handle: Mutex::new(Some(compaction_handle)),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.check_degraded()?;
        let record = WalRecord::put(key.clone(), value.clone());
        self.append_and_apply(record, key, MemValue::Put(value))?;
        self.maybe_seal()?;
        Ok(())
    }

    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        self.check_degraded()?;
        let record = WalRecord::tombstone(key.clone());
        self.append_and_apply(record, key, MemValue::Tombstone)?;
        self.maybe_seal()?;
        Ok(())
    }

    /// Degraded mode (§4.1/§7) only blocks writes; the engine keeps serving
    /// reads off whatever SSTables it managed to open plus the in-memory
    /// tables, even after a background I/O failure marks it read-only.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.inner.active.lock().unwrap().get(key) {
            return Ok(Self::resolve(v.clone()));
        }
        let frozen = self.inner.frozen.lock().unwrap().clone();
        if let Some(frozen) = frozen {
            if let Some(v) = frozen.get(key) {
                return Ok(Self::resolve(v.clone()));
            }
        }
        let tables = self.inner.sstables.read().unwrap().clone();
        for table in &tables {
            if let Some(result) = table.get(key)? {
                return Ok(result);
            }
        }
        Ok(None)
    }

    /// Merges the active MemTable, the frozen MemTable (if any), and every
    /// registered SSTable into one ordered, de-duplicated view over
    /// `[start, end)`, dropping tombstones. Materializes the whole range in
    /// memory rather than returning a lazy cursor — acceptable for the
    /// bounded collection sizes this engine targets (§9).
    pub fn range_scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, MemValue> = BTreeMap::new();

        let tables = self.inner.sstables.read().unwrap().clone();
        for table in tables.iter().rev() {
            for (key, op, value) in table.scan_all()? {
                if in_range(&key, start, end) {
                    let v = if op == sstable::format::OP_DEL {
                        MemValue::Tombstone
                    } else {
                        MemValue::Put(value)
                    };
                    merged.insert(key, v);
                }
            }
        }

        let frozen = self.inner.frozen.lock().unwrap().clone();
        if let Some(frozen) = frozen {
            for (key, value) in frozen.range(start, end) {
                merged.insert(key.clone(), value.clone());
            }
        }

        {
            let active = self.inner.active.lock().unwrap();
            for (key, value) in active.range(start, end) {
                merged.insert(key.clone(), value.clone());
            }
        }

        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| match v {
                MemValue::Put(val) => Some((k, val)),
                MemValue::Tombstone => None,
            })
            .collect())
    }

    fn resolve(v: MemValue) -> Option<Vec<u8>> {
        match v {
            MemValue::Put(v) => Some(v),
            MemValue::Tombstone => None,
        }
    }

    fn check_degraded(&self) -> Result<()> {
        if self.inner.degraded.load(Ordering::Acquire) {
            return Err(NexaError::StorageDegraded(
                "engine is in read-only degraded mode after a background I/O failure".into(),
            ));
        }
        Ok(())
    }

    fn append_and_apply(&self, record: WalRecord, key: Vec<u8>, value: MemValue) -> Result<()> {
        let _ingest = self.inner.ingest.lock().unwrap();
        self.inner.wal.lock().unwrap().append(record)?;
        self.inner.active.lock().unwrap().insert(key, value);
        Ok(())
    }

    fn maybe_seal(&self) -> Result<()> {
        let needs_seal = {
            let active = self.inner.active.lock().unwrap();
            active.should_seal() && !active.is_empty()
        };
        if !needs_seal {
            return Ok(());
        }
        if self.inner.frozen.lock().unwrap().is_some() {
            // One immutable MemTable at a time; the active table keeps
            // growing until the flush worker drains the current one.
            return Ok(());
        }
        self.seal_and_rotate()
    }

    fn seal_and_rotate(&self) -> Result<()> {
        let _ingest = self.inner.ingest.lock().unwrap();
        if self.inner.frozen.lock().unwrap().is_some() {
            return Ok(());
        }

        {
            let mut active = self.inner.active.lock().unwrap();
            if active.is_empty() {
                return Ok(());
            }
            let sealed_table = std::mem::replace(
                &mut *active,
                MemTable::new(self.inner.config.memtable_max_bytes),
            );
            // Install into `frozen` while `active` is still locked: a
            // concurrent reader locks `active` before `frozen` (see `get`),
            // so by the time it can observe the now-empty `active` table it
            // is guaranteed to also observe `frozen` already populated. The
            // key is never briefly missing from both slots.
            *self.inner.frozen.lock().unwrap() = Some(Arc::new(sealed_table));
        }

        let gen = self.inner.wal_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let new_wal_path = self.inner.data_dir.join(format!("wal_{gen}.log"));
        let new_wal = WriteAheadLog::open_at(
            &new_wal_path,
            self.inner.config.wal_batch_max_records,
            self.inner.config.wal_batch_linger,
        )?;

        let old_wal = {
            let mut wal_guard = self.inner.wal.lock().unwrap();
            std::mem::replace(&mut *wal_guard, new_wal)
        };
        let old_wal_path = old_wal.path().to_path_buf();
        drop(old_wal);

        self.inner.pending_old_wal.lock().unwrap().push(old_wal_path);

        let _ = self.inner.flush_tx.send(());
        Ok(())
    }
}

impl Drop for LsmEngine {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _ = self.inner.flush_tx.send(());
        let _ = self.inner.compaction_tx.send(());
        if let Some(h) = self.flush_handle.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.compaction_handle.lock().unwrap().take() {
            let _ = h.join();
        }
    }
}

fn in_range(key: &[u8], start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
    if let Some(s) = start {
        if key < s {
            return false;
        }
    }
    if let Some(e) = end {
        if key >= e {
            return false;
        }
    }
    true
}

fn run_flush_worker(inner: Arc<Inner>, rx: Receiver<()>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = try_flush(&inner) {
            error!("flush worker failed, entering degraded mode: {e}");
            inner.degraded.store(true, Ordering::Release);
        }
    }
}

fn try_flush(inner: &Inner) -> Result<()> {
    let table = inner.frozen.lock().unwrap().clone();
    let Some(table) = table else {
        return Ok(());
    };

    if table.is_empty() {
        *inner.frozen.lock().unwrap() = None;
        clear_pending_wal(inner)?;
        return Ok(());
    }

    let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
    let mut builder = SsTableBuilder::create(
        &inner.data_dir,
        seq,
        inner.config.index_interval,
        inner.config.bloom_fp_rate,
    )?;
    for (key, value) in table.iter() {
        match value {
            MemValue::Put(v) => builder.add(key, Some(v.as_slice()))?,
            MemValue::Tombstone => builder.add(key, None)?,
        }
    }
    builder.finish()?;
    let reader = Arc::new(SsTableReader::open(&inner.data_dir, seq)?);

    {
        let mut tables = inner.sstables.write().unwrap();
        tables.insert(0, reader);
    }
    *inner.frozen.lock().unwrap() = None;
    clear_pending_wal(inner)?;
    info!("flushed memtable into sstable {seq}");

    let _ = inner.compaction_tx.send(());
    Ok(())
}

fn clear_pending_wal(inner: &Inner) -> Result<()> {
    let paths: Vec<PathBuf> = std::mem::take(&mut *inner.pending_old_wal.lock().unwrap());
    for path in paths {
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

fn run_compaction_worker(inner: Arc<Inner>, rx: Receiver<()>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = try_compact(&inner) {
            error!("compaction worker failed, entering degraded mode: {e}");
            inner.degraded.store(true, Ordering::Release);
        }
    }
}

/// Merges the oldest contiguous group of `compaction_threshold` SSTables
/// into one (§4.4). Since that group is always the oldest data on disk,
/// any tombstone inside it has no older value left to suppress and is
/// dropped rather than carried forward.
fn try_compact(inner: &Inner) -> Result<()> {
    let threshold = inner.config.compaction_threshold;

    let group: Vec<Arc<SsTableReader>> = {
        let tables = inner.sstables.read().unwrap();
        if tables.len() < threshold {
            return Ok(());
        }
        tables[tables.len() - threshold..].to_vec()
    };

    let mut merged: BTreeMap<Vec<u8>, (u8, Vec<u8>)> = BTreeMap::new();
    for table in group.iter().rev() {
        for (key, op, value) in table.scan_all()? {
            merged.insert(key, (op, value));
        }
    }

    let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
    let mut builder = SsTableBuilder::create(
        &inner.data_dir,
        seq,
        inner.config.index_interval,
        inner.config.bloom_fp_rate,
    )?;
    let mut wrote_any = false;
    for (key, (op, value)) in merged {
        if op == sstable::format::OP_DEL {
            continue;
        }
        builder.add(&key, Some(value.as_slice()))?;
        wrote_any = true;
    }

    let merged_reader = if wrote_any {
        builder.finish()?;
        Some(Arc::new(SsTableReader::open(&inner.data_dir, seq)?))
    } else {
        None
    };
    let merged_seq = merged_reader.as_ref().map(|r| r.seq);

    let removed: Vec<Arc<SsTableReader>> = {
        let mut tables = inner.sstables.write().unwrap();
        let start = tables.len() - threshold;
        tables.splice(start.., merged_reader).collect()
    };
    for old in &removed {
        let _ = fs::remove_file(sstable::format::data_path(&inner.data_dir, old.seq));
        let _ = fs::remove_file(sstable::format::index_path(&inner.data_dir, old.seq));
        let _ = fs::remove_file(sstable::format::bloom_path(&inner.data_dir, old.seq));
    }

    info!("compacted {} sstables into {:?}", removed.len(), merged_seq);
    Ok(())
}

fn load_sstables(dir: &Path) -> Result<(Vec<Arc<SsTableReader>>, u64, bool)> {
    let mut seqs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("sstable_").and_then(|r| r.strip_suffix(".data")) {
            if let Ok(seq) = rest.parse::<u64>() {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();
    let next_seq = seqs.last().map(|s| s + 1).unwrap_or(0);

    let mut tables = Vec::new();
    let mut any_failed = false;
    for seq in seqs.into_iter().rev() {
        match SsTableReader::open(dir, seq) {
            Ok(reader) => tables.push(Arc::new(reader)),
            Err(e) => {
                error!("failed to open sstable {seq}, dropping it from the live set: {e}");
                any_failed = true;
            }
        }
    }
    Ok((tables, next_seq, any_failed))
}

/// Replays every `wal_<gen>.log` file found in the data directory, in
/// ascending generation order, into a single MemTable. Returns that
/// MemTable, the list of file paths replayed (kept until their data is
/// durable in an SSTable), and the highest generation number seen.
fn load_wal_generations(
    dir: &Path,
    config: &EngineConfig,
) -> Result<(MemTable, Vec<PathBuf>, u64)> {
    let mut gens = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("wal_").and_then(|r| r.strip_suffix(".log")) {
            if let Ok(gen) = rest.parse::<u64>() {
                gens.push(gen);
            }
        }
    }
    gens.sort_unstable();
    let max_gen = gens.last().copied().unwrap_or(0);

    let mut memtable = MemTable::new(config.memtable_max_bytes);
    let mut paths = Vec::new();

    for gen in gens {
        let path = dir.join(format!("wal_{gen}.log"));
        let outcome = wal::replay_file(&path, |record| {
            if record.is_tombstone() {
                memtable.insert(record.key, MemValue::Tombstone);
            } else {
                memtable.insert(record.key, MemValue::Put(record.value));
            }
        })?;
        if let wal::ReplayOutcome::TruncatedTail { reason } = outcome {
            warn!("wal generation {gen} ended in a truncated tail: {reason}");
        }
        paths.push(path);
    }

    Ok((memtable, paths, max_gen))
}
