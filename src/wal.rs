//! Write-ahead log: append-only durability record, batched fsync.
//!
//! Record format (§4.1): `[u64 timestamp_ms][u8 op][u32 key_len][key][u32 val_len][val]`.
//! `op` is `1` for put, `2` for delete (tombstone, `val_len == 0`).
//!
//! Writers call [`WriteAheadLog::append`], which blocks until the record is
//! durable. Internally, a dedicated flusher thread drains a channel of
//! pending appends, writes every queued record, issues one `sync_all`, then
//! wakes every caller in that batch — one mutex, one `BufWriter`, but with
//! per-call fsync generalized to batched fsync so one slow writer can't
//! force a sync per record from every other concurrent writer.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{NexaError, Result};

pub const OP_PUT: u8 = 1;
pub const OP_DEL: u8 = 2;

/// Records larger than this are treated as a corrupt tail rather than an
/// allocation the replay path should attempt.
const MAX_RECORD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub timestamp_ms: u64,
    pub op: u8,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl WalRecord {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            timestamp_ms: now_ms(),
            op: OP_PUT,
            key,
            value,
        }
    }

    pub fn tombstone(key: Vec<u8>) -> Self {
        Self {
            timestamp_ms: now_ms(),
            op: OP_DEL,
            key,
            value: Vec::new(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.op == OP_DEL
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 1 + 4 + self.key.len() + 4 + self.value.len());
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        buf.push(self.op);
        buf.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.value);
        buf
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Replays a WAL file in place without spinning up a flusher thread. Used by
/// the engine during recovery for sealed generation files it only needs to
/// read once, not append to.
pub fn replay_file<F: FnMut(WalRecord)>(path: &Path, mut handler: F) -> Result<ReplayOutcome> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReplayOutcome::Clean),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    loop {
        match read_one(&mut reader)? {
            ReadResult::Record(record) => handler(record),
            ReadResult::CleanEof => return Ok(ReplayOutcome::Clean),
            ReadResult::Truncated(reason) => {
                warn!("WAL replay stopped on truncated trailing record: {reason}");
                return Ok(ReplayOutcome::TruncatedTail { reason });
            }
        }
    }
}

enum FlusherMsg {
    Append(WalRecord, Sender<io::Result<()>>),
    Shutdown,
}

/// A partial or corrupt trailing record was found during replay.
#[derive(Debug)]
pub enum ReplayOutcome {
    Clean,
    TruncatedTail { reason: String },
}

pub struct WriteAheadLog {
    path: PathBuf,
    tx: Sender<FlusherMsg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WriteAheadLog {
    /// Opens (or creates) `<dir>/wal.log`.
    pub fn open(dir_path: &Path, batch_max_records: usize, batch_linger: Duration) -> Result<Self> {
        Self::open_at(&dir_path.join("wal.log"), batch_max_records, batch_linger)
    }

    /// Opens (or creates) the WAL at an exact file path. The engine uses
    /// this directly to rotate to a new generation file when it seals the
    /// active MemTable, so the sealed generation's file can be kept around
    /// (for crash recovery) until the corresponding SSTable is durable.
    pub fn open_at(path: &Path, batch_max_records: usize, batch_linger: Duration) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = mpsc::channel::<FlusherMsg>();

        let writer = BufWriter::new(file);
        let handle = std::thread::spawn(move || {
            run_flusher(writer, rx, batch_max_records, batch_linger);
        });

        Ok(Self {
            path: path.to_path_buf(),
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Appends a record, returning only after it is durable (post-fsync).
    pub fn append(&self, record: WalRecord) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.tx
            .send(FlusherMsg::Append(record, ack_tx))
            .map_err(|_| NexaError::WriteFailed("WAL flusher thread is gone".into()))?;

        match ack_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(NexaError::WriteFailed(e.to_string())),
            Err(_) => Err(NexaError::WriteFailed(
                "WAL flusher dropped without acknowledging".into(),
            )),
        }
    }

    /// Replays every complete record in append order, invoking `handler` for
    /// each. A partial trailing record is detected and logged; replay
    /// terminates without returning an error (§4.1 failure model).
    pub fn replay<F: FnMut(WalRecord)>(&self, handler: F) -> Result<ReplayOutcome> {
        replay_file(&self.path, handler)
    }

    /// Truncates the WAL to zero length after a successful MemTable flush.
    ///
    /// Safe to call once every `append` that happened-before it has returned
    /// (each `append` blocks for its own durability ack, so by the time the
    /// engine calls this the flusher has nothing left in flight for those
    /// writes).
    pub fn truncate(&self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        let _ = self.tx.send(FlusherMsg::Shutdown);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_flusher(
    mut writer: BufWriter<File>,
    rx: Receiver<FlusherMsg>,
    batch_max_records: usize,
    batch_linger: Duration,
) {
    loop {
        let first = match rx.recv() {
            Ok(msg) => msg,
            Err(_) => return,
        };

        let mut acks: Vec<Sender<io::Result<()>>> = Vec::new();
        match first {
            FlusherMsg::Shutdown => return,
            FlusherMsg::Append(record, ack) => {
                let _ = writer.write_all(&record.encode());
                acks.push(ack);
            }
        }

        let deadline = std::time::Instant::now() + batch_linger;
        while acks.len() < batch_max_records {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(FlusherMsg::Append(record, ack)) => {
                    let _ = writer.write_all(&record.encode());
                    acks.push(ack);
                }
                Ok(FlusherMsg::Shutdown) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let result = writer.flush().and_then(|_| writer.get_ref().sync_all());
        debug!("WAL batch flushed: {} record(s), ok={}", acks.len(), result.is_ok());

        for ack in acks {
            let _ = ack.send(result.as_ref().map(|_| ()).map_err(|e| {
                io::Error::new(e.kind(), e.to_string())
            }));
        }
    }
}

enum ReadResult {
    Record(WalRecord),
    CleanEof,
    Truncated(String),
}

fn read_one<R: Read>(reader: &mut R) -> Result<ReadResult> {
    let mut ts_buf = [0u8; 8];
    match read_exact_or_eof(reader, &mut ts_buf)? {
        ExactRead::Eof => return Ok(ReadResult::CleanEof),
        ExactRead::Partial => return Ok(ReadResult::Truncated("truncated timestamp".into())),
        ExactRead::Full => {}
    }
    let timestamp_ms = u64::from_be_bytes(ts_buf);

    let mut op_buf = [0u8; 1];
    if reader.read_exact(&mut op_buf).is_err() {
        return Ok(ReadResult::Truncated("truncated op byte".into()));
    }
    let op = op_buf[0];

    let mut len_buf = [0u8; 4];
    if reader.read_exact(&mut len_buf).is_err() {
        return Ok(ReadResult::Truncated("truncated key length".into()));
    }
    let key_len = u32::from_be_bytes(len_buf) as usize;
    if key_len > MAX_RECORD_BYTES {
        return Ok(ReadResult::Truncated(format!(
            "implausible key length {key_len}, treating as corrupt tail"
        )));
    }
    let mut key = vec![0u8; key_len];
    if reader.read_exact(&mut key).is_err() {
        return Ok(ReadResult::Truncated("truncated key payload".into()));
    }

    if reader.read_exact(&mut len_buf).is_err() {
        return Ok(ReadResult::Truncated("truncated value length".into()));
    }
    let val_len = u32::from_be_bytes(len_buf) as usize;
    if val_len > MAX_RECORD_BYTES {
        return Ok(ReadResult::Truncated(format!(
            "implausible value length {val_len}, treating as corrupt tail"
        )));
    }
    let mut value = vec![0u8; val_len];
    if reader.read_exact(&mut value).is_err() {
        return Ok(ReadResult::Truncated("truncated value payload".into()));
    }

    Ok(ReadResult::Record(WalRecord {
        timestamp_ms,
        op,
        key,
        value,
    }))
}

enum ExactRead {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ExactRead> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..])? {
            0 => {
                return Ok(if read == 0 {
                    ExactRead::Eof
                } else {
                    ExactRead::Partial
                })
            }
            n => read += n,
        }
    }
    Ok(ExactRead::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path(), 500, Duration::from_millis(5)).unwrap();

        wal.append(WalRecord::put(b"a".to_vec(), b"1".to_vec()))
            .unwrap();
        wal.append(WalRecord::put(b"b".to_vec(), b"2".to_vec()))
            .unwrap();
        wal.append(WalRecord::tombstone(b"a".to_vec())).unwrap();

        let mut seen = Vec::new();
        wal.replay(|r| seen.push(r)).unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].key, b"a");
        assert!(!seen[0].is_tombstone());
        assert_eq!(seen[2].key, b"a");
        assert!(seen[2].is_tombstone());
    }

    #[test]
    fn truncate_clears_the_log() {
        let dir = tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path(), 500, Duration::from_millis(5)).unwrap();
        wal.append(WalRecord::put(b"k".to_vec(), b"v".to_vec()))
            .unwrap();
        wal.truncate().unwrap();

        let mut seen = Vec::new();
        wal.replay(|r| seen.push(r)).unwrap();
        assert!(seen.is_empty());
    }

    #[test]
    fn replay_stops_cleanly_on_truncated_tail() {
        let dir = tempdir().unwrap();
        {
            let wal = WriteAheadLog::open(dir.path(), 500, Duration::from_millis(5)).unwrap();
            wal.append(WalRecord::put(b"k".to_vec(), b"v".to_vec()))
                .unwrap();
        }

        // Simulate a torn write: append a few stray bytes that don't form a
        // complete record.
        {
            let mut f = OpenOptions::new()
                .append(true)
                .open(dir.path().join("wal.log"))
                .unwrap();
            f.write_all(&[0u8, 1, 2]).unwrap();
        }

        let wal = WriteAheadLog::open(dir.path(), 500, Duration::from_millis(5)).unwrap();
        let mut seen = Vec::new();
        let outcome = wal.replay(|r| seen.push(r)).unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(outcome, ReplayOutcome::TruncatedTail { .. }));
    }
}
