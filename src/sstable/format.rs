//! Shared on-disk constants for the three SSTable artifacts (§4.3, §6).

pub const DATA_MAGIC: &[u8; 4] = b"NXSD";
pub const INDEX_MAGIC: &[u8; 4] = b"NXSI";
pub const BLOOM_MAGIC: &[u8; 4] = b"NXSB";

pub const OP_PUT: u8 = 1;
pub const OP_DEL: u8 = 2;

pub fn data_path(dir: &std::path::Path, seq: u64) -> std::path::PathBuf {
    dir.join(format!("sstable_{seq}.data"))
}

pub fn index_path(dir: &std::path::Path, seq: u64) -> std::path::PathBuf {
    dir.join(format!("sstable_{seq}.index"))
}

pub fn bloom_path(dir: &std::path::Path, seq: u64) -> std::path::PathBuf {
    dir.join(format!("sstable_{seq}.bloom"))
}
