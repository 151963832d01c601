//! NexaDB: an embedded LSM-tree document and vector store exposed over a
//! length-framed MessagePack protocol.
//!
//! The storage core (`wal`, `memtable`, `sstable`, `engine`) is a classic
//! single-level LSM: writes land in a write-ahead log and an in-memory
//! MemTable, seal into immutable SSTables under memory pressure, and merge
//! back down under a background compactor. `document` and `vector` layer
//! typed collections on top of the engine's flat byte-string keyspace;
//! `protocol` and `server` expose both over the network.

pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod memtable;
pub mod protocol;
pub mod query;
pub mod server;
pub mod sstable;
pub mod vector;
pub mod wal;

pub use config::{EngineConfig, ServerConfig};
pub use engine::LsmEngine;
pub use error::{ErrorKind, NexaError, Result};
