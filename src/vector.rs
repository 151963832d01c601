//! Vector collections: fixed-dimension embeddings stored alongside their
//! document, a pluggable ANN interface, and a correct brute-force cosine
//! fallback (§4.5).
//!
//! Vectors are persisted under their own key namespace via the LSM engine
//! directly (not through [`crate::document::Collection`], since they are
//! packed floats rather than MessagePack `Value`s), and a collection's
//! declared dimension is itself persisted so it survives a restart without
//! a separate catalog file.

use std::sync::{Arc, Mutex};

use crate::document::{Collection, Value, ID_FIELD};
use crate::engine::LsmEngine;
use crate::error::{NexaError, Result};

/// A pluggable approximate-nearest-neighbor index. The engine ships only
/// [`BruteForceIndex`]; a real ANN algorithm can implement this trait and
/// be swapped in without touching [`VectorCollection`].
pub trait AnnIndex: Send {
    fn add(&mut self, id: &str, vector: Vec<f32>);
    fn remove(&mut self, id: &str);
    /// Returns up to `k` `(id, similarity)` pairs, descending similarity,
    /// ties broken by ascending id.
    fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)>;
}

/// Full scan computing cosine similarity against every indexed vector.
/// Non-approximate by construction, so it doubles as the correctness
/// oracle for any ANN index swapped in later.
#[derive(Default)]
pub struct BruteForceIndex {
    vectors: Vec<(String, Vec<f32>)>,
}

impl BruteForceIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnnIndex for BruteForceIndex {
    fn add(&mut self, id: &str, vector: Vec<f32>) {
        match self.vectors.iter_mut().find(|(existing, _)| existing == id) {
            Some(entry) => entry.1 = vector,
            None => self.vectors.push((id.to_string(), vector)),
        }
    }

    fn remove(&mut self, id: &str) {
        self.vectors.retain(|(existing, _)| existing != id);
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(String, f32)> {
        let mut scored: Vec<(String, f32)> = self
            .vectors
            .iter()
            .map(|(id, v)| (id.clone(), cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}

/// Cosine similarity; the zero vector's cosine with anything is defined as
/// 0 rather than `NaN` (§4.5).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn validate_vector(vector: &[f32], dim: usize) -> Result<()> {
    if dim == 0 {
        return Err(NexaError::BadVector("vector dimension cannot be 0".into()));
    }
    if vector.len() != dim {
        return Err(NexaError::BadVector(format!(
            "expected dimension {dim}, got {}",
            vector.len()
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(NexaError::BadVector("vector contains a non-finite component".into()));
    }
    Ok(())
}

fn pack_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn unpack_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn meta_key(name: &str) -> Vec<u8> {
    format!("collection:{name}:__meta__").into_bytes()
}

fn vector_key(name: &str, id: &str) -> Vec<u8> {
    format!("vector:{name}:{id}").into_bytes()
}

fn vector_prefix(name: &str) -> Vec<u8> {
    format!("vector:{name}:").into_bytes()
}

/// A collection designated for vector storage, fixed at dimension `dim`
/// for its lifetime. Wraps an ordinary [`Collection`] for the document
/// side and keeps an in-memory [`AnnIndex`] rebuilt from persisted vectors
/// on open.
pub struct VectorCollection {
    name: String,
    dim: usize,
    engine: Arc<LsmEngine>,
    docs: Collection,
    index: Mutex<Box<dyn AnnIndex>>,
}

impl VectorCollection {
    /// Opens the vector collection, persisting `dim` as its dimension if
    /// this is the first use, or validating it matches the persisted
    /// dimension otherwise. Rebuilds the in-memory ANN index (brute-force,
    /// by default) by scanning every persisted vector.
    pub fn open(name: &str, engine: Arc<LsmEngine>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(NexaError::BadVector("vector dimension cannot be 0".into()));
        }

        match engine.get(&meta_key(name))? {
            Some(bytes) if bytes.len() == 4 => {
                let persisted = u32::from_le_bytes(bytes.try_into().unwrap()) as usize;
                if persisted != dim {
                    return Err(NexaError::BadVector(format!(
                        "collection {name} is configured for dimension {persisted}, got {dim}"
                    )));
                }
            }
            _ => {
                engine.put(meta_key(name), (dim as u32).to_le_bytes().to_vec())?;
            }
        }

        let mut index = BruteForceIndex::new();
        let prefix = vector_prefix(name);
        let upper = crate::document::prefix_upper_bound(&prefix);
        for (key, value) in engine.range_scan(Some(prefix.as_slice()), upper.as_deref())? {
            let id = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            index.add(&id, unpack_vector(&value));
        }

        let docs = Collection::new(name, Arc::clone(&engine));

        Ok(Self {
            name: name.to_string(),
            dim,
            engine,
            docs,
            index: Mutex::new(Box::new(index)),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Inserts `doc` with its associated `vector`, generating `_id` exactly
    /// as [`Collection::insert`] does. Fails with `BAD_VECTOR` on
    /// dimension mismatch or non-finite components.
    pub fn insert(&self, doc: Value, vector: Vec<f32>) -> Result<Value> {
        validate_vector(&vector, self.dim)?;
        let inserted = self.docs.insert(doc)?;
        let id = inserted
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| NexaError::Internal("inserted document missing _id".into()))?
            .to_string();

        self.engine.put(vector_key(&self.name, &id), pack_vector(&vector))?;
        self.index.lock().unwrap().add(&id, vector);
        Ok(inserted)
    }

    pub fn get(&self, id: &str) -> Result<Option<Value>> {
        self.docs.get(id)
    }

    /// Deletes the document and its vector. Returns `false` if the id was
    /// never present.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let existed = self.docs.delete(id)?;
        if existed {
            self.engine.delete(vector_key(&self.name, id))?;
            self.index.lock().unwrap().remove(id);
        }
        Ok(existed)
    }

    /// Top-`k` documents by descending cosine similarity to `query`, ties
    /// broken by ascending `_id`. Every returned id is guaranteed to exist
    /// in the collection (a deleted id is removed from the index by
    /// [`VectorCollection::delete`] before this is ever called again).
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        validate_vector(query, self.dim)?;
        let hits = self.index.lock().unwrap().search(query, k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::tempdir;

    fn test_engine(dir: &std::path::Path) -> Arc<LsmEngine> {
        let config = EngineConfig::builder().data_dir(dir).build().unwrap();
        Arc::new(LsmEngine::open(config).unwrap())
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_of_identical_unit_vectors_is_one() {
        let sim = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn insert_and_search_axis_aligned_vectors() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let vectors = VectorCollection::open("embeddings", engine, 4).unwrap();

        vectors.insert(Value::object(), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        vectors.insert(Value::object(), vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        vectors.insert(Value::object(), vec![0.0, 0.0, 1.0, 0.0]).unwrap();

        let results = vectors.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
        assert!(results[0].1 >= results[1].1);
    }

    #[test]
    fn dimension_mismatch_is_bad_vector() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let vectors = VectorCollection::open("embeddings", engine, 4).unwrap();
        let result = vectors.insert(Value::object(), vec![1.0, 0.0]);
        assert!(matches!(result, Err(NexaError::BadVector(_))));
    }

    #[test]
    fn dimension_zero_is_rejected_at_open() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let result = VectorCollection::open("embeddings", engine, 0);
        assert!(matches!(result, Err(NexaError::BadVector(_))));
    }

    #[test]
    fn reopening_with_a_different_dimension_fails() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        VectorCollection::open("embeddings", engine.clone(), 4).unwrap();
        let result = VectorCollection::open("embeddings", engine, 8);
        assert!(matches!(result, Err(NexaError::BadVector(_))));
    }

    #[test]
    fn delete_removes_vector_from_future_searches() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let vectors = VectorCollection::open("embeddings", engine, 2).unwrap();
        let doc = vectors.insert(Value::object(), vec![1.0, 0.0]).unwrap();
        let id = doc.get(ID_FIELD).unwrap().as_str().unwrap().to_string();

        assert!(vectors.delete(&id).unwrap());
        let results = vectors.search(&[1.0, 0.0], 5).unwrap();
        assert!(results.is_empty());
    }
}
