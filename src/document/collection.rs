//! Document storage on top of the flat LSM keyspace (§4.5, §3). Each
//! collection is the key prefix `collection:<name>:doc:`; documents are
//! addressed by `collection:<name>:doc:<id>` and stored as
//! MessagePack-encoded [`Value`] objects.

use std::sync::Arc;

use rand::RngCore;

use crate::document::value::Value;
use crate::engine::LsmEngine;
use crate::error::{NexaError, Result};

pub const ID_FIELD: &str = "_id";
pub const CREATED_AT_FIELD: &str = "_created_at";
pub const UPDATED_AT_FIELD: &str = "_updated_at";

pub struct Collection {
    name: String,
    engine: Arc<LsmEngine>,
}

impl Collection {
    pub fn new(name: impl Into<String>, engine: Arc<LsmEngine>) -> Self {
        Self { name: name.into(), engine }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts `doc`, generating an `_id` if one wasn't supplied and
    /// stamping `_created_at`/`_updated_at`. If the caller supplied an
    /// explicit `_id`, existence is checked before the write — a benign
    /// race against a concurrent insert of the same id is possible and
    /// accepted (the later write wins rather than erroring).
    pub fn insert(&self, mut doc: Value) -> Result<Value> {
        if !matches!(doc, Value::Object(_)) {
            return Err(NexaError::BadPayload("document must be an object".into()));
        }

        let id = match doc.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) => {
                let id = id.to_string();
                if self.get(&id)?.is_some() {
                    return Err(NexaError::Duplicate(id));
                }
                id
            }
            None => generate_id(),
        };

        let now = now_ms();
        doc.set(ID_FIELD, Value::String(id.clone()));
        doc.set(CREATED_AT_FIELD, Value::Int(now));
        doc.set(UPDATED_AT_FIELD, Value::Int(now));

        self.put_doc(&id, &doc)?;
        Ok(doc)
    }

    /// Inserts each document independently, collecting one `Result` per
    /// input rather than failing the whole batch on the first error — a
    /// duplicate `_id` in one document doesn't prevent the rest from
    /// landing.
    pub fn insert_many(&self, docs: Vec<Value>) -> Vec<Result<Value>> {
        docs.into_iter().map(|d| self.insert(d)).collect()
    }

    pub fn get(&self, id: &str) -> Result<Option<Value>> {
        match self.engine.get(&doc_key(&self.name, id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Shallow-merges `patch`'s top-level fields into the existing
    /// document, overwriting matching fields and leaving the rest intact.
    /// `_id`/`_created_at` are never touched by a patch; `_updated_at` is
    /// refreshed.
    pub fn update(&self, id: &str, patch: Value) -> Result<Value> {
        let Some(mut existing) = self.get(id)? else {
            return Err(NexaError::NotFound);
        };
        let Value::Object(fields) = &patch else {
            return Err(NexaError::BadPayload("patch must be an object".into()));
        };
        for (field, value) in fields {
            if field == ID_FIELD || field == CREATED_AT_FIELD {
                continue;
            }
            existing.set(field, value.clone());
        }
        existing.set(UPDATED_AT_FIELD, Value::Int(now_ms()));
        self.put_doc(id, &existing)?;
        Ok(existing)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        if self.get(id)?.is_none() {
            return Ok(false);
        }
        self.engine.delete(doc_key(&self.name, id))?;
        Ok(true)
    }

    /// Every live document in the collection, in key (i.e. `_id`) order.
    pub fn scan_all(&self) -> Result<Vec<Value>> {
        let prefix = collection_prefix(&self.name);
        let upper = prefix_upper_bound(&prefix);
        let entries = self
            .engine
            .range_scan(Some(prefix.as_slice()), upper.as_deref())?;
        entries.into_iter().map(|(_, bytes)| decode(&bytes)).collect()
    }

    fn put_doc(&self, id: &str, doc: &Value) -> Result<()> {
        let bytes = encode(doc)?;
        self.engine.put(doc_key(&self.name, id), bytes)
    }
}

fn encode(doc: &Value) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(doc)?)
}

fn decode(bytes: &[u8]) -> Result<Value> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn doc_key(collection: &str, id: &str) -> Vec<u8> {
    format!("collection:{collection}:doc:{id}").into_bytes()
}

fn collection_prefix(collection: &str) -> Vec<u8> {
    format!("collection:{collection}:doc:").into_bytes()
}

/// Smallest key that sorts after every key with the given prefix, or `None`
/// if the prefix is all `0xFF` bytes (scan should then run to the end of
/// the keyspace).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    for i in (0..upper.len()).rev() {
        if upper[i] < 0xFF {
            upper[i] += 1;
            upper.truncate(i + 1);
            return Some(upper);
        }
    }
    None
}

fn generate_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::tempdir;

    fn test_collection(dir: &std::path::Path) -> Collection {
        let config = EngineConfig::builder().data_dir(dir).build().unwrap();
        let engine = Arc::new(LsmEngine::open(config).unwrap());
        Collection::new("widgets", engine)
    }

    #[test]
    fn insert_generates_id_and_timestamps() {
        let dir = tempdir().unwrap();
        let col = test_collection(dir.path());
        let inserted = col.insert(Value::Object(vec![("name".into(), Value::String("a".into()))])).unwrap();

        let id = inserted.get(ID_FIELD).unwrap().as_str().unwrap().to_string();
        assert_eq!(id.len(), 16);
        assert!(inserted.get(CREATED_AT_FIELD).is_some());

        let fetched = col.get(&id).unwrap().unwrap();
        assert_eq!(fetched, inserted);
    }

    #[test]
    fn explicit_duplicate_id_is_rejected() {
        let dir = tempdir().unwrap();
        let col = test_collection(dir.path());
        let doc = Value::Object(vec![(ID_FIELD.to_string(), Value::String("fixed".into()))]);
        col.insert(doc.clone()).unwrap();
        let result = col.insert(doc);
        assert!(matches!(result, Err(NexaError::Duplicate(_))));
    }

    #[test]
    fn update_shallow_merges_and_preserves_created_at() {
        let dir = tempdir().unwrap();
        let col = test_collection(dir.path());
        let inserted = col
            .insert(Value::Object(vec![
                ("name".into(), Value::String("a".into())),
                ("count".into(), Value::Int(1)),
            ]))
            .unwrap();
        let id = inserted.get(ID_FIELD).unwrap().as_str().unwrap().to_string();
        let created_at = inserted.get(CREATED_AT_FIELD).cloned();

        let updated = col
            .update(&id, Value::Object(vec![("count".into(), Value::Int(2))]))
            .unwrap();

        assert_eq!(updated.get("count"), Some(&Value::Int(2)));
        assert_eq!(updated.get("name"), Some(&Value::String("a".into())));
        assert_eq!(updated.get(CREATED_AT_FIELD).cloned(), created_at);
    }

    #[test]
    fn delete_removes_document() {
        let dir = tempdir().unwrap();
        let col = test_collection(dir.path());
        let inserted = col.insert(Value::object()).unwrap();
        let id = inserted.get(ID_FIELD).unwrap().as_str().unwrap().to_string();

        assert!(col.delete(&id).unwrap());
        assert_eq!(col.get(&id).unwrap(), None);
        assert!(!col.delete(&id).unwrap());
    }

    #[test]
    fn insert_many_reports_per_document_outcomes() {
        let dir = tempdir().unwrap();
        let col = test_collection(dir.path());
        let fixed_id = Value::Object(vec![(ID_FIELD.to_string(), Value::String("dup".into()))]);
        col.insert(fixed_id.clone()).unwrap();

        let results = col.insert_many(vec![Value::object(), fixed_id, Value::object()]);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(NexaError::Duplicate(_))));
        assert!(results[2].is_ok());
    }

    #[test]
    fn scan_all_only_sees_this_collections_documents() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::builder().data_dir(dir.path()).build().unwrap();
        let engine = Arc::new(LsmEngine::open(config).unwrap());
        let widgets = Collection::new("widgets", engine.clone());
        let gadgets = Collection::new("gadgets", engine);

        widgets.insert(Value::object()).unwrap();
        widgets.insert(Value::object()).unwrap();
        gadgets.insert(Value::object()).unwrap();

        assert_eq!(widgets.scan_all().unwrap().len(), 2);
        assert_eq!(gadgets.scan_all().unwrap().len(), 1);
    }
}
