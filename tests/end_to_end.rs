use std::sync::Arc;

use nexadb::document::{Collection, Value, ID_FIELD};
use nexadb::query;
use nexadb::vector::VectorCollection;
use nexadb::{EngineConfig, LsmEngine};
use tempfile::tempdir;

fn open_engine(dir: &std::path::Path) -> Arc<LsmEngine> {
    let config = EngineConfig::builder().data_dir(dir).build().unwrap();
    Arc::new(LsmEngine::open(config).unwrap())
}

fn obj(fields: Vec<(&str, Value)>) -> Value {
    Value::Object(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

#[test]
fn s1_create_then_read_round_trips_with_a_16_hex_id() {
    let dir = tempdir().unwrap();
    let col = Collection::new("users", open_engine(dir.path()));

    let inserted = col
        .insert(obj(vec![("name", Value::String("Alice".into())), ("age", Value::Int(28))]))
        .unwrap();
    let id = inserted.get(ID_FIELD).unwrap().as_str().unwrap().to_string();
    assert_eq!(id.len(), 16);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

    let fetched = col.get(&id).unwrap().unwrap();
    assert_eq!(fetched.get("name"), Some(&Value::String("Alice".into())));
    assert_eq!(fetched.get("age"), Some(&Value::Int(28)));
}

#[test]
fn s2_delete_then_read_is_not_found() {
    let dir = tempdir().unwrap();
    let col = Collection::new("users", open_engine(dir.path()));

    let inserted = col.insert(Value::object()).unwrap();
    let id = inserted.get(ID_FIELD).unwrap().as_str().unwrap().to_string();

    assert!(col.delete(&id).unwrap());
    assert_eq!(col.get(&id).unwrap(), None);
}

#[test]
fn s3_query_with_gte_filters_by_age() {
    let dir = tempdir().unwrap();
    let col = Collection::new("users", open_engine(dir.path()));

    for age in [20, 30, 40] {
        col.insert(obj(vec![("age", Value::Int(age))])).unwrap();
    }

    let filter = obj(vec![("age", obj(vec![("$gte", Value::Int(30))]))]);
    let matched: Vec<Value> = col
        .scan_all()
        .unwrap()
        .into_iter()
        .filter(|doc| query::matches(doc, &filter).unwrap())
        .collect();

    assert_eq!(matched.len(), 2);
    let mut ages: Vec<i64> = matched.iter().map(|d| d.get("age").unwrap().as_i64().unwrap()).collect();
    ages.sort();
    assert_eq!(ages, vec![30, 40]);
}

#[test]
fn s4_recovers_only_durably_written_docs_after_an_unclean_restart() {
    let dir = tempdir().unwrap();
    {
        let engine = open_engine(dir.path());
        let col = Collection::new("events", engine);
        for i in 0..500 {
            col.insert(obj(vec![("seq", Value::Int(i))])).unwrap();
        }
        // Process "dies" here without a graceful shutdown; every insert up
        // to this point already went through the WAL's fsync'd batches.
    }

    let engine = open_engine(dir.path());
    let col = Collection::new("events", engine);
    assert_eq!(col.scan_all().unwrap().len(), 500);
}

#[test]
fn s5_vector_search_ranks_the_axis_aligned_match_first() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    let vectors = VectorCollection::open("embeddings", engine, 4).unwrap();

    vectors.insert(obj(vec![("axis", Value::String("x".into()))]), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
    vectors.insert(obj(vec![("axis", Value::String("y".into()))]), vec![0.0, 1.0, 0.0, 0.0]).unwrap();
    vectors.insert(obj(vec![("axis", Value::String("z".into()))]), vec![0.0, 0.0, 1.0, 0.0]).unwrap();
    vectors.insert(obj(vec![("axis", Value::String("w".into()))]), vec![0.0, 0.0, 0.0, 1.0]).unwrap();

    let results = vectors.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
    assert_eq!(results.len(), 2);
    let first_doc = vectors.get(&results[0].0).unwrap().unwrap();
    assert_eq!(first_doc.get("axis"), Some(&Value::String("x".into())));
    assert!((results[0].1 - 1.0).abs() < 1e-6);
    assert!((results[1].1 - 0.0).abs() < 1e-6);
}

#[test]
fn s6_aggregation_groups_sales_by_region_sorted_descending() {
    let dir = tempdir().unwrap();
    let col = Collection::new("sales", open_engine(dir.path()));

    let seed = [
        ("east", 100), ("east", 150), ("west", 80), ("west", 20),
        ("north", 300), ("south", 10), ("south", 15), ("south", 5),
    ];
    for (region, amount) in seed {
        col.insert(obj(vec![("region", Value::String(region.into())), ("amount", Value::Int(amount))]))
            .unwrap();
    }

    let stages = vec![
        obj(vec![(
            "$group",
            obj(vec![
                ("_id", Value::String("$region".into())),
                ("total", obj(vec![("$sum", Value::String("$amount".into()))])),
            ]),
        )]),
        obj(vec![("$sort", obj(vec![("total", Value::Int(-1))]))]),
        obj(vec![("$limit", Value::Int(2))]),
    ];

    let result = query::run_pipeline(col.scan_all().unwrap(), &stages).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result[0].get("_id"), Some(&Value::String("north".into())));
    assert_eq!(result[0].get("total"), Some(&Value::Float(300.0)));
    assert_eq!(result[1].get("_id"), Some(&Value::String("east".into())));
    assert_eq!(result[1].get("total"), Some(&Value::Float(250.0)));
}

#[test]
fn empty_collection_query_and_vector_search_both_return_nothing() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());

    let col = Collection::new("empty", Arc::clone(&engine));
    assert_eq!(col.scan_all().unwrap(), Vec::new());

    let vectors = VectorCollection::open("empty_vectors", engine, 3).unwrap();
    assert_eq!(vectors.search(&[1.0, 0.0, 0.0], 5).unwrap(), Vec::new());
}

#[test]
fn dimension_zero_vectors_are_rejected() {
    let dir = tempdir().unwrap();
    let engine = open_engine(dir.path());
    let result = VectorCollection::open("bad", engine, 0);
    assert!(matches!(result, Err(nexadb::NexaError::BadVector(_))));
}
