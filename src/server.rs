//! The binary protocol server (§4.6, §4.7): a single-threaded accept loop,
//! a bounded worker pool, and one strictly-sequential session per
//! connection.
//!
//! Built on a `tokio` multi-thread runtime for the network edge; the
//! engine's own background work (WAL flusher, MemTable flush, compaction)
//! stays on plain OS threads, so blocking file I/O never sits on the async
//! executor (§4.7, §9).
//!
//! Backpressure is enforced per frame rather than per byte-stream: since a
//! session never reads the next request until it has written the previous
//! response, at most one request's payload is ever in flight on a
//! connection, capped at `ServerConfig::max_in_flight_bytes`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::document::{Collection, Value};
use crate::engine::LsmEngine;
use crate::error::{NexaError, Result};
use crate::protocol::{self, Frame};
use crate::query;
use crate::vector::VectorCollection;

/// After this many consecutive `BAD_PAYLOAD` responses on one session, the
/// connection is terminated rather than left open indefinitely (§7).
const MAX_CONSECUTIVE_BAD_PAYLOADS: u32 = 3;

/// Runs the accept loop until the listener is closed or the process is
/// signaled to stop. Each accepted connection is dispatched to the bounded
/// worker pool (a `Semaphore` permit held for the lifetime of the
/// connection task).
pub async fn serve(engine: Arc<LsmEngine>, config: ServerConfig) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("nexadb binary protocol server listening on {addr}");

    let config = Arc::new(config);
    let permits = Arc::new(Semaphore::new(config.worker_pool_size));

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let permit = Arc::clone(&permits).acquire_owned().await.map_err(|_| {
            NexaError::Internal("worker pool semaphore closed".into())
        })?;

        let engine = Arc::clone(&engine);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_connection(stream, peer_addr, engine, config).await {
                warn!("connection {peer_addr} ended with an error: {e}");
            }
        });
    }
}

struct Session {
    authorized: bool,
    consecutive_bad_payloads: u32,
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    engine: Arc<LsmEngine>,
    config: Arc<ServerConfig>,
) -> Result<()> {
    let mut session = Session {
        authorized: peer_addr.ip().is_loopback(),
        consecutive_bad_payloads: 0,
    };

    loop {
        let frame = match protocol::read_frame_with_limit(&mut stream, config.max_in_flight_bytes as u32).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()), // peer disconnected cleanly
            Err(e @ NexaError::BadFrame(_)) => {
                let (msg_type, payload) = protocol::error_response(&e);
                let _ = protocol::write_frame(&mut stream, msg_type, &payload).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if frame.msg_type == protocol::MSG_DISCONNECT {
            let _ = protocol::write_frame(&mut stream, protocol::MSG_SUCCESS, &Value::object()).await;
            return Ok(());
        }

        let result = dispatch(&frame, &mut session, &engine, &config).await;

        match result {
            Ok((msg_type, payload)) => {
                session.consecutive_bad_payloads = 0;
                protocol::write_frame(&mut stream, msg_type, &payload).await?;
            }
            Err(e) => {
                let terminal = matches!(e, NexaError::BadFrame(_) | NexaError::Unauthorized);
                if matches!(e, NexaError::BadPayload(_)) {
                    session.consecutive_bad_payloads += 1;
                } else {
                    session.consecutive_bad_payloads = 0;
                }
                let (msg_type, payload) = protocol::error_response(&e);
                protocol::write_frame(&mut stream, msg_type, &payload).await?;
                if terminal || session.consecutive_bad_payloads >= MAX_CONSECUTIVE_BAD_PAYLOADS {
                    return Ok(());
                }
            }
        }
    }
}

async fn dispatch(
    frame: &Frame,
    session: &mut Session,
    engine: &Arc<LsmEngine>,
    config: &Arc<ServerConfig>,
) -> Result<(u8, Value)> {
    check_auth(session, &frame.payload, config)?;

    match frame.msg_type {
        protocol::MSG_CONNECT => {
            session.authorized = true;
            Ok((protocol::MSG_SUCCESS, Value::object()))
        }
        protocol::MSG_PING => Ok((
            protocol::MSG_PONG,
            Value::Object(vec![("status".to_string(), Value::String("ok".into()))]),
        )),
        protocol::MSG_CREATE => handle_create(&frame.payload, engine).await,
        protocol::MSG_READ => handle_read(&frame.payload, engine).await,
        protocol::MSG_UPDATE => handle_update(&frame.payload, engine).await,
        protocol::MSG_DELETE => handle_delete(&frame.payload, engine).await,
        protocol::MSG_QUERY => handle_query(&frame.payload, engine).await,
        protocol::MSG_VECTOR_SEARCH => handle_vector_search(&frame.payload, engine).await,
        protocol::MSG_BATCH_WRITE => handle_batch_write(&frame.payload, engine).await,
        other => Err(NexaError::BadPayload(format!("unknown message type 0x{other:02X}"))),
    }
}

/// Loopback peers are always authorized. Everyone else needs a matching
/// `auth` token on `CONNECT` and on every subsequent request, once a
/// server-side token is configured; without one configured, only loopback
/// peers are ever accepted (§6).
fn check_auth(session: &mut Session, payload: &Value, config: &ServerConfig) -> Result<()> {
    if session.authorized {
        return Ok(());
    }
    let Some(expected) = &config.auth_token else {
        return Err(NexaError::Unauthorized);
    };
    let supplied = payload.get("auth").and_then(Value::as_str);
    match supplied {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            session.authorized = true;
            Ok(())
        }
        _ => Err(NexaError::Unauthorized),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn required_str(payload: &Value, field: &str) -> Result<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| NexaError::BadPayload(format!("missing or non-string field '{field}'")))
}

fn required_object(payload: &Value, field: &str) -> Result<Value> {
    payload
        .get(field)
        .filter(|v| v.as_object().is_some())
        .cloned()
        .ok_or_else(|| NexaError::BadPayload(format!("missing or non-object field '{field}'")))
}

fn parse_vector(value: &Value, field: &str) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| NexaError::BadPayload(format!("field '{field}' must be an array")))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| NexaError::BadPayload(format!("field '{field}' must contain only numbers")))
        })
        .collect()
}

fn required_vector(payload: &Value, field: &str) -> Result<Vec<f32>> {
    let value = payload
        .get(field)
        .ok_or_else(|| NexaError::BadPayload(format!("missing field '{field}'")))?;
    parse_vector(value, field)
}

fn doc_success(doc: Value) -> (u8, Value) {
    (protocol::MSG_SUCCESS, Value::Object(vec![("document".to_string(), doc)]))
}

/// `CREATE`'s required keys are `collection`/`data` (§6); an optional
/// `vector` array routes the write through [`VectorCollection::insert`]
/// instead of a plain [`Collection::insert`] — the wire table has no
/// separate vector-insert message, so this is the natural place for it.
async fn handle_create(payload: &Value, engine: &Arc<LsmEngine>) -> Result<(u8, Value)> {
    let collection = required_str(payload, "collection")?;
    let data = required_object(payload, "data")?;
    let vector_field = payload.get("vector").cloned();
    let engine = Arc::clone(engine);

    tokio::task::spawn_blocking(move || -> Result<(u8, Value)> {
        if let Some(vector_value) = vector_field {
            let vector = vector_value
                .as_array()
                .ok_or_else(|| NexaError::BadPayload("'vector' must be an array".into()))?
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32).ok_or_else(|| {
                    NexaError::BadPayload("'vector' must contain only numbers".into())
                }))
                .collect::<Result<Vec<f32>>>()?;
            let dim = vector.len();
            let vc = VectorCollection::open(&collection, engine, dim)?;
            let inserted = vc.insert(data, vector)?;
            Ok(doc_success(inserted))
        } else {
            let col = Collection::new(collection.as_str(), engine);
            let inserted = col.insert(data)?;
            Ok(doc_success(inserted))
        }
    })
    .await
    .map_err(|e| NexaError::Internal(format!("worker task panicked: {e}")))?
}

async fn handle_read(payload: &Value, engine: &Arc<LsmEngine>) -> Result<(u8, Value)> {
    let collection = required_str(payload, "collection")?;
    let key = required_str(payload, "key")?;
    let engine = Arc::clone(engine);

    tokio::task::spawn_blocking(move || -> Result<(u8, Value)> {
        let col = Collection::new(collection.as_str(), engine);
        match col.get(&key)? {
            Some(doc) => Ok(doc_success(doc)),
            None => Err(NexaError::NotFound),
        }
    })
    .await
    .map_err(|e| NexaError::Internal(format!("worker task panicked: {e}")))?
}

async fn handle_update(payload: &Value, engine: &Arc<LsmEngine>) -> Result<(u8, Value)> {
    let collection = required_str(payload, "collection")?;
    let key = required_str(payload, "key")?;
    let updates = required_object(payload, "updates")?;
    let engine = Arc::clone(engine);

    tokio::task::spawn_blocking(move || -> Result<(u8, Value)> {
        let col = Collection::new(collection.as_str(), engine);
        let updated = col.update(&key, updates)?;
        Ok(doc_success(updated))
    })
    .await
    .map_err(|e| NexaError::Internal(format!("worker task panicked: {e}")))?
}

async fn handle_delete(payload: &Value, engine: &Arc<LsmEngine>) -> Result<(u8, Value)> {
    let collection = required_str(payload, "collection")?;
    let key = required_str(payload, "key")?;
    let engine = Arc::clone(engine);

    tokio::task::spawn_blocking(move || -> Result<(u8, Value)> {
        let col = Collection::new(collection.as_str(), engine);
        if col.delete(&key)? {
            Ok((protocol::MSG_SUCCESS, Value::object()))
        } else {
            Err(NexaError::NotFound)
        }
    })
    .await
    .map_err(|e| NexaError::Internal(format!("worker task panicked: {e}")))?
}

/// `QUERY` doubles as the aggregation entry point: a request carrying a
/// `pipeline` array runs it via [`query::run_pipeline`] over the whole
/// collection instead of applying `filters`/`limit` (§4.5's request table
/// only lists `filters`/`limit`, but the aggregation pipeline needs a way
/// onto the wire and `QUERY` is the natural home for it).
async fn handle_query(payload: &Value, engine: &Arc<LsmEngine>) -> Result<(u8, Value)> {
    let collection = required_str(payload, "collection")?;
    let pipeline = payload.get("pipeline").and_then(Value::as_array).map(<[Value]>::to_vec);
    let filters = payload.get("filters").cloned();
    let limit = payload.get("limit").and_then(Value::as_i64);
    let engine = Arc::clone(engine);

    tokio::task::spawn_blocking(move || -> Result<(u8, Value)> {
        let col = Collection::new(collection.as_str(), engine);

        let matched = if let Some(stages) = pipeline {
            query::run_pipeline(col.scan_all()?, &stages)?
        } else {
            let filters = filters
                .ok_or_else(|| NexaError::BadPayload("missing field 'filters'".into()))?;
            let mut matched = Vec::new();
            for doc in col.scan_all()? {
                if query::matches(&doc, &filters)? {
                    matched.push(doc);
                    if let Some(limit) = limit {
                        if matched.len() as i64 >= limit {
                            break;
                        }
                    }
                }
            }
            matched
        };

        let count = matched.len() as i64;
        Ok((
            protocol::MSG_SUCCESS,
            Value::Object(vec![
                ("documents".to_string(), Value::Array(matched)),
                ("count".to_string(), Value::Int(count)),
            ]),
        ))
    })
    .await
    .map_err(|e| NexaError::Internal(format!("worker task panicked: {e}")))?
}

async fn handle_vector_search(payload: &Value, engine: &Arc<LsmEngine>) -> Result<(u8, Value)> {
    let collection = required_str(payload, "collection")?;
    let vector = required_vector(payload, "vector")?;
    let k = payload
        .get("k")
        .and_then(Value::as_i64)
        .ok_or_else(|| NexaError::BadPayload("missing or non-integer field 'k'".into()))?
        .max(0) as usize;
    let engine = Arc::clone(engine);

    tokio::task::spawn_blocking(move || -> Result<(u8, Value)> {
        let dim = vector.len();
        let vc = VectorCollection::open(&collection, engine, dim)?;
        let hits = vc.search(&vector, k)?;

        let mut results = Vec::with_capacity(hits.len());
        for (id, similarity) in hits {
            if let Some(doc) = vc.get(&id)? {
                results.push(Value::Object(vec![
                    ("document".to_string(), doc),
                    ("similarity".to_string(), Value::Float(similarity as f64)),
                ]));
            }
        }
        Ok((
            protocol::MSG_SUCCESS,
            Value::Object(vec![("results".to_string(), Value::Array(results))]),
        ))
    })
    .await
    .map_err(|e| NexaError::Internal(format!("worker task panicked: {e}")))?
}

async fn handle_batch_write(payload: &Value, engine: &Arc<LsmEngine>) -> Result<(u8, Value)> {
    let collection = required_str(payload, "collection")?;
    let documents = payload
        .get("documents")
        .and_then(Value::as_array)
        .ok_or_else(|| NexaError::BadPayload("missing or non-array field 'documents'".into()))?
        .to_vec();
    let engine = Arc::clone(engine);

    tokio::task::spawn_blocking(move || -> Result<(u8, Value)> {
        let col = Collection::new(collection.as_str(), engine);
        let outcomes = col.insert_many(documents);
        let results: Vec<Value> = outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Ok(doc) => Value::Object(vec![("ok".to_string(), Value::Bool(true)), ("document".to_string(), doc)]),
                Err(e) => Value::Object(vec![
                    ("ok".to_string(), Value::Bool(false)),
                    ("error".to_string(), Value::String(e.to_string())),
                ]),
            })
            .collect();
        Ok((
            protocol::MSG_SUCCESS,
            Value::Object(vec![("results".to_string(), Value::Array(results))]),
        ))
    })
    .await
    .map_err(|e| NexaError::Internal(format!("worker task panicked: {e}")))?
}
