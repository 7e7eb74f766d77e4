//! Request handlers for the peer and client routes.

use std::io::Write;
use std::str::FromStr;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_LENGTH as CONTENT_LENGTH_HEADER, CONTENT_RANGE, RANGE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use md5::{Digest, Md5};
use strata_engine::{
    DELETION_HEADER, EngineError, NurseryNotice, ObjectVars, SHARD_TIMESTAMP_HEADER, ShardFile,
    meta_headers, metadata_from_headers,
};
use strata_types::{
    CONTENT_LENGTH, ETAG, Metadata, NAME, ObjectHash, PriorityRepJob, X_TIMESTAMP,
    canonical_header_key, format_timestamp, parse_timestamp,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::error::ApiError;

const CONTENT_TYPE: &str = "Content-Type";
const USER_META_PREFIX: &str = "X-Object-Meta-";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Buffer between an object reader task and its response body.
const STREAM_BUFFER: usize = 64 * 1024;

// -----------------------------------------------------------------------
// Request parsing
// -----------------------------------------------------------------------

fn parse_hash(raw: &str) -> Result<ObjectHash, ApiError> {
    ObjectHash::from_hex(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn parse_number<T: FromStr>(what: &str, raw: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {what}: {raw:?}")))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The declared `Content-Length`, refused up front when over `limit`.
fn declared_length(headers: &HeaderMap, limit: u64) -> Result<Option<u64>, ApiError> {
    let Some(raw) = header_str(headers, CONTENT_LENGTH_HEADER.as_str()) else {
        return Ok(None);
    };
    let length: u64 = parse_number("Content-Length", raw)?;
    if length > limit {
        return Err(ApiError::PayloadTooLarge { limit });
    }
    Ok(Some(length))
}

/// Feed a request body to `sink` chunk by chunk. Returns the byte count.
async fn drain_body(
    mut body: Body,
    declared: Option<u64>,
    limit: u64,
    mut sink: impl FnMut(&[u8]) -> std::io::Result<()>,
) -> Result<u64, ApiError> {
    let mut received = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ApiError::BadRequest(format!("request body: {e}")))?;
        let Ok(chunk) = frame.into_data() else {
            continue;
        };
        received += chunk.len() as u64;
        if received > limit {
            return Err(ApiError::PayloadTooLarge { limit });
        }
        sink(&chunk).map_err(EngineError::from)?;
    }
    if let Some(declared) = declared
        && declared != received
    {
        return Err(ApiError::BadRequest(format!(
            "body has {received} bytes, Content-Length says {declared}"
        )));
    }
    Ok(received)
}

/// A response body streamed from a file.
async fn file_body(path: &std::path::Path) -> Result<Body, ApiError> {
    match tokio::fs::File::open(path).await {
        Ok(file) => Ok(Body::from_stream(ReaderStream::new(file))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ApiError::NotFound),
        Err(e) => Err(EngineError::from(e).into()),
    }
}

/// The mandatory `X-Timestamp` of a client mutation, normalized.
fn required_timestamp(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = header_str(headers, X_TIMESTAMP)
        .ok_or_else(|| ApiError::BadRequest("missing X-Timestamp".into()))?;
    let nanos = parse_timestamp(raw).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(format_timestamp(nanos))
}

/// `Meta-*` headers of a peer request. A bare `X-Timestamp` fills in when
/// no `Meta-X-Timestamp` was sent.
fn peer_metadata(headers: &HeaderMap) -> Metadata {
    let mut metadata = metadata_from_headers(
        headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v))),
    );
    if !metadata.contains_key(X_TIMESTAMP)
        && let Some(ts) = header_str(headers, X_TIMESTAMP)
    {
        metadata.insert(X_TIMESTAMP.to_string(), ts.to_string());
    }
    metadata
}

/// `Content-Type` and `X-Object-Meta-*` headers of a client request.
fn user_metadata(headers: &HeaderMap) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let key = canonical_header_key(name.as_str());
        if key == CONTENT_TYPE || key.starts_with(USER_META_PREFIX) {
            metadata.insert(key, value.to_string());
        }
    }
    metadata
}

/// Build a header map, dropping pairs that are not valid HTTP.
fn header_map(pairs: impl IntoIterator<Item = (String, String)>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => debug!(%name, "skipping header that is not valid HTTP"),
        }
    }
    map
}

/// Client-visible headers of a stored object.
fn object_headers(metadata: &Metadata, content_length: u64) -> HeaderMap {
    let mut pairs: Vec<(String, String)> = metadata
        .iter()
        .filter(|(k, _)| {
            k.as_str() == X_TIMESTAMP
                || k.as_str() == ETAG
                || k.as_str() == CONTENT_TYPE
                || k.starts_with(USER_META_PREFIX)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.push((CONTENT_LENGTH.to_string(), content_length.to_string()));
    header_map(pairs)
}

/// A single byte range `start..end` from a `Range` header.
///
/// Returns `Ok(None)` when the header should be ignored: it is malformed or
/// asks for several ranges.
pub(crate) fn parse_range(header: &str, length: u64) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((first, last)) = spec.split_once('-') else {
        return Ok(None);
    };
    let (first, last) = (first.trim(), last.trim());
    let unsatisfiable = ApiError::RangeNotSatisfiable { length };

    if first.is_empty() {
        let Ok(suffix) = last.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || length == 0 {
            return Err(unsatisfiable);
        }
        return Ok(Some((length.saturating_sub(suffix), length)));
    }

    let Ok(start) = first.parse::<u64>() else {
        return Ok(None);
    };
    let end = if last.is_empty() {
        length
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => end.saturating_add(1).min(length),
            _ => return Ok(None),
        }
    };
    if start >= length {
        return Err(unsatisfiable);
    }
    Ok(Some((start, end)))
}

// -----------------------------------------------------------------------
// Peer routes
// -----------------------------------------------------------------------

pub(crate) async fn healthcheck() -> &'static str {
    "OK"
}

#[tracing::instrument(skip(state, headers, body))]
pub(crate) async fn put_shard(
    State(state): State<AppState>,
    Path((device, hash, index)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let hash = parse_hash(&hash)?;
    let index: u16 = parse_number("shard index", &index)?;
    let declared = declared_length(&headers, state.max_body_bytes)?;
    let mut write = state
        .engine
        .stable_writer(&device, hash, index, declared.unwrap_or(0))
        .await?;
    let temp = write.data()?;
    let len = drain_body(body, declared, state.max_body_bytes, |chunk| {
        temp.write_all(chunk)
    })
    .await?;
    write.commit(peer_metadata(&headers))?;
    debug!(device = %device, %hash, index, len, "stable shard stored");
    Ok(StatusCode::CREATED)
}

async fn locate_shard(
    state: &AppState,
    device: &str,
    hash: &str,
    index: &str,
    headers: &HeaderMap,
) -> Result<ShardFile, ApiError> {
    let hash = parse_hash(hash)?;
    let index: u16 = parse_number("shard index", index)?;
    let timestamp = header_str(headers, SHARD_TIMESTAMP_HEADER)
        .map(|raw| parse_number::<i64>("shard timestamp", raw))
        .transpose()?;
    Ok(state
        .engine
        .shard_file(device, hash, index, timestamp)
        .await?)
}

fn shard_headers(file: &ShardFile) -> HeaderMap {
    let mut headers = header_map(meta_headers(&file.metadata));
    headers.insert(CONTENT_LENGTH_HEADER, HeaderValue::from(file.length));
    headers
}

pub(crate) async fn get_shard(
    State(state): State<AppState>,
    Path((device, hash, index)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let file = locate_shard(&state, &device, &hash, &index, &headers).await?;
    let body = file_body(&file.path).await?;
    Ok((StatusCode::OK, shard_headers(&file), body).into_response())
}

pub(crate) async fn head_shard(
    State(state): State<AppState>,
    Path((device, hash, index)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let file = locate_shard(&state, &device, &hash, &index, &headers).await?;
    Ok((StatusCode::OK, shard_headers(&file), Body::empty()).into_response())
}

pub(crate) async fn post_shard(
    State(state): State<AppState>,
    Path((device, hash, index)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let hash = parse_hash(&hash)?;
    let index: u16 = parse_number("shard index", &index)?;
    state
        .engine
        .stable_post(&device, hash, index, peer_metadata(&headers))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn delete_shard(
    State(state): State<AppState>,
    Path((device, hash, index)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let hash = parse_hash(&hash)?;
    let index: u16 = parse_number("shard index", &index)?;
    let raw = header_str(&headers, X_TIMESTAMP)
        .ok_or_else(|| ApiError::BadRequest("missing X-Timestamp".into()))?;
    let timestamp = parse_timestamp(raw).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state
        .engine
        .stable_delete(&device, hash, index, timestamp)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn list_partition(
    State(state): State<AppState>,
    Path((device, partition)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let partition: u64 = parse_number("partition", &partition)?;
    let items = state.engine.list_partition(&device, partition).await?;
    debug!(device = %device, partition, rows = items.len(), "partition listed");
    Ok(Json(items).into_response())
}

#[tracing::instrument(skip(state, headers, body))]
pub(crate) async fn put_nursery(
    State(state): State<AppState>,
    Path((device, hash)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let hash = parse_hash(&hash)?;
    let deletion: bool = header_str(&headers, DELETION_HEADER)
        .ok_or_else(|| ApiError::BadRequest("missing Deletion header".into()))
        .and_then(|raw| parse_number("Deletion header", &raw.to_ascii_lowercase()))?;
    let metadata = metadata_from_headers(
        headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v))),
    );
    if deletion {
        state
            .engine
            .nursery_put(&device, hash, true, metadata, bytes::Bytes::new())
            .await?;
        return Ok(StatusCode::CREATED);
    }
    let declared = declared_length(&headers, state.max_body_bytes)?;
    let mut write = state
        .engine
        .nursery_writer(&device, hash, declared.unwrap_or(0))
        .await?;
    let temp = write.data()?;
    drain_body(body, declared, state.max_body_bytes, |chunk| {
        temp.write_all(chunk)
    })
    .await?;
    write.commit(metadata)?;
    Ok(StatusCode::CREATED)
}

pub(crate) async fn post_nursery(
    State(state): State<AppState>,
    Path((device, hash, metahash, timestamp)): Path<(String, String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let hash = parse_hash(&hash)?;
    let timestamp: i64 = parse_number("timestamp", &timestamp)?;
    let notice = state
        .engine
        .nursery_stabilized_elsewhere(&device, hash, &metahash, timestamp)
        .await?;
    debug!(device = %device, %hash, ?notice, "stabilized elsewhere");
    Ok(match notice {
        NurseryNotice::Removed => StatusCode::ACCEPTED,
        NurseryNotice::Skipped => StatusCode::NO_CONTENT,
        NurseryNotice::NotFound => StatusCode::NOT_FOUND,
    })
}

#[tracing::instrument(skip(state))]
pub(crate) async fn reconstruct(
    State(state): State<AppState>,
    Path((device, account, container, obj)): Path<(String, String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let vars = ObjectVars::path(device, account, container, obj);
    state.engine.reconstruct(&vars).await?;
    Ok(StatusCode::OK)
}

/// Run a priority replication job whose source is a local device.
pub(crate) async fn priority_rep(
    State(state): State<AppState>,
    Json(job): Json<PriorityRepJob>,
) -> Result<Response, ApiError> {
    // Fails with 507 when the source device is not ours.
    state.engine.get_db(&job.from_device.device).await?;
    info!(
        partition = job.partition,
        from = %job.from_device.device,
        to = %job.to_device.device,
        "priority replication requested"
    );
    let report = state.engine.replicate_partition(&job).await;
    Ok(Json(serde_json::json!({
        "processed": report.processed,
        "succeeded": report.succeeded,
        "failed": report.failed,
    }))
    .into_response())
}

// -----------------------------------------------------------------------
// Client routes
// -----------------------------------------------------------------------

type ObjectPath = Path<(String, String, String, String, String)>;

/// Device and object of a client path. The partition must be numeric.
fn object_vars(
    (device, partition, account, container, obj): (String, String, String, String, String),
) -> Result<(ObjectVars, String), ApiError> {
    let _: u64 = parse_number("partition", &partition)?;
    let name = format!("/{account}/{container}/{obj}");
    Ok((ObjectVars::path(device, account, container, obj), name))
}

#[tracing::instrument(skip(state, headers, body))]
pub(crate) async fn put_object(
    State(state): State<AppState>,
    Path(path): ObjectPath,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let (vars, name) = object_vars(path)?;
    let timestamp = required_timestamp(&headers)?;
    let declared = declared_length(&headers, state.max_body_bytes)?;

    let mut object = state.engine.new_object(&vars, false).await?;
    let mut hasher = Md5::new();
    let temp = object.set_data(declared.unwrap_or(0))?;
    let len = drain_body(body, declared, state.max_body_bytes, |chunk| {
        hasher.update(chunk);
        temp.write_all(chunk)
    })
    .await?;

    let digest: [u8; 16] = hasher.finalize().into();
    let etag: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    if let Some(expected) = header_str(&headers, ETAG) {
        let expected = expected.trim_matches('"');
        if !expected.eq_ignore_ascii_case(&etag) {
            return Err(ApiError::EtagMismatch {
                expected: expected.to_string(),
                actual: etag,
            });
        }
    }

    let mut metadata = user_metadata(&headers);
    metadata
        .entry(CONTENT_TYPE.to_string())
        .or_insert_with(|| DEFAULT_CONTENT_TYPE.to_string());
    metadata.insert(X_TIMESTAMP.to_string(), timestamp);
    metadata.insert(CONTENT_LENGTH.to_string(), len.to_string());
    metadata.insert(ETAG.to_string(), etag.clone());
    metadata.insert(NAME.to_string(), name);

    object.commit(metadata).await?;
    info!(object = %object.repr(), len, "object written to nursery");
    object.close();

    Ok((StatusCode::CREATED, header_map([(ETAG.to_string(), etag)])).into_response())
}

#[tracing::instrument(skip(state, headers))]
pub(crate) async fn get_object(
    State(state): State<AppState>,
    Path(path): ObjectPath,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (vars, _) = object_vars(path)?;
    let object = state.engine.new_object(&vars, true).await?;
    if !object.exists() {
        return Err(ApiError::NotFound);
    }
    let length = object.content_length();
    let range = match header_str(&headers, RANGE.as_str()) {
        Some(raw) => parse_range(raw, length)?,
        None => None,
    };

    let (status, response_headers) = match range {
        Some((start, end)) => {
            let mut response_headers = object_headers(object.metadata(), end - start);
            if let Ok(value) =
                HeaderValue::from_str(&format!("bytes {start}-{}/{length}", end - 1))
            {
                response_headers.insert(CONTENT_RANGE, value);
            }
            (StatusCode::PARTIAL_CONTENT, response_headers)
        }
        None => (StatusCode::OK, object_headers(object.metadata(), length)),
    };

    // The object is copied into a bounded pipe while the client reads.
    let (mut writer, reader) = tokio::io::duplex(STREAM_BUFFER);
    tokio::spawn(async move {
        let copied = match range {
            Some((start, end)) => object.copy_range(&mut writer, start, end).await,
            None => object.copy(&mut writer).await,
        };
        if let Err(e) = copied {
            warn!(object = %object.repr(), error = %e, "object read aborted");
        }
        object.close();
    });
    let body = Body::from_stream(ReaderStream::new(reader));
    Ok((status, response_headers, body).into_response())
}

pub(crate) async fn head_object(
    State(state): State<AppState>,
    Path(path): ObjectPath,
) -> Result<Response, ApiError> {
    let (vars, _) = object_vars(path)?;
    let object = state.engine.new_object(&vars, false).await?;
    if !object.exists() {
        return Err(ApiError::NotFound);
    }
    let response_headers = object_headers(object.metadata(), object.content_length());
    object.close();
    Ok((StatusCode::OK, response_headers, Body::empty()).into_response())
}

pub(crate) async fn post_object(
    State(state): State<AppState>,
    Path(path): ObjectPath,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let (vars, _) = object_vars(path)?;
    let timestamp = required_timestamp(&headers)?;
    let mut object = state.engine.new_object(&vars, false).await?;
    if !object.exists() {
        return Err(ApiError::NotFound);
    }
    let mut metadata = user_metadata(&headers);
    metadata.insert(X_TIMESTAMP.to_string(), timestamp);
    object.commit_metadata(metadata).await?;
    debug!(object = %object.repr(), "metadata updated");
    object.close();
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn delete_object(
    State(state): State<AppState>,
    Path(path): ObjectPath,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let (vars, name) = object_vars(path)?;
    let timestamp = required_timestamp(&headers)?;
    let mut object = state.engine.new_object(&vars, false).await?;
    let existed = object.exists();
    let metadata = Metadata::from([
        (X_TIMESTAMP.to_string(), timestamp),
        (NAME.to_string(), name),
    ]);
    object.delete(metadata).await?;
    info!(object = %object.repr(), existed, "tombstone written");
    object.close();
    Ok(if existed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}
