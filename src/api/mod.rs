//! HTTP façade over the storage layer.
//!
//! Uploads are resumable: a POST on an existing, incomplete entry answers
//! 409 with a `Range` header telling the client where to continue, and a
//! `Content-Range` request header resumes from that offset. Downloads are
//! refused until the upload has been finalized.

use std::sync::Arc;

use actix_web::error::ErrorInternalServerError;
use actix_web::http::header;
use actix_web::{delete, get, post, web, Error, HttpRequest, HttpResponse};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{debug, error, warn};
use serde_json::json;

use crate::app_state::AppState;
use crate::storage::{FileInfo, Storage, StorageError, BLOCK_SIZE, FILE_COMPLETE};

/// `Range` header describing where an interrupted upload must resume.
fn resume_range(info: &FileInfo) -> String {
    format!("bytes={}-{}/{}", info.next, info.length - 1, info.length)
}

/// Parse `Content-Range: bytes <start>-<stop>/<length>`.
fn parse_content_range(value: &str) -> Option<(i64, i64, i64)> {
    let rest = value.strip_prefix("bytes ")?;
    let (range, length) = rest.split_once('/')?;
    let (start, stop) = range.split_once('-')?;
    Some((
        start.trim().parse().ok()?,
        stop.trim().parse().ok()?,
        length.trim().parse().ok()?,
    ))
}

/// Parse a single-span `Range: bytes=<start>-<stop>` request against a file
/// of `length` bytes. Open-ended and suffix forms are accepted.
fn parse_range(value: &str, length: i64) -> Option<(i64, i64)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, stop) = rest.split_once('-')?;

    if start.is_empty() {
        let suffix: i64 = stop.trim().parse().ok()?;
        if suffix <= 0 {
            return None;
        }
        return Some(((length - suffix).max(0), length - 1));
    }

    let start: i64 = start.trim().parse().ok()?;
    let stop: i64 = if stop.is_empty() {
        length - 1
    } else {
        stop.trim().parse().ok()?
    };

    Some((start, stop.min(length - 1)))
}

fn request_header(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)?
        .to_str()
        .ok()
        .map(|s| s.to_string())
}

fn content_disposition_filename(req: &HttpRequest) -> Option<String> {
    let value = request_header(req, header::CONTENT_DISPOSITION.as_str())?;
    value.split(';').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        key.eq_ignore_ascii_case("filename")
            .then(|| value.trim_matches('"').to_string())
    })
}

/// Map a storage failure during an upload to its wire status.
fn write_error(id: &str, err: StorageError) -> HttpResponse {
    warn!("upload {}: {}", id, err);
    match err {
        StorageError::NotFound => HttpResponse::NotFound().body("NOT FOUND"),
        StorageError::Exists => {
            HttpResponse::Conflict().json(json!({"code": "conflict", "subcode": "already-exists"}))
        }
        StorageError::InvalidPos | StorageError::InvalidSize | StorageError::InvalidHash => {
            HttpResponse::BadRequest().body(err.to_string())
        }
        other => HttpResponse::InternalServerError().body(other.to_string()),
    }
}

#[get("/")]
pub async fn ping() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

#[post("/x/{id}")]
pub async fn put_entry(
    path: web::Path<String>,
    mut payload: web::Payload,
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let id = path.into_inner();
    let store = state.store.clone();

    let mut resume: Option<i64> = None;

    match store.stat(&id).await {
        Ok(info) => {
            if info.next == FILE_COMPLETE {
                return Ok(HttpResponse::Conflict()
                    .json(json!({"code": "conflict", "subcode": "already-exists"})));
            }

            if let Some(value) = request_header(&req, header::CONTENT_RANGE.as_str()) {
                let bad_range = || {
                    HttpResponse::BadRequest()
                        .insert_header(("Range", resume_range(&info)))
                        .body("invalid-range")
                };

                let Some((start, stop, length)) = parse_content_range(&value) else {
                    return Ok(bad_range());
                };
                if start != info.next || length != info.length {
                    debug!(
                        "upload {}: range {}-{}/{} next {}/{}",
                        id, start, stop, length, info.next, info.length
                    );
                    return Ok(bad_range());
                }
                if stop < length - 1 && (stop - start + 1) % BLOCK_SIZE as i64 != 0 {
                    debug!("upload {}: unaligned range {}-{}/{}", id, start, stop, length);
                    return Ok(bad_range());
                }

                resume = Some(start);
                debug!("upload {}: resume from {}", id, start);
            } else {
                return Ok(HttpResponse::Conflict()
                    .insert_header(("Range", resume_range(&info)))
                    .json(json!({
                        "code": "conflict",
                        "subcode": "incomplete",
                        "resume-from": info.next,
                    })));
            }
        }
        Err(StorageError::NotFound) => {}
        Err(e) => return Ok(HttpResponse::InternalServerError().body(e.to_string())),
    }

    if resume.is_none() {
        let size: i64 = match request_header(&req, "X-File-Length")
            .or_else(|| request_header(&req, header::CONTENT_LENGTH.as_str()))
            .and_then(|v| v.parse().ok())
        {
            Some(size) => size,
            None => return Ok(HttpResponse::LengthRequired().body("unknown file length")),
        };

        let name = content_disposition_filename(&req).unwrap_or_else(|| id.clone());
        let ctype = request_header(&req, header::CONTENT_TYPE.as_str()).unwrap_or_default();
        let hash = request_header(&req, "X-File-Hash").and_then(|v| hex::decode(v).ok());

        match store
            .create_file(&id, &name, &ctype, size, hash.as_deref())
            .await
        {
            Ok(()) => debug!("upload {}: created", id),
            Err(e) => return Ok(write_error(&id, e)),
        }

        if size == 0 {
            // No payload will follow; finalize right away.
            if let Err(e) = store.write_at(&id, 0, &[]).await {
                return Ok(write_error(&id, e));
            }
            return Ok(HttpResponse::Created().body("CREATED"));
        }
    }

    // Drive the upload in block-aligned writes; only the final write may
    // fall short of a block boundary.
    let mut pos = resume.unwrap_or(0);
    let mut buffer = BytesMut::new();

    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(ErrorInternalServerError)?;
        buffer.extend_from_slice(&chunk);

        while pos != FILE_COMPLETE && buffer.len() >= BLOCK_SIZE {
            let aligned = buffer.len() - buffer.len() % BLOCK_SIZE;
            let data = buffer.split_to(aligned);
            match store.write_at(&id, pos, &data).await {
                Ok(next) => pos = next,
                Err(e) => return Ok(write_error(&id, e)),
            }
        }
    }

    if pos != FILE_COMPLETE && !buffer.is_empty() {
        match store.write_at(&id, pos, &buffer).await {
            Ok(next) => pos = next,
            Err(e) => return Ok(write_error(&id, e)),
        }
    }

    if pos != FILE_COMPLETE {
        // The client stopped early; the entry stays open for a resume.
        warn!("upload {}: interrupted, next offset {}", id, pos);
    }

    Ok(HttpResponse::Created().body("CREATED"))
}

/// Stream `[start, end]` of a finalized file in block-sized reads.
fn body_stream(
    store: Arc<dyn Storage>,
    key: String,
    start: i64,
    end: i64,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    futures::stream::unfold(start, move |pos| {
        let store = store.clone();
        let key = key.clone();
        async move {
            if pos > end {
                return None;
            }

            let want = ((end - pos + 1) as usize).min(4 * BLOCK_SIZE);
            let mut buf = vec![0u8; want];
            match store.read_at(&key, &mut buf, pos).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), pos + n as i64))
                }
                Err(e) => {
                    error!("read {} at {}: {}", key, pos, e);
                    let err = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
                    Some((Err(err), end + 1))
                }
            }
        }
    })
}

#[get("/x/{id}")]
pub async fn get_entry(
    path: web::Path<String>,
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let id = path.into_inner();
    let store = state.store.clone();

    let info = match store.stat(&id).await {
        Ok(info) => info,
        Err(StorageError::NotFound) => return Ok(HttpResponse::NotFound().body("NOT FOUND")),
        Err(e) => return Ok(HttpResponse::InternalServerError().body(e.to_string())),
    };

    if info.next != FILE_COMPLETE {
        return Ok(HttpResponse::Forbidden()
            .insert_header(("X-Current-Length", info.next.to_string()))
            .insert_header(("X-Total-Length", info.length.to_string()))
            .insert_header(("Range", resume_range(&info)))
            .body("INCOMPLETE"));
    }

    let (start, end, partial) = match request_header(&req, header::RANGE.as_str()) {
        Some(value) => match parse_range(&value, info.length) {
            Some((start, end)) if start <= end && start < info.length => (start, end, true),
            _ => {
                return Ok(HttpResponse::RangeNotSatisfiable()
                    .insert_header((header::CONTENT_RANGE, format!("bytes */{}", info.length)))
                    .finish());
            }
        },
        None => (0, info.length - 1, false),
    };

    let mut resp = if partial {
        HttpResponse::PartialContent()
    } else {
        HttpResponse::Ok()
    };

    if !info.content_type.is_empty() {
        resp.insert_header((header::CONTENT_TYPE, info.content_type.clone()));
    }
    if !info.hash.is_empty() {
        resp.insert_header((header::ETAG, format!("\"{}\"", info.hash)));
    }
    resp.insert_header((header::ACCEPT_RANGES, "bytes"));

    if info.length == 0 {
        return Ok(resp.body(""));
    }
    if partial {
        resp.insert_header((
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, info.length),
        ));
    }

    Ok(resp.streaming(body_stream(store, id, start, end)))
}

#[get("/x/{id}/meta")]
pub async fn get_meta(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let id = path.into_inner();

    match state.store.stat(&id).await {
        Ok(info) => Ok(HttpResponse::Ok().json(info)),
        Err(StorageError::NotFound) => Ok(HttpResponse::NotFound().body("NOT FOUND")),
        Err(e) => Ok(HttpResponse::InternalServerError().body(e.to_string())),
    }
}

#[delete("/x/{id}")]
pub async fn delete_entry(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let id = path.into_inner();

    match state.store.delete_file(&id).await {
        Ok(()) => Ok(HttpResponse::NoContent().finish()),
        Err(e) => Ok(HttpResponse::InternalServerError().body(e.to_string())),
    }
}
