//!
//! docmirror HTTP server
//! ---------------------
//! Axum router over a shared `FileStorage`.
//!
//! Responsibilities:
//! - Public browsing: directory listings and downloads, restricted to confirmed files.
//! - Uploads: email check, atomic create of a pending record, confirmation mail queued.
//! - Confirmation links: flip every record carrying the token to authorized.
//!
//! Storage calls block (content copy, log fsync), so mutating and content-reading handlers
//! run them on the blocking pool.

use std::io::{Cursor, Read};
use std::sync::Arc;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::mailer::Mailgun;
use crate::notify::{check_email, ConfirmationSender, LogSender, NotificationQueue};
use crate::storage::{clean_logical_path, FileStorage, FsResult, Listing, PathStat};

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: FileStorage,
    pub config: Arc<ServerConfig>,
}

#[derive(Debug, Serialize)]
pub struct DirEntry {
    pub name: String,
    /// `parent`, `dir` or `file`.
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_human: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct DirListing {
    pub path: String,
    pub entries: Vec<DirEntry>,
}

impl DirListing {
    fn new(path: &str, listing: Listing) -> Self {
        let mut entries = Vec::with_capacity(listing.dirs.len() + listing.files.len() + 1);
        if !path.is_empty() {
            entries.push(DirEntry { name: "..".into(), kind: "parent", size: None, size_human: None, mod_time: None });
        }
        for d in listing.dirs {
            entries.push(DirEntry { name: d, kind: "dir", size: None, size_human: None, mod_time: None });
        }
        for f in listing.files {
            entries.push(DirEntry {
                size_human: Some(f.size_human()),
                size: Some(f.size),
                mod_time: Some(f.mod_time),
                name: f.name,
                kind: "file",
            });
        }
        Self { path: path.to_string(), entries }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub filename: String,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct UploadReport {
    pub path: String,
    pub filename: String,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfirmReport {
    pub email: String,
    pub confirmed: usize,
}

const DOWNLOAD_CHUNK: usize = 64 * 1024;

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/", get(|| async { "docmirror ok" }))
        .route("/files", get(files_root))
        .route("/files/", get(files_root))
        .route("/files/{*path}", get(files))
        .route("/upload", post(upload_root))
        .route("/upload/", post(upload_root))
        .route("/upload/{*dir}", post(upload))
        .route("/confirm/{token}", get(confirm))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Open storage and the notification pipeline described by `config`. Must run inside a
/// tokio runtime (the notification worker is spawned on it).
pub fn build_state(config: ServerConfig) -> anyhow::Result<AppState> {
    let storage = FileStorage::open(&config.base_dir, config.meta_dir(), config.meta.clone())
        .with_context(|| format!("opening storage (files={}, meta={})", config.base_dir.display(), config.meta_dir().display()))?;
    let sender: Arc<dyn ConfirmationSender> = if config.mailgun_api_key.trim().is_empty() {
        warn!(target: "startup", "no mailgun api key configured; confirmation links will only be logged");
        Arc::new(LogSender::new(config.domain.clone()))
    } else {
        Arc::new(Mailgun::new(&config.domain, &config.mail_sender, &config.mailgun_api_key).context("initializing mailer")?)
    };
    let (queue, _worker) = NotificationQueue::spawn(sender);
    let pending = storage.pending()?.len();
    info!(target: "startup", "storage ready: records={} pending={}", storage.meta().len(), pending);
    Ok(AppState { storage: storage.with_notifications(queue), config: Arc::new(config) })
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let state = build_state(config)?;
    let addr = state.config.bind_addr();
    info!(target: "startup", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> FsResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => Ok(res?),
        Err(e) => Err(AppError::internal("task_failed".to_string(), e.to_string())),
    }
}

fn log_failure(op: &str, target: &str, err: &AppError) {
    if err.http_status() >= 500 {
        error!(target: "docmirror::http", "{} '{}' failed: {}", op, target, err);
    } else {
        debug!(target: "docmirror::http", "{} '{}' rejected: {}", op, target, err);
    }
}

async fn files_root(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    serve_path(state, String::new(), headers).await
}

async fn files(State(state): State<AppState>, Path(path): Path<String>, headers: HeaderMap) -> AppResult<Response> {
    serve_path(state, path, headers).await
}

async fn serve_path(state: AppState, raw: String, headers: HeaderMap) -> AppResult<Response> {
    let res = serve_path_inner(state, &raw, &headers).await;
    if let Err(e) = &res { log_failure("GET", &raw, e); }
    res
}

async fn serve_path_inner(state: AppState, raw: &str, headers: &HeaderMap) -> AppResult<Response> {
    let path = clean_logical_path(raw)?;
    match state.storage.stat_public(&path)? {
        PathStat::Directory => {
            let listing = state.storage.list_public(&path)?;
            Ok(Json(DirListing::new(&path, listing)).into_response())
        }
        PathStat::File(rec) => {
            let last_modified = http_date(&rec.mod_time);
            if not_modified_since(headers, &rec.mod_time) {
                return Ok((StatusCode::NOT_MODIFIED, [(header::LAST_MODIFIED, last_modified)]).into_response());
            }
            let storage = state.storage.clone();
            let p = path.clone();
            let (rec, reader) = blocking(move || storage.open_public(&p)).await?;
            debug!(target: "docmirror::http", "serving '{}' ({})", path, rec.size_human());

            let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
            tokio::task::spawn_blocking(move || pump(reader, tx, path));
            let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            }));
            let disposition = format!("inline; filename=\"{}\"", rec.name.replace('"', ""));
            Ok((
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                    (header::LAST_MODIFIED, last_modified),
                ],
                body,
            ).into_response())
        }
        PathStat::Missing => Err(AppError::not_found("not_found".to_string(), format!("no such file or directory: {}", path))),
    }
}

/// Copy stored content into the response channel in fixed-size chunks. Stops quietly when
/// the client goes away.
fn pump(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<std::io::Result<Bytes>>, path: String) {
    let mut buf = vec![0u8; DOWNLOAD_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() { return; }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(target: "docmirror::http", "download of '{}' aborted: {}", path, e);
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

/// IMF-fixdate, as used by `Last-Modified`.
fn http_date(t: &DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// True when the request carries an `If-Modified-Since` no older than `modified` (second
/// resolution). Unparseable dates are ignored.
fn not_modified_since(headers: &HeaderMap, modified: &DateTime<Utc>) -> bool {
    let Some(since) = headers.get(header::IF_MODIFIED_SINCE).and_then(|v| v.to_str().ok()) else { return false; };
    match DateTime::parse_from_rfc2822(since) {
        Ok(since) => modified.timestamp() <= since.timestamp(),
        Err(_) => false,
    }
}

async fn upload_root(State(state): State<AppState>, Query(params): Query<UploadParams>, body: Bytes) -> AppResult<Json<UploadReport>> {
    do_upload(state, String::new(), params, body).await
}

async fn upload(State(state): State<AppState>, Path(dir): Path<String>, Query(params): Query<UploadParams>, body: Bytes) -> AppResult<Json<UploadReport>> {
    do_upload(state, dir, params, body).await
}

async fn do_upload(state: AppState, dir: String, params: UploadParams, body: Bytes) -> AppResult<Json<UploadReport>> {
    let res = do_upload_inner(state, &dir, params, body).await;
    if let Err(e) = &res { log_failure("upload to", &dir, e); }
    res
}

async fn do_upload_inner(state: AppState, dir: &str, params: UploadParams, body: Bytes) -> AppResult<Json<UploadReport>> {
    let email = check_email(&params.email, &state.config.allowed_email_domains)?;
    let directory = clean_logical_path(dir)?;
    let storage = state.storage.clone();
    let (d, f, e) = (directory.clone(), params.filename, email.clone());
    let rec = blocking(move || storage.create(&d, &f, &e, &mut Cursor::new(body))).await?;
    Ok(Json(UploadReport { path: directory, filename: rec.name, email }))
}

async fn confirm(State(state): State<AppState>, Path(token): Path<String>) -> AppResult<Json<ConfirmReport>> {
    let storage = state.storage.clone();
    let t = token.clone();
    let res = blocking(move || storage.confirm(&t)).await;
    match res {
        Ok(conf) => Ok(Json(ConfirmReport { email: conf.email.unwrap_or_default(), confirmed: conf.confirmed })),
        Err(e) => {
            log_failure("confirm", &token, &e);
            Err(e)
        }
    }
}
