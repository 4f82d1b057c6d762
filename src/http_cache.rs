//! HTTP Cache Module
//!
//! Request dispatcher for the `ac/` and `cas/` namespaces plus the status page.
//! The handler is generic over the request body so that it can be driven by
//! hyper connections and by in-memory bodies alike.

use crate::atomic_writer::save_to_disk;
use crate::cache_index::CacheIndex;
use crate::cache_key::{escape_html, CacheItem};
use crate::logging::{AccessLogEntry, ERROR_LOG_TARGET};
use crate::space_ensurer::{SpaceEnsurer, SpaceReservation};
use crate::status::StatusPage;
use crate::upload_coordinator::UploadCoordinator;
use crate::{CacheError, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderMap, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use std::fmt::Display;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

/// Body type of every response produced by [`HttpCache`].
pub type ResponseBody = BoxBody<Bytes, std::io::Error>;

/// Serves cache objects stored under the index's root directory.
pub struct HttpCache {
    index: Arc<dyn CacheIndex>,
    space_ensurer: Arc<dyn SpaceEnsurer>,
    uploads: UploadCoordinator,
    status_path: String,
}

impl HttpCache {
    pub fn new(
        index: Arc<dyn CacheIndex>,
        space_ensurer: Arc<dyn SpaceEnsurer>,
        status_path: impl Into<String>,
    ) -> Self {
        Self {
            index,
            space_ensurer,
            uploads: UploadCoordinator::new(),
            status_path: status_path.into(),
        }
    }

    /// Registry of uploads currently in progress.
    pub fn uploads(&self) -> &UploadCoordinator {
        &self.uploads
    }

    /// Handle one request and write its access log line.
    ///
    /// Never fails: every error is turned into a response.
    pub async fn handle<B>(&self, req: Request<B>, remote_addr: &str) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let result = if method == Method::GET && path == self.status_path {
            self.status_response()
        } else {
            self.handle_cache_request(req).await
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if e.is_unexpected() {
                    self.log_error(&e, &method, &path);
                }
                error_response(&e)
            }
        };

        AccessLogEntry::new(
            method.as_str(),
            response.status().as_u16(),
            remote_addr,
            &path,
        )
        .log();

        response
    }

    async fn handle_cache_request<B>(&self, req: Request<B>) -> Result<Response<ResponseBody>>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Display,
    {
        let item = CacheItem::from_request_path(req.uri().path(), self.index.root_directory())?;

        let method = req.method().clone();
        match method {
            Method::GET => self.get(&item).await,
            Method::HEAD => {
                if self.index.contains_object(&item.absolute_path) {
                    Ok(empty(StatusCode::OK))
                } else {
                    Err(CacheError::NotFound(req.uri().path().to_string()))
                }
            }
            Method::PUT => self.put(&item, req).await,
            other => Err(CacheError::UnsupportedMethod(escape_html(other.as_str()))),
        }
    }

    async fn get(&self, item: &CacheItem) -> Result<Response<ResponseBody>> {
        let not_found = || CacheError::NotFound(item.absolute_path.display().to_string());

        if !self.index.contains_object(&item.absolute_path) {
            return Err(not_found());
        }

        // The object may have been evicted since the index lookup.
        let file = match tokio::fs::File::open(&item.absolute_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => {
                return Err(CacheError::IoError(format!(
                    "Failed to open {:?}: {}",
                    item.absolute_path, e
                )))
            }
        };
        let size = file.metadata().await?.len();

        let stream = ReaderStream::new(file).map_ok(Frame::data);
        let body = BodyExt::boxed(StreamBody::new(stream));

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(body)
            .map_err(|e| CacheError::HttpError(e.to_string()))
    }

    async fn put<B>(&self, item: &CacheItem, req: Request<B>) -> Result<Response<ResponseBody>>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();
        let path = &item.absolute_path;

        if self.index.contains_object(path) {
            discard_body(body).await;
            return Ok(empty(StatusCode::OK));
        }

        let _guard = self.uploads.acquire(path).await;

        // Another writer may have published the object while we waited.
        if self.index.contains_object(path) {
            debug!("Object appeared while waiting for upload lock: {:?}", path);
            discard_body(body).await;
            return Ok(empty(StatusCode::OK));
        }

        let content_length =
            content_length(&parts.headers).ok_or(CacheError::MissingContentLength)?;

        // Held until the object is registered or the upload fails.
        let _reservation = self.reserve_space(content_length).await?;

        let written = save_to_disk(body, item).await?;
        self.index.register_object(path, written);

        Ok(empty(StatusCode::OK))
    }

    /// Eviction deletes files, so it runs on the blocking pool.
    async fn reserve_space(&self, bytes: u64) -> Result<SpaceReservation> {
        let space_ensurer = Arc::clone(&self.space_ensurer);
        let index = Arc::clone(&self.index);

        tokio::task::spawn_blocking(move || {
            SpaceReservation::acquire(&space_ensurer, index.as_ref(), bytes)
        })
        .await
        .map_err(|e| CacheError::IoError(format!("Space reservation task failed: {}", e)))?
        .ok_or(CacheError::InsufficientSpace)
    }

    fn status_response(&self) -> Result<Response<ResponseBody>> {
        let json = StatusPage::snapshot(self.index.as_ref()).to_json()?;

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, "no-cache")
            .body(full(json))
            .map_err(|e| CacheError::HttpError(e.to_string()))
    }

    fn log_error(&self, err: &CacheError, method: &Method, path: &str) {
        match err {
            CacheError::InsufficientSpace => error!(
                target: ERROR_LOG_TARGET,
                "The disk is full ({}/{} bytes used)",
                self.index.current_size_bytes(),
                self.index.max_size_bytes()
            ),
            _ => error!(target: ERROR_LOG_TARGET, "{} {}: {}", method, path, err),
        }
    }
}

/// Parse `Content-Length`; `None` when absent or not a number.
fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Read and drop the rest of a request body.
async fn discard_body<B>(mut body: B)
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    while let Some(frame) = body.frame().await {
        if let Err(e) = frame {
            debug!("Stopped discarding request body: {}", e);
            break;
        }
    }
}

fn empty(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

fn full(text: impl Into<Bytes>) -> ResponseBody {
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

/// Plain-text error response. A miss has no body.
fn error_response(err: &CacheError) -> Response<ResponseBody> {
    let status = err.status_code();
    if matches!(err, CacheError::NotFound(_)) {
        return empty(status);
    }

    let mut response = Response::new(full(format!("{}\n", err)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
