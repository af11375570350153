//! Request handling
//!
//! Maps each request to one of three storage operations and translates the
//! outcome into an HTTP response.

use std::borrow::Cow;
use std::io;
use std::str::Utf8Error;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use percent_encoding::percent_decode_str;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::error::Error;
use crate::storage::{Bucket, ObjectHandle};

/// Buffer size for streaming object bodies
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Content type used when the key's extension maps to nothing known
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Shared, read-only state of one proxy instance
pub(crate) struct ProxyState {
    pub(crate) bucket: Bucket,
    pub(crate) prefix: String,
}

impl ProxyState {
    /// Storage object name for a request key
    pub(crate) fn object_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn object(&self, key: &str) -> ObjectHandle<'_> {
        self.bucket.object(self.object_name(key))
    }
}

/// Request outcomes that are not a plain success
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Object absent or unreadable; the cause is never sent to the client
    NotFound,
    /// Upload body could not be stored
    UploadFailed(String),
    /// HTTP method outside GET, HEAD, POST and PUT
    MethodNotAllowed,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ProxyError::UploadFailed(detail) => (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("Blob upload failed: {}", detail),
            )
                .into_response(),
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }
}

/// Translate a storage error on the read path (GET, HEAD).
///
/// Every failure becomes `NotFound`; the detail only goes to the log.
fn read_failure(key: &str, err: &Error) -> ProxyError {
    if err.is_not_found() {
        tracing::debug!("Blob {:?} not found", key);
    } else {
        tracing::warn!("Failed to read blob {:?}: {}", key, err);
    }
    ProxyError::NotFound
}

fn upload_failure(key: &str, err: impl std::fmt::Display) -> ProxyError {
    tracing::warn!("Failed to upload blob {:?}: {}", key, err);
    ProxyError::UploadFailed(err.to_string())
}

/// Object key addressed by a request path.
///
/// Strips exactly one leading `/` and percent-decodes the rest. Nothing
/// else is normalized: `..` segments and repeated slashes pass through.
/// Paths that decode to invalid UTF-8 have no key.
pub fn request_key(path: &str) -> std::result::Result<Cow<'_, str>, Utf8Error> {
    let key = path.strip_prefix('/').unwrap_or(path);
    percent_decode_str(key).decode_utf8()
}

/// Content type for a key, from its file extension
fn content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

/// Catch-all handler: dispatch on the request method
pub(crate) async fn handle_request(
    State(state): State<Arc<ProxyState>>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let key = match request_key(request.uri().path()) {
        Ok(key) => key.into_owned(),
        Err(e) => return invalid_key(&method, request.uri().path(), e),
    };

    match method {
        Method::GET => download_blob(&state, &key).await,
        Method::HEAD => check_blob_exists(&state, &key).await,
        Method::POST | Method::PUT => upload_blob(&state, &key, request.into_body()).await,
        _ => ProxyError::MethodNotAllowed.into_response(),
    }
}

/// Answer a request whose path does not decode to a key
fn invalid_key(method: &Method, path: &str, err: Utf8Error) -> Response {
    let err = Error::InvalidObjectName {
        name: path.to_string(),
        reason: err.to_string(),
    };

    match *method {
        Method::GET | Method::HEAD => read_failure(path, &err).into_response(),
        Method::POST | Method::PUT => upload_failure(path, err).into_response(),
        _ => ProxyError::MethodNotAllowed.into_response(),
    }
}

/// GET: stream the object body
async fn download_blob(state: &ProxyState, key: &str) -> Response {
    let reader = match state.object(key).new_reader().await {
        Ok(reader) => reader,
        Err(e) => return read_failure(key, &e).into_response(),
    };

    let blob = key.to_string();
    let body = ReaderStream::with_capacity(reader, COPY_BUFFER_SIZE).inspect_err(move |e| {
        // Status line is already committed, the client sees a truncated body
        tracing::error!("Failed to serve blob {:?}: {}", blob, e);
    });

    (
        [(header::CONTENT_TYPE, content_type(key))],
        Body::from_stream(body),
    )
        .into_response()
}

/// HEAD: 200 if the object exists
async fn check_blob_exists(state: &ProxyState, key: &str) -> Response {
    match state.object(key).attrs().await {
        Ok(Some(attrs)) => {
            tracing::trace!("Blob {:?} exists ({} bytes)", key, attrs.size);
            StatusCode::OK.into_response()
        }
        Ok(None) => ProxyError::NotFound.into_response(),
        Err(e) => read_failure(key, &e).into_response(),
    }
}

/// POST / PUT: copy the request body into the object
async fn upload_blob(state: &ProxyState, key: &str, body: Body) -> Response {
    let mut writer = match state.object(key).new_writer().await {
        Ok(writer) => writer,
        Err(e) => return upload_failure(key, e).into_response(),
    };

    let body = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(body);
    futures::pin_mut!(reader);

    if let Err(e) = tokio::io::copy_buf(&mut reader, &mut writer).await {
        writer.close().await;
        return upload_failure(key, e).into_response();
    }

    if let Err(e) = writer.finish().await {
        return upload_failure(key, e).into_response();
    }

    StatusCode::CREATED.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::proxy::StorageProxy;
    use crate::storage::{
        ObjectAttrs, ObjectStorage, ObjectStoreBackend, ObjectWriter, ReadStream,
    };
    use async_trait::async_trait;
    use axum::Router;
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::AsyncWrite;
    use tower::ServiceExt;

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Body,
    ) -> (StatusCode, Option<String>, Bytes) {
        let request = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, body)
    }

    fn memory_proxy(prefix: &str) -> (StorageProxy, Bucket) {
        let bucket = Bucket::in_memory();
        (StorageProxy::new(bucket.clone(), prefix), bucket)
    }

    #[test]
    fn test_request_key() {
        assert_eq!(request_key("/a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(request_key("a/b.txt").unwrap(), "a/b.txt");
        assert_eq!(request_key("//a").unwrap(), "/a");
        assert_eq!(request_key("/").unwrap(), "");
        assert_eq!(request_key("/../etc/passwd").unwrap(), "../etc/passwd");
        assert_eq!(request_key("/with%20space.txt").unwrap(), "with space.txt");
        assert_eq!(request_key("/x%25y").unwrap(), "x%y");
        assert!(request_key("/%FF").is_err());
        assert!(request_key("/ok/%FE%FF").is_err());
    }

    #[test]
    fn test_object_name() {
        let (proxy, _) = memory_proxy("cache/");
        assert_eq!(proxy.object_name(&request_key("/a/b").unwrap()), "cache/a/b");
        assert_eq!(proxy.object_name(&request_key("a/b").unwrap()), "cache/a/b");
        assert_eq!(proxy.object_name(&request_key("//a").unwrap()), "cache//a");
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("report.json"), "application/json");
        assert_eq!(content_type("dir/page.html"), "text/html");
        assert_eq!(content_type("archive.unknownext"), DEFAULT_CONTENT_TYPE);
        assert_eq!(content_type("no-extension"), DEFAULT_CONTENT_TYPE);
        assert_eq!(content_type("dir.d/file"), DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_get_missing_is_404() {
        let (proxy, _) = memory_proxy("cache/");
        let router = proxy.router();

        let (status, _, body) = send(&router, "GET", "/never/uploaded", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (proxy, bucket) = memory_proxy("cache/");
        let router = proxy.router();

        let (status, _, body) = send(&router, "PUT", "/deps/lock.json", Body::from("{\"a\":1}")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body.is_empty());

        let (status, content_type, body) = send(&router, "GET", "/deps/lock.json", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert_eq!(&body[..], b"{\"a\":1}");

        // Stored under the prefix
        assert!(bucket.object("cache/deps/lock.json").attrs().await.unwrap().is_some());
        assert!(bucket.object("deps/lock.json").attrs().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_post_uploads_and_unknown_extension() {
        let (proxy, _) = memory_proxy("");
        let router = proxy.router();

        let (status, _, _) = send(&router, "POST", "/blob", Body::from(vec![0u8, 1, 2, 255])).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, content_type, body) = send(&router, "GET", "/blob", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(DEFAULT_CONTENT_TYPE));
        assert_eq!(&body[..], &[0u8, 1, 2, 255]);
    }

    #[tokio::test]
    async fn test_head() {
        let (proxy, _) = memory_proxy("cache/");
        let router = proxy.router();

        let (status, _, body) = send(&router, "HEAD", "/x.bin", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());

        send(&router, "PUT", "/x.bin", Body::from("data")).await;

        let (status, _, body) = send(&router, "HEAD", "/x.bin", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_methods() {
        let (proxy, _) = memory_proxy("cache/");
        let router = proxy.router();

        for method in ["DELETE", "PATCH", "OPTIONS"] {
            let (status, _, body) = send(&router, method, "/anything", Body::empty()).await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "{}", method);
            assert!(body.is_empty());
        }
    }

    #[tokio::test]
    async fn test_repeated_put_overwrites() {
        let (proxy, _) = memory_proxy("cache/");
        let router = proxy.router();

        for _ in 0..2 {
            let (status, _, _) = send(&router, "PUT", "/same.txt", Body::from("identical")).await;
            assert_eq!(status, StatusCode::CREATED);
        }
        let (_, _, body) = send(&router, "GET", "/same.txt", Body::empty()).await;
        assert_eq!(&body[..], b"identical");

        send(&router, "PUT", "/same.txt", Body::from("new")).await;
        let (_, _, body) = send(&router, "GET", "/same.txt", Body::empty()).await;
        assert_eq!(&body[..], b"new");
    }

    #[tokio::test]
    async fn test_concurrent_puts_distinct_keys() {
        let (proxy, _) = memory_proxy("cache/");
        let router = proxy.router();

        let (a, b) = tokio::join!(
            send(&router, "PUT", "/a.txt", Body::from("alpha")),
            send(&router, "PUT", "/b.txt", Body::from("bravo")),
        );
        assert_eq!(a.0, StatusCode::CREATED);
        assert_eq!(b.0, StatusCode::CREATED);

        let (_, _, body) = send(&router, "GET", "/a.txt", Body::empty()).await;
        assert_eq!(&body[..], b"alpha");
        let (_, _, body) = send(&router, "GET", "/b.txt", Body::empty()).await;
        assert_eq!(&body[..], b"bravo");
    }

    #[tokio::test]
    async fn test_broken_request_body_is_400() {
        let (proxy, bucket) = memory_proxy("cache/");
        let router = proxy.router();

        let chunks: Vec<std::result::Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"first chunk")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];
        let body = Body::from_stream(futures::stream::iter(chunks));

        let (status, _, body) = send(&router, "PUT", "/partial.bin", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("Blob upload failed:"));

        assert!(bucket.object("cache/partial.bin").attrs().await.unwrap().is_none());
    }

    /// Backend whose writes fail and whose reads error out
    #[derive(Default)]
    struct FailingStorage {
        aborted: Arc<AtomicBool>,
    }

    struct FailingWriter {
        aborted: Arc<AtomicBool>,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("backend unavailable")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl ObjectWriter for FailingWriter {
        async fn abort(&mut self) -> Result<()> {
            self.aborted.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ObjectStorage for FailingStorage {
        async fn open_read(&self, _name: &str) -> Result<ReadStream> {
            Err(Error::Network("permission denied".to_string()))
        }

        async fn open_write(&self, _name: &str) -> Result<Box<dyn ObjectWriter>> {
            Ok(Box::new(FailingWriter {
                aborted: Arc::clone(&self.aborted),
            }))
        }

        async fn fetch_metadata(&self, _name: &str) -> Result<Option<ObjectAttrs>> {
            Err(Error::Network("permission denied".to_string()))
        }
    }

    fn failing_proxy() -> (StorageProxy, Arc<AtomicBool>) {
        let storage = FailingStorage::default();
        let aborted = Arc::clone(&storage.aborted);
        let bucket = Bucket::new("failing", Arc::new(storage));
        (StorageProxy::new(bucket, "cache/"), aborted)
    }

    #[tokio::test]
    async fn test_storage_write_error_is_400() {
        let (proxy, aborted) = failing_proxy();
        let router = proxy.router();

        let (status, content_type, body) = send(&router, "PUT", "/k.bin", Body::from("payload")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf-8"));
        let body = String::from_utf8_lossy(&body);
        assert!(body.starts_with("Blob upload failed:"));
        assert!(body.contains("backend unavailable"));

        // The write stream was released before the response went out
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_read_errors_hidden_as_404() {
        let (proxy, _) = failing_proxy();
        let router = proxy.router();

        let (status, _, body) = send(&router, "GET", "/k.bin", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.is_empty());

        let (status, _, _) = send(&router, "HEAD", "/k.bin", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    async fn stored_names(store: &InMemory) -> Vec<String> {
        let mut names: Vec<String> = store
            .list(None)
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .unwrap();
        names.sort();
        names
    }

    fn raw_memory_proxy(prefix: &str) -> (StorageProxy, Arc<InMemory>) {
        let store = Arc::new(InMemory::new());
        let backend = ObjectStoreBackend::new(store.clone());
        let bucket = Bucket::new("memory://", Arc::new(backend));
        (StorageProxy::new(bucket, prefix), store)
    }

    #[tokio::test]
    async fn test_objects_stored_at_prefix_plus_key() {
        let (proxy, store) = raw_memory_proxy("cache/");
        let router = proxy.router();

        for uri in ["/v1~build", "/x%25y", "/a*b", "/deps/lock.json"] {
            let (status, _, _) = send(&router, "PUT", uri, Body::from(uri)).await;
            assert_eq!(status, StatusCode::CREATED, "{}", uri);
        }

        assert_eq!(
            stored_names(&store).await,
            ["cache/a*b", "cache/deps/lock.json", "cache/v1~build", "cache/x%y"]
        );

        let (status, _, body) = send(&router, "GET", "/x%25y", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"/x%25y");
    }

    #[tokio::test]
    async fn test_unrepresentable_keys_never_alias() {
        let (proxy, store) = raw_memory_proxy("cache/");
        let router = proxy.router();

        send(&router, "PUT", "/a/b", Body::from("plain")).await;
        send(&router, "PUT", "/dir", Body::from("file")).await;

        for uri in ["/a//b", "/dir/", "/./x", "/a/../b", "/"] {
            let (status, _, body) = send(&router, "PUT", uri, Body::from("other")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(String::from_utf8_lossy(&body).starts_with("Blob upload failed:"));

            let (status, _, body) = send(&router, "GET", uri, Body::empty()).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
            assert!(body.is_empty());

            let (status, _, _) = send(&router, "HEAD", uri, Body::empty()).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        }

        assert_eq!(stored_names(&store).await, ["cache/a/b", "cache/dir"]);
        let (_, _, body) = send(&router, "GET", "/a/b", Body::empty()).await;
        assert_eq!(&body[..], b"plain");
    }

    #[tokio::test]
    async fn test_non_utf8_path_has_no_key() {
        let (proxy, store) = raw_memory_proxy("cache/");
        let router = proxy.router();

        for uri in ["/%FF", "/%FE"] {
            let (status, _, body) = send(&router, "PUT", uri, Body::from("bytes")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(String::from_utf8_lossy(&body).starts_with("Blob upload failed:"));

            let (status, _, body) = send(&router, "GET", uri, Body::empty()).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
            assert!(body.is_empty());

            let (status, _, _) = send(&router, "HEAD", uri, Body::empty()).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        }

        let (status, _, _) = send(&router, "DELETE", "/%FF", Body::empty()).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        assert!(stored_names(&store).await.is_empty());
    }

    /// Backend that accepts writes but rejects every commit
    struct CommitRejectingStorage {
        inner: ObjectStoreBackend,
    }

    struct CommitRejectingWriter {
        inner: Box<dyn ObjectWriter>,
    }

    impl AsyncWrite for CommitRejectingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(self.inner.as_mut()).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(self.inner.as_mut()).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("precondition failed")))
        }
    }

    #[async_trait]
    impl ObjectWriter for CommitRejectingWriter {
        async fn abort(&mut self) -> Result<()> {
            self.inner.abort().await
        }
    }

    #[async_trait]
    impl ObjectStorage for CommitRejectingStorage {
        async fn open_read(&self, name: &str) -> Result<ReadStream> {
            self.inner.open_read(name).await
        }

        async fn open_write(&self, name: &str) -> Result<Box<dyn ObjectWriter>> {
            let inner = self.inner.open_write(name).await?;
            Ok(Box::new(CommitRejectingWriter { inner }))
        }

        async fn fetch_metadata(&self, name: &str) -> Result<Option<ObjectAttrs>> {
            self.inner.fetch_metadata(name).await
        }
    }

    #[tokio::test]
    async fn test_failed_commit_is_400() {
        let storage = CommitRejectingStorage {
            inner: ObjectStoreBackend::in_memory(),
        };
        let proxy = StorageProxy::new(Bucket::new("rejecting", Arc::new(storage)), "cache/");
        let router = proxy.router();

        let (status, content_type, body) =
            send(&router, "PUT", "/k.bin", Body::from("payload")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf-8"));
        let body = String::from_utf8_lossy(&body);
        assert!(body.starts_with("Blob upload failed:"));
        assert!(body.contains("precondition failed"));

        let (status, _, _) = send(&router, "HEAD", "/k.bin", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = send(&router, "GET", "/k.bin", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
