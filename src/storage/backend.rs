//! Storage contract.
//!
//! Every medium (local disk, WebDAV, S3, ...) implements [`Storage`] so the
//! rest of the node can sync, enumerate and serve blobs without knowing
//! where they live. Backends are shared as `Arc<dyn Storage>` once
//! initialised; every operation takes `&self` and may run concurrently.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use axum::http::request::Parts;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::webdav::WebDavUser;
use crate::error::{StorageError, StorageResult};
use crate::transfer::ResponseSink;

/// Pipe capacity between a blob writer and the task uploading it.
const WRITE_PIPE_CAPACITY: usize = 256 * 1024;

/// Readable blob content. Dropping it releases the underlying handle.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Callback invoked once per hash by [`Storage::walk_dir`].
pub type HashVisitor<'a> = dyn FnMut(&str) -> StorageResult<()> + Send + 'a;

/// Writable blob content.
///
/// Bytes written here are not guaranteed to be stored until [`BlobWriter::close`]
/// returns `Ok`; dropping the writer without closing abandons the upload and
/// nothing is committed.
pub struct BlobWriter {
    inner: Pin<Box<dyn AsyncWrite + Send>>,
    commit: Option<BoxFuture<'static, StorageResult<()>>>,
    closing: Option<oneshot::Sender<()>>,
}

impl BlobWriter {
    /// Wrap a raw writer; `commit` runs after the writer has been shut down.
    pub fn new<W, F>(inner: W, commit: F) -> Self
    where
        W: AsyncWrite + Send + 'static,
        F: Future<Output = StorageResult<()>> + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
            commit: Some(Box::pin(commit)),
            closing: None,
        }
    }

    /// Writer whose bytes are streamed to `upload` while they are written.
    ///
    /// The stream only ends cleanly after [`BlobWriter::close`]; if the writer
    /// is dropped first it yields an error and the upload task is aborted.
    pub fn streamed<F, Fut>(upload: F) -> Self
    where
        F: FnOnce(UploadStream) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<()>> + Send + 'static,
    {
        let (writer, reader) = tokio::io::duplex(WRITE_PIPE_CAPACITY);
        let (closing, closed) = oneshot::channel();
        let stream = UploadStream {
            inner: ReaderStream::new(reader),
            closed: Some(closed),
        };
        let task = UploadTask(tokio::spawn(async move { upload(stream).await }));
        Self {
            closing: Some(closing),
            ..Self::new(writer, task.join())
        }
    }

    /// Writer that buffers the whole blob and hands it to `upload` on close.
    pub fn buffered<F, Fut>(upload: F) -> Self
    where
        F: FnOnce(Bytes) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<()>> + Send + 'static,
    {
        let (writer, mut reader) = tokio::io::duplex(WRITE_PIPE_CAPACITY);
        let (closing, mut closed) = oneshot::channel::<()>();
        let task = UploadTask(tokio::spawn(async move {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            if closed.try_recv().is_err() {
                return Err(abandoned().into());
            }
            upload(Bytes::from(data)).await
        }));
        Self {
            closing: Some(closing),
            ..Self::new(writer, task.join())
        }
    }

    /// Write a chunk, reporting the medium's own error if the upload has
    /// already ended.
    pub async fn write_chunk(&mut self, data: &[u8]) -> StorageResult<()> {
        match self.inner.write_all(data).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => match self.commit.take() {
                Some(commit) => Err(commit.await.err().unwrap_or(StorageError::Io(e))),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Finish the blob and wait for the medium to accept it.
    pub async fn close(self) -> StorageResult<()> {
        let BlobWriter {
            mut inner,
            commit,
            closing,
        } = self;
        let commit = commit.ok_or_else(|| {
            StorageError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "upload already ended"))
        })?;
        if let Some(closing) = closing {
            let _ = closing.send(());
        }
        inner.shutdown().await?;
        drop(inner);
        commit.await
    }
}

fn abandoned() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "blob writer dropped before close")
}

/// Background upload that is aborted when its writer goes away.
struct UploadTask(JoinHandle<StorageResult<()>>);

impl UploadTask {
    async fn join(mut self) -> StorageResult<()> {
        (&mut self.0)
            .await
            .map_err(|e| StorageError::Io(io::Error::other(e)))?
    }
}

impl Drop for UploadTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Body handed to a streamed upload.
///
/// Ends with an error instead of a clean EOF when the writer was dropped
/// without [`BlobWriter::close`].
pub struct UploadStream {
    inner: ReaderStream<DuplexStream>,
    closed: Option<oneshot::Receiver<()>>,
}

impl Stream for UploadStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
            Some(chunk) => Poll::Ready(Some(chunk)),
            None => match self.closed.take().map(|mut closed| closed.try_recv()) {
                Some(Err(_)) => Poll::Ready(Some(Err(abandoned()))),
                _ => Poll::Ready(None),
            },
        }
    }
}

impl AsyncWrite for BlobWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

/// Backend-specific configuration held behind a trait object.
pub trait StorageOptions: fmt::Debug + Send + Sync + 'static {
    /// Serialized form, as it would appear under a storage entry's `data`.
    fn to_yaml(&self) -> StorageResult<serde_yaml::Value>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T> StorageOptions for T
where
    T: Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn to_yaml(&self) -> StorageResult<serde_yaml::Value> {
        serde_yaml::to_value(self).map_err(|e| StorageError::Config(e.to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// Take a concrete option type out of a boxed [`StorageOptions`].
pub fn downcast_options<T: 'static>(opts: Box<dyn StorageOptions>) -> StorageResult<T> {
    opts.into_any()
        .downcast::<T>()
        .map(|opts| *opts)
        .map_err(|_| {
            StorageError::Config(format!("expected {} options", std::any::type_name::<T>()))
        })
}

/// Shared state available to every backend while it initialises.
#[derive(Debug, Clone, Default)]
pub struct InitContext {
    /// Named WebDAV credential records storages may refer to by alias.
    pub webdav_users: HashMap<String, WebDavUser>,
    /// Cancels slow startup work such as measure pre-generation.
    pub cancel: CancellationToken,
}

/// Storage backend trait for pluggable blob media.
///
/// Blobs are addressed by lowercase hex content hash and never partially
/// updated. `init` must succeed before any other operation is used.
#[async_trait]
pub trait Storage: fmt::Display + Send + Sync {
    fn options(&self) -> &dyn StorageOptions;

    /// Replace the options. Fails if `opts` belongs to another backend type.
    fn set_options(&mut self, opts: Box<dyn StorageOptions>) -> StorageResult<()>;

    /// Resolve configuration, connect, create housekeeping paths and
    /// optionally pre-generate measure files.
    async fn init(&mut self, ctx: &InitContext) -> StorageResult<()>;

    /// Size in bytes of the blob stored under `hash`.
    async fn size(&self, hash: &str) -> StorageResult<u64>;

    async fn open(&self, hash: &str) -> StorageResult<BlobReader>;

    /// Start writing the blob for `hash`, replacing any existing content
    /// once the writer is closed.
    async fn create(&self, hash: &str) -> StorageResult<BlobWriter>;

    /// Remove a blob. Removing an absent blob succeeds.
    async fn remove(&self, hash: &str) -> StorageResult<()>;

    /// Call `visitor` once per stored hash. Unreadable shards are skipped;
    /// the first visitor error stops the walk and is returned.
    async fn walk_dir(&self, visitor: &mut HashVisitor<'_>) -> StorageResult<()>;

    /// Serve a blob to an HTTP client, honoring `Range` and conditional
    /// headers. Returns the number of bytes the client receives.
    async fn serve_download(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResponseSink,
        req: &Parts,
        hash: &str,
        size: u64,
    ) -> StorageResult<u64>;

    /// Serve the bandwidth probe of `tier` megabytes.
    async fn serve_measure(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResponseSink,
        req: &Parts,
        tier: u32,
    ) -> StorageResult<()>;
}

/// Await `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        result = fut => result,
    }
}
