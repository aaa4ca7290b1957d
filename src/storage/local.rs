//! Local filesystem storage backend.

use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use axum::http::{header, request::Parts, HeaderValue, Method, StatusCode};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::addressing::{belongs_to_shard, shard_of, validate_hash, SHARDS};
use super::backend::{
    downcast_options, BlobReader, BlobWriter, HashVisitor, InitContext, Storage, StorageOptions,
};
use super::measure::{self, MeasureMedium};
use super::registry::{parse_options, StorageFactory};
use crate::error::{StorageError, StorageResult};
use crate::transfer::conditional::{self, Precondition};
use crate::transfer::{parse_range, ResponseSink};

const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LocalStorageOption {
    pub cache_path: PathBuf,
    pub pre_gen_measures: bool,
}

impl Default for LocalStorageOption {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from("cache"),
            pre_gen_measures: false,
        }
    }
}

/// Local filesystem storage backend.
///
/// Stores objects in a directory structure:
/// ```text
/// {cache_path}/
///   {hash[0..2]}/     # shard
///     {hash}
///   measure/
///     {tier}
/// ```
#[derive(Default)]
pub struct LocalStorage {
    opt: LocalStorageOption,
}

pub fn factory() -> StorageFactory {
    StorageFactory {
        new: || -> Box<dyn Storage> { Box::new(LocalStorage::default()) },
        new_config: parse_options::<LocalStorageOption>,
    }
}

impl LocalStorage {
    pub fn new(opt: LocalStorageOption) -> Self {
        Self { opt }
    }

    fn hash_path(&self, hash: &str) -> StorageResult<PathBuf> {
        validate_hash(hash)?;
        Ok(self.opt.cache_path.join(shard_of(hash)).join(hash))
    }

    fn measure_file(&self, tier: u32) -> PathBuf {
        self.opt.cache_path.join(measure::measure_path(tier))
    }

    /// Write to a hidden sibling of `path` and persist it into place on close.
    ///
    /// The sibling is removed if the writer is dropped before closing.
    async fn atomic_writer(&self, path: PathBuf) -> StorageResult<BlobWriter> {
        let parent = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        fs::create_dir_all(&parent).await?;
        let prefix = path
            .file_name()
            .map(|n| format!(".{}.", n.to_string_lossy()))
            .unwrap_or_else(|| ".".to_string());
        let tmp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(".tmp")
                .tempfile_in(&parent)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
        let (file, tmp_path) = tmp.into_parts();
        Ok(BlobWriter::new(fs::File::from_std(file), async move {
            tokio::task::spawn_blocking(move || tmp_path.persist(&path))
                .await
                .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
                .map_err(|e| StorageError::Io(e.error))
        }))
    }

    async fn stream_file(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResponseSink,
        path: &Path,
        start: u64,
        length: u64,
    ) -> StorageResult<u64> {
        let mut file = fs::File::open(path).await?;
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        let mut stream = ReaderStream::with_capacity(file.take(length), READ_CHUNK_SIZE);
        let mut sent = 0;
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let chunk = chunk?;
            sent += chunk.len() as u64;
            sink.send_data(chunk).await?;
        }
        Ok(sent)
    }
}

impl fmt::Display for LocalStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<LocalStorage cache={:?}>", self.opt.cache_path)
    }
}

fn not_found(hash: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(hash.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl MeasureMedium for LocalStorage {
    async fn stat_measure(&self, tier: u32) -> StorageResult<u64> {
        Ok(fs::metadata(self.measure_file(tier)).await?.len())
    }

    async fn create_measure(&self, tier: u32) -> StorageResult<BlobWriter> {
        self.atomic_writer(self.measure_file(tier)).await
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn options(&self) -> &dyn StorageOptions {
        &self.opt
    }

    fn set_options(&mut self, opts: Box<dyn StorageOptions>) -> StorageResult<()> {
        self.opt = downcast_options(opts)?;
        Ok(())
    }

    async fn init(&mut self, ctx: &InitContext) -> StorageResult<()> {
        for shard in SHARDS.iter() {
            fs::create_dir_all(self.opt.cache_path.join(shard)).await?;
        }
        fs::create_dir_all(self.opt.cache_path.join("measure")).await?;
        if self.opt.pre_gen_measures {
            measure::pregenerate(&*self, &ctx.cancel).await?;
        }
        Ok(())
    }

    async fn size(&self, hash: &str) -> StorageResult<u64> {
        let path = self.hash_path(hash)?;
        let metadata = fs::metadata(&path).await.map_err(not_found(hash))?;
        Ok(metadata.len())
    }

    async fn open(&self, hash: &str) -> StorageResult<BlobReader> {
        let path = self.hash_path(hash)?;
        let file = fs::File::open(&path).await.map_err(not_found(hash))?;
        Ok(Box::pin(file))
    }

    async fn create(&self, hash: &str) -> StorageResult<BlobWriter> {
        let path = self.hash_path(hash)?;
        self.atomic_writer(path).await
    }

    async fn remove(&self, hash: &str) -> StorageResult<()> {
        let path = self.hash_path(hash)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()), // Already deleted
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn walk_dir(&self, visitor: &mut HashVisitor<'_>) -> StorageResult<()> {
        for shard in SHARDS.iter() {
            let mut entries = match fs::read_dir(self.opt.cache_path.join(shard)).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!(storage = %self, shard = %shard, error = %e, "skipping unreadable shard");
                    continue;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(storage = %self, shard = %shard, error = %e, "shard listing interrupted");
                        break;
                    }
                };
                if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if belongs_to_shard(shard, name) {
                    visitor(name)?;
                }
            }
        }
        Ok(())
    }

    async fn serve_download(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResponseSink,
        req: &Parts,
        hash: &str,
        _size: u64,
    ) -> StorageResult<u64> {
        let path = self.hash_path(hash)?;
        let metadata = fs::metadata(&path).await.map_err(not_found(hash))?;
        let size = metadata.len();
        let modified: DateTime<Utc> = metadata.modified()?.into();
        let etag = conditional::blob_etag(hash);

        {
            let headers = sink.headers_mut();
            headers.insert(header::ETAG, HeaderValue::from_str(&etag).map_err(|_| StorageError::InvalidHash(hash.to_string()))?);
            if let Ok(value) = HeaderValue::from_str(&conditional::http_date(modified)) {
                headers.insert(header::LAST_MODIFIED, value);
            }
        }

        match conditional::evaluate(&req.method, &req.headers, &etag, modified) {
            Precondition::Proceed => {}
            Precondition::NotModified => {
                sink.send_head(StatusCode::NOT_MODIFIED).await?;
                return Ok(0);
            }
            Precondition::Failed => {
                sink.send_head(StatusCode::PRECONDITION_FAILED).await?;
                return Ok(0);
            }
        }

        let headers = sink.headers_mut();
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );

        let mut status = StatusCode::OK;
        let (mut start, mut length) = (0, size);
        let range = req
            .headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .filter(|_| conditional::if_range_allows(&req.headers, &etag, modified));
        if let Some(range) = range {
            match parse_range(range, size) {
                Ok(ranges) => {
                    // Multi-range requests are answered with the full entity.
                    if let [only] = ranges.as_slice() {
                        if only.length > 0 {
                            status = StatusCode::PARTIAL_CONTENT;
                            start = only.start;
                            length = only.length;
                            if let Ok(value) = HeaderValue::from_str(&only.content_range(size)) {
                                headers.insert(header::CONTENT_RANGE, value);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(hash, range, error = %e, "unsatisfiable range");
                    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                        headers.insert(header::CONTENT_RANGE, value);
                    }
                    sink.send_head(StatusCode::RANGE_NOT_SATISFIABLE).await?;
                    return Ok(0);
                }
            }
        }

        sink.headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        sink.send_head(status).await?;
        if req.method == Method::HEAD {
            return Ok(0);
        }
        self.stream_file(cancel, sink, &path, start, length).await
    }

    async fn serve_measure(
        &self,
        cancel: &CancellationToken,
        sink: &mut dyn ResponseSink,
        req: &Parts,
        tier: u32,
    ) -> StorageResult<()> {
        measure::ensure_measure_file(self, tier, cancel).await?;
        measure::serve_synthetic(cancel, sink, &req.method, tier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::BufferedSink;
    use axum::http::Request;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    const HASH: &str = "ab34f2c9e1d0b7a6c5d4e3f2a1b0c9d8e7f6a5b4";

    async fn storage(temp_dir: &TempDir) -> LocalStorage {
        let mut storage = LocalStorage::new(LocalStorageOption {
            cache_path: temp_dir.path().to_path_buf(),
            pre_gen_measures: false,
        });
        storage.init(&InitContext::default()).await.unwrap();
        storage
    }

    async fn put(storage: &LocalStorage, hash: &str, data: &[u8]) {
        let mut writer = storage.create(hash).await.unwrap();
        writer.write_all(data).await.unwrap();
        writer.close().await.unwrap();
    }

    fn request(method: Method, headers: &[(header::HeaderName, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri("/download/x");
        for (name, value) in headers {
            builder = builder.header(name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn test_local_storage_basic() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;

        put(&storage, HASH, b"hello world").await;
        assert!(temp_dir.path().join("ab").join(HASH).exists());
        assert_eq!(storage.size(HASH).await.unwrap(), 11);

        let mut reader = storage.open(HASH).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");

        storage.remove(HASH).await.unwrap();
        assert!(storage.size(HASH).await.unwrap_err().is_not_found());
        // Removing again is fine
        storage.remove(HASH).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;

        put(&storage, HASH, b"first version").await;
        put(&storage, HASH, b"second").await;
        assert_eq!(storage.size(HASH).await.unwrap(), 6);

        // No temporary files remain next to the blob
        let names: Vec<_> = std::fs::read_dir(temp_dir.path().join("ab"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(HASH)]);
    }

    #[tokio::test]
    async fn test_dropped_writer_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;

        put(&storage, HASH, b"kept").await;
        let mut writer = storage.create(HASH).await.unwrap();
        writer.write_all(b"abandoned").await.unwrap();
        drop(writer);

        let names: Vec<_> = std::fs::read_dir(temp_dir.path().join("ab"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(HASH)]);
        assert_eq!(storage.size(HASH).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_creates() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(storage(&temp_dir).await);
        let content = vec![7u8; 256 * 1024];

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let storage = storage.clone();
            let content = content.clone();
            tasks.push(tokio::spawn(async move {
                let mut writer = storage.create(HASH).await?;
                writer.write_all(&content).await?;
                writer.close().await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut buf = Vec::new();
        storage.open(HASH).await.unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, content);
    }

    #[tokio::test]
    async fn test_missing_and_invalid_hashes() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;

        assert!(storage.open(HASH).await.err().unwrap().is_not_found());
        assert!(matches!(
            storage.size("x").await,
            Err(StorageError::InvalidHash(_))
        ));
        assert!(matches!(
            storage.create("../../etc").await,
            Err(StorageError::InvalidHash(_))
        ));
    }

    #[tokio::test]
    async fn test_walk_dir() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;

        put(&storage, HASH, b"1").await;
        put(&storage, "cd0011", b"2").await;
        // Misplaced and hidden entries are ignored
        std::fs::write(temp_dir.path().join("ab").join("ef9999"), b"x").unwrap();
        std::fs::write(temp_dir.path().join("ab").join(".tmp"), b"x").unwrap();
        // A shard that is not a directory is skipped
        std::fs::remove_dir(temp_dir.path().join("ff")).unwrap();
        std::fs::write(temp_dir.path().join("ff"), b"not a dir").unwrap();

        let mut hashes = Vec::new();
        storage
            .walk_dir(&mut |hash| {
                hashes.push(hash.to_string());
                Ok(())
            })
            .await
            .unwrap();
        hashes.sort();
        assert_eq!(hashes, vec![HASH.to_string(), "cd0011".to_string()]);
    }

    #[tokio::test]
    async fn test_walk_dir_stops_on_visitor_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        put(&storage, "0a0a", b"1").await;
        put(&storage, "1b1b", b"2").await;

        let mut visited = 0;
        let result = storage
            .walk_dir(&mut |_| {
                visited += 1;
                Err(StorageError::Cancelled)
            })
            .await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert_eq!(visited, 1);
    }

    #[tokio::test]
    async fn test_serve_full_and_head() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        put(&storage, HASH, b"0123456789").await;
        let cancel = CancellationToken::new();

        let mut sink = BufferedSink::new();
        let sent = storage
            .serve_download(&cancel, &mut sink, &request(Method::GET, &[]), HASH, 10)
            .await
            .unwrap();
        assert_eq!(sent, 10);
        assert_eq!(sink.status, Some(StatusCode::OK));
        assert_eq!(sink.headers[header::CONTENT_LENGTH], "10");
        assert_eq!(sink.headers[header::ETAG], format!("\"{}\"", HASH).as_str());
        assert!(sink.headers.contains_key(header::LAST_MODIFIED));
        assert_eq!(&sink.body[..], b"0123456789");

        let mut sink = BufferedSink::new();
        let sent = storage
            .serve_download(&cancel, &mut sink, &request(Method::HEAD, &[]), HASH, 10)
            .await
            .unwrap();
        assert_eq!(sent, 0);
        assert_eq!(sink.headers[header::CONTENT_LENGTH], "10");
        assert!(sink.body.is_empty());
    }

    #[tokio::test]
    async fn test_serve_range() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        put(&storage, HASH, b"0123456789").await;
        let cancel = CancellationToken::new();

        let mut sink = BufferedSink::new();
        let req = request(Method::GET, &[(header::RANGE, "bytes=2-4")]);
        let sent = storage
            .serve_download(&cancel, &mut sink, &req, HASH, 10)
            .await
            .unwrap();
        assert_eq!(sent, 3);
        assert_eq!(sink.status, Some(StatusCode::PARTIAL_CONTENT));
        assert_eq!(sink.headers[header::CONTENT_RANGE], "bytes 2-4/10");
        assert_eq!(&sink.body[..], b"234");

        let mut sink = BufferedSink::new();
        let req = request(Method::GET, &[(header::RANGE, "bytes=20-")]);
        storage
            .serve_download(&cancel, &mut sink, &req, HASH, 10)
            .await
            .unwrap();
        assert_eq!(sink.status, Some(StatusCode::RANGE_NOT_SATISFIABLE));
        assert_eq!(sink.headers[header::CONTENT_RANGE], "bytes */10");

        // A stale If-Range serves the whole blob
        let mut sink = BufferedSink::new();
        let req = request(
            Method::GET,
            &[(header::RANGE, "bytes=2-4"), (header::IF_RANGE, "\"stale\"")],
        );
        let sent = storage
            .serve_download(&cancel, &mut sink, &req, HASH, 10)
            .await
            .unwrap();
        assert_eq!(sent, 10);
        assert_eq!(sink.status, Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_serve_conditionals() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        put(&storage, HASH, b"0123456789").await;
        let cancel = CancellationToken::new();
        let etag = format!("\"{}\"", HASH);

        let mut sink = BufferedSink::new();
        let req = request(Method::GET, &[(header::IF_NONE_MATCH, etag.as_str())]);
        let sent = storage
            .serve_download(&cancel, &mut sink, &req, HASH, 10)
            .await
            .unwrap();
        assert_eq!(sent, 0);
        assert_eq!(sink.status, Some(StatusCode::NOT_MODIFIED));
        assert!(sink.body.is_empty());

        let mut sink = BufferedSink::new();
        let req = request(Method::GET, &[(header::IF_MATCH, "\"other\"")]);
        storage
            .serve_download(&cancel, &mut sink, &req, HASH, 10)
            .await
            .unwrap();
        assert_eq!(sink.status, Some(StatusCode::PRECONDITION_FAILED));
    }

    #[tokio::test]
    async fn test_serve_missing_blob() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        let mut sink = BufferedSink::new();
        let err = storage
            .serve_download(
                &CancellationToken::new(),
                &mut sink,
                &request(Method::GET, &[]),
                HASH,
                10,
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(sink.status.is_none());
    }

    #[tokio::test]
    async fn test_serve_measure() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        let cancel = CancellationToken::new();

        let mut sink = BufferedSink::new();
        storage
            .serve_measure(&cancel, &mut sink, &request(Method::GET, &[]), 2)
            .await
            .unwrap();
        assert_eq!(sink.status, Some(StatusCode::OK));
        assert_eq!(sink.body.len(), 2 * measure::MB_CHUNK_SIZE);

        let measure_file = temp_dir.path().join("measure").join("2");
        assert_eq!(
            std::fs::metadata(&measure_file).unwrap().len(),
            measure::measure_size(2)
        );
    }

    #[tokio::test]
    async fn test_measure_file_not_rewritten_when_correct() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir).await;
        let cancel = CancellationToken::new();

        measure::ensure_measure_file(&storage, 0, &cancel).await.unwrap();
        let path = temp_dir.path().join("measure").join("0");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2);
        let first = std::fs::metadata(&path).unwrap().modified().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        measure::ensure_measure_file(&storage, 0, &cancel).await.unwrap();
        let second = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_options_from_yaml() {
        let value: serde_yaml::Value =
            serde_yaml::from_str("cache-path: /srv/cache\npre-gen-measures: true").unwrap();
        let opts = parse_options::<LocalStorageOption>(value).unwrap();
        let mut storage = LocalStorage::default();
        storage.set_options(opts).unwrap();
        assert_eq!(storage.opt.cache_path, PathBuf::from("/srv/cache"));
        assert!(storage.opt.pre_gen_measures);
        assert_eq!(storage.options().to_yaml().unwrap()["cache-path"], "/srv/cache");
    }
}
