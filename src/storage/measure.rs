//! Measure files.
//!
//! Bandwidth probes are synthetic blobs of exactly `tier` MiB, stored at
//! `measure/{tier}` on each medium. Tier 0 is a 2 byte sentinel. The same
//! check-then-write routine runs for every backend; concurrent writers of the
//! same tier produce identical bytes, so no locking is needed.

use std::fmt;

use async_trait::async_trait;
use axum::http::{header, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::backend::{cancellable, BlobWriter};
use crate::error::{StorageError, StorageResult};
use crate::transfer::ResponseSink;

pub const MB_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest measure tier, in MiB.
pub const MAX_MEASURE_TIER: u32 = 200;

static MB_CHUNK: [u8; MB_CHUNK_SIZE] = [0; MB_CHUNK_SIZE];

/// One MiB of filler.
pub fn mb_chunk() -> Bytes {
    Bytes::from_static(&MB_CHUNK)
}

/// Stored size of the measure file for `tier`.
pub fn measure_size(tier: u32) -> u64 {
    if tier == 0 {
        2
    } else {
        tier as u64 * MB_CHUNK_SIZE as u64
    }
}

pub fn validate_tier(tier: u32) -> StorageResult<()> {
    if tier > MAX_MEASURE_TIER {
        return Err(StorageError::InvalidMeasureTier(tier));
    }
    Ok(())
}

/// Backend-relative path of a measure file.
pub fn measure_path(tier: u32) -> String {
    format!("measure/{}", tier)
}

/// The part of a medium the measure routine needs.
#[async_trait]
pub trait MeasureMedium: fmt::Display + Send + Sync {
    /// Current size of the stored measure file; `NotFound` if absent.
    async fn stat_measure(&self, tier: u32) -> StorageResult<u64>;

    async fn create_measure(&self, tier: u32) -> StorageResult<BlobWriter>;
}

/// Make sure the measure file for `tier` exists with its exact size.
pub async fn ensure_measure_file<M>(medium: &M, tier: u32, cancel: &CancellationToken) -> StorageResult<()>
where
    M: MeasureMedium + ?Sized,
{
    validate_tier(tier)?;
    let path = measure_path(tier);
    let expected = measure_size(tier);

    match cancellable(cancel, medium.stat_measure(tier)).await {
        Ok(size) if size == expected => return Ok(()),
        Ok(size) => {
            tracing::debug!(storage = %medium, path = %path, size, expected, "measure file size mismatch");
        }
        Err(StorageError::Cancelled) => return Err(StorageError::Cancelled),
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            tracing::error!(storage = %medium, path = %path, error = %e, "cannot stat measure file");
        }
    }
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }

    tracing::info!(storage = %medium, path = %path, "creating measure file");
    let mut writer = cancellable(cancel, medium.create_measure(tier))
        .await
        .map_err(|e| {
            tracing::error!(storage = %medium, path = %path, error = %e, "cannot create measure file");
            e
        })?;
    // A writer dropped on error or cancellation commits nothing.
    if let Err(e) = write_filler(&mut writer, tier, cancel).await {
        tracing::error!(storage = %medium, path = %path, error = %e, "cannot write measure file");
        return Err(e);
    }
    cancellable(cancel, writer.close()).await.map_err(|e| {
        tracing::error!(storage = %medium, path = %path, error = %e, "could not create measure file");
        e
    })
}

async fn write_filler(writer: &mut BlobWriter, tier: u32, cancel: &CancellationToken) -> StorageResult<()> {
    if tier == 0 {
        return cancellable(cancel, writer.write_chunk(&MB_CHUNK[..2])).await;
    }
    for _ in 0..tier {
        cancellable(cancel, writer.write_chunk(&MB_CHUNK)).await?;
    }
    Ok(())
}

/// Create every non-empty tier in order. Any failure is returned.
pub async fn pregenerate<M>(medium: &M, cancel: &CancellationToken) -> StorageResult<()>
where
    M: MeasureMedium + ?Sized,
{
    tracing::info!(storage = %medium, "creating measure files");
    for tier in 1..=MAX_MEASURE_TIER {
        ensure_measure_file(medium, tier, cancel).await?;
    }
    tracing::info!(storage = %medium, "measure files created");
    Ok(())
}

/// Answer a probe locally: `200 OK` with `tier` MiB of filler, body only for GET.
pub async fn serve_synthetic(
    cancel: &CancellationToken,
    sink: &mut dyn ResponseSink,
    method: &Method,
    tier: u32,
) -> StorageResult<()> {
    let length = tier as u64 * MB_CHUNK_SIZE as u64;
    sink.headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    sink.send_head(StatusCode::OK).await?;
    if method == Method::GET {
        for _ in 0..tier {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            sink.send_data(mb_chunk()).await?;
        }
    }
    Ok(())
}
