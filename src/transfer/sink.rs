//! Response sinks.
//!
//! Backends write their answer (status, headers, body chunks) into a
//! [`ResponseSink`] instead of building a response value, so that a relayed
//! body can be streamed while the byte count is still known to the backend.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{StorageError, StorageResult};

/// Destination of a served response.
///
/// Headers are collected until `send_head`; sending data without a head
/// implies `200 OK`.
#[async_trait]
pub trait ResponseSink: Send {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    async fn send_head(&mut self, status: StatusCode) -> StorageResult<()>;

    async fn send_data(&mut self, data: Bytes) -> StorageResult<()>;
}

/// Sink that keeps the whole response in memory.
#[derive(Debug, Default)]
pub struct BufferedSink {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: BytesMut,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseSink for BufferedSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn send_head(&mut self, status: StatusCode) -> StorageResult<()> {
        if self.status.is_none() {
            self.status = Some(status);
        }
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> StorageResult<()> {
        self.status.get_or_insert(StatusCode::OK);
        self.body.extend_from_slice(&data);
        Ok(())
    }
}

/// Status line and headers of a streamed response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

type BodyItem = Result<Bytes, std::io::Error>;

/// Sink that streams into an HTTP response owned by another task.
pub struct ChannelSink {
    headers: HeaderMap,
    head: Option<oneshot::Sender<StorageResult<ResponseHead>>>,
    body: mpsc::Sender<BodyItem>,
}

/// Receiving half of a [`ChannelSink`].
///
/// Dropping it (or the response body built from it) cancels the token the
/// channel was created with, aborting the serving task's outbound work.
pub struct PendingResponse {
    head: oneshot::Receiver<StorageResult<ResponseHead>>,
    body: mpsc::Receiver<BodyItem>,
    guard: DropGuard,
}

/// Create a sink and its pending response; `buffer` is the number of body
/// chunks in flight.
pub fn channel(buffer: usize, cancel: &CancellationToken) -> (ChannelSink, PendingResponse) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(buffer.max(1));
    (
        ChannelSink {
            headers: HeaderMap::new(),
            head: Some(head_tx),
            body: body_tx,
        },
        PendingResponse {
            head: head_rx,
            body: body_rx,
            guard: cancel.clone().drop_guard(),
        },
    )
}

impl ChannelSink {
    /// Report the outcome of the serving operation.
    ///
    /// An error before the head was sent reaches the pending response; an
    /// error afterwards aborts the body stream.
    pub fn finish(mut self, result: StorageResult<()>) {
        match (self.head.take(), result) {
            (Some(head), Ok(())) => {
                let _ = head.send(Ok(ResponseHead {
                    status: StatusCode::OK,
                    headers: std::mem::take(&mut self.headers),
                }));
            }
            (Some(head), Err(e)) => {
                let _ = head.send(Err(e));
            }
            (None, Err(e)) => {
                tracing::debug!(error = %e, "response aborted after head was sent");
                let _ = self.body.try_send(Err(std::io::Error::other(e.to_string())));
            }
            (None, Ok(())) => {}
        }
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn send_head(&mut self, status: StatusCode) -> StorageResult<()> {
        let Some(head) = self.head.take() else {
            return Ok(());
        };
        let headers = std::mem::take(&mut self.headers);
        head.send(Ok(ResponseHead { status, headers }))
            .map_err(|_| StorageError::Cancelled)
    }

    async fn send_data(&mut self, data: Bytes) -> StorageResult<()> {
        if self.head.is_some() {
            self.send_head(StatusCode::OK).await?;
        }
        self.body
            .send(Ok(data))
            .await
            .map_err(|_| StorageError::Cancelled)
    }
}

impl PendingResponse {
    /// Wait for the head and build a response streaming the rest of the body.
    pub async fn into_response(self) -> StorageResult<Response> {
        let PendingResponse { head, body, guard } = self;
        let head = head.await.map_err(|_| {
            StorageError::Io(std::io::Error::other("serving task ended without a response"))
        })??;

        // Only a body dropped before its end cancels the serving task.
        let stream = futures::stream::unfold((body, guard), |(mut body, guard)| async move {
            match body.recv().await {
                Some(item) => Some((item, (body, guard))),
                None => {
                    let _ = guard.disarm();
                    None
                }
            }
        });
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        Ok(response)
    }
}
