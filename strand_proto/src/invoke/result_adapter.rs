//! Invocation Result Adapter
//!
//! Turns the completion of a pending call into what the caller asked for: a
//! value within the call's timeout, a backup-request race, or a stream of
//! responses.
//!
//! # Features
//!
//! - Timeouts reported as [`RpcError::CallTimeout`], or as
//!   [`RpcError::LinkTimeout`] when an upstream hop enabled link-timeout
//!   tracking
//! - Backup requests: after `backup_request_time` without an answer, one clone
//!   is issued under a fresh id and the first of the two to resolve, success
//!   or failure, decides the call
//! - [`ResponseStream`] and [`RequestSink`] for the streaming modes
//!
//! # Important Notes
//!
//! - Timeout watches are plain futures and vanish with the call
//! - The losing side of a backup race is dropped, which releases its pending
//!   entry. Nothing is cancelled on the wire
//! - Both timeout errors carry the configured value: the call timeout, or the
//!   original link budget
//!
//! # Related Components
//!
//! - `invoke::pending`: the completions awaited here
//! - `invoke::client`: issues the requests

use crate::error::RpcError;
use crate::invoke::pending::PendingStream;
use crate::proto::connection::Connection;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use strand_io::tokio::time::{timeout_at, Instant};
use strand_types::proto::{InvocationDescriptor, Request, Response};

/// The error reported when `invocation` runs out of time
pub fn timeout_error(invocation: &InvocationDescriptor) -> RpcError {
    match invocation.link_timeout {
        Some(budget) => RpcError::LinkTimeout {
            timeout_ms: budget.original().as_millis() as u64,
        },
        None => RpcError::CallTimeout {
            timeout_ms: invocation.timeout.as_millis() as u64,
        },
    }
}

/// Extracts the value of `response`, or the remote error it carries
pub fn unwrap_response(response: Response) -> Result<Bytes, RpcError> {
    response.into_result().map_err(RpcError::Remote)
}

/// Awaits `pending` for at most the effective timeout of `invocation`
pub async fn await_with_timeout<F>(
    invocation: &InvocationDescriptor,
    pending: F,
) -> Result<Bytes, RpcError>
where
    F: Future<Output = Result<Response, RpcError>>,
{
    await_until(invocation, deadline_from(invocation, Instant::now()), pending).await
}

/// The instant a call started at `started` runs out of time
pub fn deadline_from(invocation: &InvocationDescriptor, started: Instant) -> Instant {
    started + invocation.effective_timeout()
}

async fn await_until<F>(
    invocation: &InvocationDescriptor,
    deadline: Instant,
    pending: F,
) -> Result<Bytes, RpcError>
where
    F: Future<Output = Result<Response, RpcError>>,
{
    match timeout_at(deadline, pending).await {
        Ok(response) => unwrap_response(response?),
        Err(_) => Err(timeout_error(invocation)),
    }
}

/// Awaits `primary`; if it has not resolved after `backup_request_time`,
/// calls `issue_backup` once and races both for the rest of the budget.
/// Without a backup delay this is [`await_with_timeout`]
pub async fn race_with_backup<P, B, F>(
    invocation: &InvocationDescriptor,
    primary: P,
    issue_backup: B,
) -> Result<Bytes, RpcError>
where
    P: Future<Output = Result<Response, RpcError>>,
    B: FnOnce() -> F,
    F: Future<Output = Result<Response, RpcError>>,
{
    race_with_backup_since(invocation, Instant::now(), primary, issue_backup).await
}

/// Like [`race_with_backup`] for a call whose clock started at `started`.
/// Time already spent, such as connecting, counts against both the backup
/// delay and the call timeout
pub async fn race_with_backup_since<P, B, F>(
    invocation: &InvocationDescriptor,
    started: Instant,
    primary: P,
    issue_backup: B,
) -> Result<Bytes, RpcError>
where
    P: Future<Output = Result<Response, RpcError>>,
    B: FnOnce() -> F,
    F: Future<Output = Result<Response, RpcError>>,
{
    let deadline = deadline_from(invocation, started);
    let delay = match invocation.backup_request_time {
        Some(delay) => delay,
        None => return await_until(invocation, deadline, primary).await,
    };

    if delay > invocation.timeout {
        return Err(RpcError::InvalidConfig(format!(
            "backup request time {delay:?} exceeds the call timeout {:?}",
            invocation.timeout
        )));
    }

    if delay >= invocation.effective_timeout() {
        return await_until(invocation, deadline, primary).await;
    }

    futures::pin_mut!(primary);
    if let Ok(response) = timeout_at(started + delay, &mut primary).await {
        return unwrap_response(response?);
    }

    log::debug!(target: "strand", "No response to {} after {delay:?}; issuing a backup request", invocation.method.path());
    let backup = issue_backup();
    futures::pin_mut!(backup);

    await_until(invocation, deadline, first_resolution(primary, backup)).await
}

/// Resolves with whichever side resolves first, success or failure. The
/// other side is dropped
async fn first_resolution<A, B>(primary: A, backup: B) -> Result<Response, RpcError>
where
    A: Future<Output = Result<Response, RpcError>> + Unpin,
    B: Future<Output = Result<Response, RpcError>> + Unpin,
{
    let (result, _loser) = futures::future::select(primary, backup).await.factor_first();
    if let Err(err) = &result {
        log::trace!(target: "strand", "Backup race settled by a failure: {err:?}");
    }

    result
}

/// The responses of a streaming call.
///
/// Yields one item per response frame. The frame flagged end-of-stream ends
/// the stream: if it carries a remote error that error is yielded first. A
/// lost connection yields [`RpcError::ConnectionClosed`] and ends the stream
pub struct ResponseStream {
    pending: PendingStream,
    close_on_drop: Option<Connection>,
    finished: bool,
}

impl ResponseStream {
    pub(crate) fn new(pending: PendingStream, close_on_drop: Option<Connection>) -> Self {
        Self {
            pending,
            close_on_drop,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for ResponseStream {
    type Item = Result<Bytes, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let next = match self.pending.poll_next_unpin(cx) {
            Poll::Ready(next) => next,
            Poll::Pending => return Poll::Pending,
        };

        match next {
            None => {
                self.finished = true;
                Poll::Ready(None)
            }

            Some(Err(err)) => {
                self.finished = true;
                Poll::Ready(Some(Err(err)))
            }

            Some(Ok(response)) if response.end_of_stream => {
                self.finished = true;
                match response.into_result() {
                    Ok(_) => Poll::Ready(None),
                    Err(err) => Poll::Ready(Some(Err(RpcError::Remote(err)))),
                }
            }

            Some(Ok(response)) => Poll::Ready(Some(unwrap_response(response))),
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if let Some(connection) = self.close_on_drop.take() {
            connection.shutdown();
        }
    }
}

/// The request side of a client or duplex stream.
///
/// The call argument went out with the opening frame; every `send` adds one
/// frame under the same request id. `finish` sends the closing frame. A sink
/// dropped without finishing closes the request stream on a best-effort basis
pub struct RequestSink {
    connection: Connection,
    opening: Arc<Request>,
    finished: bool,
}

impl RequestSink {
    pub(crate) fn new(connection: Connection, opening: Arc<Request>) -> Self {
        Self {
            connection,
            opening,
            finished: false,
        }
    }

    pub fn request_id(&self) -> u32 {
        self.opening.request_id
    }

    pub async fn send<T: Into<Bytes>>(&mut self, payload: T) -> Result<(), RpcError> {
        if self.finished {
            return Err(RpcError::msg("request stream already finished"));
        }

        self.connection
            .send(self.opening.stream_frame(payload, false))
            .await
    }

    pub async fn finish(mut self) -> Result<(), RpcError> {
        self.finished = true;
        self.connection
            .send(self.opening.stream_frame(Bytes::new(), true))
            .await
    }
}

impl Drop for RequestSink {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self
                .connection
                .send_nowait(self.opening.stream_frame(Bytes::new(), true));
        }
    }
}

/// A client or duplex streaming call in progress
pub struct StreamCall {
    pub requests: RequestSink,
    pub responses: ResponseStream,
}

impl StreamCall {
    pub fn split(self) -> (RequestSink, ResponseStream) {
        (self.requests, self.responses)
    }
}
