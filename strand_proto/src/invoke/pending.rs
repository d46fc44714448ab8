//! Pending Calls
//!
//! Maps request ids to the completions waiting on them. The receiving half of
//! every registration owns a guard that removes its entry when dropped, so a
//! call that times out, loses a backup race or is cancelled by its caller never
//! leaves a stale entry behind.
//!
//! # Important Notes
//!
//! - Unary entries are removed by their first response; stream entries by the
//!   response flagged end-of-stream
//! - Losing a connection fails every entry bound to it with
//!   [`RpcError::ConnectionClosed`]
//! - The table lock is only held for map operations

use crate::error::RpcError;
use crate::proto::connection::ConnectionId;
use futures::Stream;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use strand_io::tokio::sync::{mpsc, oneshot};
use strand_io::Mutex;
use strand_types::proto::Response;

enum Completion {
    Unary(oneshot::Sender<Result<Response, RpcError>>),
    Stream(mpsc::UnboundedSender<Result<Response, RpcError>>),
}

struct PendingEntry {
    connection: ConnectionId,
    completion: Completion,
}

#[derive(Clone, Default)]
pub struct PendingCalls {
    entries: Arc<Mutex<HashMap<u32, PendingEntry>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call expecting exactly one response
    pub fn register_unary(
        &self,
        request_id: u32,
        connection: ConnectionId,
    ) -> Result<PendingResponse, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.register(request_id, connection, Completion::Unary(tx))?;
        Ok(PendingResponse {
            rx,
            _guard: PendingGuard::new(self, request_id),
        })
    }

    /// Registers a call expecting a sequence of responses
    pub fn register_stream(
        &self,
        request_id: u32,
        connection: ConnectionId,
    ) -> Result<PendingStream, RpcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(request_id, connection, Completion::Stream(tx))?;
        Ok(PendingStream {
            rx,
            _guard: PendingGuard::new(self, request_id),
        })
    }

    fn register(
        &self,
        request_id: u32,
        connection: ConnectionId,
        completion: Completion,
    ) -> Result<(), RpcError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&request_id) {
            return Err(RpcError::msg(format!(
                "request id {request_id} is already pending"
            )));
        }

        let _ = entries.insert(
            request_id,
            PendingEntry {
                connection,
                completion,
            },
        );
        Ok(())
    }

    /// Hands `response` to the call waiting on its id. Returns the response
    /// back when nothing is waiting
    pub fn complete(&self, response: Response) -> Result<(), Response> {
        let mut entries = self.entries.lock();
        let occupied = match entries.entry(response.request_id) {
            Entry::Occupied(occupied) => occupied,
            Entry::Vacant(..) => return Err(response),
        };

        if matches!(occupied.get().completion, Completion::Unary(..)) {
            if let Completion::Unary(tx) = occupied.remove().completion {
                let _ = tx.send(Ok(response));
            }
            return Ok(());
        }

        let end_of_stream = response.end_of_stream;
        let delivered = match &occupied.get().completion {
            Completion::Stream(tx) => tx.send(Ok(response)).is_ok(),
            Completion::Unary(..) => false,
        };

        // a dropped receiver retires the entry as well
        if end_of_stream || !delivered {
            let _ = occupied.remove();
        }

        Ok(())
    }

    /// Fails every call bound to `connection`. Returns how many were failed
    pub fn fail_connection(&self, connection: ConnectionId, err: RpcError) -> usize {
        let failed: Vec<PendingEntry> = {
            let mut entries = self.entries.lock();
            let ids: Vec<u32> = entries
                .iter()
                .filter(|(_, entry)| entry.connection == connection)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect()
        };

        let count = failed.len();
        for entry in failed {
            match entry.completion {
                Completion::Unary(tx) => {
                    let _ = tx.send(Err(err.clone()));
                }
                Completion::Stream(tx) => {
                    let _ = tx.send(Err(err.clone()));
                }
            }
        }

        if count > 0 {
            log::debug!(target: "strand", "Failed {count} pending calls on connection {connection}: {err:?}");
        }

        count
    }

    pub fn contains(&self, request_id: u32) -> bool {
        self.entries.lock().contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

struct PendingGuard {
    calls: PendingCalls,
    request_id: u32,
}

impl PendingGuard {
    fn new(calls: &PendingCalls, request_id: u32) -> Self {
        Self {
            calls: calls.clone(),
            request_id,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let _ = self.calls.entries.lock().remove(&self.request_id);
    }
}

/// Resolves to the single response of a registered call
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Response, RpcError>>,
    _guard: PendingGuard,
}

impl Future for PendingResponse {
    type Output = Result<Response, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Yields the responses of a registered streaming call
pub struct PendingStream {
    rx: mpsc::UnboundedReceiver<Result<Response, RpcError>>,
    _guard: PendingGuard,
}

impl Stream for PendingStream {
    type Item = Result<Response, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use strand_types::errors::RemoteError;

    fn reply(request_id: u32, payload: &'static [u8], end_of_stream: bool) -> Response {
        Response::new(request_id, Ok(Bytes::from_static(payload))).with_end_of_stream(end_of_stream)
    }

    #[tokio::test]
    async fn unary_call_completes_once() {
        let calls = PendingCalls::new();
        let pending = calls.register_unary(7, 1).unwrap();
        assert!(calls.contains(7));

        assert!(calls.complete(reply(7, b"pong", true)).is_ok());
        assert!(!calls.contains(7));
        let response = pending.await.unwrap();
        assert_eq!(response.value().unwrap().as_ref(), b"pong");

        // a second response for the same id has nobody waiting
        let stray = calls.complete(reply(7, b"late", true)).unwrap_err();
        assert_eq!(stray.request_id, 7);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let calls = PendingCalls::new();
        let _first = calls.register_unary(3, 1).unwrap();
        assert!(calls.register_unary(3, 1).is_err());
        assert!(calls.register_stream(3, 2).is_err());
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn dropping_the_waiter_removes_the_entry() {
        let calls = PendingCalls::new();
        let unary = calls.register_unary(1, 1).unwrap();
        let stream = calls.register_stream(2, 1).unwrap();
        assert_eq!(calls.len(), 2);

        drop(unary);
        drop(stream);
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn stream_entry_lives_until_end_of_stream() {
        let calls = PendingCalls::new();
        let mut stream = calls.register_stream(9, 1).unwrap();

        assert!(calls.complete(reply(9, b"a", false)).is_ok());
        assert!(calls.complete(reply(9, b"b", false)).is_ok());
        assert!(calls.contains(9));
        assert!(calls.complete(reply(9, b"", true)).is_ok());
        assert!(!calls.contains(9));

        let mut payloads = Vec::new();
        while let Some(item) = stream.next().await {
            let response = item.unwrap();
            let done = response.end_of_stream;
            payloads.push(response.into_result().unwrap());
            if done {
                break;
            }
        }

        assert_eq!(payloads, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::new()]);
    }

    #[tokio::test]
    async fn remote_errors_are_delivered_as_responses() {
        let calls = PendingCalls::new();
        let pending = calls.register_unary(4, 1).unwrap();
        let failure = Response::new(4, Err(RemoteError::new(RemoteError::NOT_FOUND, "no such method")));
        assert!(calls.complete(failure).is_ok());

        let response = pending.await.unwrap();
        assert_eq!(response.exception().unwrap().code, RemoteError::NOT_FOUND);
    }

    #[tokio::test]
    async fn connection_loss_fails_only_its_calls() {
        let calls = PendingCalls::new();
        let lost = calls.register_unary(1, 10).unwrap();
        let mut lost_stream = calls.register_stream(2, 10).unwrap();
        let survivor = calls.register_unary(3, 11).unwrap();

        assert_eq!(calls.fail_connection(10, RpcError::ConnectionClosed), 2);
        assert_eq!(lost.await.unwrap_err(), RpcError::ConnectionClosed);
        assert_eq!(lost_stream.next().await.unwrap().unwrap_err(), RpcError::ConnectionClosed);
        assert!(lost_stream.next().await.is_none());

        assert!(calls.contains(3));
        assert!(calls.complete(reply(3, b"ok", true)).is_ok());
        assert!(survivor.await.is_ok());
    }
}
