#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_proto::prelude::*;

/// Answers the paths the end-to-end tests call
#[derive(Default)]
pub struct TestService {
    pub calls: Arc<AtomicUsize>,
}

fn text(payload: &Bytes) -> String {
    String::from_utf8_lossy(payload).to_string()
}

fn number(payload: &Bytes) -> Result<u64, RemoteError> {
    text(payload)
        .parse()
        .map_err(|_| RemoteError::new(400, format!("not a number: {}", text(payload))))
}

fn internal(err: RpcError) -> RemoteError {
    RemoteError::internal(err.to_string())
}

#[async_trait]
impl Service for TestService {
    async fn call(&self, request: Arc<Request>) -> Response {
        let seen = self.calls.fetch_add(1, Ordering::SeqCst);
        let path = request.invocation.method.path().to_string();
        match path.as_str() {
            "/ping" if request.payload.as_ref() == b"ping" => Response::success(request, "pong"),
            "/echo" => {
                let payload = request.payload.clone();
                Response::success(request, payload)
            }
            "/slow" => {
                strand_io::tokio::time::sleep(Duration::from_millis(500)).await;
                Response::success(request, "late")
            }
            "/addr" => {
                let sender = request
                    .remote_addr
                    .map(|addr| addr.to_string())
                    .unwrap_or_default();
                Response::success(request, sender)
            }
            "/first-is-slow" => {
                if seen == 0 {
                    strand_io::tokio::time::sleep(Duration::from_millis(800)).await;
                }
                let reply = format!("answered {}", request.request_id);
                Response::success(request, reply)
            }
            path => {
                let err = RemoteError::new(RemoteError::NOT_FOUND, format!("no handler for {path}"));
                Response::failure(request, err)
            }
        }
    }

    async fn call_stream(
        &self,
        request: Arc<Request>,
        mut frames: RequestFrames,
        replies: StreamReplies,
    ) -> Result<(), RemoteError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        match request.invocation.method.path() {
            "/count" => {
                for i in 0..number(&request.payload)? {
                    replies.send(i.to_string()).await.map_err(internal)?;
                }
                Ok(())
            }
            "/sum" => {
                let mut total = number(&request.payload)?;
                while let Some(frame) = frames.next().await {
                    total += number(&frame)?;
                }
                replies.send(total.to_string()).await.map_err(internal)
            }
            "/upper" => {
                replies
                    .send(text(&request.payload).to_uppercase())
                    .await
                    .map_err(internal)?;
                while let Some(frame) = frames.next().await {
                    replies
                        .send(text(&frame).to_uppercase())
                        .await
                        .map_err(internal)?;
                }
                Ok(())
            }
            path => Err(RemoteError::new(
                RemoteError::NOT_FOUND,
                format!("no stream handler for {path}"),
            )),
        }
    }
}

/// Ignores everything a raw transport reports
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {
    fn received(&self, _connection: &Connection, _message: Message) {}
}

pub fn codec() -> Arc<dyn Codec> {
    Arc::new(LengthPrefixedCodec::default())
}

/// Loopback config on private I/O groups
pub fn private_config(network: Network) -> ProtocolConfig {
    let config = match network {
        Network::Tcp => ProtocolConfig::tcp(),
        Network::Udp => ProtocolConfig::udp(),
    };

    config
        .with_io_threads(2)
        .with_io_thread_group_share(false)
        .with_request_timeout(2_000)
}

/// Polls `condition` every 10ms for up to two seconds
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        strand_io::tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition()
}
