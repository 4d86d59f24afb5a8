//! Forwards requests to the backends picked by the scheduler and streams the bodies back.
//!
//! [`Dispatcher::dispatch`] returns immediately with a [`ChunkStream`]. A spawned producer
//! walks the requests in order, posts each one to its backend, and pushes the response body
//! into a bounded channel. The stream ends when every request has been answered, when no
//! backend is eligible, or after a failed call, which is reported as a single empty chunk.
//!
//! Dropping the stream stops the producer before its next backend call. A call that is already
//! in flight still runs to completion.
use axum::http::{Method, StatusCode, header};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::client::HttpClient;
use crate::errors::DispatchError;
use crate::load_balancer::Scheduler;
use crate::models::GenerationRequest;
use crate::registry::NodeRegistry;

/// The response bodies for one dispatch, in request order. An empty chunk marks a failed call.
pub type ChunkStream = ReceiverStream<Bytes>;

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Capacity of the channel between the producer and the consumer.
    pub buffer: usize,
    /// Log how long each backend call took.
    pub show_time_cost: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            buffer: 16,
            show_time_cost: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher<T: HttpClient> {
    registry: Arc<NodeRegistry>,
    scheduler: Arc<Scheduler>,
    http_client: T,
    options: DispatchOptions,
}

impl<T> Dispatcher<T>
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    pub fn new(
        registry: Arc<NodeRegistry>,
        scheduler: Arc<Scheduler>,
        http_client: T,
        options: DispatchOptions,
    ) -> Self {
        Self {
            registry,
            scheduler,
            http_client,
            options,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Starts forwarding `requests` to `{backend}/{endpoint}` and returns the lazy result stream.
    pub fn dispatch(&self, requests: Vec<GenerationRequest>, endpoint: &str) -> ChunkStream {
        let (tx, rx) = mpsc::channel(self.options.buffer.max(1));
        let dispatcher = self.clone();
        let endpoint = endpoint.trim_start_matches('/').to_owned();

        tokio::spawn(async move {
            dispatcher.produce(requests, &endpoint, tx).await;
        });

        ReceiverStream::new(rx)
    }

    async fn produce(
        &self,
        requests: Vec<GenerationRequest>,
        endpoint: &str,
        tx: mpsc::Sender<Bytes>,
    ) {
        if requests.is_empty() || !self.scheduler.has_candidates(&self.registry) {
            debug!(
                requests = requests.len(),
                method = %self.scheduler.method(),
                "Nothing to dispatch"
            );
            return;
        }

        for request in requests {
            if tx.is_closed() {
                debug!("Consumer dropped the stream, stopping dispatch");
                return;
            }

            let Some(address) = self.scheduler.select(&self.registry) else {
                debug!("No eligible backend left");
                return;
            };
            let url = format!("http://{address}/{endpoint}");
            debug!(url = %url, method = %self.scheduler.method(), "Dispatching request");

            let started = Instant::now();
            let result = self.forward(&url, &request).await;
            if self.options.show_time_cost {
                info!(url = %url, elapsed_ms = (started.elapsed().as_millis() as u64), "Backend call finished");
            }

            match result {
                Ok(body) => {
                    if tx.send(body).await.is_err() {
                        debug!("Consumer dropped the stream, stopping dispatch");
                        return;
                    }
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to retrieve data");
                    let _ = tx.send(Bytes::new()).await;
                    return;
                }
            }
        }
    }

    /// One POST to the backend. Anything but a 200 is an error.
    async fn forward(&self, url: &str, request: &GenerationRequest) -> Result<Bytes, DispatchError> {
        let payload = request.payload()?;
        let req = axum::http::Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(payload))
            .map_err(|e| DispatchError::InvalidRequest {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;

        let response = self
            .http_client
            .request(req)
            .await
            .map_err(DispatchError::Transport)?;

        if response.status() != StatusCode::OK {
            return Err(DispatchError::Status(response.status()));
        }

        Ok(axum::body::to_bytes(response.into_body(), usize::MAX).await?)
    }
}
