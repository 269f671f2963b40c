use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::config::DeliveryConfig;
use crate::telemetry::Level;

use super::{DeliveryRequest, DeliveryResponse, Destination, NetworkTransport, Transport};

/// How a submitted delivery ended, from the caller's point of view
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(Option<Value>),
    Failed(String),
    /// The request was discarded without a response (queue full or closed)
    Dropped,
    TimedOut,
    Cancelled,
}

/// Wait for a response, giving up on cancellation or after `timeout`.
///
/// A response that is already available wins over cancellation.
pub async fn await_delivery(
    response_rx: oneshot::Receiver<DeliveryResponse>,
    token: &CancellationToken,
    timeout: Duration,
) -> DeliveryOutcome {
    tokio::select! {
        biased;

        response = response_rx => match response {
            Ok(response) if response.is_success() => DeliveryOutcome::Delivered(response.data),
            Ok(response) => DeliveryOutcome::Failed(response.error.unwrap_or_default()),
            Err(_) => DeliveryOutcome::Dropped,
        },

        _ = token.cancelled() => DeliveryOutcome::Cancelled,

        _ = tokio::time::sleep(timeout) => DeliveryOutcome::TimedOut,
    }
}

struct Inner {
    tx: mpsc::Sender<DeliveryRequest>,
    rx: Arc<Mutex<mpsc::Receiver<DeliveryRequest>>>,
    token: CancellationToken,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    worker_count: usize,
}

/// Handle to the shared worker pool. Clones share the same queue.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher delivering over HTTP and syslog. The dispatcher
    /// stops when `shutdown` is cancelled.
    pub fn new(workers: usize, capacity: usize, shutdown: &CancellationToken) -> Self {
        Self::with_transport(workers, capacity, shutdown, Arc::new(NetworkTransport::default()))
    }

    pub fn from_config(config: &DeliveryConfig, shutdown: &CancellationToken) -> Self {
        Self::new(config.workers, config.queue_capacity, shutdown)
    }

    /// Spawn `workers` workers on the current runtime.
    pub fn with_transport(
        workers: usize,
        capacity: usize,
        shutdown: &CancellationToken,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let token = shutdown.child_token();

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&rx),
                    token.clone(),
                    Arc::clone(&transport),
                ))
            })
            .collect();

        debug!(workers, capacity, "dispatcher started");

        Self {
            inner: Arc::new(Inner {
                tx,
                rx,
                token,
                workers: StdMutex::new(handles),
                closed: AtomicBool::new(false),
                worker_count: workers,
            }),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.token.is_cancelled()
    }

    /// The token workers observe; cancelled on `close` or process shutdown
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Queue a payload for delivery without decoding the response.
    pub fn submit(
        &self,
        payload: impl Serialize,
        destination: Destination,
        level: Level,
    ) -> oneshot::Receiver<DeliveryResponse> {
        self.enqueue(payload, destination, level, false)
    }

    /// Queue a payload and attach the decoded JSON response as `data`.
    pub fn submit_for_result(
        &self,
        payload: impl Serialize,
        destination: Destination,
        level: Level,
    ) -> oneshot::Receiver<DeliveryResponse> {
        self.enqueue(payload, destination, level, true)
    }

    fn enqueue(
        &self,
        payload: impl Serialize,
        destination: Destination,
        level: Level,
        decode_response: bool,
    ) -> oneshot::Receiver<DeliveryResponse> {
        let (mut request, response_rx) =
            DeliveryRequest::new(None, destination, level, decode_response);

        match serde_json::to_value(payload) {
            Ok(Value::Null) => {}
            Ok(payload) => request.payload = Some(payload),
            Err(e) => {
                request.respond(DeliveryResponse::failure(format!(
                    "failed to encode payload: {e}"
                )));
                return response_rx;
            }
        }

        if self.is_closed() {
            trace!("dispatcher closed, dropping request");
            return response_rx;
        }

        match self.inner.tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                warn!(
                    "delivery queue full, dropping request to {}",
                    request.destination.describe()
                );
            }
            Err(TrySendError::Closed(_)) => {
                trace!("dispatcher closed, dropping request");
            }
        }
        response_rx
    }

    /// Stop the workers and discard everything still queued. Requests being
    /// delivered when this is called still get their response. Calling it
    /// again is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.token.cancel();

        let discarded = {
            let mut rx = self.inner.rx.lock().await;
            rx.close();
            let mut discarded = 0usize;
            while rx.try_recv().is_ok() {
                discarded += 1;
            }
            discarded
        };
        if discarded > 0 {
            debug!(discarded, "discarded queued delivery requests");
        }

        let workers = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("delivery worker failed: {e}");
            }
        }

        debug!("dispatcher closed");
    }
}

#[instrument(skip(rx, token, transport))]
async fn run_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<DeliveryRequest>>>,
    token: CancellationToken,
    transport: Arc<dyn Transport>,
) {
    trace!("delivery worker started");

    loop {
        let request = tokio::select! {
            biased;

            _ = token.cancelled() => break,

            request = async { rx.lock().await.recv().await } => match request {
                Some(request) => request,
                None => break,
            },
        };

        // Once claimed, a request runs to completion even if cancellation
        // arrives meanwhile.
        let result = transport.deliver(&request).await;
        if let Err(e) = &result {
            debug!("delivery to {} failed: {e}", request.destination.describe());
        }
        request.respond(result.into());
    }

    trace!("delivery worker stopped");
}
