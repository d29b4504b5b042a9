//! The bounded worker pool.
//!
//! A fixed set of workers pulls jobs from a bounded queue. `submit` blocks
//! while the queue is full, which is the backpressure the fetch loop
//! relies on. Acknowledgement policy lives here: a message is acked only
//! when its handler succeeds, and nak'd otherwise so the bus redelivers.

use std::sync::Arc;

use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use savor_common::{Error, Result};

/// Processes the payload of one CDC message.
#[async_trait]
pub trait CdcHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &[u8]) -> Result<()>;
}

/// A message that can be acknowledged back to the bus.
///
/// The seam keeps the pool testable; the real implementation is a
/// JetStream message.
#[async_trait]
pub trait Delivery: Send + 'static {
    fn payload(&self) -> &[u8];
    async fn ack(&self) -> Result<()>;
    async fn nak(&self) -> Result<()>;
}

#[async_trait]
impl Delivery for jetstream::Message {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<()> {
        jetstream::Message::ack(self)
            .await
            .map_err(|e| Error::Bus(e.to_string()))
    }

    async fn nak(&self) -> Result<()> {
        self.ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| Error::Bus(e.to_string()))
    }
}

/// A bounded pool of workers draining one job queue.
pub struct WorkerPool<D: Delivery> {
    jobs: mpsc::Sender<D>,
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl<D: Delivery> WorkerPool<D> {
    /// Spawn `workers` workers over a queue of `queue_size` jobs.
    pub fn new(
        workers: usize,
        queue_size: usize,
        handler: Arc<dyn CdcHandler>,
        token: CancellationToken,
    ) -> Self {
        let workers = workers.max(1);
        let queue_size = queue_size.max(1);

        let (tx, rx) = mpsc::channel(queue_size);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                let token = token.clone();
                tokio::spawn(worker_loop(id, rx, handler, token))
            })
            .collect();

        Self {
            jobs: tx,
            token,
            workers,
        }
    }

    /// Queue a message for processing. Blocks while the queue is full.
    /// Returns `false` once the pool is cancelled or closed.
    pub async fn submit(&self, message: D) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = self.jobs.send(message) => sent.is_ok(),
        }
    }

    /// Close the queue and wait for workers to finish their in-flight
    /// messages.
    pub async fn shutdown(self) {
        drop(self.jobs);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop<D: Delivery>(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<D>>>,
    handler: Arc<dyn CdcHandler>,
    token: CancellationToken,
) {
    loop {
        let message = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => None,
                message = rx.recv() => message,
            }
        };
        let Some(message) = message else {
            break;
        };
        process_message(handler.as_ref(), message).await;
    }
    debug!(worker = id, "worker exited");
}

async fn process_message<D: Delivery>(handler: &dyn CdcHandler, message: D) {
    if let Err(e) = handler.handle(message.payload()).await {
        error!(error = %e, "failed to handle CDC message");
        if let Err(e) = message.nak().await {
            error!(error = %e, "failed to nak message");
        }
        return;
    }

    if let Err(e) = message.ack().await {
        error!(error = %e, "failed to ack message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubDelivery {
        payload: Vec<u8>,
        acks: Arc<AtomicUsize>,
        naks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Delivery for StubDelivery {
        fn payload(&self) -> &[u8] {
            &self.payload
        }

        async fn ack(&self) -> Result<()> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nak(&self) -> Result<()> {
            self.naks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FlakyHandler {
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CdcHandler for FlakyHandler {
        async fn handle(&self, payload: &[u8]) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if payload == b"bad" {
                return Err(Error::Internal("boom".into()));
            }
            Ok(())
        }
    }

    fn delivery(
        payload: &[u8],
        acks: &Arc<AtomicUsize>,
        naks: &Arc<AtomicUsize>,
    ) -> StubDelivery {
        StubDelivery {
            payload: payload.to_vec(),
            acks: Arc::clone(acks),
            naks: Arc::clone(naks),
        }
    }

    #[tokio::test]
    async fn test_ack_on_success_nak_on_failure() {
        let handled = Arc::new(AtomicUsize::new(0));
        let acks = Arc::new(AtomicUsize::new(0));
        let naks = Arc::new(AtomicUsize::new(0));

        let pool = WorkerPool::new(
            2,
            10,
            Arc::new(FlakyHandler {
                handled: Arc::clone(&handled),
            }),
            CancellationToken::new(),
        );

        assert!(pool.submit(delivery(b"ok", &acks, &naks)).await);
        assert!(pool.submit(delivery(b"bad", &acks, &naks)).await);
        assert!(pool.submit(delivery(b"ok", &acks, &naks)).await);
        pool.shutdown().await;

        assert_eq!(handled.load(Ordering::SeqCst), 3);
        assert_eq!(acks.load(Ordering::SeqCst), 2);
        assert_eq!(naks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_returns_false_after_cancel() {
        let token = CancellationToken::new();
        let pool: WorkerPool<StubDelivery> = WorkerPool::new(
            1,
            1,
            Arc::new(FlakyHandler {
                handled: Arc::new(AtomicUsize::new(0)),
            }),
            token.clone(),
        );

        token.cancel();
        // Give the worker a moment to observe cancellation and stop
        // draining, then fill the queue until submit must block.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let acks = Arc::new(AtomicUsize::new(0));
        let naks = Arc::new(AtomicUsize::new(0));
        let mut accepted = 0;
        for _ in 0..3 {
            if pool.submit(delivery(b"ok", &acks, &naks)).await {
                accepted += 1;
            } else {
                break;
            }
        }
        // A cancelled pool stops accepting once its bounded queue is full.
        assert!(accepted <= 1);
    }

    #[tokio::test]
    async fn test_workers_drain_queue_on_shutdown() {
        let handled = Arc::new(AtomicUsize::new(0));
        let acks = Arc::new(AtomicUsize::new(0));
        let naks = Arc::new(AtomicUsize::new(0));

        let pool = WorkerPool::new(
            1,
            100,
            Arc::new(FlakyHandler {
                handled: Arc::clone(&handled),
            }),
            CancellationToken::new(),
        );

        for _ in 0..20 {
            assert!(pool.submit(delivery(b"ok", &acks, &naks)).await);
        }
        pool.shutdown().await;
        assert_eq!(handled.load(Ordering::SeqCst), 20);
        assert_eq!(acks.load(Ordering::SeqCst), 20);
    }
}
