//! Open-loop worker pool.
//!
//! A fixed set of workers drains a bounded queue of request descriptors
//! and hands each to the engine; the metrics aggregator is the only sink —
//! responses are not returned. Closed-loop execution uses
//! [`crate::engine::Engine::execute`] directly instead.
//!
//! `enqueue` never blocks: a full queue fails fast and the caller applies
//! its own back-off. Shutdown is a broadcast: workers finish the
//! descriptor in flight (bounded by its timeout) and exit.

use crate::engine::Engine;
use crate::errors::EngineError;
use crate::request::RequestDescriptor;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fixed-size worker pool over a bounded request queue.
pub struct WorkerPool {
    tx: mpsc::Sender<RequestDescriptor>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    /// Start a pool sized from the engine's configuration: queue capacity
    /// `2 × max_connections`, `worker_count` workers.
    pub fn for_engine(engine: Arc<Engine>) -> Self {
        let worker_count = engine.config().worker_count;
        let queue_capacity = engine.config().max_connections * 2;
        Self::start(engine, worker_count, queue_capacity)
    }

    /// Start a pool with explicit sizing.
    pub fn start(engine: Arc<Engine>, worker_count: usize, queue_capacity: usize) -> Self {
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<RequestDescriptor>(queue_capacity);
        let rx = Arc::new(AsyncMutex::new(rx));
        let cancel = CancellationToken::new();

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let engine = engine.clone();
            let rx = rx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                run_worker(worker_id, engine, rx, cancel).await;
            }));
        }

        info!(worker_count, queue_capacity, "Worker pool started");
        Self {
            tx,
            cancel,
            handles,
            queue_capacity,
        }
    }

    /// Submit a descriptor without blocking.
    ///
    /// A full queue is back-pressure: the caller gets `CapacityExceeded`
    /// immediately and retries on its own schedule.
    pub fn enqueue(&self, request: RequestDescriptor) -> Result<(), EngineError> {
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::CapacityExceeded(format!(
                "request queue full ({} entries)",
                self.queue_capacity
            )),
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::InvalidArgument("worker pool is shut down".to_string())
            }
        })
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Broadcast shutdown and wait for every worker to exit.
    ///
    /// Workers finish their in-flight descriptor; queued descriptors that
    /// no worker has picked up yet are dropped.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.tx);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task join failed");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    engine: Arc<Engine>,
    rx: Arc<AsyncMutex<mpsc::Receiver<RequestDescriptor>>>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "Worker starting");
    loop {
        // Hold the receiver lock only while waiting for the next
        // descriptor, never across its execution.
        let request = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                request = rx.recv() => request,
            }
        };

        let Some(request) = request else {
            break;
        };

        match engine.execute(&request).await {
            Ok(record) => {
                if record.success {
                    debug!(
                        worker_id,
                        url = %request.url,
                        status = record.status_code,
                        "Request completed"
                    );
                } else {
                    let category = crate::errors::ErrorCategory::from_status_code(record.status_code)
                        .unwrap_or(crate::errors::ErrorCategory::NetworkError);
                    debug!(
                        worker_id,
                        url = %request.url,
                        status = record.status_code,
                        category = %category,
                        "Request failed"
                    );
                }
            }
            Err(e) => {
                warn!(worker_id, url = %request.url, error = %e, category = %e.category(), "Request rejected");
            }
        }
    }
    debug!(worker_id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;

    fn test_engine() -> Arc<Engine> {
        Arc::new(Engine::new(EngineConfig::default()).unwrap())
    }

    fn db_connect_request() -> RequestDescriptor {
        RequestDescriptor {
            method: "CONNECT".to_string(),
            ..RequestDescriptor::get("mysql://user@db.local/shop")
        }
    }

    #[tokio::test]
    async fn test_pool_drains_queue_into_metrics() {
        let engine = test_engine();
        let pool = WorkerPool::start(engine.clone(), 4, 32);

        for _ in 0..8 {
            pool.enqueue(db_connect_request()).unwrap();
        }

        // The simulated database connect sleeps a few ms per call.
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        pool.shutdown().await;

        let snap = engine.metrics_snapshot();
        assert_eq!(snap.total_requests, 8);
        assert_eq!(snap.successful_requests, 8);
    }

    #[tokio::test]
    async fn test_enqueue_fails_fast_when_full() {
        let engine = test_engine();
        // No workers: nothing drains the queue.
        let pool = WorkerPool::start(engine, 0, 4);

        for _ in 0..4 {
            pool.enqueue(db_connect_request()).unwrap();
        }
        let err = pool.enqueue(db_connect_request()).unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded(_)));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_sized_from_engine_config() {
        let engine = Arc::new(
            Engine::new(EngineConfig {
                max_connections: 16,
                worker_count: 3,
                ..EngineConfig::default()
            })
            .unwrap(),
        );

        let pool = WorkerPool::for_engine(engine);
        assert_eq!(pool.queue_capacity(), 32);
        assert_eq!(pool.worker_count(), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_idle_workers() {
        let engine = test_engine();
        let pool = WorkerPool::start(engine, 2, 8);

        // Workers are parked on an empty queue; shutdown must not hang.
        tokio::time::timeout(std::time::Duration::from_secs(5), pool.shutdown())
            .await
            .expect("shutdown timed out");
    }
}
