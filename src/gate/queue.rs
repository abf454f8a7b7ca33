//! Bounded FIFO queue drained in fixed-size concurrent batches.
//!
//! Enqueue never blocks. At most one drain loop runs at a time, guarded by a
//! semaphore of weight one; it pulls up to `batch_size` items, processes them
//! concurrently, waits for the whole batch, and repeats until the queue is
//! empty. An empty queue costs nothing: no drain is started.

use crate::ModwardenError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Processes one drained item.
#[async_trait]
pub trait BatchHandler<T>: Send + Sync + 'static {
    /// Handle `item`. Runs concurrently with the rest of its batch.
    async fn process(&self, item: T);
}

/// Shared queue with a single-drainer discipline.
pub struct BatchQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    drain_gate: Arc<Semaphore>,
    handler: Arc<dyn BatchHandler<T>>,
    batch_size: usize,
    capacity: usize,
    batches: AtomicU64,
}

impl<T: Send + 'static> BatchQueue<T> {
    /// Create a queue feeding `handler`.
    pub fn new(handler: Arc<dyn BatchHandler<T>>, batch_size: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::new()),
                drain_gate: Arc::new(Semaphore::new(1)),
                handler,
                batch_size: batch_size.max(1),
                capacity: capacity.max(1),
                batches: AtomicU64::new(0),
            }),
        }
    }

    /// Append `item` and make sure a drain loop is running.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// `QueueFull` once the high-water mark is reached; the item is dropped.
    pub fn enqueue(&self, item: T) -> Result<(), ModwardenError> {
        {
            let mut items = self.inner.lock_items();
            if items.len() >= self.inner.capacity {
                return Err(ModwardenError::QueueFull);
            }
            items.push_back(item);
            debug!(depth = items.len(), "Request queued");
        }
        self.kick();
        Ok(())
    }

    /// Items waiting to be drained.
    pub fn len(&self) -> usize {
        self.inner.lock_items().len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches processed since creation.
    pub fn batches_processed(&self) -> u64 {
        self.inner.batches.load(Ordering::Relaxed)
    }

    fn kick(&self) {
        let Ok(permit) = Arc::clone(&self.inner.drain_gate).try_acquire_owned() else {
            // A drain is already running and will pick the item up.
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.drain(permit));
    }
}

impl<T: Send + 'static> Inner<T> {
    fn lock_items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_batch(&self) -> Vec<T> {
        let mut items = self.lock_items();
        let n = items.len().min(self.batch_size);
        items.drain(..n).collect()
    }

    async fn drain(self: Arc<Self>, permit: OwnedSemaphorePermit) {
        let mut permit = permit;
        loop {
            loop {
                let batch = self.take_batch();
                if batch.is_empty() {
                    break;
                }
                self.run_batch(batch).await;
            }

            drop(permit);

            // An enqueue may have landed after the last empty check but
            // before the permit was released; its kick saw the gate taken.
            if self.lock_items().is_empty() {
                return;
            }
            match Arc::clone(&self.drain_gate).try_acquire_owned() {
                Ok(next) => permit = next,
                Err(_) => return,
            }
        }
    }

    async fn run_batch(&self, batch: Vec<T>) {
        let size = batch.len();
        debug!(size, "Processing batch");

        let mut tasks = JoinSet::new();
        for item in batch {
            let handler = Arc::clone(&self.handler);
            tasks.spawn(async move { handler.process(item).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Batch member panicked");
            }
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    struct Recorder {
        seen: mpsc::UnboundedSender<u32>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        release: Arc<Notify>,
        hold: bool,
    }

    impl Recorder {
        fn new(hold: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<u32>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    seen: tx,
                    in_flight: AtomicUsize::new(0),
                    max_in_flight: AtomicUsize::new(0),
                    release: Arc::new(Notify::new()),
                    hold,
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl BatchHandler<u32> for Recorder {
        async fn process(&self, item: u32) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if self.hold {
                self.release.notified().await;
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = self.seen.send(item);
        }
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<u32>, n: usize) -> Vec<u32> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("item drained in time")
                .expect("channel open");
            out.push(item);
        }
        out
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_item_is_processed() {
        let (recorder, mut rx) = Recorder::new(false);
        let queue: BatchQueue<u32> = BatchQueue::new(recorder, 3, 100);

        for i in 0..10 {
            queue.enqueue(i).unwrap();
        }

        let mut seen = collect(&mut rx, 10).await;
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batch_size_bounds_concurrency() {
        let (recorder, mut rx) = Recorder::new(false);
        let handler: Arc<dyn BatchHandler<u32>> = Arc::clone(&recorder) as _;
        let queue: BatchQueue<u32> = BatchQueue::new(handler, 2, 100);

        for i in 0..9 {
            queue.enqueue(i).unwrap();
        }
        collect(&mut rx, 9).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(recorder.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert!(queue.batches_processed() >= 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_queue_rejects() {
        let (recorder, mut rx) = Recorder::new(true);
        let release = Arc::clone(&recorder.release);
        let queue: BatchQueue<u32> = BatchQueue::new(recorder, 1, 2);

        // First item is pulled into a held batch; two more fill the queue.
        queue.enqueue(1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue(2).unwrap();
        queue.enqueue(3).unwrap();

        assert!(matches!(queue.enqueue(4), Err(ModwardenError::QueueFull)));

        for _ in 0..3 {
            release.notify_one();
            rx.recv().await.unwrap();
        }
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_all_drained() {
        let (recorder, mut rx) = Recorder::new(false);
        let queue: BatchQueue<u32> = BatchQueue::new(recorder, 4, 1000);

        let mut producers = Vec::new();
        for p in 0..8u32 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..25u32 {
                    queue.enqueue(p * 100 + i).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let seen = collect(&mut rx, 200).await;
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let (recorder, _rx) = Recorder::new(false);
        let queue: BatchQueue<u32> = BatchQueue::new(recorder, 3, 10);
        assert!(queue.is_empty());
        assert_eq!(queue.batches_processed(), 0);
    }
}
