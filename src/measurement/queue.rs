//! Thread-safe FIFO between the sampling worker and its consumers.
//!
//! Single producer (the worker), any number of consumers. The lock is never
//! exposed and never held across an `.await`; waiting is done on
//! `tokio::sync::Notify`, so consumers may run on any executor.

use crate::measurement::sample::Sample;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct Inner {
    items: Mutex<VecDeque<Sample>>,
    capacity: Option<usize>,
    closed: AtomicBool,
    /// Signalled when an item is pushed or the queue closes.
    available: Notify,
    /// Signalled when an item is removed from a bounded queue, or the queue closes.
    space: Notify,
}

/// Cloneable handle to a sample queue.
#[derive(Clone)]
pub struct SampleQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SampleQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleQueue")
            .field("len", &self.len())
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for SampleQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl SampleQueue {
    /// Queue without a size limit; pushes never wait.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Queue holding at most `capacity` samples; pushes wait for space.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::new()),
                capacity,
                closed: AtomicBool::new(false),
                available: Notify::new(),
                space: Notify::new(),
            }),
        }
    }

    /// Append a sample, waiting for space if the queue is bounded and full.
    ///
    /// Returns the sample back if the queue was closed.
    pub(crate) async fn push(&self, sample: Sample) -> Result<(), Sample> {
        let mut sample = Some(sample);
        loop {
            let space = self.inner.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            if let Some(s) = sample.take() {
                match self.try_push(s) {
                    Ok(()) => return Ok(()),
                    Err(s) if self.is_closed() => return Err(s),
                    Err(s) => sample = Some(s),
                }
            }
            space.await;
        }
    }

    fn try_push(&self, sample: Sample) -> Result<(), Sample> {
        if self.is_closed() {
            return Err(sample);
        }
        {
            let mut items = self.inner.items.lock();
            if self.inner.capacity.is_some_and(|cap| items.len() >= cap) {
                return Err(sample);
            }
            items.push_back(sample);
        }
        self.inner.available.notify_one();
        Ok(())
    }

    /// Mark the producer as finished. Queued samples stay available.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.available.notify_waiters();
        self.inner.space.notify_waiters();
    }

    /// Remove the oldest sample without waiting.
    pub fn try_pop(&self) -> Option<Sample> {
        let sample = self.inner.items.lock().pop_front();
        if sample.is_some() && self.inner.capacity.is_some() {
            self.inner.space.notify_one();
        }
        sample
    }

    /// Remove the oldest sample, waiting until one arrives.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<Sample> {
        loop {
            let available = self.inner.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            if let Some(sample) = self.try_pop() {
                return Some(sample);
            }
            if self.is_closed() {
                // A push may have landed between the two checks
                return self.try_pop();
            }
            available.await;
        }
    }

    /// Like [`SampleQueue::pop`] but gives up after `timeout`.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Sample> {
        tokio::time::timeout(timeout, self.pop()).await.ok().flatten()
    }

    /// Blocking pop for consumers outside an async runtime.
    ///
    /// Must not be called from within a tokio runtime thread.
    pub fn blocking_pop(&self) -> Option<Sample> {
        futures::executor::block_on(self.pop())
    }

    /// Remove and return everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<Sample> {
        let drained: Vec<Sample> = self.inner.items.lock().drain(..).collect();
        if !drained.is_empty() && self.inner.capacity.is_some() {
            self.inner.space.notify_waiters();
        }
        drained
    }

    /// Number of queued samples.
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Whether no samples are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size limit, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Whether the producer has finished.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Channel, Reading};
    use chrono::Utc;

    fn sample(sequence: u64) -> Sample {
        Sample::new(
            sequence,
            Utc::now(),
            vec![Reading::new(Channel::TSorp, sequence as f64)],
        )
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = SampleQueue::unbounded();
        for seq in 1..=5 {
            queue.push(sample(seq)).await.unwrap();
        }
        assert_eq!(queue.len(), 5);
        let order: Vec<u64> = queue.drain().iter().map(Sample::sequence).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = SampleQueue::unbounded();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(sample(7)).await.unwrap();
        let popped = consumer.await.unwrap().unwrap();
        assert_eq!(popped.sequence(), 7);
    }

    #[tokio::test]
    async fn test_close_releases_waiting_consumers() {
        let queue = SampleQueue::unbounded();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();
        tokio::task::yield_now().await;
        queue.close();
        for consumer in consumers {
            assert!(consumer.await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_closed_queue_still_drains() {
        let queue = SampleQueue::unbounded();
        queue.push(sample(1)).await.unwrap();
        queue.close();
        assert!(queue.push(sample(2)).await.is_err());
        assert_eq!(queue.pop().await.map(|s| s.sequence()), Some(1));
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_bounded_push_waits_for_space() {
        let queue = SampleQueue::bounded(1);
        queue.push(sample(1)).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(sample(2)).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.try_pop().map(|s| s.sequence()), Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.try_pop().map(|s| s.sequence()), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_on_empty_queue() {
        let queue = SampleQueue::unbounded();
        assert!(queue.pop_timeout(Duration::from_millis(100)).await.is_none());
    }

    #[test]
    fn test_blocking_pop_from_plain_thread() {
        let queue = SampleQueue::unbounded();
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.blocking_pop())
        };
        futures::executor::block_on(queue.push(sample(4))).unwrap();
        assert_eq!(consumer.join().unwrap().map(|s| s.sequence()), Some(4));
    }
}
