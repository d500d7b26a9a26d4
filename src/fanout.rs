//! Raw-queue fanout (C2): replicates each sample from a daemon queue into
//! one bounded queue per active filter, each with its own independent
//! drop-oldest policy and drop counter.
//!
//! This is the only place a sample is duplicated (section 9): a per-filter
//! queue has exactly one consumer, which is what makes the liveness race
//! documented in C1 impossible downstream of the daemon itself.

use crate::types::BoundedDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const IMU_FILTER_QUEUE_CAPACITY: usize = 500;
pub const GPS_FILTER_QUEUE_CAPACITY: usize = 50;

/// One named output queue of a fanout, shared behind a `Mutex` since a
/// filter worker and the fanout task touch it from different tasks.
pub struct FanoutQueue<T> {
    pub name: &'static str,
    queue: Mutex<BoundedDeque<T>>,
}

impl<T> FanoutQueue<T> {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self { name, queue: Mutex::new(BoundedDeque::new(capacity)) }
    }

    pub async fn try_pop(&self) -> Option<T> {
        self.queue.lock().await.pop()
    }

    pub async fn dropped(&self) -> u64 {
        self.queue.lock().await.dropped()
    }

    async fn push(&self, item: T)
    where
        T: Clone,
    {
        self.queue.lock().await.push(item);
    }
}

/// Replicates samples of type `T` into `N` independent per-filter queues.
/// A stalled consumer only fills and drops from its own queue (section
/// 4.2's isolation invariant) — `broadcast` never blocks on any one queue.
pub struct Fanout<T> {
    outputs: Vec<Arc<FanoutQueue<T>>>,
}

impl<T: Clone> Fanout<T> {
    pub fn new(consumer_names: &[&'static str], capacity: usize) -> Self {
        let outputs = consumer_names
            .iter()
            .map(|name| Arc::new(FanoutQueue::new(name, capacity)))
            .collect();
        Self { outputs }
    }

    pub fn queue(&self, name: &str) -> Option<Arc<FanoutQueue<T>>> {
        self.outputs.iter().find(|q| q.name == name).cloned()
    }

    pub fn queues(&self) -> &[Arc<FanoutQueue<T>>] {
        &self.outputs
    }

    /// Replicate one sample into every consumer queue.
    pub async fn broadcast(&self, item: T) {
        for out in &self.outputs {
            out.push(item.clone()).await;
        }
    }

    pub async fn total_dropped(&self) -> u64 {
        let mut total = 0;
        for out in &self.outputs {
            total += out.dropped().await;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_replicates_to_every_named_queue() {
        let fanout: Fanout<u32> = Fanout::new(&["ekf", "complementary", "incident"], 10);
        fanout.broadcast(42).await;
        for name in ["ekf", "complementary", "incident"] {
            let q = fanout.queue(name).unwrap();
            assert_eq!(q.try_pop().await, Some(42));
        }
    }

    #[tokio::test]
    async fn a_stalled_consumer_only_drops_from_its_own_queue() {
        let fanout: Fanout<u32> = Fanout::new(&["ekf", "complementary"], 2);
        for i in 0..5 {
            fanout.broadcast(i).await;
        }
        // "ekf" never drains: it drops, "complementary" is drained normally.
        let complementary = fanout.queue("complementary").unwrap();
        while complementary.try_pop().await.is_some() {}

        let ekf = fanout.queue("ekf").unwrap();
        assert!(ekf.dropped().await > 0);
        assert_eq!(complementary.dropped().await, 3); // capacity 2, 5 pushed before drain
    }

    #[tokio::test]
    async fn unknown_queue_name_returns_none() {
        let fanout: Fanout<u32> = Fanout::new(&["ekf"], 10);
        assert!(fanout.queue("es_ekf").is_none());
    }
}
