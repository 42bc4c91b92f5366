//! The "ordered delivery" primitive: a reliable totally-ordered multicast
//! within a shard, modeled as an explicit handle so a single process can
//! exercise the commit path without a real group-communication substrate.
//! This module gives the trait plus `LocalOrderedDelivery`, a single
//! background task draining an unbounded channel in submission order — the
//! delivery thread never suspends on external I/O, collapsed to one
//! process.

use tokio::sync::mpsc;

/// A reliable, totally-ordered delivery channel for `T`. Items submitted
/// from any number of callers are delivered to a single handler, one at a
/// time, in submission order. Implementations must never reorder or drop
/// an accepted item.
pub trait OrderedDelivery<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Hands `item` off for ordered delivery. Returns once the item is
    /// queued, not once it has been delivered — callers that need the
    /// result of delivery embed a reply channel in `T` itself (the pattern
    /// the replicated store uses for put acknowledgement).
    fn submit(&self, item: T);
}

/// A single-process `OrderedDelivery` backed by one background task that
/// owns the handler exclusively, so it never needs to synchronize against
/// concurrent invocations the way a multi-threaded dispatcher would.
pub struct LocalOrderedDelivery<T> {
    sender: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> LocalOrderedDelivery<T> {
    /// Spawns the delivery task. `handler` runs on that task for the
    /// lifetime of the `LocalOrderedDelivery`; it is the sole owner of
    /// whatever in-core state it mutates, so every state mutation the
    /// shard makes happens inside this one callback.
    pub fn spawn<F>(mut handler: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<T>();
        tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                handler(item);
            }
        });
        Self { sender }
    }
}

impl<T: Send + 'static> OrderedDelivery<T> for LocalOrderedDelivery<T> {
    fn submit(&self, item: T) {
        // The receiver only disappears when the delivery task is dropped
        // (process shutdown); a send failure past that point is not
        // actionable by the caller.
        if self.sender.send(item).is_err() {
            log::warn!("ordered delivery channel closed; item dropped");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn delivers_in_submission_order() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_clone = observed.clone();

        let delivery: LocalOrderedDelivery<(u32, oneshot::Sender<()>)> =
            LocalOrderedDelivery::spawn(move |(n, ack)| {
                observed_clone.lock().unwrap().push(n);
                let _ = ack.send(());
            });

        let mut acks = Vec::new();
        for n in 0..50 {
            let (tx, rx) = oneshot::channel();
            delivery.submit((n, tx));
            acks.push(rx);
        }
        for rx in acks {
            rx.await.unwrap();
        }

        assert_eq!(*observed.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn concurrent_submitters_still_serialize_through_one_handler() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_clone = observed.clone();

        let delivery: Arc<LocalOrderedDelivery<(u32, oneshot::Sender<()>)>> =
            Arc::new(LocalOrderedDelivery::spawn(move |(n, ack)| {
                observed_clone.lock().unwrap().push(n);
                let _ = ack.send(());
            }));

        let mut handles = Vec::new();
        for n in 0..20u32 {
            let delivery = delivery.clone();
            handles.push(tokio::spawn(async move {
                let (tx, rx) = oneshot::channel();
                delivery.submit((n, tx));
                rx.await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let got = observed.lock().unwrap();
        let mut sorted = got.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }
}
