//! Event plumbing shared by the feedtap crates.
//!
//! [`InMemoryBus`] fans typed events out to any number of subscribers, while
//! [`ordered::OrderedQueue`] turns a stream of concurrently running fetches
//! back into observation order.

pub mod ordered;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

pub use ordered::{Delivered, OrderedQueue};

/// Anything cloneable and thread-safe can ride the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no active subscribers")]
    NoSubscribers,
    #[error("channel closed")]
    ChannelClosed,
}

#[async_trait]
pub trait EventBus<E>: Send + Sync
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), BusError>;
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// Process-local bus over a tokio broadcast channel. Slow subscribers
/// lose the oldest events once `capacity` is exceeded.
pub struct InMemoryBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> InMemoryBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }
}

#[async_trait]
impl<E> EventBus<E> for InMemoryBus<E>
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), BusError> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| BusError::NoSubscribers)
    }

    fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

/// Bridges a fresh subscription into an mpsc receiver. Lag is logged and
/// skipped; the bridge ends when either side goes away.
pub fn to_mpsc<E>(bus: Arc<InMemoryBus<E>>, capacity: usize) -> mpsc::Receiver<E>
where
    E: Event,
{
    let mut rx = bus.subscribe();
    let (tx, out_rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "event-bus", skipped, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    out_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_reports_error() {
        let bus = InMemoryBus::<u32>::new(4);
        assert_eq!(bus.publish(1).await, Err(BusError::NoSubscribers));
    }

    #[tokio::test]
    async fn mpsc_bridge_preserves_order() {
        let bus = InMemoryBus::<u32>::new(8);
        let mut rx = to_mpsc(Arc::clone(&bus), 8);
        for n in 0..3 {
            bus.publish(n).await.expect("publish");
        }
        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn mpsc_bridge_drains_buffered_events_after_bus_drops() {
        let bus = InMemoryBus::<u32>::new(8);
        let mut rx = to_mpsc(Arc::clone(&bus), 8);
        bus.publish(7).await.expect("publish");
        bus.publish(8).await.expect("publish");
        drop(bus);

        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, Some(8));
        assert_eq!(rx.recv().await, None);
    }
}
