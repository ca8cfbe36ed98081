//! FIFO delivery of concurrently fetched items.
//!
//! Every pushed item starts its fetch right away, but results leave the queue
//! strictly in push order: a single drain task awaits only the head entry and
//! moves on once it settles. A failed fetch is logged and skipped; it never
//! stalls the entries behind it.

use std::fmt::{Debug, Display};
use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::BusError;

/// One settled entry, emitted in observation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered<M, T> {
    pub meta: M,
    pub value: T,
}

struct Pending<M, T> {
    meta: M,
    fetch: JoinHandle<Result<T, String>>,
}

pub struct OrderedQueue<M, T> {
    tx: mpsc::UnboundedSender<Pending<M, T>>,
    drain: JoinHandle<()>,
}

impl<M, T> OrderedQueue<M, T>
where
    M: Debug + Send + 'static,
    T: Send + 'static,
{
    /// Spawns the drain task and returns the queue with its output stream.
    pub fn spawn(capacity: usize) -> (Self, mpsc::Receiver<Delivered<M, T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let drain = tokio::spawn(Self::drain(rx, out_tx));
        (Self { tx, drain }, out_rx)
    }

    /// Starts `fetch` immediately and appends it to the tail of the queue.
    pub fn push<F, E>(&self, meta: M, fetch: F) -> Result<(), BusError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let fetch = tokio::spawn(async move { fetch.await.map_err(|err| err.to_string()) });
        self.tx
            .send(Pending { meta, fetch })
            .map_err(|_| BusError::ChannelClosed)
    }

    /// Stops accepting items; entries already queued are still delivered.
    pub async fn close(self) {
        let Self { tx, drain } = self;
        drop(tx);
        let _ = drain.await;
    }

    async fn drain(
        mut rx: mpsc::UnboundedReceiver<Pending<M, T>>,
        out: mpsc::Sender<Delivered<M, T>>,
    ) {
        while let Some(head) = rx.recv().await {
            let Pending { meta, fetch } = head;
            let settled = match fetch.await {
                Ok(result) => result,
                Err(join_err) => Err(join_err.to_string()),
            };
            match settled {
                Ok(value) => {
                    debug!(target: "ordered-queue", ?meta, "delivering");
                    if out.send(Delivered { meta, value }).await.is_err() {
                        debug!(target: "ordered-queue", "output dropped; stopping drain");
                        break;
                    }
                }
                Err(err) => {
                    warn!(target: "ordered-queue", ?meta, %err, "fetch failed; skipping");
                }
            }
        }
    }
}
