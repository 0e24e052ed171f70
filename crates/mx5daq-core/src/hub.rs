//! Broadcast hub
//!
//! Fans every reading out to all currently registered subscribers.
//!
//! ## Guarantees
//! - Each delivery pass sees one consistent snapshot of the subscriber set.
//! - Once [`BroadcastHub::unsubscribe`] returns, that subscriber receives nothing more.
//! - A failing or panicking endpoint is deregistered; the others are unaffected.
//! - A full endpoint queue drops the reading for that subscriber only.
//!
//! ```text
//!   broadcast(&Reading)
//!        │
//!        ├──► [endpoint S1] ─► queue ─► consumer
//!        ├──► [endpoint S2] ─► queue ─► consumer
//!        └──► [endpoint SN] ─► queue ─► consumer
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::reading::Reading;
use crate::sink::Sink;

/// Default per-subscriber queue depth for [`BroadcastHub::channel`]
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Handle returned by [`BroadcastHub::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Why an endpoint refused a reading
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The consumer side is gone; the subscriber will be removed
    #[error("endpoint closed")]
    Closed,

    /// The consumer is lagging; this reading is dropped for it
    #[error("endpoint queue full")]
    Full,
}

/// A subscriber's transport.
///
/// `send` must not block and must not call back into the hub.
pub trait Endpoint: Send + Sync {
    /// Hand one reading to the consumer
    fn send(&self, reading: &Reading) -> Result<(), DeliveryError>;
}

impl Endpoint for mpsc::Sender<Reading> {
    fn send(&self, reading: &Reading) -> Result<(), DeliveryError> {
        self.try_send(*reading).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

impl Endpoint for mpsc::UnboundedSender<Reading> {
    fn send(&self, reading: &Reading) -> Result<(), DeliveryError> {
        mpsc::UnboundedSender::send(self, *reading).map_err(|_| DeliveryError::Closed)
    }
}

impl Endpoint for std::sync::mpsc::Sender<Reading> {
    fn send(&self, reading: &Reading) -> Result<(), DeliveryError> {
        std::sync::mpsc::Sender::send(self, *reading).map_err(|_| DeliveryError::Closed)
    }
}

struct Subscriber {
    id: SubscriptionId,
    endpoint: Box<dyn Endpoint>,
}

/// Fan-out of readings to a dynamic set of subscribers
pub struct BroadcastHub {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl BroadcastHub {
    /// Create a hub whose [`channel`](Self::channel) subscriptions hold
    /// up to `queue_capacity` readings each
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register an endpoint
    pub fn subscribe<E: Endpoint + 'static>(&self, endpoint: E) -> SubscriptionId {
        self.subscribe_boxed(Box::new(endpoint))
    }

    /// Register an already boxed endpoint
    pub fn subscribe_boxed(&self, endpoint: Box<dyn Endpoint>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subs.push(Subscriber { id, endpoint });
        info!(subscriber = %id, total = subs.len(), "Subscriber registered");
        id
    }

    /// Register a bounded channel and return its receiving half
    pub fn channel(&self) -> (SubscriptionId, mpsc::Receiver<Reading>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        (self.subscribe(tx), rx)
    }

    /// Deregister a subscriber. Returns `false` if it was not registered
    /// (already removed, or dropped after a delivery failure).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        if removed {
            info!(subscriber = %id, total = subs.len(), "Subscriber removed");
        }
        removed
    }

    /// Number of registered subscribers
    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .map(|s| s.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }

    /// Check if no subscribers are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue depth used by [`channel`](Self::channel)
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Deliver one reading to every subscriber. Returns how many accepted it.
    pub fn broadcast(&self, reading: &Reading) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        {
            let subs = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for sub in subs.iter() {
                let result = panic::catch_unwind(AssertUnwindSafe(|| sub.endpoint.send(reading)));
                match result {
                    Ok(Ok(())) => delivered += 1,
                    Ok(Err(DeliveryError::Full)) => {
                        warn!(subscriber = %sub.id, "Subscriber lagging, reading dropped");
                    }
                    Ok(Err(DeliveryError::Closed)) => {
                        debug!(subscriber = %sub.id, "Subscriber endpoint closed");
                        failed.push(sub.id);
                    }
                    Err(_) => {
                        warn!(subscriber = %sub.id, "Subscriber endpoint panicked");
                        failed.push(sub.id);
                    }
                }
            }
        }

        if !failed.is_empty() {
            let mut subs = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            subs.retain(|s| !failed.contains(&s.id));
            info!(
                removed = failed.len(),
                total = subs.len(),
                "Dropped failed subscribers"
            );
        }

        delivered
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Sink for BroadcastHub {
    fn deliver(&self, reading: &Reading) {
        self.broadcast(reading);
    }
}
