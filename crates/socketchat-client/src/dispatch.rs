//! Dispatch of decoded messages to the presentation layer
//!
//! Two delivery paths share one registry:
//!
//! - a single primary `MessageListener`, replaced last-write-wins and invoked
//!   synchronously on the receive task;
//! - a bounded, ordered set of channel subscribers, each draining its own
//!   bounded queue on its own schedule. A subscriber whose queue is full is
//!   pruned: it receives what was already queued, then `None`.
//!
//! A message that finds neither is dropped and counted; it is not queued for
//! listeners registered later.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use socketchat_core::{Message, SubscriptionError};

// ----------------------------------------------------------------------------
// Listener Trait
// ----------------------------------------------------------------------------

/// Callback receiving every decoded inbound message
///
/// Runs on the connection's receive task. Implementations must return quickly
/// and hand any presentation work to their own thread or queue; while the
/// callback runs, no further frames are read.
pub trait MessageListener: Send + Sync {
    fn on_message_received(&self, message: &Message);
}

impl<F> MessageListener for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn on_message_received(&self, message: &Message) {
        self(message)
    }
}

// ----------------------------------------------------------------------------
// Subscriptions
// ----------------------------------------------------------------------------

/// Handle identifying one channel subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    sender: mpsc::Sender<Message>,
}

/// Receiving end of a channel subscription
///
/// Dropping the subscription unregisters it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<Message>,
    registry: Weak<DispatchRegistry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next message
    ///
    /// Returns `None` once the subscription has been unregistered or pruned
    /// and its queue drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Take the next queued message without waiting
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatch Registry
// ----------------------------------------------------------------------------

/// Routes inbound messages to the primary listener and subscribers
pub struct DispatchRegistry {
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    max_subscribers: usize,
    queue_capacity: usize,
    next_subscription_id: AtomicU64,
    undelivered: AtomicU64,
}

impl std::fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("has_listener", &self.has_listener())
            .field("subscribers", &self.subscriber_count())
            .field("max_subscribers", &self.max_subscribers)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl DispatchRegistry {
    /// Registry for up to `max_subscribers` subscribers, each queueing at
    /// most `queue_capacity` undrained messages
    pub fn new(max_subscribers: usize, queue_capacity: usize) -> Self {
        Self {
            listener: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
            max_subscribers,
            queue_capacity: queue_capacity.max(1),
            next_subscription_id: AtomicU64::new(1),
            undelivered: AtomicU64::new(0),
        }
    }

    /// Replace the primary listener, returning the previous one
    ///
    /// A message already being delivered finishes with the listener it
    /// started with; every later message goes to the new one.
    pub fn set_message_listener(
        &self,
        listener: Arc<dyn MessageListener>,
    ) -> Option<Arc<dyn MessageListener>> {
        let mut slot = self.listener.write().unwrap_or_else(PoisonError::into_inner);
        let previous = slot.replace(listener);
        debug!(
            "Message listener {}",
            if previous.is_some() { "replaced" } else { "registered" }
        );
        previous
    }

    /// Remove the primary listener
    pub fn clear_message_listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.listener
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn has_listener(&self) -> bool {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Register a channel subscriber
    pub fn subscribe(self: &Arc<Self>) -> Result<Subscription, SubscriptionError> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        if subscribers.len() >= self.max_subscribers {
            return Err(SubscriptionError::LimitReached {
                max: self.max_subscribers,
            });
        }

        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        subscribers.push(Subscriber { id, sender });
        debug!("Subscriber {:?} registered ({} active)", id, subscribers.len());

        Ok(Subscription {
            id,
            receiver,
            registry: Arc::downgrade(self),
        })
    }

    /// Unregister a subscriber by handle
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Messages that reached neither a listener nor a subscriber
    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }

    /// Deliver one message; returns the number of recipients reached
    pub fn dispatch(&self, message: &Message) -> usize {
        // Snapshot so the callback runs without holding the lock
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut delivered = 0;
        if let Some(listener) = listener {
            listener.on_message_received(message);
            delivered += 1;
        }

        {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            subscribers.retain(|subscriber| match subscriber.sender.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Pruning subscriber {:?}: {} messages queued and not drained",
                        subscriber.id, self.queue_capacity
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Pruning closed subscriber {:?}", subscriber.id);
                    false
                }
            });
        }

        if delivered == 0 {
            self.undelivered.fetch_add(1, Ordering::Relaxed);
            trace!("No recipients for {:?} message", message.message_type());
        }
        delivered
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
