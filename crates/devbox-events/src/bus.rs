//! In-process, synchronous publish/subscribe keyed by event type.
//!
//! Subscribers are values implementing [`Subscriber<E>`]; each one decides per
//! event whether it stays registered by returning a [`Delivery`]. Registration
//! hands back a [`Subscription`] guard that unregisters on drop, so a waiter
//! that gives up never leaves a handler behind.
//!
//! Delivery happens on the publishing thread. The subscriber table lock is not
//! held while handlers run, which lets a handler publish or unsubscribe from
//! inside `on_event`. A subscriber registered after an event was published
//! never sees it; nothing is persisted or retried.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;

/// What a subscriber wants after handling an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
    Keep,
    Unsubscribe,
}

pub trait Subscriber<E>: Send + Sync {
    fn on_event(&self, event: &E) -> Delivery;
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(u64);

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<TypeId, Vec<Registered>>>,
}

#[derive(Clone)]
struct Registered {
    id: SubscriptionId,
    handler: Arc<dyn ErasedSubscriber>,
}

trait ErasedSubscriber: Send + Sync {
    fn deliver(&self, event: &dyn Any) -> Delivery;
}

struct Typed<E, S> {
    subscriber: S,
    _event: PhantomData<fn(&E)>,
}

impl<E, S> ErasedSubscriber for Typed<E, S>
where
    E: Any,
    S: Subscriber<E>,
{
    fn deliver(&self, event: &dyn Any) -> Delivery {
        match event.downcast_ref::<E>() {
            Some(event) => self.subscriber.on_event(event),
            None => Delivery::Keep,
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `subscriber` for events of type `E`.
    ///
    /// The returned guard unregisters the subscriber when dropped.
    #[must_use = "dropping the subscription unregisters the subscriber"]
    pub fn subscribe<E, S>(&self, subscriber: S) -> Subscription
    where
        E: Any + Send + Sync,
        S: Subscriber<E> + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Arc<dyn ErasedSubscriber> = Arc::new(Typed::<E, S> {
            subscriber,
            _event: PhantomData,
        });
        self.inner
            .subscribers
            .write()
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Registered { id, handler });
        trace!(event = std::any::type_name::<E>(), id = id.0, "subscribe");
        Subscription {
            bus: self.clone(),
            event_type: TypeId::of::<E>(),
            id,
        }
    }

    /// Removes a subscriber for `E`. Returns false if it was already gone.
    pub fn unsubscribe<E: Any>(&self, id: SubscriptionId) -> bool {
        self.remove(TypeId::of::<E>(), id)
    }

    /// Delivers `event` to every subscriber of `E` registered at call time.
    pub fn publish<E: Any + Send + Sync>(&self, event: E) {
        let event_type = TypeId::of::<E>();
        let targets: Vec<Registered> = self
            .inner
            .subscribers
            .read()
            .get(&event_type)
            .cloned()
            .unwrap_or_default();
        trace!(
            event = std::any::type_name::<E>(),
            subscribers = targets.len(),
            "publish"
        );

        let finished: Vec<SubscriptionId> = targets
            .iter()
            .filter(|registered| registered.handler.deliver(&event) == Delivery::Unsubscribe)
            .map(|registered| registered.id)
            .collect();
        for id in finished {
            self.remove(event_type, id);
        }
    }

    pub fn subscriber_count<E: Any>(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }

    /// Drops every subscriber of every event type.
    pub fn clear(&self) {
        self.inner.subscribers.write().clear();
    }

    fn remove(&self, event_type: TypeId, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let Some(registered) = subscribers.get_mut(&event_type) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|entry| entry.id != id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            subscribers.remove(&event_type);
        }
        removed
    }
}

/// Scoped registration: unregisters its subscriber on drop.
#[must_use = "dropping the subscription unregisters the subscriber"]
pub struct Subscription {
    bus: EventBus,
    event_type: TypeId,
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// True while the subscriber is still registered on the bus.
    pub fn is_active(&self) -> bool {
        self.bus
            .inner
            .subscribers
            .read()
            .get(&self.event_type)
            .is_some_and(|registered| registered.iter().any(|entry| entry.id == self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.remove(self.event_type, self.id);
    }
}
