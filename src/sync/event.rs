//! Typed publish/subscribe events.
//!
//! Subscribers run synchronously on the raising thread, outside any lock the
//! raiser holds. Subscriptions live for the lifetime of the event; services
//! are dropped wholesale when removed, taking their subscribers with them.

use parking_lot::RwLock;
use std::sync::Arc;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A broadcast point for values of one type.
pub struct Event<T> {
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Invoke every subscriber with the value.
    pub fn raise(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self.handlers.read().clone();
        for handler in handlers {
            handler(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn raise_reaches_every_subscriber() {
        let event: Event<u32> = Event::new();
        let seen = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let seen = seen.clone();
            event.subscribe(move |value| {
                seen.fetch_add(*value, Ordering::SeqCst);
            });
        }

        event.raise(&5);
        assert_eq!(seen.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn raise_without_subscribers_is_a_no_op() {
        let event: Event<String> = Event::new();
        event.raise(&"nothing".to_string());
    }
}
