//! Bounded ring of events with TTL pruning and subscription.

use crate::event::Event;
use chrono::{Duration as ChronoDuration, Utc};
use mapcache_core::EventBufferConfig;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Ledger of recent cache mutations.
///
/// Holds at most `max_size` events; when a TTL is configured, events older
/// than it are dropped whenever the buffer is touched. Subscribers receive
/// every event added after they subscribed. A subscriber that falls more
/// than `max_size` events behind observes a lag error from the channel.
#[derive(Debug)]
pub struct EventsBuffer {
    events: Mutex<VecDeque<Event>>,
    max_size: usize,
    ttl: Option<ChronoDuration>,
    sender: broadcast::Sender<Event>,
}

impl EventsBuffer {
    pub fn new(max_size: usize, ttl: std::time::Duration) -> Self {
        let max_size = max_size.max(1);
        let (sender, _) = broadcast::channel(max_size);
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_size)),
            max_size,
            ttl: (!ttl.is_zero())
                .then(|| ChronoDuration::from_std(ttl).ok())
                .flatten(),
            sender,
        }
    }

    /// Buffer for an enabled config; `None` when the ledger is switched off.
    pub fn from_config(config: &EventBufferConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.max_size, config.ttl))
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Record an event and forward it to subscribers.
    pub fn add(&self, event: Event) {
        let mut events = self.lock();
        self.prune(&mut events);
        while events.len() >= self.max_size {
            events.pop_front();
        }
        events.push_back(event.clone());
        drop(events);

        // No receivers is not an error for a ledger.
        let _ = self.sender.send(event);
    }

    /// Visit retained events, oldest first.
    pub fn dump<F>(&self, mut callback: F)
    where
        F: FnMut(&Event),
    {
        let mut events = self.lock();
        self.prune(&mut events);
        events.iter().for_each(|e| callback(e));
    }

    /// Copy of retained events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        let mut out = Vec::new();
        self.dump(|e| out.push(e.clone()));
        out
    }

    /// Receive events added from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Retained events plus a receiver for later ones, with no gap or
    /// overlap between the two.
    pub fn dump_and_subscribe(&self) -> (Vec<Event>, broadcast::Receiver<Event>) {
        let mut events = self.lock();
        self.prune(&mut events);
        let receiver = self.sender.subscribe();
        (events.iter().cloned().collect(), receiver)
    }

    pub fn len(&self) -> usize {
        let mut events = self.lock();
        self.prune(&mut events);
        events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn prune(&self, events: &mut VecDeque<Event>) {
        let Some(ttl) = self.ttl else {
            return;
        };
        let cutoff = Utc::now() - ttl;
        let before = events.len();
        while events.front().is_some_and(|e| e.timestamp < cutoff) {
            events.pop_front();
        }
        let pruned = before - events.len();
        if pruned > 0 {
            tracing::trace!(pruned, "pruned expired map events");
        }
    }

    // The ledger holds plain data, so a panic elsewhere cannot leave it
    // half-updated.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Action;
    use proptest::prelude::*;
    use std::time::Duration;

    fn event(key: &str) -> Event {
        Event::new(Action::Update, key)
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        assert!(EventsBuffer::from_config(&EventBufferConfig::default()).is_none());
        let buffer =
            EventsBuffer::from_config(&EventBufferConfig::enabled(4, Duration::ZERO)).unwrap();
        assert_eq!(buffer.max_size(), 4);
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let buffer = EventsBuffer::new(3, Duration::ZERO);
        for key in ["a", "b", "c", "d"] {
            buffer.add(event(key));
        }
        let keys: Vec<_> = buffer.events().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_ttl_prunes_old_events() {
        let buffer = EventsBuffer::new(10, Duration::from_secs(60));
        buffer.add(event("stale").with_timestamp(Utc::now() - ChronoDuration::seconds(120)));
        buffer.add(event("fresh"));

        let keys: Vec<_> = buffer.events().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["fresh"]);
    }

    #[test]
    fn test_zero_ttl_keeps_everything() {
        let buffer = EventsBuffer::new(10, Duration::ZERO);
        buffer.add(event("old").with_timestamp(Utc::now() - ChronoDuration::days(365)));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_subscriber_receives_new_events() {
        let buffer = EventsBuffer::new(8, Duration::ZERO);
        buffer.add(event("before"));

        let (existing, mut rx) = buffer.dump_and_subscribe();
        assert_eq!(existing.len(), 1);
        assert!(rx.try_recv().is_err());

        buffer.add(event("after"));
        assert_eq!(rx.try_recv().unwrap().key, "after");
    }

    #[test]
    fn test_clear() {
        let buffer = EventsBuffer::new(8, Duration::ZERO);
        buffer.add(event("a"));
        buffer.clear();
        assert!(buffer.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// The buffer never exceeds its size and keeps the newest events.
        #[test]
        fn prop_bounded_and_newest(max_size in 1usize..32, n in 0usize..100) {
            let buffer = EventsBuffer::new(max_size, Duration::ZERO);
            for i in 0..n {
                buffer.add(event(&i.to_string()));
            }
            let events = buffer.events();
            prop_assert_eq!(events.len(), n.min(max_size));
            if let Some(last) = events.last() {
                prop_assert_eq!(last.key.clone(), (n - 1).to_string());
            }
        }
    }
}
