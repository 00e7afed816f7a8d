//! Change notification for applied batches.
//!
//! Every successful batch apply publishes one [`ChangesApplied`] event naming
//! the collections it touched. Each subscriber sees each event at most once;
//! a subscriber that falls more than [`CHANGE_FEED_CAPACITY`] events behind
//! observes a lag error and skips ahead.
//!
//! ```rust,ignore
//! let mut changes = store.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = changes.recv().await {
//!         println!("changed: {:?}", event.collections);
//!     }
//! });
//! ```

use tokio::sync::broadcast;

/// Number of events buffered per subscriber.
pub const CHANGE_FEED_CAPACITY: usize = 256;

/// Collections affected by one applied batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesApplied {
    /// Distinct collection names, in first-seen order.
    pub collections: Vec<String>,
}

/// Broadcast channel carrying [`ChangesApplied`] events.
#[derive(Debug)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangesApplied>,
}

impl ChangeFeed {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { sender }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangesApplied> {
        self.sender.subscribe()
    }

    /// Publishes the collections touched by a batch.
    ///
    /// Empty batches and batches with no subscribers are dropped.
    pub fn publish<I, S>(&self, collections: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut distinct: Vec<String> = Vec::new();
        for name in collections {
            let name = name.as_ref();
            if !distinct.iter().any(|c| c == name) {
                distinct.push(name.to_string());
            }
        }
        if distinct.is_empty() {
            return;
        }
        // Err only means nobody is listening.
        let _ = self.sender.send(ChangesApplied {
            collections: distinct,
        });
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicates_in_first_seen_order() {
        let feed = ChangeFeed::new();
        let mut rx = feed.subscribe();

        feed.publish(["b", "a", "b", "c", "a"]);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.collections, vec!["b", "a", "c"]);
    }

    #[test]
    fn every_subscriber_receives_once() {
        let feed = ChangeFeed::new();
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 2);

        feed.publish(["users"]);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn empty_batches_are_not_published() {
        let feed = ChangeFeed::new();
        let mut rx = feed.subscribe();
        feed.publish(Vec::<String>::new());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let feed = ChangeFeed::new();
        feed.publish(["users"]);
        assert_eq!(feed.subscriber_count(), 0);
    }
}
