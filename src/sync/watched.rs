//! Thread-safe ordered set with removal waits.

use std::sync::Mutex;

use tokio::sync::watch;

/// How a wait on a [`WatchedCollection`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// The awaited items were removed one by one.
    Removed,
    /// The collection was cleared after the wait's generation.
    Cleared,
}

#[derive(Debug)]
struct Items<T> {
    items: Vec<T>,
    clears: u64,
}

/// An insertion-ordered set whose removals can be awaited.
///
/// Every removal (and `clear`) bumps a revision counter; waiters subscribe
/// to the counter *before* re-checking membership, so a removal racing the
/// check is never lost. Waits are tied to a [`generation`](Self::generation)
/// so an item dropped by `clear` is never mistaken for one that was removed.
#[derive(Debug)]
pub struct WatchedCollection<T> {
    inner: Mutex<Items<T>>,
    revision: watch::Sender<u64>,
}

impl<T: PartialEq + Clone> WatchedCollection<T> {
    /// Create an empty collection.
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Items {
                items: Vec::new(),
                clears: 0,
            }),
            revision,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Items<T>> {
        self.inner.lock().expect("watched collection mutex poisoned")
    }

    /// Number of times the collection has been cleared. Read it before
    /// inserting the items a later wait is about.
    pub fn generation(&self) -> u64 {
        self.lock().clears
    }

    /// Add `item` unless already present. Returns whether it was added.
    pub fn insert(&self, item: T) -> bool {
        let mut inner = self.lock();
        if inner.items.contains(&item) {
            return false;
        }
        inner.items.push(item);
        true
    }

    /// Remove `item`. Returns `true` exactly once per inserted item.
    pub fn remove(&self, item: &T) -> bool {
        let removed = {
            let mut inner = self.lock();
            match inner.items.iter().position(|candidate| candidate == item) {
                Some(index) => {
                    inner.items.remove(index);
                    true
                }
                None => false,
            }
        };

        if removed {
            self.revision.send_modify(|revision| *revision += 1);
        }
        removed
    }

    /// Drop everything. Pending waits resolve to [`Settled::Cleared`].
    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.items.clear();
            inner.clears += 1;
        }
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Whether `item` is currently present.
    pub fn contains(&self, item: &T) -> bool {
        self.lock().items.contains(item)
    }

    /// Number of items present.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current items in insertion order.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().items.clone()
    }

    /// Wait until `item` is no longer present.
    pub async fn wait_removed(&self, item: &T, generation: u64) -> Settled {
        self.wait_until(generation, |items| !items.contains(item)).await
    }

    /// Wait until the collection is empty.
    pub async fn wait_empty(&self, generation: u64) -> Settled {
        self.wait_until(generation, |items| items.is_empty()).await
    }

    async fn wait_until(&self, generation: u64, done: impl Fn(&[T]) -> bool) -> Settled {
        let mut rx = self.revision.subscribe();
        loop {
            {
                let inner = self.lock();
                if inner.clears != generation {
                    return Settled::Cleared;
                }
                if done(inner.items.as_slice()) {
                    return Settled::Removed;
                }
            }
            if rx.changed().await.is_err() {
                return Settled::Cleared;
            }
        }
    }
}

impl<T: PartialEq + Clone> Default for WatchedCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn insert_is_set_like() {
        let set = WatchedCollection::new();
        assert!(set.insert(1));
        assert!(!set.insert(1));
        assert!(set.insert(2));
        assert_eq!(set.snapshot(), vec![1, 2]);

        assert!(set.remove(&1));
        assert!(!set.remove(&1));
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn wait_removed_resolves_for_matching_item_only() {
        let set = Arc::new(WatchedCollection::new());
        let generation = set.generation();
        set.insert("a");
        set.insert("b");

        let waiter = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.wait_removed(&"a", generation).await })
        };

        set.remove(&"b");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "removing another item must not wake the waiter");

        set.remove(&"a");
        let settled = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not released")
            .unwrap();
        assert_eq!(settled, Settled::Removed);
    }

    #[tokio::test]
    async fn wait_empty_after_last_removal() {
        let set = Arc::new(WatchedCollection::new());
        let generation = set.generation();
        set.insert(10u32);
        set.insert(11u32);

        let waiter = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.wait_empty(generation).await })
        };

        set.remove(&11);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        set.remove(&10);
        let settled = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("emptied wait not released")
            .unwrap();
        assert_eq!(settled, Settled::Removed);
    }

    #[tokio::test]
    async fn clear_is_reported_distinctly() {
        let set = Arc::new(WatchedCollection::new());
        let generation = set.generation();
        set.insert(1u8);
        set.insert(2u8);

        let one = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.wait_removed(&1, generation).await })
        };
        let all = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.wait_empty(generation).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        set.clear();
        assert_eq!(one.await.unwrap(), Settled::Cleared);
        assert_eq!(all.await.unwrap(), Settled::Cleared);
        assert_eq!(set.generation(), generation + 1);
    }

    #[tokio::test]
    async fn clear_before_the_wait_starts_is_still_seen() {
        let set: WatchedCollection<u8> = WatchedCollection::new();
        let generation = set.generation();
        set.insert(5);
        set.clear();

        assert_eq!(set.wait_removed(&5, generation).await, Settled::Cleared);
        assert_eq!(set.wait_empty(set.generation()).await, Settled::Removed);
    }

    #[tokio::test]
    async fn waits_on_absent_items_return_immediately() {
        let set: WatchedCollection<u8> = WatchedCollection::new();
        assert_eq!(set.wait_removed(&7, set.generation()).await, Settled::Removed);
        assert_eq!(set.wait_empty(set.generation()).await, Settled::Removed);
    }
}
