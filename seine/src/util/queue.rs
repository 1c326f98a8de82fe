use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// An async-friendly unbounded FIFO with head insertion. In contrast to a
/// channel, entries can be restacked at the front so a failed block is
/// retried before any successor. Multiple producers may push; consumption
/// assumes a single consumer.
pub struct PendingQueue<T> {
    /// The actual items. New items are appended at the back and popped off
    /// the front; restacked items go back in at the front.
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        PendingQueue {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
        self.notify.notify_one();
    }

    /// Restack: insert at the front so the item is the next one consumed.
    pub fn push_front(&self, item: T) {
        self.items.lock().unwrap().push_front(item);
        self.notify.notify_one();
    }

    /// Take the front item, waiting until one is available.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    /// Apply `f` to the front item without removing it.
    ///
    /// This locks the queue while it is executing, and `f` should therefore
    /// not do any slow work.
    pub fn peek_front_with<B, F>(&self, f: F) -> Option<B>
    where
        F: FnOnce(&T) -> B,
    {
        self.items.lock().unwrap().front().map(f)
    }
}
