use std::collections::VecDeque;

/// Fixed-capacity in-memory FIFO with drop-oldest eviction.
///
/// All operations are O(1). The buffer never errors: when full, `add`
/// evicts and returns the oldest element, while `add_front` (used for
/// requeueing failed deliveries) evicts the *newest* element instead,
/// trading recency for the priority of the requeued item. Callers are
/// responsible for counting the returned evictions.
#[derive(Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an item, evicting and returning the oldest if at capacity.
    pub fn add(&mut self, item: T) -> Option<T> {
        let dropped = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        dropped
    }

    /// Prepends an item, evicting and returning the *newest* if at capacity.
    pub fn add_front(&mut self, item: T) -> Option<T> {
        let dropped = if self.items.len() == self.capacity {
            self.items.pop_back()
        } else {
            None
        };
        self.items.push_front(item);
        dropped
    }

    /// FIFO dequeue.
    pub fn get(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn usage_percent(&self) -> f64 {
        (self.items.len() as f64 / self.capacity as f64) * 100.0
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_evicts_oldest_at_capacity() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.add("a"), None);
        assert_eq!(ring.add("b"), None);
        assert_eq!(ring.add("c"), None);
        assert_eq!(ring.add("d"), Some("a"));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.get(), Some("b"));
        assert_eq!(ring.get(), Some("c"));
        assert_eq!(ring.get(), Some("d"));
        assert!(ring.is_empty());
    }

    #[test]
    fn add_front_evicts_newest_at_capacity() {
        let mut ring = RingBuffer::new(3);
        ring.add(1);
        ring.add(2);
        ring.add(3);
        // 3 is the newest; the requeued 0 takes its place
        assert_eq!(ring.add_front(0), Some(3));
        assert_eq!(ring.get(), Some(0));
        assert_eq!(ring.get(), Some(1));
        assert_eq!(ring.get(), Some(2));
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let mut ring = RingBuffer::new(8);
        for i in 0..1_000 {
            ring.add(i);
            assert!(ring.len() <= ring.capacity());
        }
    }

    #[test]
    fn usage_percent_tracks_occupancy() {
        let mut ring = RingBuffer::new(10);
        assert_eq!(ring.usage_percent(), 0.0);
        for i in 0..5 {
            ring.add(i);
        }
        assert!((ring.usage_percent() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut ring = RingBuffer::new(2);
        ring.add("x");
        assert_eq!(ring.peek(), Some(&"x"));
        assert_eq!(ring.len(), 1);
        ring.clear();
        assert!(ring.peek().is_none());
    }
}
