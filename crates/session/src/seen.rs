use std::collections::{HashMap, VecDeque};

use moltlink_core::{ChannelRef, MessageRef};

type SeenKey = (ChannelRef, MessageRef);

/// Raw messages already consumed, bounded by an LRU cap.
///
/// Every hit refreshes the entry, so a message the feed keeps re-serving is
/// never evicted while it is still being served.
pub struct SeenSet {
    capacity: usize,
    stamps: HashMap<SeenKey, u64>,
    order: VecDeque<(SeenKey, u64)>,
    clock: u64,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            stamps: HashMap::new(),
            order: VecDeque::new(),
            clock: 0,
        }
    }

    /// Mark `(channel, id)` consumed. Returns `false` if it already was.
    pub fn insert(&mut self, channel: &ChannelRef, id: &MessageRef) -> bool {
        let key = (channel.clone(), id.clone());
        let fresh = !self.stamps.contains_key(&key);
        self.touch(key);
        if fresh {
            self.evict();
        }
        fresh
    }

    pub fn contains(&self, channel: &ChannelRef, id: &MessageRef) -> bool {
        self.stamps.contains_key(&(channel.clone(), id.clone()))
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    fn touch(&mut self, key: SeenKey) {
        self.clock += 1;
        self.stamps.insert(key.clone(), self.clock);
        self.order.push_back((key, self.clock));

        if self.order.len() > self.capacity * 2 {
            let stamps = &self.stamps;
            self.order
                .retain(|(key, stamp)| stamps.get(key) == Some(stamp));
        }
    }

    fn evict(&mut self) {
        while self.stamps.len() > self.capacity {
            let Some((key, stamp)) = self.order.pop_front() else {
                break;
            };
            if self.stamps.get(&key) == Some(&stamp) {
                self.stamps.remove(&key);
            }
        }
    }
}
