//! Slab-backed doubly linked list used for LRU ordering inside a shard.
//!
//! Slots are recycled through a free list so steady-state operation does
//! not allocate. A `SlotId` stays valid until the entry it names is
//! removed; callers own that bookkeeping.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotId(usize);

/// Which LRU segment an item currently sits in, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    /// Not linked into either segment (pending inserts).
    None,
    Younger(SlotId),
    Older(SlotId),
}

struct Slot<K> {
    key: Option<K>,
    prev: Option<usize>,
    next: Option<usize>,
}

pub(crate) struct LruList<K> {
    slots: Vec<Slot<K>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<K> LruList<K> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_front(&mut self, key: K) -> SlotId {
        let slot = Slot {
            key: Some(key),
            prev: None,
            next: self.head,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        if let Some(head) = self.head {
            self.slots[head].prev = Some(index);
        } else {
            self.tail = Some(index);
        }
        self.head = Some(index);
        self.len += 1;
        SlotId(index)
    }

    /// Unlinks the slot and returns its key. Returns `None` for a slot that
    /// was already removed.
    pub fn remove(&mut self, id: SlotId) -> Option<K> {
        let SlotId(index) = id;
        let key = self.slots.get_mut(index)?.key.take()?;
        let (prev, next) = {
            let slot = &self.slots[index];
            (slot.prev, slot.next)
        };
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.tail = prev,
        }
        self.slots[index].prev = None;
        self.slots[index].next = None;
        self.free.push(index);
        self.len -= 1;
        Some(key)
    }

    pub fn pop_back(&mut self) -> Option<K> {
        let tail = self.tail?;
        self.remove(SlotId(tail))
    }
}
