//! Fixed capacity record pools.
//!
//! Records never move once allocated, which is what lets the controller hold their physical
//! addresses. Handles carry a generation so that a handle to a freed slot never resolves, even
//! after the slot has been handed out again.

use log::error;
use std::{fmt, hash, marker::PhantomData};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum PoolError {
    #[error("slot is not allocated")]
    NotAllocated,
}

/// A generation-checked handle into a [Pool].
pub struct Id<T> {
    index: u16,
    generation: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    fn new(index: u16, generation: u16) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> usize {
        usize::from(self.index)
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Id<T> {}

impl<T> hash::Hash for Id<T> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    value: T,
    generation: u16,
    live: bool,
    next_free: Option<u16>,
}

pub struct Pool<T, const N: usize> {
    name: &'static str,
    slots: [Slot<T>; N],
    free: Option<u16>,
    available: usize,
}

impl<T: Default, const N: usize> Pool<T, N> {
    pub fn new(name: &'static str) -> Self {
        assert!(N <= usize::from(u16::MAX));
        let slots = core::array::from_fn(|i| Slot {
            value: T::default(),
            generation: 0,
            live: false,
            next_free: if i + 1 < N { Some((i + 1) as u16) } else { None },
        });
        Self {
            name,
            slots,
            free: if N > 0 { Some(0) } else { None },
            available: N,
        }
    }
}

impl<T, const N: usize> Pool<T, N> {
    /// Takes a free slot and stores `value` in it. Returns `None` when the pool is exhausted.
    pub fn alloc(&mut self, value: T) -> Option<Id<T>> {
        let index = self.free?;
        let slot = &mut self.slots[usize::from(index)];
        self.free = slot.next_free.take();
        slot.live = true;
        slot.value = value;
        self.available -= 1;
        Some(Id::new(index, slot.generation))
    }

    /// Returns a slot to the pool. Freeing a slot twice, or through a stale handle, is a bug in
    /// the caller and is reported rather than ignored.
    pub fn free(&mut self, id: Id<T>) -> Result<(), PoolError> {
        if !self.contains(id) {
            error!("{} pool: free of unallocated slot {:?}", self.name, id);
            return Err(PoolError::NotAllocated);
        }
        let slot = &mut self.slots[id.index()];
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free;
        self.free = Some(id.index);
        self.available += 1;
        Ok(())
    }

    pub fn contains(&self, id: Id<T>) -> bool {
        self.slots
            .get(id.index())
            .map_or(false, |slot| slot.live && slot.generation == id.generation)
    }

    pub fn get(&self, id: Id<T>) -> Option<&T> {
        match self.slots.get(id.index()) {
            Some(slot) if slot.live && slot.generation == id.generation => Some(&slot.value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        match self.slots.get_mut(id.index()) {
            Some(slot) if slot.live && slot.generation == id.generation => Some(&mut slot.value),
            _ => None,
        }
    }

    /// Live records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.live
                .then(|| (Id::new(i as u16, slot.generation), &slot.value))
        })
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn never_hands_out_a_live_slot_twice() {
        let mut pool = Pool::<u32, 4>::new("test");
        let mut live = Vec::new();
        // A fixed interleaving of allocations and frees that cycles every slot several times.
        for round in 0..32u32 {
            if round % 3 == 2 {
                let id = live.remove(0);
                let before = pool.available();
                pool.free(id).unwrap();
                assert_eq!(pool.available(), before + 1);
            } else if let Some(id) = pool.alloc(round) {
                live.push(id);
            } else {
                assert_eq!(live.len(), pool.capacity());
            }
            let slots: HashSet<usize> = live.iter().map(|id| id.index()).collect();
            assert_eq!(slots.len(), live.len());
            assert_eq!(pool.available(), pool.capacity() - live.len());
        }
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut pool = Pool::<u8, 2>::new("test");
        assert!(pool.alloc(1).is_some());
        assert!(pool.alloc(2).is_some());
        assert!(pool.alloc(3).is_none());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut pool = Pool::<u8, 1>::new("test");
        let first = pool.alloc(1).unwrap();
        pool.free(first).unwrap();
        assert_eq!(pool.free(first), Err(PoolError::NotAllocated));

        let second = pool.alloc(2).unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(pool.get(first).is_none());
        assert_eq!(pool.get(second), Some(&2));
        assert_eq!(pool.iter().count(), 1);
    }
}
