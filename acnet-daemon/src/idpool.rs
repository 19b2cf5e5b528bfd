//! Fixed-capacity pool of records addressed by 16-bit ids.
//!
//! An id is `index | bank` where `bank` is a per-pool random tag with the
//! capacity bit always set. Lookups check the bank, so an id kept by a client
//! across a release/realloc cycle (or across a daemon restart) dereferences
//! to nothing instead of to an unrelated record.

use rand::Rng;
use std::collections::VecDeque;

pub struct IdPool<T> {
    bank: u16,
    slots: Vec<Option<T>>,
    free: VecDeque<u16>,
    max_active: usize,
}

impl<T> IdPool<T> {
    /// Capacity must be a power of two no larger than 2^15.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two() && capacity <= 0x8000);

        let mask = (capacity - 1) as u16;
        let bank = (rand::thread_rng().gen::<u16>() & !mask) | capacity as u16;

        IdPool {
            bank,
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity as u16).collect(),
            max_active: 0,
        }
    }

    fn index_of(&self, id: u16) -> Option<usize> {
        let index = (id & (self.slots.len() - 1) as u16) as usize;

        if index as u16 | self.bank == id && self.slots[index].is_some() {
            Some(index)
        } else {
            None
        }
    }

    /// Reserve a slot for `value`. Returns `None` when the pool is exhausted.
    pub fn alloc(&mut self, value: T) -> Option<u16> {
        let index = self.free.pop_front()?;

        self.slots[index as usize] = Some(value);
        self.max_active = self.max_active.max(self.active_count());
        Some(index | self.bank)
    }

    pub fn get(&self, id: u16) -> Option<&T> {
        self.index_of(id)
            .and_then(|index| self.slots[index].as_ref())
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut T> {
        self.index_of(id)
            .and_then(|index| self.slots[index].as_mut())
    }

    /// Return the record to the free list (FIFO, to maximize id reuse
    /// distance). Stale ids are ignored.
    pub fn release(&mut self, id: u16) -> Option<T> {
        let index = self.index_of(id)?;

        self.free.push_back(index as u16);
        self.slots[index].take()
    }

    /// Iterate the active records with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(move |(index, slot)| {
                slot.as_ref().map(|value| (index as u16 | self.bank, value))
            })
    }

    pub fn active_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn max_active_count(&self) -> usize {
        self.max_active
    }
}
