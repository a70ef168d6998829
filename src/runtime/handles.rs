//! Generation-checked handle table for passing host data across threads.
//!
//! A [`Handle`] is a single-owner token: the thread that inserts a value
//! hands the token to another thread, which takes the value back out exactly
//! once. Stale tokens (already taken, or from a recycled slot) resolve to
//! nothing instead of aliasing a newer value.

use std::sync::{Mutex, MutexGuard};

/// Token for one entry in a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Pack into the opaque `u64` carried by native callbacks. Never zero.
    pub fn to_token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

struct Slots<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    live: usize,
}

pub struct HandleTable<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, value: T) -> Handle {
        let mut slots = self.lock();
        slots.live += 1;
        if let Some(index) = slots.free.pop() {
            let entry = &mut slots.entries[index as usize];
            entry.value = Some(value);
            return Handle {
                index,
                generation: entry.generation,
            };
        }
        let index = slots.entries.len() as u32;
        slots.entries.push(Entry {
            generation: 1,
            value: Some(value),
        });
        Handle {
            index,
            generation: 1,
        }
    }

    /// Remove the value. The slot's generation moves on, so `handle` and
    /// every copy of it go stale.
    pub fn take(&self, handle: Handle) -> Option<T> {
        let mut slots = self.lock();
        let entry = slots.entries.get_mut(handle.index as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1).max(1);
        slots.free.push(handle.index);
        slots.live -= 1;
        Some(value)
    }

    /// Borrow the value without removing it.
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slots = self.lock();
        let entry = slots.entries.get(handle.index as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        entry.value.as_ref().map(f)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.with(handle, |_| ()).is_some()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
