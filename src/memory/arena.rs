use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Handle returned by the arena allocator.
///
/// A handle carries the generation of the slot it was issued for. Once the
/// value is removed the slot's generation moves on, so stale handles resolve to
/// `None` instead of aliasing whatever reuses the slot.
pub struct ArenaHandle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ArenaHandle<T> {
    fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for ArenaHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaHandle<T> {}

impl<T> PartialEq for ArenaHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for ArenaHandle<T> {}

impl<T> Hash for ArenaHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for ArenaHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaHandle({}v{})", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Slot arena with a free list. Removed slots are recycled under a new
/// generation.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn allocate(&mut self, value: T) -> ArenaHandle<T> {
        self.len += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let (generation, next_free) = match slot {
                Slot::Vacant {
                    generation,
                    next_free,
                } => (generation.wrapping_add(1), *next_free),
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *slot = Slot::Occupied { generation, value };
            self.free_head = next_free;
            return ArenaHandle::new(index as usize, generation);
        }
        let handle = ArenaHandle::new(self.slots.len(), 0);
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        handle
    }

    pub fn get(&self, handle: ArenaHandle<T>) -> Option<&T> {
        match self.slots.get(handle.index()) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: ArenaHandle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index()) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, handle: ArenaHandle<T>) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: ArenaHandle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {}
            _ => return None,
        }
        let vacant = Slot::Vacant {
            generation: handle.generation,
            next_free: self.free_head,
        };
        let previous = std::mem::replace(slot, vacant);
        self.free_head = Some(handle.index);
        self.len -= 1;
        match previous {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArenaHandle<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((ArenaHandle::new(index, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_roundtrip() {
        let mut arena = Arena::new();
        let handle_a = arena.allocate("hello");
        let handle_b = arena.allocate("world");
        assert_eq!(arena.get(handle_a), Some(&"hello"));
        assert_eq!(arena.get(handle_b), Some(&"world"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn removed_handle_goes_stale() {
        let mut arena = Arena::new();
        let handle = arena.allocate(7u32);
        assert_eq!(arena.remove(handle), Some(7));
        assert!(arena.get(handle).is_none());
        assert!(arena.remove(handle).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn recycled_slot_gets_new_generation() {
        let mut arena = Arena::new();
        let first = arena.allocate("first");
        arena.remove(first);
        let second = arena.allocate("second");
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(arena.get(first).is_none());
        assert_eq!(arena.get(second), Some(&"second"));
        assert_eq!(arena.iter().count(), 1);
    }
}
