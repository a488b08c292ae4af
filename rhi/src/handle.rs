//! Opaque, generational handles to RHI resources.
//!
//! Grounded in `wgpu-core`'s `Registry`/`Storage` arena (index + epoch),
//! simplified: we have one backend and no cross-process sharing, so a
//! single `(index, generation)` pair per resource kind is enough. The
//! generation guards against a freed slot's handle being reused by a
//! stale caller after the slot is recycled for a new resource.

use std::marker::PhantomData;

pub struct Marker<T>(PhantomData<fn() -> T>);

/// A handle into one of the device's resource arenas.
///
/// `index` is the slot in the arena's backing `Vec`; `generation` is
/// bumped every time that slot is reused, so a handle obtained before a
/// `destroy_*` call will never alias a handle obtained after.
pub struct Handle<T> {
    pub(crate) index: u32,
    pub(crate) generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({}, gen {})", self.index, self.generation)
    }
}

pub enum BufferMarker {}
pub enum TextureMarker {}
pub enum SamplerMarker {}
pub enum ShaderMarker {}
pub enum PipelineMarker {}

pub type BufferHandle = Handle<BufferMarker>;
pub type TextureHandle = Handle<TextureMarker>;
pub type SamplerHandle = Handle<SamplerMarker>;
pub type ShaderHandle = Handle<ShaderMarker>;
pub type PipelineHandle = Handle<PipelineMarker>;

enum Slot<T> {
    Occupied(u32, T),
    /// Carries the generation the *next* occupant of this slot will get.
    Free(u32),
}

/// A generational arena: a `Vec` of slots, each either occupied or free,
/// with a generation counter bumped on every remove so stale handles are
/// rejected rather than silently resolving to the wrong object.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> (Handle<T>, u32) {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match *slot {
                Slot::Free(generation) => generation,
                Slot::Occupied(..) => unreachable!("free_list pointed at an occupied slot"),
            };
            *slot = Slot::Occupied(generation, value);
            (Handle::new(index, generation), index)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied(0, value));
            (Handle::new(index, 0), index)
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied(generation, value)) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied(generation, value)) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let matches = matches!(
            self.slots.get(handle.index as usize),
            Some(Slot::Occupied(generation, _)) if *generation == handle.generation
        );
        if !matches {
            return None;
        }
        let next_generation = handle.generation.wrapping_add(1);
        let slot = std::mem::replace(
            &mut self.slots[handle.index as usize],
            Slot::Free(next_generation),
        );
        self.free_list.push(handle.index);
        match slot {
            Slot::Occupied(_, value) => Some(value),
            Slot::Free(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            if let Slot::Occupied(generation, value) = slot {
                Some((Handle::new(index as u32, *generation), value))
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_roundtrip() {
        let mut arena: Arena<u32> = Arena::new();
        let (h, _) = arena.insert(42);
        assert_eq!(arena.get(h), Some(&42));
    }

    #[test]
    fn stale_handle_after_remove_is_rejected() {
        let mut arena: Arena<u32> = Arena::new();
        let (h1, _) = arena.insert(1);
        arena.remove(h1);
        let (h2, _) = arena.insert(2);
        assert_eq!(h1.index(), h2.index());
        assert_eq!(arena.get(h1), None);
        assert_eq!(arena.get(h2), Some(&2));
    }
}
