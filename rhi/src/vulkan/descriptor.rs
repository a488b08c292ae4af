//! Descriptor management: layout cache, pool manager, frame-local set cache.
//!
//! Follows `wgpu-hal`'s render-pass/framebuffer caching pattern
//! (`rustc_hash::FxHashMap` keyed by a structural hash, guarded by a
//! `parking_lot::Mutex`) generalised to descriptor layouts, pools, and sets.

use std::hash::{Hash, Hasher};

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use rhit::DescriptorBinding;

use super::conv;
use crate::DeviceError;

/// Ordered list of bindings hashed with FNV-1a-like bit mixing (via
/// `rustc_hash`) over each binding's fields in sorted order — the
/// structural hash used as the layout cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorLayoutInfo {
    pub bindings: Vec<DescriptorBinding>,
}

impl DescriptorLayoutInfo {
    pub fn new(mut bindings: Vec<DescriptorBinding>) -> Self {
        bindings.sort_by_key(|b| (b.set, b.binding));
        Self { bindings }
    }

    fn structural_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for binding in &self.bindings {
            binding.set.hash(&mut hasher);
            binding.binding.hash(&mut hasher);
            binding.descriptor_type.hash(&mut hasher);
            binding.count.hash(&mut hasher);
            binding.stage_flags.hash(&mut hasher);
        }
        hasher.finish()
    }
}

struct LayoutEntry {
    raw: vk::DescriptorSetLayout,
    info: DescriptorLayoutInfo,
    ref_count: u32,
    last_used_frame: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub collected: u64,
}

/// Layout cache keyed by structural hash, with refcounting and a GC sweep
/// for entries that have decayed to refcount 0.
pub struct DescriptorLayoutCache {
    inner: Mutex<LayoutCacheInner>,
}

struct LayoutCacheInner {
    entries: FxHashMap<u64, Vec<LayoutEntry>>,
    stats: LayoutCacheStats,
}

impl DescriptorLayoutCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LayoutCacheInner {
                entries: FxHashMap::default(),
                stats: LayoutCacheStats::default(),
            }),
        }
    }

    /// Returns the cached layout handle for `info`, creating it on miss.
    /// Collisions (same hash, different bindings) grow a bucket rather than
    /// overwriting, allocating a new entry for the new binding set.
    pub fn get_or_create(
        &self,
        device: &ash::Device,
        info: DescriptorLayoutInfo,
        current_frame: u64,
    ) -> Result<vk::DescriptorSetLayout, DeviceError> {
        profiling::scope!("DescriptorLayoutCache::get_or_create");
        let hash = info.structural_hash();
        let mut inner = self.inner.lock();

        if let Some(bucket) = inner.entries.get_mut(&hash) {
            if let Some(entry) = bucket.iter_mut().find(|e| e.info == info) {
                entry.ref_count += 1;
                entry.last_used_frame = current_frame;
                inner.stats.hits += 1;
                return Ok(entry.raw);
            }
        }
        inner.stats.misses += 1;
        drop(inner);

        let raw = unsafe { create_native_layout(device, &info)? };

        let mut inner = self.inner.lock();
        inner.entries.entry(hash).or_default().push(LayoutEntry {
            raw,
            info,
            ref_count: 1,
            last_used_frame: current_frame,
        });
        Ok(raw)
    }

    /// Decrements the refcount of the layout matching `raw`. The entry may
    /// survive at refcount 0 for later lookups until [`garbage_collect`]
    /// reclaims it.
    ///
    /// [`garbage_collect`]: Self::garbage_collect
    pub fn release(&self, raw: vk::DescriptorSetLayout) {
        let mut inner = self.inner.lock();
        for bucket in inner.entries.values_mut() {
            if let Some(entry) = bucket.iter_mut().find(|e| e.raw == raw) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                return;
            }
        }
    }

    /// Destroys layouts with refcount 0 whose `last_used_frame` is older
    /// than `max_age` frames relative to `current_frame`.
    pub fn garbage_collect(&self, device: &ash::Device, current_frame: u64, max_age: u64) {
        profiling::scope!("DescriptorLayoutCache::garbage_collect");
        let mut inner = self.inner.lock();
        let mut collected = 0u64;
        for bucket in inner.entries.values_mut() {
            bucket.retain(|entry| {
                let expired = entry.ref_count == 0
                    && current_frame.saturating_sub(entry.last_used_frame) > max_age;
                if expired {
                    unsafe { device.destroy_descriptor_set_layout(entry.raw, None) };
                    collected += 1;
                }
                !expired
            });
        }
        inner.stats.collected += collected;
    }

    pub fn stats(&self) -> LayoutCacheStats {
        self.inner.lock().stats
    }

    pub fn clear(&self, device: &ash::Device) {
        let mut inner = self.inner.lock();
        for bucket in inner.entries.values() {
            for entry in bucket {
                unsafe { device.destroy_descriptor_set_layout(entry.raw, None) };
            }
        }
        inner.entries.clear();
    }
}

unsafe fn create_native_layout(
    device: &ash::Device,
    info: &DescriptorLayoutInfo,
) -> Result<vk::DescriptorSetLayout, DeviceError> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = info
        .bindings
        .iter()
        .map(|b| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(b.binding)
                .descriptor_type(conv::map_descriptor_type(b.descriptor_type))
                .descriptor_count(b.count)
                .stage_flags(conv::map_shader_stage_flags(b.stage_flags))
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    Ok(unsafe { device.create_descriptor_set_layout(&create_info, None)? })
}

/// One fixed-capacity pool tracked by the [`DescriptorPoolManager`].
struct ManagedPool {
    raw: vk::DescriptorPool,
    capacity: u32,
    allocated_count: u32,
    last_used_frame: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorPoolStats {
    pub allocations: u64,
    pub pool_resets: u64,
    pub pools_created: u64,
}

/// Growable list of fixed-capacity descriptor pools, ring-buffered across
/// frames.
pub struct DescriptorPoolManager {
    inner: Mutex<PoolManagerInner>,
    sets_per_pool: u32,
}

struct PoolManagerInner {
    pools: Vec<ManagedPool>,
    current: usize,
    current_frame: u64,
    stats: DescriptorPoolStats,
}

impl DescriptorPoolManager {
    pub fn new(device: &ash::Device, sets_per_pool: u32) -> Result<Self, DeviceError> {
        let first = unsafe { create_pool(device, sets_per_pool)? };
        Ok(Self {
            sets_per_pool,
            inner: Mutex::new(PoolManagerInner {
                pools: vec![ManagedPool {
                    raw: first,
                    capacity: sets_per_pool,
                    allocated_count: 0,
                    last_used_frame: 0,
                }],
                current: 0,
                current_frame: 0,
                stats: DescriptorPoolStats { pools_created: 1, ..Default::default() },
            }),
        })
    }

    /// Allocates one descriptor set matching `layout`, advancing to (or
    /// creating) the next pool on `OUT_OF_POOL_MEMORY` / `full`.
    pub fn allocate(
        &self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, DeviceError> {
        profiling::scope!("DescriptorPoolManager::allocate");
        let mut inner = self.inner.lock();
        let frame = inner.current_frame;
        let attempts = inner.pools.len().max(1) + 1;

        for _ in 0..attempts {
            let pool_is_full = inner.pools[inner.current].allocated_count >= inner.pools[inner.current].capacity;
            if pool_is_full {
                inner.current += 1;
                if inner.current >= inner.pools.len() {
                    let raw = unsafe { create_pool(device, self.sets_per_pool)? };
                    inner.pools.push(ManagedPool {
                        raw,
                        capacity: self.sets_per_pool,
                        allocated_count: 0,
                        last_used_frame: frame,
                    });
                    inner.stats.pools_created += 1;
                }
                continue;
            }

            let pool = &mut inner.pools[inner.current];
            let layouts = [layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool.raw)
                .set_layouts(&layouts);
            match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => {
                    pool.allocated_count += 1;
                    pool.last_used_frame = frame;
                    inner.stats.allocations += 1;
                    return Ok(sets[0]);
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                    pool.allocated_count = pool.capacity;
                    inner.current += 1;
                    if inner.current >= inner.pools.len() {
                        let raw = unsafe { create_pool(device, self.sets_per_pool)? };
                        inner.pools.push(ManagedPool {
                            raw,
                            capacity: self.sets_per_pool,
                            allocated_count: 0,
                            last_used_frame: frame,
                        });
                        inner.stats.pools_created += 1;
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }

        Err(DeviceError::PoolExhausted(0, inner.pools.len()))
    }

    /// Records the current frame and resets every pool whose
    /// `last_used_frame + MAX_FRAMES_IN_FLIGHT < frame_number`.
    pub fn begin_frame(&self, device: &ash::Device, frame_number: u64) {
        profiling::scope!("DescriptorPoolManager::begin_frame");
        let mut inner = self.inner.lock();
        inner.current_frame = frame_number;
        let threshold = rhit::MAX_FRAMES_IN_FLIGHT as u64;

        for pool in inner.pools.iter_mut() {
            if pool.last_used_frame + threshold < frame_number && pool.allocated_count > 0 {
                unsafe {
                    device
                        .reset_descriptor_pool(pool.raw, vk::DescriptorPoolResetFlags::empty())
                        .expect("resetting a descriptor pool not referenced by any in-flight frame cannot fail");
                }
                pool.allocated_count = 0;
            }
        }
        inner.current = 0;
        inner.stats.pool_resets += inner
            .pools
            .iter()
            .filter(|p| p.allocated_count == 0)
            .count() as u64;
    }

    pub fn stats(&self) -> DescriptorPoolStats {
        self.inner.lock().stats
    }

    pub fn num_pools(&self) -> usize {
        self.inner.lock().pools.len()
    }

    pub fn clear(&self, device: &ash::Device) {
        let mut inner = self.inner.lock();
        for pool in inner.pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool.raw, None) };
        }
    }
}

unsafe fn create_pool(device: &ash::Device, capacity: u32) -> Result<vk::DescriptorPool, DeviceError> {
    let sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: capacity * 4,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: capacity * 4,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: capacity * 2,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: capacity * 2,
        },
    ];
    let info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(capacity)
        .pool_sizes(&sizes);
    Ok(unsafe { device.create_descriptor_pool(&info, None)? })
}

/// Per-slot binding for a [`DescriptorSetKey`]: either a buffer range or an
/// image/sampler pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotBinding {
    Buffer { buffer: vk::Buffer, offset: u64, range: u64 },
    Image { view: vk::ImageView, sampler: vk::Sampler, layout: vk::ImageLayout },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorSetKey {
    pub layout: vk::DescriptorSetLayout,
    /// Indexed by binding number so a lookup never needs to allocate.
    pub slots: Vec<(u32, SlotBinding)>,
}

impl DescriptorSetKey {
    fn structural_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        (self.layout.as_raw()).hash(&mut hasher);
        let mut sorted = self.slots.clone();
        sorted.sort_by_key(|(binding, _)| *binding);
        for (binding, slot) in &sorted {
            binding.hash(&mut hasher);
            match slot {
                SlotBinding::Buffer { buffer, offset, range } => {
                    0u8.hash(&mut hasher);
                    buffer.as_raw().hash(&mut hasher);
                    offset.hash(&mut hasher);
                    range.hash(&mut hasher);
                }
                SlotBinding::Image { view, sampler, layout } => {
                    1u8.hash(&mut hasher);
                    view.as_raw().hash(&mut hasher);
                    sampler.as_raw().hash(&mut hasher);
                    (*layout).as_raw().hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetCacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Frame-local cache mapping [`DescriptorSetKey`] hashes to allocated
/// descriptor sets, reset wholesale at the start of each frame.
///
/// Reserves the write-struct arrays once per call and only then takes
/// pointers into them: reallocation between building the pointer and the
/// native update call is a classic source of silent corruption when
/// batching `vkUpdateDescriptorSets` writes.
pub struct DescriptorSetCache {
    inner: Mutex<SetCacheInner>,
}

struct SetCacheInner {
    sets: FxHashMap<u64, vk::DescriptorSet>,
    stats: SetCacheStats,
}

impl DescriptorSetCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SetCacheInner {
                sets: FxHashMap::default(),
                stats: SetCacheStats::default(),
            }),
        }
    }

    pub fn get_or_allocate(
        &self,
        device: &ash::Device,
        pools: &DescriptorPoolManager,
        key: &DescriptorSetKey,
    ) -> Result<vk::DescriptorSet, DeviceError> {
        profiling::scope!("DescriptorSetCache::get_or_allocate");
        let hash = key.structural_hash();

        {
            let mut inner = self.inner.lock();
            if let Some(&set) = inner.sets.get(&hash) {
                inner.stats.hits += 1;
                return Ok(set);
            }
            inner.stats.misses += 1;
        }

        let set = pools.allocate(device, key.layout)?;
        unsafe { update_descriptor_set(device, set, key) };

        let mut inner = self.inner.lock();
        inner.sets.insert(hash, set);
        Ok(set)
    }

    /// Clears the whole map — cached sets are implicitly invalidated when
    /// their pool is later reset by [`DescriptorPoolManager::begin_frame`]
    ///.
    pub fn reset(&self, _frame_number: u64) {
        self.inner.lock().sets.clear();
    }

    pub fn stats(&self) -> SetCacheStats {
        self.inner.lock().stats
    }
}

/// Writes every slot of `key` into `set` in a single `vkUpdateDescriptorSets`
/// call. `buffer_infos`/`image_infos` are filled completely in a first pass
/// (reserved up front, capacity equal to `key.slots.len()`, so neither ever
/// reallocates) and only then frozen; a second pass builds `writes` from
/// slices into those now-immutable vectors, matching how `wgpu-hal` assembles
/// descriptor writes. Building `writes` in the same pass that pushes into
/// `buffer_infos`/`image_infos` does not borrow-check: each pushed
/// `WriteDescriptorSet` ties its lifetime to a shared borrow of the vector,
/// which the next iteration's `push` (a `&mut` borrow) would conflict with.
unsafe fn update_descriptor_set(device: &ash::Device, set: vk::DescriptorSet, key: &DescriptorSetKey) {
    enum Kind {
        Buffer(usize),
        Image(usize),
    }

    let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::with_capacity(key.slots.len());
    let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::with_capacity(key.slots.len());
    let mut kinds: Vec<(u32, Kind)> = Vec::with_capacity(key.slots.len());

    for (binding, slot) in &key.slots {
        match *slot {
            SlotBinding::Buffer { buffer, offset, range } => {
                let index = buffer_infos.len();
                buffer_infos.push(vk::DescriptorBufferInfo { buffer, offset, range });
                kinds.push((*binding, Kind::Buffer(index)));
            }
            SlotBinding::Image { view, sampler, layout } => {
                let index = image_infos.len();
                image_infos.push(vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                });
                kinds.push((*binding, Kind::Image(index)));
            }
        }
    }

    let mut writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(kinds.len());
    for (binding, kind) in &kinds {
        writes.push(match *kind {
            Kind::Buffer(index) => vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(*binding)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(std::slice::from_ref(&buffer_infos[index])),
            Kind::Image(index) => vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(*binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(&image_infos[index])),
        });
    }

    unsafe { device.update_descriptor_sets(&writes, &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhit::{DescriptorType, ShaderStageFlags};

    fn binding(set: u32, binding: u32) -> DescriptorBinding {
        DescriptorBinding {
            set,
            binding,
            descriptor_type: DescriptorType::UniformBuffer,
            count: 1,
            stage_flags: ShaderStageFlags::FRAGMENT,
        }
    }

    #[test]
    fn identical_binding_sequences_hash_equal() {
        let a = DescriptorLayoutInfo::new(vec![binding(0, 1), binding(0, 0)]);
        let b = DescriptorLayoutInfo::new(vec![binding(0, 0), binding(0, 1)]);
        assert_eq!(a.structural_hash(), b.structural_hash());
        assert_eq!(a, b);
    }

    #[test]
    fn differing_binding_sequences_hash_differently() {
        let a = DescriptorLayoutInfo::new(vec![binding(0, 0)]);
        let b = DescriptorLayoutInfo::new(vec![binding(0, 1)]);
        assert_ne!(a.structural_hash(), b.structural_hash());
    }
}
