//! Two-tier GPU memory sub-allocator: a pool-of-pools free-list allocator
//! with a dedicated-allocation fast path for large or explicitly-dedicated
//! requests.
//!
//! The free-list bookkeeping (`Block`, `Pool`) is deliberately free
//! of any `ash` type so it can be exercised by plain unit tests without a
//! Vulkan device; the device-memory acquisition glue lives in
//! [`MemoryManager`] below it.

use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A byte region inside a [`Pool`]. `free` blocks are eligible for
/// first-fit allocation; `id` is a monotonically increasing identity that
/// survives vector reshuffling caused by splits/merges, so an
/// [`Allocation`] can reference its block without holding a raw pointer
/// (Design Note #9: "arena + index" instead of a pool ↔ allocation back
/// pointer).
#[derive(Debug, Clone, Copy)]
struct Block {
    id: u64,
    offset: u64,
    size: u64,
    free: bool,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two() || alignment == 0);
    if alignment == 0 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// Result of a successful sub-allocation from a [`Pool`].
#[derive(Debug, Clone, Copy)]
pub struct BlockAllocation {
    pub block_id: u64,
    pub offset: u64,
    pub size: u64,
}

/// Backend-agnostic free-list over one fixed-size byte range.
///
/// Invariants (checked by the test suite, not at runtime): blocks cover
/// `[0, pool_size)` contiguously in offset order with no gaps or overlap;
/// adjacent free blocks are merged immediately on free; first-fit never
/// returns a block smaller than the aligned request.
pub struct Pool {
    size: u64,
    blocks: Vec<Block>,
    next_block_id: u64,
    used_size: AtomicU64,
}

impl Pool {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            blocks: vec![Block {
                id: 0,
                offset: 0,
                size,
                free: true,
            }],
            next_block_id: 1,
            used_size: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn used_size(&self) -> u64 {
        self.used_size.load(Ordering::Relaxed)
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_block_id;
        self.next_block_id += 1;
        id
    }

    /// First-fit search considering alignment padding; splits the chosen
    /// block into up to three: a pre-padding free remainder, the aligned
    /// allocated segment, and a post-allocation free remainder.
    pub fn try_alloc(&mut self, size: u64, alignment: u64) -> Option<BlockAllocation> {
        let index = self.blocks.iter().position(|b| {
            if !b.free {
                return false;
            }
            let aligned_offset = align_up(b.offset, alignment.max(1));
            let padding = aligned_offset - b.offset;
            padding + size <= b.size
        })?;

        let block = self.blocks[index];
        let aligned_offset = align_up(block.offset, alignment.max(1));
        let padding = aligned_offset - block.offset;
        let remainder = block.size - padding - size;

        let mut replacement = Vec::with_capacity(3);
        if padding > 0 {
            replacement.push(Block {
                id: self.alloc_id(),
                offset: block.offset,
                size: padding,
                free: true,
            });
        }
        let allocated_id = self.alloc_id();
        replacement.push(Block {
            id: allocated_id,
            offset: aligned_offset,
            size,
            free: false,
        });
        if remainder > 0 {
            replacement.push(Block {
                id: self.alloc_id(),
                offset: aligned_offset + size,
                size: remainder,
                free: true,
            });
        }

        self.blocks.splice(index..=index, replacement);
        self.used_size.fetch_add(size, Ordering::Relaxed);

        Some(BlockAllocation {
            block_id: allocated_id,
            offset: aligned_offset,
            size,
        })
    }

    /// Returns a previously allocated block to the free list, merging it
    /// with any immediately adjacent free neighbours.
    pub fn free(&mut self, block_id: u64) {
        let Some(index) = self.blocks.iter().position(|b| b.id == block_id) else {
            log::warn!("memory pool: free() of unknown block id {block_id}, ignoring");
            return;
        };

        let freed_size = self.blocks[index].size;
        self.blocks[index].free = true;
        self.used_size.fetch_sub(freed_size, Ordering::Relaxed);

        self.merge_with_neighbours(index);
    }

    fn merge_with_neighbours(&mut self, mut index: usize) {
        // Merge with the next block first so `index` stays valid.
        if index + 1 < self.blocks.len() && self.blocks[index + 1].free {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].size += next.size;
        }
        if index > 0 && self.blocks[index - 1].free {
            let cur = self.blocks.remove(index);
            index -= 1;
            self.blocks[index].size += cur.size;
        }
    }

    /// Best-effort defragmentation: merges every pair of adjacent free
    /// blocks. Does not relocate live allocations.
    pub fn defragment(&mut self) {
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                let next = self.blocks.remove(i + 1);
                self.blocks[i].size += next.size;
            } else {
                i += 1;
            }
        }
    }

    pub fn largest_free_block(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|b| b.free)
            .map(|b| b.size)
            .max()
            .unwrap_or(0)
    }

    pub fn is_entirely_free(&self) -> bool {
        self.blocks.len() == 1 && self.blocks[0].free
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Sanity check used by tests: blocks are contiguous, cover the full
    /// range, and no two adjacent blocks are both free.
    #[cfg(test)]
    fn assert_invariants(&self) {
        let mut cursor = 0u64;
        for (i, block) in self.blocks.iter().enumerate() {
            assert_eq!(block.offset, cursor, "gap or overlap before block {i}");
            cursor += block.size;
            if i > 0 {
                assert!(
                    !(self.blocks[i - 1].free && block.free),
                    "adjacent free blocks {} and {} were not merged",
                    i - 1,
                    i
                );
            }
        }
        assert_eq!(cursor, self.size, "blocks do not cover the full pool");
    }
}

/// Handle to a CPU-visible mapping. Stored as a raw address because the
/// pool outlives any individual `Allocation` and the mapping is valid for
/// the whole pool's lifetime once established.
#[derive(Debug, Clone, Copy)]
pub struct MappedPtr(pub *mut u8);

// Safety: the pointer is only ever dereferenced by the thread holding the
// allocation that owns the corresponding byte range; the manager itself
// never touches mapped memory.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

/// Output of [`MemoryManager::allocate`].
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub device_memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub memory_type_index: u32,
    pub mapped_ptr: Option<MappedPtr>,
    pub dedicated: bool,
    /// `None` for dedicated allocations; `Some((type_index, block_id))`
    /// for pool sub-allocations.
    pub(crate) block_id: Option<u64>,
}

impl Allocation {
    pub fn mapped_slice(&self) -> Option<&mut [u8]> {
        self.mapped_ptr
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr.0, self.size as usize) })
    }
}

/// Request passed to [`MemoryManager::allocate`].
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
    pub required_properties: vk::MemoryPropertyFlags,
    pub preferred_properties: vk::MemoryPropertyFlags,
    pub dedicated: bool,
    pub mappable: bool,
}

/// Aggregate statistics across every memory type's pools plus dedicated
/// allocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub total_reserved: u64,
    pub total_allocated: u64,
    pub allocation_count: u32,
    pub dedicated_count: u32,
    pub largest_free_block: u64,
}

struct PoolWithBacking {
    pool: Pool,
    device_memory: vk::DeviceMemory,
    mapped_ptr: Option<MappedPtr>,
}

struct MemoryTypeState {
    pools: Vec<PoolWithBacking>,
}

impl Default for MemoryTypeState {
    fn default() -> Self {
        Self { pools: Vec::new() }
    }
}

/// Pool-of-pools sub-allocator, one [`MemoryTypeState`] per Vulkan memory
/// type, plus a dedicated-allocation fast path for large or explicitly
/// dedicated requests.
pub struct MemoryManager {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// One mutex per memory type: the free-list and used-size counter of
    /// every pool of that type are guarded together.
    types: Vec<Mutex<MemoryTypeState>>,
    allocation_count: AtomicU64,
    dedicated_count: AtomicU64,
    dedicated_bytes: AtomicU64,
}

impl MemoryManager {
    pub fn new(memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        let count = memory_properties.memory_type_count as usize;
        let types = (0..count).map(|_| Mutex::new(MemoryTypeState::default())).collect();
        Self {
            memory_properties,
            types,
            allocation_count: AtomicU64::new(0),
            dedicated_count: AtomicU64::new(0),
            dedicated_bytes: AtomicU64::new(0),
        }
    }

    /// Iterate memory types in index order, returning the first that is
    /// in the allowed mask and satisfies `required`; among ties, prefer
    /// one that also satisfies `preferred`.
    fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let candidates = || {
            (0..self.memory_properties.memory_type_count).filter(move |&i| {
                let in_mask = memory_type_bits & (1 << i) != 0;
                let props = self.memory_properties.memory_types[i as usize].property_flags;
                in_mask && props.contains(required)
            })
        };

        candidates()
            .find(|&i| {
                let props = self.memory_properties.memory_types[i as usize].property_flags;
                props.contains(preferred)
            })
            .or_else(|| candidates().next())
    }

    pub fn is_host_visible_memory_type(&self, index: u32) -> bool {
        self.memory_properties.memory_types[index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Allocates `request.size` bytes directly from the device (no
    /// sub-allocation bookkeeping), used both by the dedicated fast path
    /// and when a pool must grow.
    unsafe fn allocate_device_memory(
        &self,
        device: &ash::Device,
        memory_type_index: u32,
        size: u64,
        mappable: bool,
    ) -> Result<(vk::DeviceMemory, Option<MappedPtr>), crate::DeviceError> {
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { device.allocate_memory(&info, None)? };

        let mapped_ptr = if mappable && self.is_host_visible_memory_type(memory_type_index) {
            let ptr = unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
            };
            Some(MappedPtr(ptr as *mut u8))
        } else {
            None
        };

        Ok((memory, mapped_ptr))
    }

    /// Dedicated allocation above the large-allocation threshold, else
    /// first-fit into an existing pool, else a fresh pool, else failure.
    pub fn allocate(
        &self,
        device: &ash::Device,
        request: AllocationRequest,
    ) -> Result<Allocation, crate::DeviceError> {
        profiling::scope!("MemoryManager::allocate");

        let memory_type_index = self
            .find_memory_type_index(
                request.memory_type_bits,
                request.required_properties,
                request.preferred_properties,
            )
            .ok_or(crate::DeviceError::NoSuitableMemoryType)?;

        if request.dedicated || request.size >= rhit::LARGE_ALLOCATION_THRESHOLD {
            let (memory, mapped_ptr) = unsafe {
                self.allocate_device_memory(device, memory_type_index, request.size, request.mappable)?
            };
            self.allocation_count.fetch_add(1, Ordering::Relaxed);
            self.dedicated_count.fetch_add(1, Ordering::Relaxed);
            self.dedicated_bytes.fetch_add(request.size, Ordering::Relaxed);
            return Ok(Allocation {
                device_memory: memory,
                offset: 0,
                size: request.size,
                memory_type_index,
                mapped_ptr,
                dedicated: true,
                block_id: None,
            });
        }

        let mut type_state = self.types[memory_type_index as usize].lock();

        for pool in type_state.pools.iter_mut() {
            if let Some(block) = pool.pool.try_alloc(request.size, request.alignment) {
                self.allocation_count.fetch_add(1, Ordering::Relaxed);
                let mapped_ptr = pool
                    .mapped_ptr
                    .map(|p| MappedPtr(unsafe { p.0.add(block.offset as usize) }));
                return Ok(Allocation {
                    device_memory: pool.device_memory,
                    offset: block.offset,
                    size: block.size,
                    memory_type_index,
                    mapped_ptr,
                    dedicated: false,
                    block_id: Some(block.block_id),
                });
            }
        }

        if type_state.pools.len() >= rhit::MAX_POOLS_PER_TYPE {
            return Err(crate::DeviceError::PoolExhausted(
                memory_type_index,
                rhit::MAX_POOLS_PER_TYPE,
            ));
        }

        let pool_size = request.size.max(rhit::DEFAULT_POOL_SIZE);
        let (memory, mapped_ptr) = unsafe {
            self.allocate_device_memory(device, memory_type_index, pool_size, request.mappable)?
        };

        let mut pool = PoolWithBacking {
            pool: Pool::new(pool_size),
            device_memory: memory,
            mapped_ptr,
        };
        let block = pool
            .pool
            .try_alloc(request.size, request.alignment)
            .expect("freshly created pool of at least request.size must fit the request");
        let allocation_mapped = mapped_ptr.map(|p| MappedPtr(unsafe { p.0.add(block.offset as usize) }));

        type_state.pools.push(pool);
        self.allocation_count.fetch_add(1, Ordering::Relaxed);

        Ok(Allocation {
            device_memory: memory,
            offset: block.offset,
            size: block.size,
            memory_type_index,
            mapped_ptr: allocation_mapped,
            dedicated: false,
            block_id: Some(block.block_id),
        })
    }

    /// Returns an allocation to the manager. Dedicated allocations free
    /// their device-memory object directly; sub-allocations are returned
    /// to their pool's free-list.
    pub fn free(&self, device: &ash::Device, allocation: Allocation) {
        profiling::scope!("MemoryManager::free");
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);

        match allocation.block_id {
            None => {
                self.dedicated_count.fetch_sub(1, Ordering::Relaxed);
                self.dedicated_bytes.fetch_sub(allocation.size, Ordering::Relaxed);
                unsafe { device.free_memory(allocation.device_memory, None) };
            }
            Some(block_id) => {
                let mut type_state = self.types[allocation.memory_type_index as usize].lock();
                if let Some(pool) = type_state
                    .pools
                    .iter_mut()
                    .find(|p| p.device_memory == allocation.device_memory)
                {
                    pool.pool.free(block_id);
                }
            }
        }
    }

    /// Merges adjacent free blocks in every pool of every memory type.
    pub fn defragment_all(&self) {
        for type_state in &self.types {
            let mut type_state = type_state.lock();
            for pool in type_state.pools.iter_mut() {
                pool.pool.defragment();
            }
        }
    }

    /// Releases pools that are entirely free, keeping at least one pool
    /// per memory type that has ever been used (so a subsequent
    /// allocation of that type doesn't immediately recreate one).
    pub fn trim_unused_pools(&self, device: &ash::Device) {
        for type_state in &self.types {
            let mut type_state = type_state.lock();
            if type_state.pools.len() <= 1 {
                continue;
            }
            let mut kept = Vec::with_capacity(type_state.pools.len());
            for (i, pool) in type_state.pools.drain(..).enumerate() {
                if i > 0 && pool.pool.is_entirely_free() {
                    unsafe { device.free_memory(pool.device_memory, None) };
                } else {
                    kept.push(pool);
                }
            }
            type_state.pools = kept;
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let mut total_reserved = self.dedicated_bytes.load(Ordering::Relaxed);
        let mut total_allocated = self.dedicated_bytes.load(Ordering::Relaxed);
        let mut largest_free_block = 0u64;

        for type_state in &self.types {
            let type_state = type_state.lock();
            for pool in &type_state.pools {
                total_reserved += pool.pool.size();
                total_allocated += pool.pool.used_size();
                largest_free_block = largest_free_block.max(pool.pool.largest_free_block());
            }
        }

        MemoryStats {
            total_reserved,
            total_allocated,
            allocation_count: self.allocation_count.load(Ordering::Relaxed) as u32,
            dedicated_count: self.dedicated_count.load(Ordering::Relaxed) as u32,
            largest_free_block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_scenario() {
        let mut pool = Pool::new(64 * 1024 * 1024);
        let requests = [(17u64, 256u64), (33, 256), (97, 4096), (1025, 65536)];
        let mut allocations = Vec::new();
        for (size, alignment) in requests {
            let alloc = pool.try_alloc(size, alignment).expect("fits in empty 64MiB pool");
            assert_eq!(alloc.offset % alignment, 0);
            allocations.push(alloc);
        }
        for i in 0..allocations.len() {
            for j in (i + 1)..allocations.len() {
                let a = allocations[i];
                let b = allocations[j];
                let disjoint = a.offset + a.size <= b.offset || b.offset + b.size <= a.offset;
                assert!(disjoint, "allocations {i} and {j} overlap");
            }
        }
        let requested_sum: u64 = requests.iter().map(|(s, _)| s).sum();
        assert!(pool.used_size() >= requested_sum);
        pool.assert_invariants();
    }

    #[test]
    fn free_list_merge_scenario() {
        let mut pool = Pool::new(3 * 1024 * 1024);
        let a = pool.try_alloc(1024 * 1024, 1).unwrap();
        let b = pool.try_alloc(1024 * 1024, 1).unwrap();
        let c = pool.try_alloc(1024 * 1024, 1).unwrap();

        pool.free(b.block_id);
        pool.free(a.block_id);
        pool.free(c.block_id);

        assert_eq!(pool.block_count(), 1);
        assert!(pool.is_entirely_free());
        assert_eq!(pool.largest_free_block(), 3 * 1024 * 1024);
        pool.assert_invariants();
    }

    #[test]
    fn no_overlap_of_live_allocations_under_churn() {
        let mut pool = Pool::new(1024 * 1024);
        let mut live = Vec::new();
        for i in 0..64u64 {
            let size = 1024 + i * 37 % 4096;
            if let Some(alloc) = pool.try_alloc(size, 64) {
                live.push(alloc);
            }
            if live.len() > 3 && i % 2 == 0 {
                let freed = live.remove(0);
                pool.free(freed.block_id);
            }
        }
        for i in 0..live.len() {
            for j in (i + 1)..live.len() {
                let a = live[i];
                let b = live[j];
                assert!(a.offset + a.size <= b.offset || b.offset + b.size <= a.offset);
            }
        }
        pool.assert_invariants();
    }

    #[test]
    fn first_fit_never_returns_undersized_block() {
        let mut pool = Pool::new(1024);
        pool.try_alloc(512, 1).unwrap();
        // Remaining free space is 512 bytes; a 600-byte request must fail.
        assert!(pool.try_alloc(600, 1).is_none());
    }

    #[test]
    fn defragment_merges_without_relocating() {
        let mut pool = Pool::new(3 * 1024);
        let a = pool.try_alloc(1024, 1).unwrap();
        let _b = pool.try_alloc(1024, 1).unwrap();
        let _c = pool.try_alloc(1024, 1).unwrap();
        pool.free(a.block_id);
        pool.defragment();
        // Only one allocation was freed; defragment cannot create space
        // that doesn't yet exist, it only merges what's already free.
        assert_eq!(pool.block_count(), 3);
        pool.assert_invariants();
    }
}
