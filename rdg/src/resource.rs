//! RDG resource handles, descriptors, and per-subresource access tracking.
//!
//! Uses the handle-is-an-index idiom `rhi::handle::Handle` already
//! established for native resources: an arena plus an index rather than a
//! back-pointer.

use rhit::{
    BufferUsage, MemoryLocation, PixelFormat, RdgBufferFlags, RdgTextureFlags, RhiAccess,
    TextureUsage,
};

/// Opaque handle to a texture declared against an [`crate::RdgBuilder`].
/// Only valid for the builder that returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RdgTextureHandle(pub(crate) u32);

/// Opaque handle to a buffer declared against an [`crate::RdgBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RdgBufferHandle(pub(crate) u32);

impl RdgTextureHandle {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl RdgBufferHandle {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle identifying a pass's position in registration order. Assigned
/// monotonically by `add_pass`; also used as the topological-sort tie
/// break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RdgPassHandle(pub(crate) u32);

impl RdgPassHandle {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Descriptor for an RDG-owned texture. Separate
/// from `rhit::TextureDescriptor` because it carries RDG-only lifetime
/// flags; `to_rhi_descriptor` converts it at materialisation time.
#[derive(Debug, Clone)]
pub struct RdgTextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub sample_count: u32,
    pub format: PixelFormat,
    pub usage: TextureUsage,
    pub flags: RdgTextureFlags,
}

impl RdgTextureDesc {
    pub fn texture_2d(width: u32, height: u32, format: PixelFormat, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            sample_count: 1,
            format,
            usage,
            flags: RdgTextureFlags::NONE,
        }
    }

    pub fn depth_2d(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            sample_count: 1,
            format,
            usage: TextureUsage::DEPTH_STENCIL,
            flags: RdgTextureFlags::NONE,
        }
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_layers
    }

    pub fn to_rhi_descriptor(&self, label: Option<String>) -> rhit::TextureDescriptor {
        rhit::TextureDescriptor {
            width: self.width,
            height: self.height,
            depth: self.depth,
            mip_levels: self.mip_levels,
            array_layers: self.array_layers,
            sample_count: self.sample_count,
            format: self.format,
            usage: self.usage,
            label,
        }
    }
}

/// Descriptor for an RDG-owned buffer.
#[derive(Debug, Clone)]
pub struct RdgBufferDesc {
    pub size: u64,
    pub stride: u32,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    pub flags: RdgBufferFlags,
}

impl RdgBufferDesc {
    pub fn uniform_buffer(size: u64) -> Self {
        Self {
            size,
            stride: size as u32,
            usage: BufferUsage::UNIFORM,
            location: MemoryLocation::CpuToGpu,
            flags: RdgBufferFlags::NONE,
        }
    }

    pub fn vertex_buffer(size: u64, stride: u32) -> Self {
        Self {
            size,
            stride,
            usage: BufferUsage::VERTEX,
            location: MemoryLocation::DeviceLocal,
            flags: RdgBufferFlags::NONE,
        }
    }

    pub fn to_rhi_descriptor(&self, label: Option<String>) -> rhit::BufferDescriptor {
        rhit::BufferDescriptor {
            size: self.size,
            usage: self.usage,
            location: self.location,
            dedicated: false,
            label,
        }
    }
}

/// One (mip, array-slice) cell's access state, plus the first/last pass
/// handles that touched it.
///
/// Invariant: if `first_pass` is set, `last_pass` is set too, and
/// `first_pass <= last_pass` in sorted order — `touch` is only ever called
/// in sorted-pass order during transition insertion, so this holds by
/// construction.
#[derive(Debug, Clone, Copy)]
pub struct SubresourceState {
    pub access: RhiAccess,
    pub first_pass: Option<RdgPassHandle>,
    pub last_pass: Option<RdgPassHandle>,
}

impl Default for SubresourceState {
    fn default() -> Self {
        Self {
            access: RhiAccess::UNKNOWN,
            first_pass: None,
            last_pass: None,
        }
    }
}

impl SubresourceState {
    pub(crate) fn touch(&mut self, access: RhiAccess, pass: RdgPassHandle) {
        if self.first_pass.is_none() {
            self.first_pass = Some(pass);
        }
        self.last_pass = Some(pass);
        self.access = access;
    }
}

/// `mip * array_layers + array_slice` subresource indexing, used uniformly
/// by every texture so access records and subresource state stay aligned.
pub(crate) fn subresource_index(mip: u32, array_slice: u32, mip_levels: u32) -> usize {
    (array_slice * mip_levels + mip) as usize
}

pub(crate) struct RdgTexture {
    pub name: String,
    pub desc: RdgTextureDesc,
    pub subresources: Vec<SubresourceState>,
    pub backing: Option<rhi::TextureHandle>,
    pub external: bool,
}

impl RdgTexture {
    pub(crate) fn new(name: String, desc: RdgTextureDesc) -> Self {
        let count = desc.subresource_count().max(1) as usize;
        Self {
            name,
            subresources: vec![SubresourceState::default(); count],
            desc,
            backing: None,
            external: false,
        }
    }

    /// Resolves a possibly-whole-resource subresource range into concrete
    /// `(mip, array_slice)` indices.
    pub(crate) fn resolve_range(&self, mip: Option<u32>, array_slice: Option<u32>) -> Vec<usize> {
        match (mip, array_slice) {
            (Some(m), Some(a)) => vec![subresource_index(m, a, self.desc.mip_levels)],
            _ => (0..self.subresources.len()).collect(),
        }
    }

    /// Inverse of `subresource_index`: recovers `(mip, array_slice)` from a
    /// flat index, used when a whole-resource access must be split back
    /// into per-subresource transitions.
    pub(crate) fn mip_array_of(&self, index: usize) -> (u32, u32) {
        let mip_levels = self.desc.mip_levels.max(1);
        let index = index as u32;
        (index % mip_levels, index / mip_levels)
    }
}

pub(crate) struct RdgBuffer {
    pub name: String,
    pub desc: RdgBufferDesc,
    pub state: SubresourceState,
    pub backing: Option<rhi::BufferHandle>,
    pub external: bool,
}

impl RdgBuffer {
    pub(crate) fn new(name: String, desc: RdgBufferDesc) -> Self {
        Self {
            name,
            desc,
            state: SubresourceState::default(),
            backing: None,
            external: false,
        }
    }
}
