//! Pass declarations: the setup-time accesses a pass records against
//! specific resources and subresources.
//!
//! Accesses are kept as plain data recorded during `setup_fn` rather than a
//! builder the pass keeps hold of afterwards.

use rhit::{RdgPassFlags, RhiAccess};

use crate::resource::{RdgBufferHandle, RdgPassHandle, RdgTextureHandle};

#[derive(Debug, Clone, Copy)]
pub(crate) struct TextureAccessRecord {
    pub texture: RdgTextureHandle,
    pub access: RhiAccess,
    pub mip: Option<u32>,
    pub array_slice: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferAccessRecord {
    pub buffer: RdgBufferHandle,
    pub access: RhiAccess,
}

/// One emitted barrier, targeting either a whole texture/buffer or a
/// single subresource. `mip`/`array_slice` are `None` for a whole-resource
/// transition.
#[derive(Debug, Clone, Copy)]
pub enum TransitionTarget {
    Texture(RdgTextureHandle),
    Buffer(RdgBufferHandle),
}

#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub target: TransitionTarget,
    pub prev_access: RhiAccess,
    pub next_access: RhiAccess,
    pub mip: Option<u32>,
    pub array_slice: Option<u32>,
}

/// The facade passed to a pass's `setup_fn`, recording its declared
/// resource accesses. Consumed by `RdgBuilder::add_pass` once the closure
/// returns; the pass itself never sees it again.
#[derive(Default)]
pub struct RdgPassBuilder {
    pub(crate) texture_accesses: Vec<TextureAccessRecord>,
    pub(crate) buffer_accesses: Vec<BufferAccessRecord>,
}

impl RdgPassBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Declares a whole-resource texture read at `access` (default
    /// `SRV_GRAPHICS`, matching the original's `readTexture` default).
    pub fn read_texture(&mut self, texture: RdgTextureHandle) {
        self.read_texture_access(texture, RhiAccess::SRV_GRAPHICS);
    }

    pub fn read_texture_access(&mut self, texture: RdgTextureHandle, access: RhiAccess) {
        self.texture_accesses.push(TextureAccessRecord {
            texture,
            access,
            mip: None,
            array_slice: None,
        });
    }

    /// Declares a read of a single subresource.
    pub fn read_texture_subresource(
        &mut self,
        texture: RdgTextureHandle,
        access: RhiAccess,
        mip: u32,
        array_slice: u32,
    ) {
        self.texture_accesses.push(TextureAccessRecord {
            texture,
            access,
            mip: Some(mip),
            array_slice: Some(array_slice),
        });
    }

    /// Declares a whole-resource texture write at `access` (default `RTV`).
    pub fn write_texture(&mut self, texture: RdgTextureHandle) {
        self.write_texture_access(texture, RhiAccess::RTV);
    }

    pub fn write_texture_access(&mut self, texture: RdgTextureHandle, access: RhiAccess) {
        self.texture_accesses.push(TextureAccessRecord {
            texture,
            access,
            mip: None,
            array_slice: None,
        });
    }

    pub fn write_depth(&mut self, depth: RdgTextureHandle) {
        self.write_texture_access(depth, RhiAccess::DSV_WRITE);
    }

    pub fn read_depth(&mut self, depth: RdgTextureHandle) {
        self.read_texture_access(depth, RhiAccess::DSV_READ);
    }

    pub fn read_buffer(&mut self, buffer: RdgBufferHandle) {
        self.read_buffer_access(buffer, RhiAccess::SRV_GRAPHICS);
    }

    pub fn read_buffer_access(&mut self, buffer: RdgBufferHandle, access: RhiAccess) {
        self.buffer_accesses.push(BufferAccessRecord { buffer, access });
    }

    pub fn write_buffer(&mut self, buffer: RdgBufferHandle) {
        self.write_buffer_access(buffer, RhiAccess::UAV_GRAPHICS);
    }

    pub fn write_buffer_access(&mut self, buffer: RdgBufferHandle, access: RhiAccess) {
        self.buffer_accesses.push(BufferAccessRecord { buffer, access });
    }
}

/// A registered pass: its declared accesses, the lambda that will record
/// GPU commands, and the bookkeeping the compile phase fills in.
pub(crate) struct PassRecord<'a> {
    pub name: String,
    pub flags: RdgPassFlags,
    pub handle: RdgPassHandle,
    pub texture_accesses: Vec<TextureAccessRecord>,
    pub buffer_accesses: Vec<BufferAccessRecord>,
    pub execute_fn: Option<Box<dyn FnOnce(&rhi::vulkan::Recorder) + 'a>>,
    /// Passes this pass must run after (producers of resources it reads,
    /// or prior accessors of resources it writes).
    pub dependencies: Vec<RdgPassHandle>,
    pub transitions: Vec<Transition>,
    pub culled: bool,
}

impl<'a> PassRecord<'a> {
    pub fn writes_texture(&self, texture: RdgTextureHandle) -> bool {
        self.texture_accesses
            .iter()
            .any(|a| a.texture == texture && a.access.is_writable())
    }

    pub fn writes_buffer(&self, buffer: RdgBufferHandle) -> bool {
        self.buffer_accesses
            .iter()
            .any(|a| a.buffer == buffer && a.access.is_writable())
    }
}
