//! Command buffer manager and command-list context.
//!
//! The manager owns a ring of `MAX_FRAMES_IN_FLIGHT` command buffers; the
//! context holds the pending graphics state for whichever buffer is
//! currently being recorded. Neither type is thread-safe — recording for a
//! given frame happens on a single owning thread, and the device serialises
//! access behind a [`parking_lot::Mutex`] rather than making these types
//! `Sync` themselves.

use ash::vk;
use rhit::*;
use smallvec::SmallVec;

use crate::handle::{BufferHandle, PipelineHandle, SamplerHandle, TextureHandle};
use crate::{CommandError, DeviceError};

/// A ring of per-frame-in-flight command buffers, grounded in
/// `VulkanDevice`'s single command pool plus `FVulkanRHICommandListImmediate`'s
/// delegation to "the active per-frame command buffer".
pub struct CommandBufferManager {
    buffers: Vec<vk::CommandBuffer>,
}

impl CommandBufferManager {
    pub unsafe fn new(device: &ash::Device, pool: vk::CommandPool) -> Result<Self, DeviceError> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_FRAMES_IN_FLIGHT);
        let buffers = unsafe { device.allocate_command_buffers(&info)? };
        Ok(Self { buffers })
    }

    pub fn active(&self, frame_slot: usize) -> vk::CommandBuffer {
        self.buffers[frame_slot]
    }

    /// Resets and begins recording the command buffer for `frame_slot`
    ///.
    pub fn begin_frame(&self, device: &ash::Device, frame_slot: usize) -> Result<(), DeviceError> {
        let buffer = self.buffers[frame_slot];
        unsafe {
            device.reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())?;
            let begin_info =
                vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(buffer, &begin_info)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Default)]
struct BoundVertexBuffer {
    buffer: Option<BufferHandle>,
    offset: u64,
}

#[derive(Clone, Copy, Default, PartialEq)]
pub(crate) enum BoundResource {
    #[default]
    None,
    Buffer(BufferHandle),
    Texture(TextureHandle),
    Sampler(SamplerHandle),
}

/// The active command buffer's pending graphics state.
pub struct Context {
    pub(crate) command_buffer: vk::CommandBuffer,
    recording: bool,
    render_pass_active: bool,

    default_render_pass: vk::RenderPass,
    default_framebuffer: vk::Framebuffer,
    default_extent: vk::Extent2D,

    pipeline: Option<PipelineHandle>,
    pipeline_dirty: bool,
    vertex_buffers: SmallVec<[BoundVertexBuffer; 8]>,
    index_buffer: Option<(BufferHandle, bool)>,
    slots: SmallVec<[BoundResource; 16]>,
    viewport: Option<vk::Viewport>,
    scissor: Option<vk::Rect2D>,
    viewport_dirty: bool,
}

impl Context {
    pub fn new() -> Self {
        Self {
            command_buffer: vk::CommandBuffer::null(),
            recording: false,
            render_pass_active: false,
            default_render_pass: vk::RenderPass::null(),
            default_framebuffer: vk::Framebuffer::null(),
            default_extent: vk::Extent2D::default(),
            pipeline: None,
            pipeline_dirty: false,
            vertex_buffers: SmallVec::new(),
            index_buffer: None,
            slots: SmallVec::new(),
            viewport: None,
            scissor: None,
            viewport_dirty: false,
        }
    }

    /// Rebinds the context to a fresh command buffer and default render
    /// target for the frame that just began.
    pub fn reset(
        &mut self,
        command_buffer: vk::CommandBuffer,
        default_render_pass: vk::RenderPass,
        default_framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) {
        self.command_buffer = command_buffer;
        self.recording = true;
        self.render_pass_active = false;
        self.default_render_pass = default_render_pass;
        self.default_framebuffer = default_framebuffer;
        self.default_extent = extent;
        self.pipeline = None;
        self.pipeline_dirty = false;
        self.vertex_buffers.clear();
        self.index_buffer = None;
        self.slots.clear();
        self.viewport = None;
        self.scissor = None;
        self.viewport_dirty = false;
    }

    pub fn require_recording(&self) -> Result<(), CommandError> {
        if self.recording {
            Ok(())
        } else {
            Err(CommandError::NotRecording)
        }
    }

    pub fn is_render_pass_active(&self) -> bool {
        self.render_pass_active
    }

    pub fn set_pipeline(&mut self, handle: PipelineHandle) {
        if self.pipeline != Some(handle) {
            self.pipeline = Some(handle);
            self.pipeline_dirty = true;
        }
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        let slot = slot as usize;
        if self.vertex_buffers.len() <= slot {
            self.vertex_buffers.resize(slot + 1, BoundVertexBuffer::default());
        }
        self.vertex_buffers[slot] = BoundVertexBuffer { buffer: Some(buffer), offset };
    }

    pub fn set_index_buffer(&mut self, buffer: BufferHandle, is_32_bit: bool) {
        self.index_buffer = Some((buffer, is_32_bit));
    }

    pub fn set_resource_slot(&mut self, slot: u32, resource: BoundResource) {
        let slot = slot as usize;
        if self.slots.len() <= slot {
            self.slots.resize(slot + 1, BoundResource::None);
        }
        self.slots[slot] = resource;
    }

    pub fn set_constant_buffer(&mut self, slot: u32, buffer: BufferHandle) {
        self.set_resource_slot(slot, BoundResource::Buffer(buffer));
    }

    pub fn set_shader_resource(&mut self, slot: u32, texture: TextureHandle) {
        self.set_resource_slot(slot, BoundResource::Texture(texture));
    }

    pub fn set_sampler(&mut self, slot: u32, sampler: SamplerHandle) {
        self.set_resource_slot(slot, BoundResource::Sampler(sampler));
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.viewport = Some(viewport);
        self.viewport_dirty = true;
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.scissor = Some(scissor);
        self.viewport_dirty = true;
    }

    pub fn begin_render_pass(&mut self, device: &ash::Device, render_pass: vk::RenderPass, framebuffer: vk::Framebuffer, extent: vk::Extent2D, clears: &[vk::ClearValue]) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent })
            .clear_values(clears);
        unsafe { device.cmd_begin_render_pass(self.command_buffer, &info, vk::SubpassContents::INLINE) };
        self.render_pass_active = true;
    }

    pub fn end_render_pass(&mut self, device: &ash::Device) -> Result<(), CommandError> {
        if !self.render_pass_active {
            return Err(CommandError::NoActiveRenderPass);
        }
        unsafe { device.cmd_end_render_pass(self.command_buffer) };
        self.render_pass_active = false;
        Ok(())
    }

    /// Applies dirty viewport/scissor, binds the pipeline if changed, and
    /// the bound vertex/index buffers.
    /// Descriptor-set resolution (§4.7) happens in the recorder, which has
    /// access to the device's caches; this only flushes pipeline/vertex
    /// state that is purely a function of the context.
    pub fn prepare_for_draw(
        &mut self,
        device: &ash::Device,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        buffer_raw: impl Fn(BufferHandle) -> Option<vk::Buffer>,
    ) -> Result<vk::PipelineLayout, CommandError> {
        let _ = layout;
        if !self.render_pass_active {
            return Err(CommandError::NoActiveRenderPass);
        }
        if self.viewport_dirty {
            if let Some(viewport) = self.viewport {
                unsafe { device.cmd_set_viewport(self.command_buffer, 0, &[viewport]) };
            }
            if let Some(scissor) = self.scissor {
                unsafe { device.cmd_set_scissor(self.command_buffer, 0, &[scissor]) };
            }
            self.viewport_dirty = false;
        }
        if self.pipeline_dirty {
            unsafe { device.cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline) };
            self.pipeline_dirty = false;
        }

        let mut raws: SmallVec<[vk::Buffer; 8]> = SmallVec::new();
        let mut offsets: SmallVec<[u64; 8]> = SmallVec::new();
        for vb in &self.vertex_buffers {
            let Some(handle) = vb.buffer else { continue };
            let raw = buffer_raw(handle).ok_or(CommandError::InvalidResourceBinding(0))?;
            raws.push(raw);
            offsets.push(vb.offset);
        }
        if !raws.is_empty() {
            unsafe { device.cmd_bind_vertex_buffers(self.command_buffer, 0, &raws, &offsets) };
        }
        if let Some((handle, is_32_bit)) = self.index_buffer {
            let raw = buffer_raw(handle).ok_or(CommandError::InvalidResourceBinding(0))?;
            let index_type = if is_32_bit { vk::IndexType::UINT32 } else { vk::IndexType::UINT16 };
            unsafe { device.cmd_bind_index_buffer(self.command_buffer, raw, 0, index_type) };
        }
        Ok(layout)
    }

    pub fn bound_resources(&self) -> &[BoundResource] {
        &self.slots
    }

    pub fn pipeline_handle(&self) -> Option<PipelineHandle> {
        self.pipeline
    }

    pub fn default_render_pass(&self) -> vk::RenderPass {
        self.default_render_pass
    }

    pub fn default_framebuffer(&self) -> vk::Framebuffer {
        self.default_framebuffer
    }

    pub fn default_extent(&self) -> vk::Extent2D {
        self.default_extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_not_recording() {
        let ctx = Context::new();
        assert!(ctx.require_recording().is_err());
    }

    #[test]
    fn reset_marks_context_recording_with_no_pipeline_bound() {
        let mut ctx = Context::new();
        ctx.reset(vk::CommandBuffer::null(), vk::RenderPass::null(), vk::Framebuffer::null(), vk::Extent2D::default());
        assert!(ctx.require_recording().is_ok());
        assert!(ctx.pipeline_handle().is_none());
        assert!(!ctx.is_render_pass_active());
    }

    #[test]
    fn vertex_buffer_slots_grow_sparsely() {
        let mut ctx = Context::new();
        ctx.reset(vk::CommandBuffer::null(), vk::RenderPass::null(), vk::Framebuffer::null(), vk::Extent2D::default());
        let handle = BufferHandle::new(3, 0);
        ctx.set_vertex_buffer(2, handle, 16);
        assert_eq!(ctx.vertex_buffers.len(), 3);
        assert_eq!(ctx.vertex_buffers[2].buffer, Some(handle));
        assert_eq!(ctx.vertex_buffers[2].offset, 16);
        assert!(ctx.vertex_buffers[0].buffer.is_none());
    }

    #[test]
    fn changing_pipeline_sets_dirty_flag() {
        let mut ctx = Context::new();
        ctx.reset(vk::CommandBuffer::null(), vk::RenderPass::null(), vk::Framebuffer::null(), vk::Extent2D::default());
        let pipeline = PipelineHandle::new(1, 0);
        ctx.set_pipeline(pipeline);
        assert!(ctx.pipeline_dirty);
        ctx.pipeline_dirty = false;
        ctx.set_pipeline(pipeline);
        assert!(!ctx.pipeline_dirty, "rebinding the same pipeline must not re-dirty it");
    }
}
