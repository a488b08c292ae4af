//! Immediate command recorder: the RHI façade for command recording,
//! implemented purely by delegating to the active [`Context`]. The recorder
//! owns no state of its own; its lifetime equals the borrow of the
//! [`Device`] it was created from.

use std::sync::atomic::Ordering;

use ash::vk;
use rustc_hash::FxHashMap;

use rhit::{BufferHandle, DescriptorBinding, PipelineHandle, SamplerHandle, TextureHandle};

use super::command::BoundResource;
use super::conv;
use super::descriptor::{DescriptorLayoutInfo, DescriptorSetKey, SlotBinding};
use super::device::Device;
use super::pipeline::grouped_bindings;
use super::render_target::{AttachmentOps, RenderTargetInfo};
use super::resources::ShaderModule;
use crate::{ColorAttachment, CommandError, DepthAttachment, DeviceError, ResourceRef};

/// Implements the §6 Recorder contract against the Vulkan backend. Every
/// method below validates/delegates to `device.context` and, for draw
/// calls, resolves descriptor sets through the device's caches.
pub struct Recorder<'a> {
    device: &'a Device,
}

impl<'a> Recorder<'a> {
    pub(crate) fn new(device: &'a Device) -> Self {
        Self { device }
    }

    pub fn begin(&self) -> Result<(), CommandError> {
        self.device.context.lock().require_recording()
    }

    pub fn end(&self) -> Result<(), CommandError> {
        let ctx = self.device.context.lock();
        ctx.require_recording()?;
        if ctx.is_render_pass_active() {
            return Err(CommandError::RenderPassActive);
        }
        Ok(())
    }

    /// Rebinds the context to the swapchain image acquired by the last
    /// `prepare_frame()`.
    pub fn reset(&self) {
        self.device.reset_context_to_default_target();
    }

    pub fn set_pipeline_state(&self, pipeline: PipelineHandle) -> Result<(), CommandError> {
        let mut ctx = self.device.context.lock();
        ctx.require_recording()?;
        ctx.set_pipeline(pipeline);
        Ok(())
    }

    pub fn set_vertex_buffers(&self, start_slot: u32, buffers: &[(BufferHandle, u64)]) -> Result<(), CommandError> {
        let mut ctx = self.device.context.lock();
        ctx.require_recording()?;
        for (i, &(buffer, offset)) in buffers.iter().enumerate() {
            ctx.set_vertex_buffer(start_slot + i as u32, buffer, offset);
        }
        Ok(())
    }

    pub fn set_index_buffer(&self, buffer: BufferHandle, is_32_bit: bool) -> Result<(), CommandError> {
        let mut ctx = self.device.context.lock();
        ctx.require_recording()?;
        ctx.set_index_buffer(buffer, is_32_bit);
        Ok(())
    }

    pub fn set_constant_buffer(&self, slot: u32, buffer: BufferHandle) -> Result<(), CommandError> {
        let mut ctx = self.device.context.lock();
        ctx.require_recording()?;
        ctx.set_constant_buffer(slot, buffer);
        Ok(())
    }

    pub fn set_shader_resource(&self, slot: u32, texture: TextureHandle) -> Result<(), CommandError> {
        let mut ctx = self.device.context.lock();
        ctx.require_recording()?;
        ctx.set_shader_resource(slot, texture);
        Ok(())
    }

    pub fn set_sampler(&self, slot: u32, sampler: SamplerHandle) -> Result<(), CommandError> {
        let mut ctx = self.device.context.lock();
        ctx.require_recording()?;
        ctx.set_sampler(slot, sampler);
        Ok(())
    }

    pub fn set_viewport(&self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) -> Result<(), CommandError> {
        let mut ctx = self.device.context.lock();
        ctx.require_recording()?;
        ctx.set_viewport(vk::Viewport { x, y, width, height, min_depth, max_depth });
        Ok(())
    }

    pub fn set_scissor_rect(&self, x: i32, y: i32, width: u32, height: u32) -> Result<(), CommandError> {
        let mut ctx = self.device.context.lock();
        ctx.require_recording()?;
        ctx.set_scissor(vk::Rect2D {
            offset: vk::Offset2D { x, y },
            extent: vk::Extent2D { width, height },
        });
        Ok(())
    }

    /// Binds `color_targets`/`depth_target`, materialising (or reusing) the
    /// compatible render pass and framebuffer from the device's caches, and
    /// begins the render pass.
    pub fn set_render_targets(
        &self,
        color_targets: &[ColorAttachment],
        depth_target: Option<DepthAttachment>,
    ) -> Result<(), DeviceError> {
        let (render_pass, framebuffer, extent, clears) = {
            let textures = self.device.textures.lock();

            let mut color_formats = Vec::with_capacity(color_targets.len());
            let mut color_ops = Vec::with_capacity(color_targets.len());
            let mut color_views = Vec::with_capacity(color_targets.len());
            let mut clears: Vec<vk::ClearValue> = Vec::with_capacity(color_targets.len() + 1);
            let mut width = 0u32;
            let mut height = 0u32;

            for attachment in color_targets {
                let texture = textures.get(attachment.texture).ok_or(DeviceError::InvalidHandle)?;
                color_formats.push(texture.format);
                color_ops.push(AttachmentOps { load: attachment.load, store: attachment.store });
                color_views.push(texture.default_view);
                width = texture.extent.width;
                height = texture.extent.height;
                clears.push(vk::ClearValue { color: vk::ClearColorValue { float32: [0.0, 0.0, 0.0, 1.0] } });
            }

            let (depth_stencil_format, depth_stencil_ops, depth_stencil_view) = match depth_target {
                Some(attachment) => {
                    let texture = textures.get(attachment.texture).ok_or(DeviceError::InvalidHandle)?;
                    width = texture.extent.width;
                    height = texture.extent.height;
                    clears.push(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                    });
                    (
                        Some(texture.format),
                        Some(AttachmentOps { load: attachment.load, store: attachment.store }),
                        Some(texture.default_view),
                    )
                }
                None => (None, None, None),
            };

            let info = RenderTargetInfo {
                color_formats,
                color_ops,
                color_views,
                depth_stencil_format,
                depth_stencil_ops,
                depth_stencil_view,
                sample_count: 1,
                width,
                height,
                presentable: false,
            };

            let render_pass = self.device.render_passes.get_or_create(&self.device.device, &info.render_pass_key())?;
            let framebuffer = self.device.framebuffers.get_or_create(&self.device.device, render_pass, &info)?;
            (render_pass, framebuffer, vk::Extent2D { width: info.width, height: info.height }, clears)
        };

        let mut ctx = self.device.context.lock();
        ctx.require_recording()?;
        if ctx.is_render_pass_active() {
            return Err(CommandError::RenderPassActive.into());
        }
        ctx.begin_render_pass(&self.device.device, render_pass, framebuffer, extent, &clears);
        Ok(())
    }

    pub fn end_render_pass(&self) -> Result<(), CommandError> {
        let mut ctx = self.device.context.lock();
        ctx.require_recording()?;
        ctx.end_render_pass(&self.device.device)
    }

    pub fn draw(&self, vertex_count: u32, first_vertex: u32) -> Result<(), DeviceError> {
        self.draw_instanced(vertex_count, 1, first_vertex, 0)
    }

    pub fn draw_instanced(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), DeviceError> {
        let cmd = self.prepare_draw()?;
        unsafe {
            self.device.device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
        }
        Ok(())
    }

    pub fn draw_indexed(&self, index_count: u32, first_index: u32, base_vertex: i32) -> Result<(), DeviceError> {
        self.draw_indexed_instanced(index_count, 1, first_index, base_vertex, 0)
    }

    pub fn draw_indexed_instanced(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> Result<(), DeviceError> {
        let cmd = self.prepare_draw()?;
        unsafe {
            self.device
                .device
                .cmd_draw_indexed(cmd, index_count, instance_count, first_index, base_vertex, first_instance);
        }
        Ok(())
    }

    /// Flushes pipeline/viewport/vertex-buffer state, resolves and binds
    /// descriptor sets for the bound resource slots, and returns the
    /// command buffer ready for a draw call.
    fn prepare_draw(&self) -> Result<vk::CommandBuffer, DeviceError> {
        profiling::scope!("Recorder::prepare_draw");
        let mut ctx = self.device.context.lock();
        let pipeline = ctx.pipeline_handle().ok_or(DeviceError::InvalidHandle)?;
        let (raw_pipeline, layout) = self.device.resolve_pipeline(pipeline)?;

        let buffers = self.device.buffers.lock();
        ctx.prepare_for_draw(&self.device.device, raw_pipeline, layout, |h| buffers.get(h).map(|b| b.raw))?;
        drop(buffers);

        self.bind_descriptor_sets(&ctx, pipeline, layout)?;

        Ok(ctx.command_buffer)
    }

    /// Groups the currently bound resource slots by the pipeline's
    /// reflected descriptor sets, resolves (or allocates) each matching
    /// descriptor set via the device's frame-local cache, and binds them
    /// all in one `vkCmdBindDescriptorSets` call.
    fn bind_descriptor_sets(
        &self,
        ctx: &super::command::Context,
        pipeline: PipelineHandle,
        layout: vk::PipelineLayout,
    ) -> Result<(), DeviceError> {
        let descs = self.device.pipeline_descs.lock();
        let desc = descs.get(pipeline).ok_or(DeviceError::InvalidHandle)?.clone();
        drop(descs);

        let shaders = self.device.shaders.lock();
        let vertex: &ShaderModule = shaders.get(desc.vertex_shader).ok_or(DeviceError::InvalidHandle)?;
        let fragment: Option<&ShaderModule> =
            desc.fragment_shader.map(|h| shaders.get(h).ok_or(DeviceError::InvalidHandle)).transpose()?;
        let by_set: FxHashMap<u32, Vec<DescriptorBinding>> = grouped_bindings(vertex, fragment);
        drop(shaders);

        if by_set.is_empty() {
            return Ok(());
        }

        let bound = ctx.bound_resources().to_vec();
        let buffers = self.device.buffers.lock();
        let textures = self.device.textures.lock();
        let samplers = self.device.samplers.lock();

        let mut set_indices: Vec<u32> = by_set.keys().copied().collect();
        set_indices.sort_unstable();

        let mut sets = Vec::with_capacity(set_indices.len());
        for set_index in &set_indices {
            let bindings = &by_set[set_index];
            let layout_info = DescriptorLayoutInfo::new(bindings.clone());
            let current_frame = self.device.current_frame.load(Ordering::Relaxed);
            let set_layout = self.device.layouts.get_or_create(&self.device.device, layout_info, current_frame)?;

            let mut slots = Vec::with_capacity(bindings.len());
            for binding in bindings {
                let bound_resource = bound.get(binding.binding as usize).copied().unwrap_or(BoundResource::None);
                let slot_binding = match bound_resource {
                    BoundResource::Buffer(handle) => {
                        let buffer = buffers.get(handle).ok_or(DeviceError::InvalidHandle)?;
                        SlotBinding::Buffer { buffer: buffer.raw, offset: 0, range: buffer.size }
                    }
                    BoundResource::Texture(handle) => {
                        let texture = textures.get(handle).ok_or(DeviceError::InvalidHandle)?;
                        let sampler = texture.default_sampler.ok_or(DeviceError::InvalidHandle)?;
                        SlotBinding::Image {
                            view: texture.default_view,
                            sampler,
                            layout: *texture.current_layout.lock(),
                        }
                    }
                    BoundResource::Sampler(handle) => {
                        let sampler = samplers.get(handle).ok_or(DeviceError::InvalidHandle)?;
                        let fallback_view = textures.iter().next().map(|t| t.default_view).unwrap_or(vk::ImageView::null());
                        SlotBinding::Image {
                            view: fallback_view,
                            sampler: sampler.raw,
                            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        }
                    }
                    BoundResource::None => return Err(CommandError::InvalidResourceBinding(binding.binding).into()),
                };
                slots.push((binding.binding, slot_binding));
            }

            let key = DescriptorSetKey { layout: set_layout, slots };
            let set = self.device.set_cache.get_or_allocate(&self.device.device, &self.device.pools, &key)?;
            sets.push(set);
        }
        drop(buffers);
        drop(textures);
        drop(samplers);

        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                ctx.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set_indices[0],
                &sets,
                &[],
            );
        }
        Ok(())
    }

    /// Clears a color render target outside of a render pass; `texture`
    /// must be in `TRANSFER_DST_OPTIMAL` or `GENERAL`.
    pub fn clear_render_target(&self, texture: TextureHandle, color: [f32; 4]) -> Result<(), DeviceError> {
        let textures = self.device.textures.lock();
        let tex = textures.get(texture).ok_or(DeviceError::InvalidHandle)?;
        let cmd = self.device.active_command_buffer();
        let layout = *tex.current_layout.lock();
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: tex.mip_levels,
            base_array_layer: 0,
            layer_count: tex.array_layers,
        };
        unsafe {
            self.device.device.cmd_clear_color_image(
                cmd,
                tex.raw,
                layout,
                &vk::ClearColorValue { float32: color },
                &[range],
            );
        }
        Ok(())
    }

    pub fn clear_depth_stencil(&self, texture: TextureHandle, depth: f32, stencil: u32) -> Result<(), DeviceError> {
        let textures = self.device.textures.lock();
        let tex = textures.get(texture).ok_or(DeviceError::InvalidHandle)?;
        let cmd = self.device.active_command_buffer();
        let layout = *tex.current_layout.lock();
        let aspect = if tex.format.has_stencil() {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        };
        let range = vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: tex.mip_levels,
            base_array_layer: 0,
            layer_count: tex.array_layers,
        };
        unsafe {
            self.device.device.cmd_clear_depth_stencil_image(
                cmd,
                tex.raw,
                layout,
                &vk::ClearDepthStencilValue { depth, stencil },
                &[range],
            );
        }
        Ok(())
    }

    /// Transitions a single resource from `from` to `to` with a targeted
    /// pipeline barrier; the access-validity and no-op rules are
    /// `RhiAccess::is_valid`/`transition_required_to`.
    pub fn transition_resource(
        &self,
        resource: ResourceRef,
        from: rhit::RhiAccess,
        to: rhit::RhiAccess,
    ) -> Result<(), DeviceError> {
        if !from.transition_required_to(to) {
            return Ok(());
        }
        let cmd = self.device.active_command_buffer();
        let (src_stage, src_access) = conv::access_to_stage_access(from);
        let (dst_stage, dst_access) = conv::access_to_stage_access(to);

        match resource {
            ResourceRef::Buffer(handle) => {
                let buffers = self.device.buffers.lock();
                let buffer = buffers.get(handle).ok_or(DeviceError::InvalidHandle)?;
                let barrier = vk::BufferMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer.raw)
                    .offset(0)
                    .size(vk::WHOLE_SIZE);
                unsafe {
                    self.device.device.cmd_pipeline_barrier(
                        cmd,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[barrier],
                        &[],
                    );
                }
            }
            ResourceRef::Texture(handle) => {
                let textures = self.device.textures.lock();
                let texture = textures.get(handle).ok_or(DeviceError::InvalidHandle)?;
                let mut current_layout = texture.current_layout.lock();
                let old_layout = *current_layout;
                let new_layout = conv::access_to_image_layout(to);
                let aspect = if texture.format.is_depth_stencil() {
                    if texture.format.has_stencil() {
                        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
                    } else {
                        vk::ImageAspectFlags::DEPTH
                    }
                } else {
                    vk::ImageAspectFlags::COLOR
                };
                let barrier = vk::ImageMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(old_layout)
                    .new_layout(new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(texture.raw)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: aspect,
                        base_mip_level: 0,
                        level_count: texture.mip_levels,
                        base_array_layer: 0,
                        layer_count: texture.array_layers,
                    });
                unsafe {
                    self.device.device.cmd_pipeline_barrier(
                        cmd,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                }
                *current_layout = new_layout;
            }
        }
        Ok(())
    }

    /// A full, untargeted pipeline barrier: used when the caller cannot or
    /// does not want to name individual
    /// resources, e.g. after a batch of transitions whose ordering the
    /// caller already guarantees.
    pub fn resource_barrier(&self) {
        let cmd = self.device.active_command_buffer();
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    pub fn begin_event(&self, name: &str) {
        if let Some(debug_utils) = &self.device.debug_utils_device {
            let cmd = self.device.active_command_buffer();
            if let Ok(label) = std::ffi::CString::new(name) {
                let info = vk::DebugUtilsLabelEXT::default().label_name(&label);
                unsafe { debug_utils.cmd_begin_debug_utils_label(cmd, &info) };
            }
        }
    }

    pub fn end_event(&self) {
        if let Some(debug_utils) = &self.device.debug_utils_device {
            let cmd = self.device.active_command_buffer();
            unsafe { debug_utils.cmd_end_debug_utils_label(cmd) };
        }
    }

    pub fn set_marker(&self, name: &str) {
        if let Some(debug_utils) = &self.device.debug_utils_device {
            let cmd = self.device.active_command_buffer();
            if let Ok(label) = std::ffi::CString::new(name) {
                let info = vk::DebugUtilsLabelEXT::default().label_name(&label);
                unsafe { debug_utils.cmd_insert_debug_utils_label(cmd, &info) };
            }
        }
    }
}
