//! Pipeline cache: deduplicates graphics pipelines by a structural hash of
//! shaders + fixed-function state.

use std::hash::{Hash, Hasher};

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use rhit::{PipelineStateDescriptor, ShaderHandle};

use super::conv;
use super::descriptor::{DescriptorLayoutCache, DescriptorLayoutInfo};
use super::render_target::{AttachmentOps, LoadOp, RenderPassCache, RenderPassKey, StoreOp};
use super::resources::ShaderModule;
use crate::DeviceError;

/// Hashable wrapper around [`PipelineStateDescriptor`] — the cache key.
/// Shader handles hash by their generational identity; fixed-function state
/// hashes by value.
#[derive(Clone)]
pub struct PipelineStateKey {
    pub desc: PipelineStateDescriptor<ShaderHandle>,
}

impl PipelineStateKey {
    fn structural_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.desc.vertex_shader.index().hash(&mut hasher);
        self.desc.fragment_shader.map(|s| s.index()).hash(&mut hasher);
        self.desc.vertex_stride.hash(&mut hasher);
        for attr in &self.desc.vertex_attributes {
            attr.location.hash(&mut hasher);
            attr.format.hash(&mut hasher);
            attr.offset.hash(&mut hasher);
        }
        self.desc.topology.hash(&mut hasher);
        self.desc.fill_mode.hash(&mut hasher);
        self.desc.cull_mode.hash(&mut hasher);
        self.desc.front_face.hash(&mut hasher);
        self.desc.depth_stencil.hash(&mut hasher);
        self.desc.blend.hash(&mut hasher);
        for format in &self.desc.render_target_formats.color_formats {
            format.hash(&mut hasher);
        }
        self.desc.render_target_formats.depth_stencil_format.hash(&mut hasher);
        self.desc.render_target_formats.sample_count.hash(&mut hasher);
        hasher.finish()
    }
}

struct CachedPipeline {
    raw: vk::Pipeline,
    layout: vk::PipelineLayout,
}

/// Deduplicates compiled `vk::Pipeline`s by [`PipelineStateKey`].
pub struct PipelineCache {
    inner: Mutex<FxHashMap<u64, CachedPipeline>>,
    /// Persisted native pipeline-cache blob handle: an optional `VkPipelineCache` that accelerates subsequent
    /// builds. Loaded from a blob at device creation if the caller supplies
    /// one, reloaded at shutdown via `serialize()`.
    native_cache: vk::PipelineCache,
}

impl PipelineCache {
    pub unsafe fn new(device: &ash::Device, initial_data: Option<&[u8]>) -> Result<Self, DeviceError> {
        let mut info = vk::PipelineCacheCreateInfo::default();
        if let Some(data) = initial_data {
            info = info.initial_data(data);
        }
        let native_cache = unsafe { device.create_pipeline_cache(&info, None)? };
        Ok(Self {
            inner: Mutex::new(FxHashMap::default()),
            native_cache,
        })
    }

    /// Returns a cached pipeline and its layout, or builds a new one on
    /// miss.
    pub fn get_or_create(
        &self,
        device: &ash::Device,
        layouts: &DescriptorLayoutCache,
        render_passes: &RenderPassCache,
        key: &PipelineStateKey,
        shaders: &dyn Fn(ShaderHandle) -> Option<&ShaderModule>,
        current_frame: u64,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout), DeviceError> {
        profiling::scope!("PipelineCache::get_or_create");
        let hash = key.structural_hash();
        if let Some(cached) = self.inner.lock().get(&hash) {
            return Ok((cached.raw, cached.layout));
        }

        let vertex = shaders(key.desc.vertex_shader)
            .ok_or(DeviceError::InvalidShaderBytecode("vertex shader handle not found".to_string()))?;
        let fragment = key
            .desc
            .fragment_shader
            .map(|h| shaders(h).ok_or(DeviceError::InvalidShaderBytecode("fragment shader handle not found".to_string())))
            .transpose()?;

        let layout = unsafe { build_pipeline_layout(device, layouts, vertex, fragment, current_frame)? };
        let render_pass_key = render_pass_key_for(key);
        let render_pass = render_passes.get_or_create(device, &render_pass_key)?;

        let raw = match unsafe { build_pipeline(device, self.native_cache, key, vertex, fragment, layout, render_pass) } {
            Ok(raw) => raw,
            Err(err) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(err);
            }
        };

        self.inner.lock().insert(hash, CachedPipeline { raw, layout });
        Ok((raw, layout))
    }

    /// Serialises the native pipeline cache blob for persistence across
    /// runs. Format is backend-native, not portable across Vulkan drivers.
    pub fn serialize(&self, device: &ash::Device) -> Result<Vec<u8>, DeviceError> {
        Ok(unsafe { device.get_pipeline_cache_data(self.native_cache)? })
    }

    pub fn clear(&self, device: &ash::Device) {
        let mut inner = self.inner.lock();
        for cached in inner.values() {
            unsafe {
                device.destroy_pipeline(cached.raw, None);
                device.destroy_pipeline_layout(cached.layout, None);
            }
        }
        inner.clear();
        unsafe { device.destroy_pipeline_cache(self.native_cache, None) };
    }
}

fn render_pass_key_for(key: &PipelineStateKey) -> RenderPassKey {
    let clear_store = AttachmentOps { load: LoadOp::Clear, store: StoreOp::Store };
    let color_formats = key.desc.render_target_formats.color_formats.clone();
    let color_ops = color_formats.iter().map(|_| clear_store).collect();
    RenderPassKey {
        color_formats,
        color_ops,
        depth_stencil_format: key.desc.render_target_formats.depth_stencil_format,
        depth_stencil_ops: key
            .desc
            .render_target_formats
            .depth_stencil_format
            .map(|_| clear_store),
        sample_count: key.desc.render_target_formats.sample_count,
        presentable: false,
    }
}

/// Groups a vertex/fragment shader pair's reflected descriptor bindings by
/// set index. Shared by pipeline-layout construction and the recorder's
/// descriptor-set resolution, so both agree on which binding belongs to
/// which set.
pub(crate) fn grouped_bindings(
    vertex: &ShaderModule,
    fragment: Option<&ShaderModule>,
) -> FxHashMap<u32, Vec<rhit::DescriptorBinding>> {
    let mut by_set: FxHashMap<u32, Vec<rhit::DescriptorBinding>> = FxHashMap::default();
    for binding in vertex.bindings.iter().chain(fragment.map(|f| f.bindings.iter()).into_iter().flatten()) {
        by_set.entry(binding.set).or_default().push(*binding);
    }
    by_set
}

/// Derives the pipeline layout from the shaders' reflected descriptor
/// bindings, grouped by set index, via the layout cache.
unsafe fn build_pipeline_layout(
    device: &ash::Device,
    layouts: &DescriptorLayoutCache,
    vertex: &ShaderModule,
    fragment: Option<&ShaderModule>,
    current_frame: u64,
) -> Result<vk::PipelineLayout, DeviceError> {
    let mut by_set = grouped_bindings(vertex, fragment);

    let mut set_indices: Vec<u32> = by_set.keys().copied().collect();
    set_indices.sort_unstable();

    let mut set_layouts = Vec::with_capacity(set_indices.len());
    for set_index in set_indices {
        let info = DescriptorLayoutInfo::new(by_set.remove(&set_index).unwrap_or_default());
        set_layouts.push(layouts.get_or_create(device, info, current_frame)?);
    }

    let info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    Ok(unsafe { device.create_pipeline_layout(&info, None)? })
}

unsafe fn build_pipeline(
    device: &ash::Device,
    native_cache: vk::PipelineCache,
    key: &PipelineStateKey,
    vertex: &ShaderModule,
    fragment: Option<&ShaderModule>,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
) -> Result<vk::Pipeline, DeviceError> {
    let entry_point = c"main";

    let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vertex.raw)
        .name(entry_point)];
    if let Some(fragment) = fragment {
        stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment.raw)
                .name(entry_point),
        );
    }

    let binding_desc = [vk::VertexInputBindingDescription {
        binding: 0,
        stride: key.desc.vertex_stride,
        input_rate: vk::VertexInputRate::VERTEX,
    }];
    let attribute_descs: Vec<vk::VertexInputAttributeDescription> = key
        .desc
        .vertex_attributes
        .iter()
        .map(|attr| vk::VertexInputAttributeDescription {
            location: attr.location,
            binding: 0,
            format: conv::map_pixel_format(attr.format),
            offset: attr.offset,
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_desc)
        .vertex_attribute_descriptions(&attribute_descs);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(conv::map_primitive_topology(key.desc.topology))
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(conv::map_fill_mode(key.desc.fill_mode))
        .line_width(1.0)
        .cull_mode(conv::map_cull_mode(key.desc.cull_mode))
        .front_face(conv::map_front_face(key.desc.front_face));

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(key.desc.depth_stencil.depth_test_enabled)
        .depth_write_enable(key.desc.depth_stencil.depth_write_enabled)
        .depth_compare_op(conv::map_compare_function(key.desc.depth_stencil.depth_compare));

    let blend = &key.desc.blend;
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(blend.enabled)
        .src_color_blend_factor(conv::map_blend_factor(blend.src_color))
        .dst_color_blend_factor(conv::map_blend_factor(blend.dst_color))
        .color_blend_op(conv::map_blend_op(blend.color_op))
        .src_alpha_blend_factor(conv::map_blend_factor(blend.src_alpha))
        .dst_alpha_blend_factor(conv::map_blend_factor(blend.dst_alpha))
        .alpha_blend_op(conv::map_blend_op(blend.alpha_op))
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    let color_blend_attachments: Vec<_> = key
        .desc
        .render_target_formats
        .color_formats
        .iter()
        .map(|_| color_blend_attachment)
        .collect();
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

    // Viewport and scissor are always dynamic.
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(native_cache, std::slice::from_ref(&info), None)
            .map_err(|(_, result)| result)?
    };
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_layout_handle_identity_is_raw_value() {
        let layout = unsafe { vk::PipelineLayout::from_raw(42) };
        assert_eq!(layout.as_raw(), 42);
    }
}
