//! Render pass & framebuffer caches, plus the `RenderTargetInfo` builder
//! helper.
//!
//! Grounded directly in `wgpu-hal`'s `vulkan::mod::RenderPassKey`/
//! `FramebufferKey` (`Eq + Hash` structs used as `FxHashMap` keys, one
//! mutex-guarded map each) generalised to this engine's clear/load-op-driven
//! attachment model.

use ash::vk;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use rhit::PixelFormat;

use super::conv;
use crate::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentOps {
    pub load: LoadOp,
    pub store: StoreOp,
}

/// Cache key for compatible render passes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub color_formats: Vec<PixelFormat>,
    pub color_ops: Vec<AttachmentOps>,
    pub depth_stencil_format: Option<PixelFormat>,
    pub depth_stencil_ops: Option<AttachmentOps>,
    pub sample_count: u32,
    /// `true` if the final color layout should be presentable rather than
    /// shader-readable.
    pub presentable: bool,
}

/// Cache key for framebuffers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub render_pass: u64,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub views: Vec<u64>,
}

/// Builds a [`RenderPassKey`]/[`FramebufferKey`] from a set of bound color
/// and depth targets, replacing hand-assembled cache keys in command-context
/// call sites.
pub struct RenderTargetInfo {
    pub color_formats: Vec<PixelFormat>,
    pub color_ops: Vec<AttachmentOps>,
    pub color_views: Vec<vk::ImageView>,
    pub depth_stencil_format: Option<PixelFormat>,
    pub depth_stencil_ops: Option<AttachmentOps>,
    pub depth_stencil_view: Option<vk::ImageView>,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
    pub presentable: bool,
}

impl RenderTargetInfo {
    pub fn render_pass_key(&self) -> RenderPassKey {
        RenderPassKey {
            color_formats: self.color_formats.clone(),
            color_ops: self.color_ops.clone(),
            depth_stencil_format: self.depth_stencil_format,
            depth_stencil_ops: self.depth_stencil_ops,
            sample_count: self.sample_count,
            presentable: self.presentable,
        }
    }

    pub fn framebuffer_key(&self, render_pass: vk::RenderPass) -> FramebufferKey {
        use ash::vk::Handle;
        let mut views: Vec<u64> = self.color_views.iter().map(|v| v.as_raw()).collect();
        if let Some(depth_view) = self.depth_stencil_view {
            views.push(depth_view.as_raw());
        }
        FramebufferKey {
            render_pass: render_pass.as_raw(),
            width: self.width,
            height: self.height,
            layers: 1,
            views,
        }
    }
}

/// Structural-hash cache materialising compatible render passes on demand
///.
pub struct RenderPassCache {
    inner: Mutex<FxHashMap<RenderPassKey, vk::RenderPass>>,
}

impl RenderPassCache {
    pub fn new() -> Self {
        Self { inner: Mutex::new(FxHashMap::default()) }
    }

    pub fn get_or_create(
        &self,
        device: &ash::Device,
        key: &RenderPassKey,
    ) -> Result<vk::RenderPass, DeviceError> {
        profiling::scope!("RenderPassCache::get_or_create");
        if let Some(&raw) = self.inner.lock().get(key) {
            return Ok(raw);
        }
        let raw = unsafe { build_render_pass(device, key)? };
        self.inner.lock().insert(key.clone(), raw);
        Ok(raw)
    }

    pub fn clear(&self, device: &ash::Device) {
        let mut inner = self.inner.lock();
        for &raw in inner.values() {
            unsafe { device.destroy_render_pass(raw, None) };
        }
        inner.clear();
    }
}

fn attachment_initial_layout(ops: AttachmentOps, optimal: vk::ImageLayout) -> vk::ImageLayout {
    match ops.load {
        LoadOp::Clear | LoadOp::DontCare => vk::ImageLayout::UNDEFINED,
        LoadOp::Load => optimal,
    }
}

fn map_load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

fn map_store_op(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

/// Composes color attachments then an optional depth attachment, a single
/// subpass, and an external-to-subpass dependency covering the relevant
/// pipeline stages. A depth-only pass omits color-stage bits
/// from its dependency masks.
unsafe fn build_render_pass(device: &ash::Device, key: &RenderPassKey) -> Result<vk::RenderPass, DeviceError> {
    let mut attachments = Vec::with_capacity(key.color_formats.len() + 1);
    let mut color_refs = Vec::with_capacity(key.color_formats.len());

    let final_color_layout = if key.presentable {
        vk::ImageLayout::PRESENT_SRC_KHR
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    };

    for (format, ops) in key.color_formats.iter().zip(key.color_ops.iter()) {
        let index = attachments.len() as u32;
        attachments.push(
            vk::AttachmentDescription::default()
                .format(conv::map_pixel_format(*format))
                .samples(sample_count_flags(key.sample_count))
                .load_op(map_load_op(ops.load))
                .store_op(map_store_op(ops.store))
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(attachment_initial_layout(*ops, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                .final_layout(final_color_layout),
        );
        color_refs.push(vk::AttachmentReference {
            attachment: index,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        });
    }

    let depth_ref = if let (Some(format), Some(ops)) = (key.depth_stencil_format, key.depth_stencil_ops) {
        let index = attachments.len() as u32;
        attachments.push(
            vk::AttachmentDescription::default()
                .format(conv::map_pixel_format(format))
                .samples(sample_count_flags(key.sample_count))
                .load_op(map_load_op(ops.load))
                .store_op(map_store_op(ops.store))
                .stencil_load_op(map_load_op(ops.load))
                .stencil_store_op(map_store_op(ops.store))
                .initial_layout(attachment_initial_layout(ops, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL))
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
        Some(vk::AttachmentReference {
            attachment: index,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        })
    } else {
        None
    };

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(ref depth_ref) = depth_ref {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }

    let has_color = !key.color_formats.is_empty();
    let mut src_stage = vk::PipelineStageFlags::empty();
    let mut dst_stage = vk::PipelineStageFlags::empty();
    let mut src_access = vk::AccessFlags::empty();
    let mut dst_access = vk::AccessFlags::empty();

    if has_color {
        src_stage |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        dst_stage |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        dst_access |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if depth_ref.is_some() {
        src_stage |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        dst_stage |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        dst_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }

    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(src_stage)
        .dst_stage_mask(dst_stage)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    let subpasses = [subpass];
    let dependencies = [dependency];
    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    Ok(unsafe { device.create_render_pass(&info, None)? })
}

fn sample_count_flags(count: u32) -> vk::SampleCountFlags {
    match count {
        1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

/// Framebuffers cached per `(render_pass, width, height, layers, ordered
/// view handles)`.
pub struct FramebufferCache {
    inner: Mutex<FxHashMap<FramebufferKey, vk::Framebuffer>>,
}

impl FramebufferCache {
    pub fn new() -> Self {
        Self { inner: Mutex::new(FxHashMap::default()) }
    }

    pub fn get_or_create(
        &self,
        device: &ash::Device,
        render_pass: vk::RenderPass,
        info: &RenderTargetInfo,
    ) -> Result<vk::Framebuffer, DeviceError> {
        profiling::scope!("FramebufferCache::get_or_create");
        let key = info.framebuffer_key(render_pass);
        if let Some(&raw) = self.inner.lock().get(&key) {
            return Ok(raw);
        }

        let mut views = info.color_views.clone();
        if let Some(depth) = info.depth_stencil_view {
            views.push(depth);
        }
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(info.width)
            .height(info.height)
            .layers(1);
        let raw = unsafe { device.create_framebuffer(&create_info, None)? };

        self.inner.lock().insert(key, raw);
        Ok(raw)
    }

    pub fn clear(&self, device: &ash::Device) {
        let mut inner = self.inner.lock();
        for &raw in inner.values() {
            unsafe { device.destroy_framebuffer(raw, None) };
        }
        inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_layouts_produce_equal_keys() {
        let ops = AttachmentOps { load: LoadOp::Clear, store: StoreOp::Store };
        let a = RenderPassKey {
            color_formats: vec![PixelFormat::Rgba8Unorm],
            color_ops: vec![ops],
            depth_stencil_format: None,
            depth_stencil_ops: None,
            sample_count: 1,
            presentable: true,
        };
        let b = a.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn differing_field_produces_distinct_key() {
        let ops = AttachmentOps { load: LoadOp::Clear, store: StoreOp::Store };
        let a = RenderPassKey {
            color_formats: vec![PixelFormat::Rgba8Unorm],
            color_ops: vec![ops],
            depth_stencil_format: None,
            depth_stencil_ops: None,
            sample_count: 1,
            presentable: true,
        };
        let mut b = a.clone();
        b.sample_count = 4;
        assert_ne!(a, b);
    }
}
