//! Shared, backend-agnostic data types for the RHI and RDG crates.
//!
//! This crate plays the role `wgpu-types` plays for `wgpu-hal`/`wgpu-core`:
//! plain descriptors, bitflags and small value types with no dependency on
//! `ash` or any other backend crate, so that `rdg` can depend on the same
//! vocabulary as `rhi` without pulling in Vulkan itself.

#![warn(unsafe_op_in_unsafe_fn)]
#![allow(clippy::new_without_default)]

use std::fmt;

pub mod access;

pub use access::{RdgBufferFlags, RdgPassFlags, RdgTextureFlags, RhiAccess};

/// Maximum number of frames that may be in flight on the GPU at once.
///
/// Triple buffering: one frame being recorded, one submitted and
/// potentially still executing, one whose fence we are waiting on.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Threshold above which an allocation always takes the dedicated path,
/// bypassing pool sub-allocation. See `rhi`'s memory manager.
pub const LARGE_ALLOCATION_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Default size of a freshly created memory pool.
pub const DEFAULT_POOL_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum number of pools a single memory type may own concurrently.
pub const MAX_POOLS_PER_TYPE: usize = 32;

/// Default capacity (in descriptor sets) of a freshly created descriptor pool.
pub const DESCRIPTOR_SETS_PER_POOL: u32 = 256;

/// Pixel format for textures and render targets.
///
/// Named after the Vulkan formats they map onto; kept backend-neutral so
/// `rdg` can describe resources without depending on `ash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PixelFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    D32Float,
    D32FloatS8Uint,
    D24UnormS8Uint,
    D16Unorm,
}

impl PixelFormat {
    /// Whether this format carries a depth and/or stencil aspect.
    pub fn is_depth_stencil(self) -> bool {
        matches!(
            self,
            PixelFormat::D32Float
                | PixelFormat::D32FloatS8Uint
                | PixelFormat::D24UnormS8Uint
                | PixelFormat::D16Unorm
        )
    }

    /// Whether this format carries a stencil aspect.
    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            PixelFormat::D32FloatS8Uint | PixelFormat::D24UnormS8Uint
        )
    }

    /// Bytes per texel, for formats with a uniform texel size. Block-
    /// compressed formats are not modelled by this crate.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            PixelFormat::R8Unorm => 1,
            PixelFormat::Rg8Unorm => 2,
            PixelFormat::Rgba8Unorm
            | PixelFormat::Rgba8UnormSrgb
            | PixelFormat::Bgra8Unorm
            | PixelFormat::Bgra8UnormSrgb
            | PixelFormat::R32Float
            | PixelFormat::D32Float
            | PixelFormat::D24UnormS8Uint => 4,
            PixelFormat::D16Unorm => 2,
            PixelFormat::D32FloatS8Uint => 8,
            PixelFormat::Rgba16Float => 8,
            PixelFormat::Rgba32Float => 16,
        }
    }
}

bitflags::bitflags! {
    /// Intended uses of a buffer, used to pick Vulkan usage flags and
    /// memory-property preferences.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX          = 1 << 0;
        const INDEX           = 1 << 1;
        const UNIFORM         = 1 << 2;
        const STORAGE         = 1 << 3;
        const COPY_SRC        = 1 << 4;
        const COPY_DST        = 1 << 5;
        const INDIRECT        = 1 << 6;
        /// The caller intends to `map()` this buffer from the host.
        const MAP_READ        = 1 << 7;
        const MAP_WRITE       = 1 << 8;
    }
}

bitflags::bitflags! {
    /// Intended uses of a texture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED          = 1 << 0;
        const STORAGE          = 1 << 1;
        const RENDER_TARGET    = 1 << 2;
        const DEPTH_STENCIL    = 1 << 3;
        const COPY_SRC         = 1 << 4;
        const COPY_DST         = 1 << 5;
        const TRANSIENT        = 1 << 6;
    }
}

/// Hint describing how host-visible memory should be preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// No CPU access required; prefer `DEVICE_LOCAL`.
    DeviceLocal,
    /// CPU writes every frame; prefer `HOST_VISIBLE | HOST_COHERENT`,
    /// ideally also `DEVICE_LOCAL` (ReBAR).
    CpuToGpu,
    /// CPU reads back GPU-written data; prefer `HOST_VISIBLE | HOST_CACHED`.
    GpuToCpu,
}

/// Descriptor for `rhi`'s buffer creation entry point.
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    /// Force a dedicated allocation regardless of size.
    pub dedicated: bool,
    pub label: Option<String>,
}

/// Descriptor for `rhi`'s texture creation entry point.
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub sample_count: u32,
    pub format: PixelFormat,
    pub usage: TextureUsage,
    pub label: Option<String>,
}

impl TextureDescriptor {
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
            label: None,
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
            label: None,
        }
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_layers
    }

    pub fn is_render_target(&self) -> bool {
        self.usage.contains(TextureUsage::RENDER_TARGET)
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.format.is_depth_stencil()
    }
}

/// Minification/magnification filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Texture-coordinate wrapping behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    MirrorRepeat,
    ClampToEdge,
    ClampToBorder,
}

/// Depth/stencil and shadow-sampler comparison function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone)]
pub struct SamplerDescriptor {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    pub max_anisotropy: f32,
    pub compare: Option<CompareFunction>,
    pub lod_min_clamp: f32,
    pub lod_max_clamp: f32,
    pub label: Option<String>,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            address_mode_w: AddressMode::Repeat,
            max_anisotropy: 1.0,
            compare: None,
            lod_min_clamp: 0.0,
            lod_max_clamp: 1000.0,
            label: None,
        }
    }
}

/// Which programmable stage(s) a shader or descriptor binding is visible to.
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX   = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE  = 1 << 2;
    }
}

/// Single shader stage's module kind, used by `create_vertex_shader`/
/// `create_pixel_shader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

/// Kind of descriptor a shader binding resolves to, inferred by minimal
/// SPIR-V reflection (storage class of an `OpVariable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    StorageImage,
    Sampler,
}

/// A single binding discovered by shader reflection or declared by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stage_flags: ShaderStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    TriangleList,
    TriangleStrip,
    LineList,
    LineStrip,
    PointList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillMode {
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub enabled: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
}

impl BlendState {
    pub const REPLACE: Self = Self {
        enabled: false,
        src_color: BlendFactor::One,
        dst_color: BlendFactor::Zero,
        color_op: BlendOp::Add,
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::Zero,
        alpha_op: BlendOp::Add,
    };

    pub const ALPHA_BLEND: Self = Self {
        enabled: true,
        src_color: BlendFactor::SrcAlpha,
        dst_color: BlendFactor::OneMinusSrcAlpha,
        color_op: BlendOp::Add,
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::OneMinusSrcAlpha,
        alpha_op: BlendOp::Add,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test_enabled: bool,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enabled: true,
            depth_write_enabled: true,
            depth_compare: CompareFunction::LessEqual,
        }
    }
}

/// A single vertex attribute: shader location, format-implied size via
/// `PixelFormat`, and byte offset within the vertex stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: PixelFormat,
    pub offset: u32,
}

/// Opaque handle to a shader module owned by an `rhi` device. The concrete
/// representation (generational index) lives in `rhi`; this crate only
/// needs the type name for `PipelineStateDescriptor`.
pub trait ShaderHandleLike: fmt::Debug + Copy + Eq + std::hash::Hash {}

/// Render-target format tuple a pipeline is built against.
#[derive(Debug, Clone)]
pub struct RenderTargetFormats {
    pub color_formats: Vec<PixelFormat>,
    pub depth_stencil_format: Option<PixelFormat>,
    pub sample_count: u32,
}

/// Fixed-function + shader-reference state that is hashed to deduplicate
/// pipelines in `rhi`'s pipeline cache.
#[derive(Debug, Clone)]
pub struct PipelineStateDescriptor<Shader> {
    pub vertex_shader: Shader,
    pub fragment_shader: Option<Shader>,
    pub vertex_stride: u32,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub topology: PrimitiveTopology,
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_stencil: DepthStencilState,
    pub blend: BlendState,
    pub render_target_formats: RenderTargetFormats,
    pub label: Option<String>,
}

/// Present-mode hint consumed at device/swapchain creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresentMode {
    Fifo,
    #[default]
    Mailbox,
    Immediate,
}

/// Configuration consumed by `Device::new`. See SPEC_FULL.md §10.3.
#[derive(Clone)]
pub struct RhiConfig {
    pub enable_validation: bool,
    pub application_name: String,
    pub application_version: u32,
    pub window_width: u32,
    pub window_height: u32,
    pub preferred_present_mode: PresentMode,
}

impl fmt::Debug for RhiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RhiConfig")
            .field("enable_validation", &self.enable_validation)
            .field("application_name", &self.application_name)
            .field("application_version", &self.application_version)
            .field("window_width", &self.window_width)
            .field("window_height", &self.window_height)
            .field("preferred_present_mode", &self.preferred_present_mode)
            .finish()
    }
}

impl Default for RhiConfig {
    fn default() -> Self {
        Self {
            enable_validation: false,
            application_name: "monster-rhi".to_string(),
            application_version: 1,
            window_width: 1280,
            window_height: 720,
            preferred_present_mode: PresentMode::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_are_flagged() {
        assert!(PixelFormat::D32Float.is_depth_stencil());
        assert!(PixelFormat::D32FloatS8Uint.has_stencil());
        assert!(!PixelFormat::Rgba8Unorm.is_depth_stencil());
    }

    #[test]
    fn texture_descriptor_subresource_count() {
        let desc = TextureDescriptor {
            width: 256,
            height: 256,
            depth: 1,
            mip_levels: 4,
            array_layers: 6,
            sample_count: 1,
            format: PixelFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLED,
            label: None,
        };
        assert_eq!(desc.subresource_count(), 24);
    }
}
