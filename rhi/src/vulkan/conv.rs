//! Conversions between the backend-neutral `rhit` vocabulary and `ash`'s
//! Vulkan types. Grounded in `wgpu-hal`'s `vulkan/conv.rs`: one small
//! free function per mapping, `match` over the source enum, no fallible
//! paths (every `rhit` variant maps to a valid Vulkan counterpart).

use ash::vk;
use rhit::*;

pub fn map_pixel_format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::R8Unorm => vk::Format::R8_UNORM,
        PixelFormat::Rg8Unorm => vk::Format::R8G8_UNORM,
        PixelFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        PixelFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        PixelFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        PixelFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        PixelFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        PixelFormat::R32Float => vk::Format::R32_SFLOAT,
        PixelFormat::D32Float => vk::Format::D32_SFLOAT,
        PixelFormat::D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        PixelFormat::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        PixelFormat::D16Unorm => vk::Format::D16_UNORM,
    }
}

pub fn map_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    flags
}

pub fn map_texture_usage(usage: TextureUsage, format: PixelFormat) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= if format.is_depth_stencil() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    flags
}

pub fn map_filter_mode(mode: FilterMode) -> vk::Filter {
    match mode {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

pub fn map_mipmap_mode(mode: FilterMode) -> vk::SamplerMipmapMode {
    match mode {
        FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub fn map_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub fn map_compare_function(func: CompareFunction) -> vk::CompareOp {
    match func {
        CompareFunction::Never => vk::CompareOp::NEVER,
        CompareFunction::Less => vk::CompareOp::LESS,
        CompareFunction::Equal => vk::CompareOp::EQUAL,
        CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunction::Greater => vk::CompareOp::GREATER,
        CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunction::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn map_shader_stage_flags(flags: ShaderStageFlags) -> vk::ShaderStageFlags {
    let mut out = vk::ShaderStageFlags::empty();
    if flags.contains(ShaderStageFlags::VERTEX) {
        out |= vk::ShaderStageFlags::VERTEX;
    }
    if flags.contains(ShaderStageFlags::FRAGMENT) {
        out |= vk::ShaderStageFlags::FRAGMENT;
    }
    if flags.contains(ShaderStageFlags::COMPUTE) {
        out |= vk::ShaderStageFlags::COMPUTE;
    }
    out
}

pub fn map_shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

pub fn map_descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
    }
}

pub fn map_primitive_topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

pub fn map_fill_mode(mode: FillMode) -> vk::PolygonMode {
    match mode {
        FillMode::Solid => vk::PolygonMode::FILL,
        FillMode::Wireframe => vk::PolygonMode::LINE,
    }
}

pub fn map_cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub fn map_front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
    }
}

pub fn map_blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

pub fn map_blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}

/// `vk::Extent2D` clamped between a surface's `min_image_extent` and
/// `max_image_extent`, as required before passing an extent to
/// `vkCreateSwapchainKHR`.
pub fn clamp_extent(requested: vk::Extent2D, caps: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// Maps a single `RhiAccess` state to the Vulkan image layout, pipeline
/// stage, and access mask a barrier into that state needs. Only the bits
/// the recorder and RDG executor
/// actually transition textures into are covered; an access with none of
/// those bits set degrades to `UNDEFINED`/`TOP_OF_PIPE`/empty access, which
/// is always a safe (if conservative) barrier target.
pub fn access_to_image_layout(access: RhiAccess) -> vk::ImageLayout {
    if access.contains(RhiAccess::PRESENT) {
        vk::ImageLayout::PRESENT_SRC_KHR
    } else if access.contains(RhiAccess::RTV) {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else if access.contains(RhiAccess::DSV_WRITE) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else if access.contains(RhiAccess::DSV_READ) {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    } else if access.intersects(RhiAccess::SRV_MASK) {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else if access.intersects(RhiAccess::UAV_MASK) {
        vk::ImageLayout::GENERAL
    } else if access.contains(RhiAccess::COPY_SRC) || access.contains(RhiAccess::RESOLVE_SRC) {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    } else if access.contains(RhiAccess::COPY_DST) || access.contains(RhiAccess::RESOLVE_DST) {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL
    } else {
        vk::ImageLayout::UNDEFINED
    }
}

pub fn access_to_stage_access(access: RhiAccess) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let mut stage = vk::PipelineStageFlags::empty();
    let mut mask = vk::AccessFlags::empty();

    if access.contains(RhiAccess::PRESENT) {
        stage |= vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }
    if access.contains(RhiAccess::CPU_READ) {
        stage |= vk::PipelineStageFlags::HOST;
        mask |= vk::AccessFlags::HOST_READ;
    }
    if access.contains(RhiAccess::INDIRECT_ARGS) {
        stage |= vk::PipelineStageFlags::DRAW_INDIRECT;
        mask |= vk::AccessFlags::INDIRECT_COMMAND_READ;
    }
    if access.contains(RhiAccess::VERTEX_OR_INDEX_BUFFER) {
        stage |= vk::PipelineStageFlags::VERTEX_INPUT;
        mask |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ;
    }
    if access.contains(RhiAccess::SRV_GRAPHICS) {
        stage |= vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::VERTEX_SHADER;
        mask |= vk::AccessFlags::SHADER_READ;
    }
    if access.contains(RhiAccess::SRV_COMPUTE) {
        stage |= vk::PipelineStageFlags::COMPUTE_SHADER;
        mask |= vk::AccessFlags::SHADER_READ;
    }
    if access.contains(RhiAccess::COPY_SRC) || access.contains(RhiAccess::RESOLVE_SRC) {
        stage |= vk::PipelineStageFlags::TRANSFER;
        mask |= vk::AccessFlags::TRANSFER_READ;
    }
    if access.contains(RhiAccess::COPY_DST) || access.contains(RhiAccess::RESOLVE_DST) {
        stage |= vk::PipelineStageFlags::TRANSFER;
        mask |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if access.contains(RhiAccess::DSV_READ) {
        stage |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        mask |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
    }
    if access.contains(RhiAccess::DSV_WRITE) {
        stage |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        mask |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    if access.contains(RhiAccess::RTV) {
        stage |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        mask |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if access.intersects(RhiAccess::UAV_GRAPHICS) {
        stage |= vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::VERTEX_SHADER;
        mask |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }
    if access.intersects(RhiAccess::UAV_COMPUTE) {
        stage |= vk::PipelineStageFlags::COMPUTE_SHADER;
        mask |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
    }

    if stage.is_empty() {
        stage = vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    (stage, mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_formats_round_trip_to_distinct_vk_formats() {
        let a = map_pixel_format(PixelFormat::Rgba8Unorm);
        let b = map_pixel_format(PixelFormat::Bgra8Unorm);
        assert_ne!(a, b);
        assert_eq!(map_pixel_format(PixelFormat::D32Float), vk::Format::D32_SFLOAT);
    }

    #[test]
    fn buffer_usage_flags_combine() {
        let usage = BufferUsage::VERTEX | BufferUsage::COPY_DST;
        let flags = map_buffer_usage(usage);
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!flags.contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }

    #[test]
    fn clamp_extent_respects_surface_bounds() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        };
        let clamped = clamp_extent(vk::Extent2D { width: 8000, height: 0 }, &caps);
        assert_eq!(clamped.width, 4096);
        assert_eq!(clamped.height, 1);
    }

    #[test]
    fn present_access_maps_to_present_layout() {
        assert_eq!(access_to_image_layout(RhiAccess::PRESENT), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn rtv_access_requests_color_attachment_write() {
        let (stage, mask) = access_to_stage_access(RhiAccess::RTV);
        assert!(stage.contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
        assert!(mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn unknown_access_degrades_to_top_of_pipe() {
        let (stage, mask) = access_to_stage_access(RhiAccess::UNKNOWN);
        assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert!(mask.is_empty());
    }
}
