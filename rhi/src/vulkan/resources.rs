//! Resource objects: buffers, textures, samplers, shader modules.
//!
//! Mirrors `wgpu-hal`'s `vulkan::Buffer`/`Texture`/`Sampler` in shape (a
//! native handle plus whatever backing memory it owns) but each resource
//! owns its own [`Allocation`] directly rather than going through a generic
//! `gpu_alloc::MemoryBlock` — the pool/dedicated split lives in
//! [`super::memory`].

use ash::vk;
use parking_lot::Mutex;
use rhit::*;

use super::conv;
use super::memory::{Allocation, AllocationRequest, MemoryManager};
use crate::DeviceError;

#[derive(Debug)]
pub struct Buffer {
    pub raw: vk::Buffer,
    pub size: u64,
    pub usage: BufferUsage,
    pub stride: u32,
    pub allocation: Allocation,
    /// `true` if `allocation.mapped_ptr` comes from a pool's persistent
    /// mapping rather than a mapping established just for this buffer.
    pub persistent_mapped: bool,
}

impl Buffer {
    pub unsafe fn create(
        device: &ash::Device,
        memory: &MemoryManager,
        desc: &BufferDescriptor,
    ) -> Result<Self, DeviceError> {
        profiling::scope!("Buffer::create");

        let vk_usage = conv::map_buffer_usage(desc.usage) | vk::BufferUsageFlags::TRANSFER_DST;
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(vk_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { device.create_buffer(&info, None)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(raw) };
        let mappable = matches!(desc.location, MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu)
            || desc.usage.intersects(BufferUsage::MAP_READ | BufferUsage::MAP_WRITE);

        let (required, preferred) = memory_properties_for(desc.location);
        let request = AllocationRequest {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
            required_properties: required,
            preferred_properties: preferred,
            dedicated: desc.dedicated,
            mappable,
        };

        let allocation = match memory.allocate(device, request) {
            Ok(a) => a,
            Err(err) => {
                unsafe { device.destroy_buffer(raw, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe {
            device.bind_buffer_memory(raw, allocation.device_memory, allocation.offset)
        } {
            memory.free(device, allocation);
            unsafe { device.destroy_buffer(raw, None) };
            return Err(err.into());
        }

        let persistent_mapped = allocation.mapped_ptr.is_some() && !allocation.dedicated;

        Ok(Self {
            raw,
            size: desc.size,
            usage: desc.usage,
            stride: 0,
            allocation,
            persistent_mapped,
        })
    }

    /// Returns a mapped host-visible slice, or `None` if this buffer's
    /// memory type is not host-visible. `unmap` is a no-op by design: the
    /// mapping (whether pool-persistent or dedicated) lives for the
    /// resource's lifetime.
    pub fn map(&self) -> Option<&mut [u8]> {
        self.allocation.mapped_slice()
    }

    /// Releases the native handle. Freeing the backing [`Allocation`] is
    /// the caller's responsibility via the device's deferred-destruction
    /// queue — resources never free memory eagerly during a live frame
    ///.
    pub unsafe fn destroy_raw(&self, device: &ash::Device) {
        unsafe { device.destroy_buffer(self.raw, None) };
    }
}

fn memory_properties_for(location: MemoryLocation) -> (vk::MemoryPropertyFlags, vk::MemoryPropertyFlags) {
    match location {
        MemoryLocation::DeviceLocal => (
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ),
        MemoryLocation::CpuToGpu => (
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ),
        MemoryLocation::GpuToCpu => (
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        ),
    }
}

#[derive(Debug)]
pub struct Texture {
    pub raw: vk::Image,
    pub default_view: vk::ImageView,
    pub default_sampler: Option<vk::Sampler>,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: PixelFormat,
    pub sample_count: u32,
    pub usage: TextureUsage,
    pub current_layout: Mutex<vk::ImageLayout>,
    pub allocation: Allocation,
}

impl Texture {
    pub unsafe fn create(
        device: &ash::Device,
        memory: &MemoryManager,
        desc: &TextureDescriptor,
    ) -> Result<Self, DeviceError> {
        profiling::scope!("Texture::create");

        let format = conv::map_pixel_format(desc.format);
        let usage = conv::map_texture_usage(desc.usage, desc.format)
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC;
        let extent = vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
        };

        let info = vk::ImageCreateInfo::default()
            .image_type(if desc.depth > 1 {
                vk::ImageType::TYPE_3D
            } else {
                vk::ImageType::TYPE_2D
            })
            .format(format)
            .extent(extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(sample_count_flags(desc.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { device.create_image(&info, None)? };

        let requirements = unsafe { device.get_image_memory_requirements(raw) };
        let request = AllocationRequest {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
            required_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            preferred_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            dedicated: desc.is_render_target() || desc.usage.contains(TextureUsage::TRANSIENT),
            mappable: false,
        };
        let allocation = match memory.allocate(device, request) {
            Ok(a) => a,
            Err(err) => {
                unsafe { device.destroy_image(raw, None) };
                return Err(err);
            }
        };

        if let Err(err) =
            unsafe { device.bind_image_memory(raw, allocation.device_memory, allocation.offset) }
        {
            memory.free(device, allocation);
            unsafe { device.destroy_image(raw, None) };
            return Err(err.into());
        }

        let aspect = aspect_mask(desc.format);
        let view_info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(if desc.array_layers > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: desc.array_layers,
            });
        let default_view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(v) => v,
            Err(err) => {
                memory.free(device, allocation);
                unsafe { device.destroy_image(raw, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            raw,
            default_view,
            default_sampler: None,
            extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            format: desc.format,
            sample_count: desc.sample_count,
            usage: desc.usage,
            current_layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            allocation,
        })
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_layers
    }

    pub unsafe fn destroy_raw(&self, device: &ash::Device) {
        unsafe {
            device.destroy_image_view(self.default_view, None);
            device.destroy_image(self.raw, None);
        }
    }
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

fn aspect_mask(format: PixelFormat) -> vk::ImageAspectFlags {
    if !format.is_depth_stencil() {
        vk::ImageAspectFlags::COLOR
    } else if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

#[derive(Debug)]
pub struct Sampler {
    pub raw: vk::Sampler,
}

impl Sampler {
    pub unsafe fn create(device: &ash::Device, desc: &SamplerDescriptor) -> Result<Self, DeviceError> {
        let anisotropy_enable = desc.max_anisotropy > 1.0;
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(conv::map_filter_mode(desc.mag_filter))
            .min_filter(conv::map_filter_mode(desc.min_filter))
            .mipmap_mode(conv::map_mipmap_mode(desc.mipmap_filter))
            .address_mode_u(conv::map_address_mode(desc.address_mode_u))
            .address_mode_v(conv::map_address_mode(desc.address_mode_v))
            .address_mode_w(conv::map_address_mode(desc.address_mode_w))
            .anisotropy_enable(anisotropy_enable)
            .max_anisotropy(desc.max_anisotropy.max(1.0))
            .compare_enable(desc.compare.is_some())
            .compare_op(desc.compare.map(conv::map_compare_function).unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(desc.lod_min_clamp)
            .max_lod(desc.lod_max_clamp)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);
        let raw = unsafe { device.create_sampler(&info, None)? };
        Ok(Self { raw })
    }

    pub unsafe fn destroy_raw(&self, device: &ash::Device) {
        unsafe { device.destroy_sampler(self.raw, None) };
    }
}

/// A shader module plus the descriptor bindings discovered by reflection.
#[derive(Debug)]
pub struct ShaderModule {
    pub raw: vk::ShaderModule,
    pub stage: ShaderStage,
    pub bindings: Vec<DescriptorBinding>,
}

impl ShaderModule {
    pub unsafe fn create(
        device: &ash::Device,
        stage: ShaderStage,
        bytecode: &[u8],
    ) -> Result<Self, DeviceError> {
        let words = validate_spirv(bytecode)?;
        let bindings = reflect_bindings(&words, conv::map_shader_stage(stage));

        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        let raw = unsafe { device.create_shader_module(&info, None)? };

        Ok(Self { raw, stage, bindings })
    }

    pub unsafe fn destroy_raw(&self, device: &ash::Device) {
        unsafe { device.destroy_shader_module(self.raw, None) };
    }
}

/// SPIR-V magic number: the first four bytes of any valid module.
const SPIRV_MAGIC: u32 = 0x0723_0203;

fn validate_spirv(bytecode: &[u8]) -> Result<Vec<u32>, DeviceError> {
    if bytecode.len() % 4 != 0 {
        return Err(DeviceError::InvalidShaderBytecode(
            "length is not a multiple of 4".to_string(),
        ));
    }
    let words: Vec<u32> = bytecode
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words.first().copied() != Some(SPIRV_MAGIC) {
        return Err(DeviceError::InvalidShaderBytecode(
            "missing SPIR-V magic number".to_string(),
        ));
    }
    Ok(words)
}

/// SPIR-V opcode numbers this minimal reflection pass cares about. Spec §6:
/// "Reflection reads only `OpDecorate` ... and `OpVariable`".
const OP_DECORATE: u16 = 71;
const OP_VARIABLE: u16 = 59;

const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;

const STORAGE_CLASS_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_CLASS_UNIFORM: u32 = 2;

/// Walks the SPIR-V instruction stream (after the 5-word header) collecting
/// `(binding, descriptor_set)` decorations per result-id and the storage
/// class of every `OpVariable`, then joins them into [`DescriptorBinding`]s.
/// Unrecognised or unbound variables are ignored.
fn reflect_bindings(words: &[u32], stage_flags: vk::ShaderStageFlags) -> Vec<DescriptorBinding> {
    use rustc_hash::FxHashMap;

    let stage_flags = stage_flags_from_vk(stage_flags);

    let mut bindings: FxHashMap<u32, u32> = FxHashMap::default();
    let mut sets: FxHashMap<u32, u32> = FxHashMap::default();
    let mut variables: Vec<(u32, u32)> = Vec::new(); // (result_id, storage_class)

    let mut cursor = 5usize; // skip the 5-word SPIR-V header
    while cursor < words.len() {
        let instruction = words[cursor];
        let word_count = (instruction >> 16) as usize;
        let opcode = (instruction & 0xFFFF) as u16;
        if word_count == 0 || cursor + word_count > words.len() {
            break;
        }
        let operands = &words[cursor + 1..cursor + word_count];

        if opcode == OP_DECORATE && operands.len() >= 2 {
            let target = operands[0];
            let decoration = operands[1];
            if decoration == DECORATION_BINDING && operands.len() >= 3 {
                bindings.insert(target, operands[2]);
            } else if decoration == DECORATION_DESCRIPTOR_SET && operands.len() >= 3 {
                sets.insert(target, operands[2]);
            }
        } else if opcode == OP_VARIABLE && operands.len() >= 3 {
            // OpVariable: result-type, result-id, storage-class, [initializer]
            let result_id = operands[1];
            let storage_class = operands[2];
            variables.push((result_id, storage_class));
        }

        cursor += word_count;
    }

    variables
        .into_iter()
        .filter_map(|(id, storage_class)| {
            let descriptor_type = match storage_class {
                STORAGE_CLASS_UNIFORM_CONSTANT => DescriptorType::CombinedImageSampler,
                STORAGE_CLASS_UNIFORM => DescriptorType::UniformBuffer,
                _ => return None,
            };
            let binding = *bindings.get(&id)?;
            let set = *sets.get(&id)?;
            Some(DescriptorBinding {
                set,
                binding,
                descriptor_type,
                count: 1,
                stage_flags,
            })
        })
        .collect()
}

fn stage_flags_from_vk(flags: vk::ShaderStageFlags) -> ShaderStageFlags {
    let mut out = ShaderStageFlags::empty();
    if flags.contains(vk::ShaderStageFlags::VERTEX) {
        out |= ShaderStageFlags::VERTEX;
    }
    if flags.contains(vk::ShaderStageFlags::FRAGMENT) {
        out |= ShaderStageFlags::FRAGMENT;
    }
    if flags.contains(vk::ShaderStageFlags::COMPUTE) {
        out |= ShaderStageFlags::COMPUTE;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn rejects_bad_magic() {
        let bytecode = encode(&[0xDEADBEEF, 0, 0, 0, 0]);
        assert!(validate_spirv(&bytecode).is_err());
    }

    #[test]
    fn rejects_non_multiple_of_four_length() {
        let mut bytecode = encode(&[SPIRV_MAGIC, 0, 0, 0, 0]);
        bytecode.push(0);
        assert!(validate_spirv(&bytecode).is_err());
    }

    #[test]
    fn accepts_minimal_valid_header() {
        let bytecode = encode(&[SPIRV_MAGIC, 0x00010000, 0, 1, 0]);
        assert!(validate_spirv(&bytecode).is_ok());
    }

    #[test]
    fn reflects_uniform_buffer_binding() {
        // %var = OpVariable %ptr Uniform ; decorated Binding=3, DescriptorSet=1
        let result_id = 100u32;
        let decorate_binding = [(2u32 << 16) | OP_DECORATE as u32, result_id, DECORATION_BINDING, 3];
        let decorate_set = [(2u32 << 16) | OP_DECORATE as u32, result_id, DECORATION_DESCRIPTOR_SET, 1];
        let op_variable = [
            (3u32 << 16) | OP_VARIABLE as u32,
            42, // result type
            result_id,
            STORAGE_CLASS_UNIFORM,
        ];

        let mut words = vec![SPIRV_MAGIC, 0x00010000, 0, 200, 0];
        words.extend_from_slice(&fix_word_counts(&decorate_binding));
        words.extend_from_slice(&fix_word_counts(&decorate_set));
        words.extend_from_slice(&fix_word_counts(&op_variable));

        let bindings = reflect_bindings(&words, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].set, 1);
        assert_eq!(bindings[0].binding, 3);
        assert_eq!(bindings[0].descriptor_type, DescriptorType::UniformBuffer);
    }

    /// Recomputes `(word_count << 16) | opcode` for a hand-assembled
    /// instruction so the fixture above reads naturally.
    fn fix_word_counts(instruction: &[u32]) -> Vec<u32> {
        let opcode = instruction[0] & 0xFFFF;
        let mut out = instruction.to_vec();
        out[0] = ((instruction.len() as u32) << 16) | opcode;
        out
    }
}
