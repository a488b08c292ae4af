//! The device: instance/surface/physical+logical device, swapchain, depth
//! buffer, default render pass and per-image framebuffers, synchronisation
//! primitives, and the caches/memory manager they all sit on top of.
//!
//! Object lifetime and cache wiring follow `wgpu-hal`'s
//! `vulkan::Device`/`Adapter` shape (one big struct owning `ash::Device`
//! plus the subsystems built on it).

use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use rhit::*;

use crate::handle::{Arena, BufferHandle, PipelineHandle, SamplerHandle, ShaderHandle, TextureHandle};
use crate::{CommandError, DeviceError, MemoryStats, SurfaceError};

use super::command::{CommandBufferManager, Context};
use super::conv;
use super::descriptor::{DescriptorLayoutCache, DescriptorPoolManager, DescriptorSetCache};
use super::loader::BackendLoader;
use super::memory::MemoryManager;
use super::pipeline::PipelineCache;
use super::render_target::{AttachmentOps, FramebufferCache, LoadOp, RenderPassCache, RenderPassKey, RenderTargetInfo, StoreOp};
use super::resources::{Buffer, Sampler, ShaderModule, Texture};

/// A resource queued for destruction `MAX_FRAMES_IN_FLIGHT + 1` frames from
/// now.
enum Garbage {
    Buffer(vk::Buffer, super::memory::Allocation),
    Image(vk::Image, vk::ImageView, super::memory::Allocation),
}

struct GarbageEntry {
    garbage: Garbage,
    frames_remaining: u32,
}

/// Depth buffer backing the default render pass; recreated alongside the
/// swapchain.
struct DepthResources {
    image: vk::Image,
    view: vk::ImageView,
    allocation: super::memory::Allocation,
    format: vk::Format,
}

/// Per-swapchain-image state: the image, its view, and its framebuffer.
/// The fence of whichever frame slot last used this image lives in
/// `Device::image_fences` instead of here, behind a `Mutex`, since
/// `prepare_frame` only has `&self`.
struct ImageSlot {
    image: vk::Image,
    view: vk::ImageView,
    framebuffer: vk::Framebuffer,
    render_finished: vk::Semaphore,
}

/// Per-frame-in-flight synchronisation: one image-available semaphore and
/// one fence, recycled in a ring of [`rhit::MAX_FRAMES_IN_FLIGHT`] slots.
struct FrameSlot {
    image_available: vk::Semaphore,
    fence: vk::Fence,
}

pub struct Device {
    _entry: BackendLoader,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: vk::DebugUtilsMessengerEXT,
    /// Device-level `VK_EXT_debug_utils` label/marker commands, loaded
    /// alongside the instance-level messenger when validation is enabled
    ///.
    pub(crate) debug_utils_device: Option<ash::ext::debug_utils::Device>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    graphics_family: u32,
    present_family: u32,

    swapchain_device: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    images: Vec<ImageSlot>,
    /// `image_fences[i]` is the fence of whichever frame slot last acquired
    /// swapchain image `i`, so `prepare_frame` can wait on it from `&self`.
    image_fences: Mutex<Vec<Option<vk::Fence>>>,
    depth: DepthResources,

    pub(crate) default_render_pass: vk::RenderPass,

    command_pool: vk::CommandPool,
    pub(crate) command_buffers: CommandBufferManager,
    pub(crate) context: Mutex<Context>,

    frame_slots: Vec<FrameSlot>,
    pub(crate) current_frame: AtomicU64,
    current_image_index: Mutex<u32>,

    garbage: Mutex<Vec<GarbageEntry>>,

    memory: MemoryManager,
    pub(crate) layouts: DescriptorLayoutCache,
    pub(crate) pools: DescriptorPoolManager,
    pub(crate) set_cache: DescriptorSetCache,
    pub(crate) render_passes: RenderPassCache,
    pub(crate) framebuffers: FramebufferCache,
    pipelines: PipelineCache,

    pub(crate) buffers: Mutex<Arena<Buffer>>,
    pub(crate) textures: Mutex<Arena<Texture>>,
    pub(crate) samplers: Mutex<Arena<Sampler>>,
    pub(crate) shaders: Mutex<Arena<ShaderModule>>,
    pub(crate) pipeline_descs: Mutex<Arena<PipelineStateDescriptor<ShaderHandle>>>,
}

const DEVICE_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

impl Device {
    /// Brings up the instance, device, swapchain, and caches in the order a
    /// Vulkan application must follow: instance, optional debug messenger,
    /// surface, physical device selection, logical device, swapchain,
    /// depth resources, then the sub-allocator and descriptor/pipeline
    /// caches that depend on a live `ash::Device`.
    pub fn new(
        config: &RhiConfig,
        window: &(impl HasWindowHandle + HasDisplayHandle),
    ) -> Result<Self, DeviceError> {
        profiling::scope!("Device::new");

        let entry = BackendLoader::new()?;
        let instance = unsafe { create_instance(&entry, config, window)? };

        let debug_utils_loader = ash::ext::debug_utils::Instance::new(entry.entry(), &instance);
        let debug_messenger = if config.enable_validation {
            unsafe { setup_debug_messenger(&debug_utils_loader)? }
        } else {
            vk::DebugUtilsMessengerEXT::null()
        };

        let surface_loader = ash::khr::surface::Instance::new(entry.entry(), &instance);
        let surface = unsafe {
            ash_window::create_surface(
                entry.entry(),
                &instance,
                window.display_handle().map_err(|_| DeviceError::SurfaceCreationFailed)?.as_raw(),
                window.window_handle().map_err(|_| DeviceError::SurfaceCreationFailed)?.as_raw(),
                None,
            )
            .map_err(|_| DeviceError::SurfaceCreationFailed)?
        };

        let (physical_device, graphics_family, present_family, memory_properties) =
            unsafe { select_physical_device(&instance, &surface_loader, surface)? };

        let device = unsafe { create_logical_device(&instance, physical_device, graphics_family, present_family)? };
        let debug_utils_device = config
            .enable_validation
            .then(|| ash::ext::debug_utils::Device::new(&instance, &device));
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        let swapchain_device = ash::khr::swapchain::Device::new(&instance, &device);

        let (swapchain, format, extent, raw_images) = unsafe {
            create_swapchain(
                &instance,
                &surface_loader,
                surface,
                physical_device,
                &swapchain_device,
                graphics_family,
                present_family,
                config,
                vk::SwapchainKHR::null(),
            )?
        };

        let memory = MemoryManager::new(memory_properties);
        let depth = unsafe { create_depth_resources(&instance, &device, physical_device, &memory, extent)? };

        let render_pass_key = default_render_pass_key(format, depth.format);
        let render_passes = RenderPassCache::new();
        let default_render_pass = render_passes.get_or_create(&device, &render_pass_key)?;

        let framebuffers = FramebufferCache::new();
        let mut views = Vec::with_capacity(raw_images.len());
        for &image in &raw_images {
            let view = unsafe { create_color_view(&device, image, format)? };
            views.push(view);
        }

        let mut images = Vec::with_capacity(raw_images.len());
        for (image, view) in raw_images.into_iter().zip(views.into_iter()) {
            let rt_info = RenderTargetInfo {
                color_formats: vec![pixel_format_from_vk(format)],
                color_ops: vec![AttachmentOps { load: LoadOp::Clear, store: StoreOp::Store }],
                color_views: vec![view],
                depth_stencil_format: Some(pixel_format_from_vk(depth.format)),
                depth_stencil_ops: Some(AttachmentOps { load: LoadOp::Clear, store: StoreOp::DontCare }),
                depth_stencil_view: Some(depth.view),
                sample_count: 1,
                width: extent.width,
                height: extent.height,
                presentable: true,
            };
            let framebuffer = framebuffers.get_or_create(&device, default_render_pass, &rt_info)?;
            let render_finished = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
            images.push(ImageSlot { image, view, framebuffer, render_finished });
        }
        let image_fences = Mutex::new(vec![None; images.len()]);

        let command_pool = unsafe {
            let info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(graphics_family);
            device.create_command_pool(&info, None)?
        };
        let command_buffers = unsafe { CommandBufferManager::new(&device, command_pool)? };

        let mut frame_slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT as usize);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let image_available = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let fence = unsafe { device.create_fence(&fence_info, None)? };
            frame_slots.push(FrameSlot { image_available, fence });
        }

        let layouts = DescriptorLayoutCache::new();
        let pools = DescriptorPoolManager::new(&device, DESCRIPTOR_SETS_PER_POOL)?;
        let set_cache = DescriptorSetCache::new();
        let pipelines = unsafe { PipelineCache::new(&device, None)? };

        Ok(Self {
            _entry: entry,
            instance,
            debug_utils: Some(debug_utils_loader),
            debug_messenger,
            debug_utils_device,
            surface_loader,
            surface,
            physical_device,
            device,
            graphics_queue,
            present_queue,
            graphics_family,
            present_family,
            swapchain_device,
            swapchain,
            swapchain_format: format,
            swapchain_extent: extent,
            images,
            image_fences,
            depth,
            default_render_pass,
            command_pool,
            command_buffers,
            context: Mutex::new(Context::new()),
            frame_slots,
            current_frame: AtomicU64::new(0),
            current_image_index: Mutex::new(0),
            garbage: Mutex::new(Vec::new()),
            memory,
            layouts,
            pools,
            set_cache,
            render_passes,
            framebuffers,
            pipelines,
            buffers: Mutex::new(Arena::new()),
            textures: Mutex::new(Arena::new()),
            samplers: Mutex::new(Arena::new()),
            shaders: Mutex::new(Arena::new()),
            pipeline_descs: Mutex::new(Arena::new()),
        })
    }

    pub fn create_buffer(&self, desc: &BufferDescriptor) -> Result<BufferHandle, DeviceError> {
        let buffer = unsafe { Buffer::create(&self.device, &self.memory, desc)? };
        Ok(self.buffers.lock().insert(buffer).0)
    }

    pub fn create_texture(&self, desc: &TextureDescriptor) -> Result<TextureHandle, DeviceError> {
        let texture = unsafe { Texture::create(&self.device, &self.memory, desc)? };
        Ok(self.textures.lock().insert(texture).0)
    }

    pub fn create_sampler(&self, desc: &SamplerDescriptor) -> Result<SamplerHandle, DeviceError> {
        let sampler = unsafe { Sampler::create(&self.device, desc)? };
        Ok(self.samplers.lock().insert(sampler).0)
    }

    pub fn create_shader(&self, stage: ShaderStage, bytecode: &[u8]) -> Result<ShaderHandle, DeviceError> {
        let module = unsafe { ShaderModule::create(&self.device, stage, bytecode)? };
        Ok(self.shaders.lock().insert(module).0)
    }

    pub fn create_pipeline_state(
        &self,
        desc: PipelineStateDescriptor<ShaderHandle>,
    ) -> Result<PipelineHandle, DeviceError> {
        Ok(self.pipeline_descs.lock().insert(desc).0)
    }

    /// Resolves and builds (on cache miss) the native pipeline+layout for
    /// `handle`.
    pub(crate) fn resolve_pipeline(
        &self,
        handle: PipelineHandle,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout), DeviceError> {
        let descs = self.pipeline_descs.lock();
        let desc = descs
            .get(handle)
            .ok_or(DeviceError::InvalidHandle)?
            .clone();
        drop(descs);
        let key = super::pipeline::PipelineStateKey { desc };
        let shaders = self.shaders.lock();
        let current_frame = self.current_frame.load(Ordering::Relaxed);
        self.pipelines.get_or_create(
            &self.device,
            &self.layouts,
            &self.render_passes,
            &key,
            &|h: ShaderHandle| {
                // SAFETY: the returned reference does not outlive this call;
                // `get_or_create` only reads it before returning.
                unsafe { std::mem::transmute(shaders.get(h)) }
            },
            current_frame,
        )
    }

    pub fn immediate_recorder(&self) -> super::recorder::Recorder<'_> {
        super::recorder::Recorder::new(self)
    }

    /// The command buffer currently active for this frame-in-flight slot
    ///.
    pub(crate) fn active_command_buffer(&self) -> vk::CommandBuffer {
        let frame = (self.current_frame.load(Ordering::Relaxed) % MAX_FRAMES_IN_FLIGHT as u64) as usize;
        self.command_buffers.active(frame)
    }

    /// Rebinds the context's default render target back to the swapchain
    /// image acquired by the last `prepare_frame()`.
    pub(crate) fn reset_context_to_default_target(&self) {
        let image_index = *self.current_image_index.lock();
        self.context.lock().reset(
            self.active_command_buffer(),
            self.default_render_pass,
            self.images[image_index as usize].framebuffer,
            self.swapchain_extent,
        );
    }

    pub fn wait_for_idle(&self) {
        unsafe { self.device.device_wait_idle().ok() };
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let stats = self.memory.stats();
        MemoryStats {
            used_bytes: stats.total_allocated,
            reserved_bytes: stats.total_reserved,
            allocation_count: stats.allocation_count,
            dedicated_count: stats.dedicated_count,
            largest_free_block: stats.largest_free_block,
        }
    }

    pub fn collect_garbage(&self) {
        self.memory.defragment_all();
        self.memory.trim_unused_pools(&self.device);
    }

    /// Acquires the next swapchain image, waiting on the relevant
    /// in-flight fence before reusing that frame slot's resources.
    pub fn prepare_frame(&self) -> Result<u32, SurfaceError> {
        profiling::scope!("Device::prepare_frame");
        let frame = (self.current_frame.load(Ordering::Relaxed) % MAX_FRAMES_IN_FLIGHT as u64) as usize;
        let slot = &self.frame_slots[frame];

        unsafe {
            self.device.wait_for_fences(&[slot.fence], true, u64::MAX).map_err(DeviceError::from)?;
        }

        let (image_index, suboptimal) = unsafe {
            self.swapchain_device
                .acquire_next_image(self.swapchain, u64::MAX, slot.image_available, vk::Fence::null())
                .map_err(|e| match e {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => SurfaceError::Outdated,
                    vk::Result::ERROR_SURFACE_LOST_KHR => SurfaceError::Lost,
                    other => SurfaceError::Other(other.into()),
                })?
        };
        if suboptimal {
            log::debug!("swapchain image {image_index} acquired suboptimal");
        }

        let previous_fence = {
            let mut image_fences = self.image_fences.lock();
            std::mem::replace(&mut image_fences[image_index as usize], Some(slot.fence))
        };
        if let Some(fence) = previous_fence {
            unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX).map_err(DeviceError::from)? };
        }
        unsafe { self.device.reset_fences(&[slot.fence]).map_err(DeviceError::from)? };

        *self.current_image_index.lock() = image_index;
        self.command_buffers.begin_frame(&self.device, frame)?;
        self.context.lock().reset(
            self.command_buffers.active(frame),
            self.default_render_pass,
            self.images[image_index as usize].framebuffer,
            self.swapchain_extent,
        );
        Ok(image_index)
    }

    /// Submits the active command buffer and queues the present, rolling
    /// the frame-local caches forward.
    pub fn present(&self) -> Result<(), SurfaceError> {
        profiling::scope!("Device::present");
        let frame_number = self.current_frame.load(Ordering::Relaxed);
        let frame = (frame_number % MAX_FRAMES_IN_FLIGHT as u64) as usize;
        let image_index = *self.current_image_index.lock();
        let slot = &self.frame_slots[frame];
        let image_slot = &self.images[image_index as usize];

        unsafe {
            self.device.end_command_buffer(self.command_buffers.active(frame)).map_err(DeviceError::from)?;
        }

        let wait = [slot.image_available];
        let signal = [image_slot.render_finished];
        let stage_mask = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cmd_buffers = [self.command_buffers.active(frame)];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stage_mask)
            .command_buffers(&cmd_buffers)
            .signal_semaphores(&signal);
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], slot.fence)
                .map_err(DeviceError::from)?;
        }

        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let present_result = unsafe { self.swapchain_device.queue_present(self.present_queue, &present_info) };
        match present_result {
            Ok(_) => {}
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(SurfaceError::Outdated),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => return Err(SurfaceError::Lost),
            Err(other) => return Err(SurfaceError::Other(other.into())),
        }

        let next_frame = frame_number + 1;
        self.current_frame.store(next_frame, Ordering::Relaxed);
        self.pools.begin_frame(&self.device, next_frame);
        self.set_cache.reset(next_frame);
        self.layouts.garbage_collect(&self.device, next_frame, 120);
        self.drain_garbage_step();
        Ok(())
    }

    /// Decrements every deferred-destruction entry's countdown by one and
    /// releases those that reach zero.
    fn drain_garbage_step(&self) {
        let mut garbage = self.garbage.lock();
        let mut i = 0;
        while i < garbage.len() {
            garbage[i].frames_remaining = garbage[i].frames_remaining.saturating_sub(1);
            if garbage[i].frames_remaining == 0 {
                let entry = garbage.swap_remove(i);
                match entry.garbage {
                    Garbage::Buffer(raw, allocation) => unsafe {
                        self.device.destroy_buffer(raw, None);
                        self.memory.free(&self.device, allocation);
                    },
                    Garbage::Image(raw, view, allocation) => unsafe {
                        self.device.destroy_image_view(view, None);
                        self.device.destroy_image(raw, None);
                        self.memory.free(&self.device, allocation);
                    },
                }
            } else {
                i += 1;
            }
        }
    }

    pub fn defer_buffer(&self, handle: BufferHandle) {
        if let Some(buffer) = self.buffers.lock().remove(handle) {
            self.garbage.lock().push(GarbageEntry {
                garbage: Garbage::Buffer(buffer.raw, buffer.allocation),
                frames_remaining: MAX_FRAMES_IN_FLIGHT + 1,
            });
        }
    }

    pub fn defer_texture(&self, handle: TextureHandle) {
        if let Some(texture) = self.textures.lock().remove(handle) {
            self.garbage.lock().push(GarbageEntry {
                garbage: Garbage::Image(texture.raw, texture.default_view, texture.allocation),
                frames_remaining: MAX_FRAMES_IN_FLIGHT + 1,
            });
        }
    }

    /// Recreates the swapchain and everything downstream of its extent
    ///. A zero extent is not an error:
    /// the caller should keep calling until the window is restored.
    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<bool, DeviceError> {
        if width == 0 || height == 0 {
            return Ok(false);
        }
        self.wait_for_idle();

        for image in &self.images {
            unsafe {
                self.device.destroy_framebuffer(image.framebuffer, None);
                self.device.destroy_image_view(image.view, None);
                self.device.destroy_semaphore(image.render_finished, None);
            }
        }
        self.images.clear();
        self.image_fences.lock().clear();
        unsafe { destroy_depth_resources(&self.device, &self.memory, &self.depth) };

        let old_swapchain = self.swapchain;
        let (swapchain, format, extent, raw_images) = unsafe {
            create_swapchain(
                &self.instance,
                &self.surface_loader,
                self.surface,
                self.physical_device,
                &self.swapchain_device,
                self.graphics_family,
                self.present_family,
                &RhiConfig { window_width: width, window_height: height, ..Default::default() },
                old_swapchain,
            )?
        };
        unsafe { self.swapchain_device.destroy_swapchain(old_swapchain, None) };

        self.swapchain = swapchain;
        self.swapchain_format = format;
        self.swapchain_extent = extent;
        self.depth = unsafe { create_depth_resources(&self.instance, &self.device, self.physical_device, &self.memory, extent)? };

        for &image in &raw_images {
            let view = unsafe { create_color_view(&self.device, image, format)? };
            let rt_info = RenderTargetInfo {
                color_formats: vec![pixel_format_from_vk(format)],
                color_ops: vec![AttachmentOps { load: LoadOp::Clear, store: StoreOp::Store }],
                color_views: vec![view],
                depth_stencil_format: Some(pixel_format_from_vk(self.depth.format)),
                depth_stencil_ops: Some(AttachmentOps { load: LoadOp::Clear, store: StoreOp::DontCare }),
                depth_stencil_view: Some(self.depth.view),
                sample_count: 1,
                width: extent.width,
                height: extent.height,
                presentable: true,
            };
            let framebuffer = self.framebuffers.get_or_create(&self.device, self.default_render_pass, &rt_info)?;
            let render_finished = unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
            self.images.push(ImageSlot { image, view, framebuffer, render_finished });
            self.image_fences.lock().push(None);
        }

        Ok(true)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.wait_for_idle();
        unsafe {
            self.layouts.clear(&self.device);
            self.pools.clear(&self.device);
            self.pipelines.clear(&self.device);
            self.framebuffers.clear(&self.device);
            self.render_passes.clear(&self.device);
            destroy_depth_resources(&self.device, &self.memory, &self.depth);
            for image in &self.images {
                self.device.destroy_framebuffer(image.framebuffer, None);
                self.device.destroy_image_view(image.view, None);
                self.device.destroy_semaphore(image.render_finished, None);
            }
            for slot in &self.frame_slots {
                self.device.destroy_semaphore(slot.image_available, None);
                self.device.destroy_fence(slot.fence, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.swapchain_device.destroy_swapchain(self.swapchain, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(debug_utils) = &self.debug_utils {
                if self.debug_messenger != vk::DebugUtilsMessengerEXT::null() {
                    debug_utils.destroy_debug_utils_messenger(self.debug_messenger, None);
                }
            }
            self.instance.destroy_instance(None);
        }
    }
}

unsafe fn create_instance(
    entry: &BackendLoader,
    config: &RhiConfig,
    window: &impl HasDisplayHandle,
) -> Result<ash::Instance, DeviceError> {
    let app_name = CString::new(config.application_name.as_str()).unwrap_or_default();
    let engine_name = CString::new("monster-rhi").unwrap();
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(config.application_version)
        .engine_name(&engine_name)
        .engine_version(1)
        .api_version(vk::API_VERSION_1_2);

    let required_surface_extensions = ash_window::enumerate_required_extensions(
        window.display_handle().map_err(|_| DeviceError::SurfaceCreationFailed)?.as_raw(),
    )
    .map_err(|_| DeviceError::SurfaceCreationFailed)?;

    let supported = entry.supported_instance_extensions()?;
    let is_supported = |name: &CStr| supported.iter().any(|s| s.as_c_str() == name);

    let mut extensions = Vec::with_capacity(required_surface_extensions.len() + 1);
    for &raw in required_surface_extensions {
        let name = unsafe { CStr::from_ptr(raw) };
        if !is_supported(name) {
            return Err(DeviceError::MissingRequiredExtension(name.to_string_lossy().into_owned()));
        }
        extensions.push(raw);
    }
    if config.enable_validation {
        if is_supported(ash::ext::debug_utils::NAME) {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        } else {
            log::warn!("validation requested but VK_EXT_debug_utils is not available");
        }
    }

    let mut layers = Vec::new();
    let validation_layer = CString::new("VK_LAYER_KHRONOS_validation").unwrap();
    if config.enable_validation {
        let supported = entry.supported_instance_layers()?;
        if supported.iter().any(|s| s.as_c_str() == validation_layer.as_c_str()) {
            layers.push(validation_layer.as_ptr());
        } else {
            log::warn!("validation requested but VK_LAYER_KHRONOS_validation is not available");
        }
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);
    unsafe { entry.entry().create_instance(&create_info, None).map_err(DeviceError::from) }
}

unsafe fn setup_debug_messenger(
    loader: &ash::ext::debug_utils::Instance,
) -> Result<vk::DebugUtilsMessengerEXT, DeviceError> {
    let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    unsafe { loader.create_debug_utils_messenger(&info, None).map_err(DeviceError::from) }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[vulkan] {message}");
    } else {
        log::warn!("[vulkan] {message}");
    }
    vk::FALSE
}

/// Scores discrete ≫ integrated ≫ other and requires swapchain support and
/// a graphics+present queue family.
unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32, u32, vk::PhysicalDeviceMemoryProperties), DeviceError> {
    let devices = unsafe { instance.enumerate_physical_devices().map_err(DeviceError::from)? };
    let mut best: Option<(i32, vk::PhysicalDevice, u32, u32)> = None;

    for device in devices {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(DeviceError::from)?
        };
        let has_swapchain = extensions.iter().any(|e| {
            CStr::from_bytes_until_nul(bytemuck_name(&e.extension_name))
                .map(|n| n == ash::khr::swapchain::NAME)
                .unwrap_or(false)
        });
        if !has_swapchain {
            continue;
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let mut graphics_family = None;
        let mut present_family = None;
        for (i, family) in queue_families.iter().enumerate() {
            let i = i as u32;
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                graphics_family.get_or_insert(i);
            }
            let supports_present = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, i, surface)
                    .unwrap_or(false)
            };
            if supports_present {
                present_family.get_or_insert(i);
            }
        }
        let (Some(graphics_family), Some(present_family)) = (graphics_family, present_family) else {
            continue;
        };

        let score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 2,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            _ => 0,
        };
        if best.as_ref().map(|(s, ..)| score > *s).unwrap_or(true) {
            best = Some((score, device, graphics_family, present_family));
        }
    }

    let (_, physical_device, graphics_family, present_family) = best.ok_or(DeviceError::NoSuitableDevice)?;
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    Ok((physical_device, graphics_family, present_family, memory_properties))
}

fn bytemuck_name(name: &[std::os::raw::c_char]) -> &[u8] {
    // SAFETY: `c_char` and `u8` share layout on every platform ash targets.
    unsafe { std::slice::from_raw_parts(name.as_ptr() as *const u8, name.len()) }
}

unsafe fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_family: u32,
    present_family: u32,
) -> Result<ash::Device, DeviceError> {
    let mut unique_families = vec![graphics_family];
    if present_family != graphics_family {
        unique_families.push(present_family);
    }
    let priorities = [1.0f32];
    let queue_infos: Vec<_> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities)
        })
        .collect();

    let extension_ptrs: Vec<_> = DEVICE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();
    let features = vk::PhysicalDeviceFeatures::default();
    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_ptrs)
        .enabled_features(&features);

    unsafe { instance.create_device(physical_device, &create_info, None).map_err(DeviceError::from) }
}

/// Builds (or rebuilds) the swapchain, preferring sRGB format and MAILBOX
/// present mode, clamped to the surface's extent bounds.
#[allow(clippy::too_many_arguments)]
unsafe fn create_swapchain(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    swapchain_device: &ash::khr::swapchain::Device,
    graphics_family: u32,
    present_family: u32,
    config: &RhiConfig,
    old_swapchain: vk::SwapchainKHR,
) -> Result<(vk::SwapchainKHR, vk::Format, vk::Extent2D, Vec<vk::Image>), DeviceError> {
    let _ = instance;
    let caps = unsafe {
        surface_loader
            .get_physical_device_surface_capabilities(physical_device, surface)
            .map_err(DeviceError::from)?
    };
    let formats = unsafe {
        surface_loader
            .get_physical_device_surface_formats(physical_device, surface)
            .map_err(DeviceError::from)?
    };
    let present_modes = unsafe {
        surface_loader
            .get_physical_device_surface_present_modes(physical_device, surface)
            .map_err(DeviceError::from)?
    };
    if formats.is_empty() || present_modes.is_empty() {
        return Err(DeviceError::SwapchainCreationFailed);
    }

    let surface_format = formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .copied()
        .unwrap_or(formats[0]);

    let present_mode = match config.preferred_present_mode {
        PresentMode::Immediate if present_modes.contains(&vk::PresentModeKHR::IMMEDIATE) => {
            vk::PresentModeKHR::IMMEDIATE
        }
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        _ if present_modes.contains(&vk::PresentModeKHR::MAILBOX) => vk::PresentModeKHR::MAILBOX,
        _ => vk::PresentModeKHR::FIFO,
    };

    let requested = vk::Extent2D { width: config.window_width, height: config.window_height };
    let extent = if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        conv::clamp_extent(requested, &caps)
    };

    let mut image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        image_count = image_count.min(caps.max_image_count);
    }

    let queue_families = [graphics_family, present_family];
    let mut info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .pre_transform(caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);
    if graphics_family != present_family {
        info = info.image_sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(&queue_families);
    } else {
        info = info.image_sharing_mode(vk::SharingMode::EXCLUSIVE);
    }

    let swapchain = unsafe { swapchain_device.create_swapchain(&info, None).map_err(DeviceError::from)? };
    let images = unsafe { swapchain_device.get_swapchain_images(swapchain).map_err(DeviceError::from)? };
    Ok((swapchain, surface_format.format, extent, images))
}

unsafe fn create_color_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView, DeviceError> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { device.create_image_view(&info, None).map_err(DeviceError::from) }
}

/// Prefers `D32_SFLOAT`, then `D32_SFLOAT_S8_UINT`, then
/// `D24_UNORM_S8_UINT`.
unsafe fn pick_depth_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> vk::Format {
    const CANDIDATES: [vk::Format; 3] =
        [vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT, vk::Format::D24_UNORM_S8_UINT];
    for &format in &CANDIDATES {
        let props = unsafe { instance.get_physical_device_format_properties(physical_device, format) };
        if props.optimal_tiling_features.contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT) {
            return format;
        }
    }
    vk::Format::D32_SFLOAT
}

unsafe fn create_depth_resources(
    instance: &ash::Instance,
    device: &ash::Device,
    physical_device: vk::PhysicalDevice,
    memory: &MemoryManager,
    extent: vk::Extent2D,
) -> Result<DepthResources, DeviceError> {
    let format = unsafe { pick_depth_format(instance, physical_device) };
    let info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = unsafe { device.create_image(&info, None).map_err(DeviceError::from)? };

    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let request = super::memory::AllocationRequest {
        size: requirements.size,
        alignment: requirements.alignment,
        memory_type_bits: requirements.memory_type_bits,
        required_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        preferred_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        dedicated: true,
        mappable: false,
    };
    let allocation = memory.allocate(device, request)?;
    unsafe {
        device
            .bind_image_memory(image, allocation.device_memory, allocation.offset)
            .map_err(DeviceError::from)?
    };

    let has_stencil = format == vk::Format::D32_SFLOAT_S8_UINT || format == vk::Format::D24_UNORM_S8_UINT;
    let aspect = if has_stencil {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    };
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    let view = unsafe { device.create_image_view(&view_info, None).map_err(DeviceError::from)? };

    Ok(DepthResources { image, view, allocation, format })
}

unsafe fn destroy_depth_resources(device: &ash::Device, memory: &MemoryManager, depth: &DepthResources) {
    unsafe {
        device.destroy_image_view(depth.view, None);
        device.destroy_image(depth.image, None);
    }
    // NOTE: `allocation` is not `Clone`; depth resources are recreated
    // wholesale on swapchain resize rather than deferred, so this direct
    // free (post wait_for_idle) is safe.
    memory.free(device, unsafe { std::ptr::read(&depth.allocation) });
}

fn default_render_pass_key(color_format: vk::Format, depth_format: vk::Format) -> RenderPassKey {
    RenderPassKey {
        color_formats: vec![pixel_format_from_vk(color_format)],
        color_ops: vec![AttachmentOps { load: LoadOp::Clear, store: StoreOp::Store }],
        depth_stencil_format: Some(pixel_format_from_vk(depth_format)),
        depth_stencil_ops: Some(AttachmentOps { load: LoadOp::Clear, store: StoreOp::DontCare }),
        sample_count: 1,
        presentable: true,
    }
}

fn pixel_format_from_vk(format: vk::Format) -> PixelFormat {
    match format {
        vk::Format::B8G8R8A8_SRGB => PixelFormat::Bgra8UnormSrgb,
        vk::Format::B8G8R8A8_UNORM => PixelFormat::Bgra8Unorm,
        vk::Format::R8G8B8A8_SRGB => PixelFormat::Rgba8UnormSrgb,
        vk::Format::R8G8B8A8_UNORM => PixelFormat::Rgba8Unorm,
        vk::Format::D32_SFLOAT => PixelFormat::D32Float,
        vk::Format::D32_SFLOAT_S8_UINT => PixelFormat::D32FloatS8Uint,
        vk::Format::D24_UNORM_S8_UINT => PixelFormat::D24UnormS8Uint,
        _ => PixelFormat::Rgba8Unorm,
    }
}
