//! A Vulkan Rendering Hardware Interface.
//!
//! This crate owns everything "below" the render dependency graph: the
//! backend loader, the device and its swapchain/synchronisation
//! primitives, the two-tier GPU memory sub-allocator, resource objects,
//! the descriptor/render-pass/framebuffer/pipeline caches, and the
//! per-frame command submission machinery. `rdg` is built on top of the
//! [`Device`] and [`Recorder`] contracts declared here; it never touches
//! `ash` directly.
//!
//! The crate is organised the way `wgpu-hal` organises its Vulkan
//! backend: a `vulkan` module holding the concrete implementation, with
//! the handful of cross-cutting pieces (errors, generational handles,
//! conversions) at the crate root.

#![allow(unsafe_op_in_unsafe_fn)]

#[cfg(feature = "vulkan")]
pub mod vulkan;

mod handle;

pub use handle::{BufferHandle, PipelineHandle, SamplerHandle, ShaderHandle, TextureHandle};
pub(crate) use handle::Arena;
pub use rhit::*;

use thiserror::Error;

/// Errors surfaced by device initialisation and resource allocation.
///
/// Mirrors `wgpu-hal`'s `DeviceError`: a small enum of named failure modes
/// plus a catch-all conversion from the backend's native error type.
#[derive(Clone, Debug, Error)]
pub enum DeviceError {
    #[error("a required instance or device extension is not available: {0}")]
    MissingRequiredExtension(String),
    #[error("no physical device satisfies the RHI's requirements (discrete/integrated GPU with swapchain support)")]
    NoSuitableDevice,
    #[error("failed to create the presentation surface")]
    SurfaceCreationFailed,
    #[error("failed to create or recreate the swapchain")]
    SwapchainCreationFailed,
    #[error("device ran out of memory")]
    OutOfDeviceMemory,
    #[error("no memory type satisfies the requested properties")]
    NoSuitableMemoryType,
    #[error("memory type {0} has reached its pool limit ({1} pools); raise MAX_POOLS_PER_TYPE or reduce allocation churn")]
    PoolExhausted(u32, usize),
    #[error("invalid shader bytecode: {0}")]
    InvalidShaderBytecode(String),
    #[error("device lost")]
    Lost,
    #[error("referenced handle is stale or was never created")]
    InvalidHandle,
    #[error(transparent)]
    Command(#[from] CommandError),
    #[cfg(feature = "vulkan")]
    #[error("unexpected Vulkan result: {0:?}")]
    Unexpected(ash::vk::Result),
}

#[cfg(feature = "vulkan")]
impl From<ash::vk::Result> for DeviceError {
    fn from(result: ash::vk::Result) -> Self {
        match result {
            ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DeviceError::OutOfDeviceMemory,
            ash::vk::Result::ERROR_DEVICE_LOST => DeviceError::Lost,
            other => DeviceError::Unexpected(other),
        }
    }
}

/// Errors surfaced by the command recorder / context.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("operation requires an active recording (call begin() first)")]
    NotRecording,
    #[error("operation is invalid while a render pass is active")]
    RenderPassActive,
    #[error("operation requires an active render pass (call set_render_targets first)")]
    NoActiveRenderPass,
    #[error("invalid resource bound at slot {0}")]
    InvalidResourceBinding(u32),
}

/// Errors surfaced by `acquire_next_image`/`present`.
#[derive(Clone, Debug, Error)]
pub enum SurfaceError {
    #[error("swapchain is out of date and must be recreated")]
    Outdated,
    #[error("surface was lost")]
    Lost,
    #[error(transparent)]
    Other(#[from] DeviceError),
}

/// GPU memory usage snapshot, returned by `Device::memory_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub used_bytes: u64,
    pub reserved_bytes: u64,
    pub allocation_count: u32,
    pub dedicated_count: u32,
    pub largest_free_block: u64,
}

/// One resource the recorder's `transition_resource`/`resource_barrier`
/// calls can target.
#[cfg(feature = "vulkan")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

/// A single color render target binding for `Recorder::set_render_targets`.
#[cfg(feature = "vulkan")]
#[derive(Debug, Clone, Copy)]
pub struct ColorAttachment {
    pub texture: TextureHandle,
    pub load: vulkan::LoadOp,
    pub store: vulkan::StoreOp,
}

/// The depth/stencil render target binding for `Recorder::set_render_targets`.
#[cfg(feature = "vulkan")]
#[derive(Debug, Clone, Copy)]
pub struct DepthAttachment {
    pub texture: TextureHandle,
    pub load: vulkan::LoadOp,
    pub store: vulkan::StoreOp,
}
