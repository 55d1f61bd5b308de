use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::{GfxError, GfxResult};

pub struct GfxSurface {
    pub(crate) handle: vk::SurfaceKHR,
    pub(crate) pf: ash::khr::surface::Instance,
}

impl GfxSurface {
    pub fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> GfxResult<Self> {
        let pf = ash::khr::surface::Instance::new(entry, instance);
        let handle = unsafe { ash_window::create_surface(entry, instance, display, window, None) }
            .map_err(|e| GfxError::Surface(format!("failed to create surface: {:?}", e)))?;

        Ok(Self { handle, pf })
    }

    pub fn destroy(&self) {
        log::info!("destroying surface");
        unsafe { self.pf.destroy_surface(self.handle, None) }
    }
}

// tools
impl GfxSurface {
    #[inline]
    pub fn capabilities(&self, pdevice: vk::PhysicalDevice) -> GfxResult<vk::SurfaceCapabilitiesKHR> {
        Ok(unsafe { self.pf.get_physical_device_surface_capabilities(pdevice, self.handle)? })
    }

    #[inline]
    pub fn supports_present(&self, pdevice: vk::PhysicalDevice, queue_family_index: u32) -> bool {
        unsafe { self.pf.get_physical_device_surface_support(pdevice, queue_family_index, self.handle) }
            .unwrap_or(false)
    }

    /// 选择 surface format：优先使用期望的 format，否则使用第一个
    pub fn choose_format(
        &self,
        pdevice: vk::PhysicalDevice,
        expected: vk::SurfaceFormatKHR,
    ) -> GfxResult<vk::SurfaceFormatKHR> {
        let formats = unsafe { self.pf.get_physical_device_surface_formats(pdevice, self.handle)? };
        formats
            .iter()
            .find(|f| f.format == expected.format && f.color_space == expected.color_space)
            .or_else(|| formats.first())
            .copied()
            .ok_or_else(|| GfxError::Surface("surface reports no format".to_string()))
    }

    /// FIFO 是所有实现都必须支持的
    pub fn choose_present_mode(
        &self,
        pdevice: vk::PhysicalDevice,
        expected: vk::PresentModeKHR,
    ) -> GfxResult<vk::PresentModeKHR> {
        let modes = unsafe { self.pf.get_physical_device_surface_present_modes(pdevice, self.handle)? };
        if modes.contains(&expected) {
            Ok(expected)
        } else {
            log::warn!("present mode {:?} is not supported, fallback to FIFO", expected);
            Ok(vk::PresentModeKHR::FIFO)
        }
    }
}
