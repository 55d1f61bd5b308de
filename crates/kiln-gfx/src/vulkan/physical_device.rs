use std::ffi::CStr;

use ash::vk;
use itertools::Itertools;

use crate::error::{GfxError, GfxResult};
use crate::vulkan::surface::GfxSurface;

/// 表示一张物理显卡
pub struct GfxPhysicalDevice {
    pub(crate) handle: vk::PhysicalDevice,
    pub(crate) name: String,

    pub(crate) basic_props: vk::PhysicalDeviceProperties,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) sampler_anisotropy: bool,

    /// runtime array + update after bind + partially bound + variable count 全部支持
    pub(crate) descriptor_indexing: bool,
    pub(crate) max_update_after_bind_sampled_images: u32,

    /// 同时支持 graphics 和 present 的 queue family
    pub(crate) queue_family_index: u32,
}

impl GfxPhysicalDevice {
    /// 选择一张满足要求的显卡
    ///
    /// 要求：Vulkan 1.3、synchronization2、graphics queue；有 surface 时还要求 present 和 swapchain。
    /// 优先选择独立显卡，如果没有则选择第一个可用的显卡
    pub fn select(instance: &ash::Instance, surface: Option<&GfxSurface>) -> GfxResult<Self> {
        let pdevices = unsafe { instance.enumerate_physical_devices()? };
        pdevices
            .into_iter()
            .filter_map(|pdevice| Self::new(pdevice, instance, surface))
            .find_or_first(Self::is_discrete_gpu)
            .ok_or(GfxError::NoSuitableAdapter)
    }

    /// 不满足要求时返回 None
    fn new(pdevice: vk::PhysicalDevice, instance: &ash::Instance, surface: Option<&GfxSurface>) -> Option<Self> {
        unsafe {
            let mut indexing_props = vk::PhysicalDeviceDescriptorIndexingProperties::default();
            let basic_props = {
                let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut indexing_props);
                instance.get_physical_device_properties2(pdevice, &mut props2);
                props2.properties
            };
            let name = CStr::from_ptr(basic_props.device_name.as_ptr()).to_string_lossy().into_owned();
            log::info!("found gpu: {}", name);

            if basic_props.api_version < vk::API_VERSION_1_3 {
                log::info!("skip gpu {}: vulkan 1.3 is required", name);
                return None;
            }

            let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
            let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
            let features = {
                let mut features2 =
                    vk::PhysicalDeviceFeatures2::default().push_next(&mut features12).push_next(&mut features13);
                instance.get_physical_device_features2(pdevice, &mut features2);
                features2.features
            };
            if features13.synchronization2 != vk::TRUE {
                log::info!("skip gpu {}: synchronization2 is required", name);
                return None;
            }

            let descriptor_indexing = features12.descriptor_indexing == vk::TRUE
                && features12.runtime_descriptor_array == vk::TRUE
                && features12.descriptor_binding_partially_bound == vk::TRUE
                && features12.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
                && features12.descriptor_binding_variable_descriptor_count == vk::TRUE
                && features12.shader_sampled_image_array_non_uniform_indexing == vk::TRUE;

            if surface.is_some() {
                let exts = instance.enumerate_device_extension_properties(pdevice).ok()?;
                let has_swapchain = exts
                    .iter()
                    .any(|ext| ext.extension_name_as_c_str().is_ok_and(|e| e == ash::khr::swapchain::NAME));
                if !has_swapchain {
                    log::info!("skip gpu {}: VK_KHR_swapchain is required", name);
                    return None;
                }
            }

            let queue_family_props = instance.get_physical_device_queue_family_properties(pdevice);
            log::debug!("gpu {} queue family props:\n{:#?}", name, queue_family_props);

            // 全能的 queue：graphics, compute, transfer
            let queue_family_index = queue_family_props
                .iter()
                .enumerate()
                .filter(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER))
                .map(|(idx, _)| idx as u32)
                .find(|idx| surface.is_none_or(|s| s.supports_present(pdevice, *idx)));
            let Some(queue_family_index) = queue_family_index else {
                log::info!("skip gpu {}: no graphics queue that can present", name);
                return None;
            };

            Some(Self {
                handle: pdevice,
                name,
                basic_props,
                mem_props: instance.get_physical_device_memory_properties(pdevice),
                sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
                descriptor_indexing,
                max_update_after_bind_sampled_images: indexing_props
                    .max_per_stage_descriptor_update_after_bind_sampled_images,
                queue_family_index,
            })
        }
    }
}

// getters
impl GfxPhysicalDevice {
    #[inline]
    pub fn is_discrete_gpu(&self) -> bool {
        self.basic_props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    /// 所有 host visible 的 memory type 所在 heap 中最大的那个
    pub fn host_visible_heap_size(&self) -> vk::DeviceSize {
        let mem_props = &self.mem_props;
        mem_props.memory_types[..mem_props.memory_type_count as usize]
            .iter()
            .filter(|ty| ty.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE))
            .map(|ty| mem_props.memory_heaps[ty.heap_index as usize].size)
            .max()
            .unwrap_or(0)
    }
}
