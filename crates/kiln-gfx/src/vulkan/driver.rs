use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;

use ash::vk;
use itertools::Itertools;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use slotmap::SlotMap;
use vk_mem::Alloc;

use crate::barrier::{GfxBufferBarrier, GfxImageBarrier, render_pass_dependencies};
use crate::caps::GfxCaps;
use crate::desc::{
    AcquireOutcome, AllocationKey, BufferDesc, DescriptorInfo, DescriptorPoolDesc, DescriptorSetLayoutDesc,
    DescriptorWrite, FramebufferDesc, GfxBuffer, GfxImage, GfxSwapchain, GraphicsPipelineDesc, ImageDesc,
    ImageViewDesc, MemoryLocation, PipelineLayoutDesc, PresentOutcome, RenderPassBegin, RenderPassDesc, SamplerDesc,
    SubmitBatch, SwapchainDesc, calculate_swapchain_extent,
};
use crate::driver::GfxDriver;
use crate::error::{GfxError, GfxResult, log_creation_error};
use crate::vulkan::debug_messenger::GfxDebugMsger;
use crate::vulkan::instance::GfxInstance;
use crate::vulkan::physical_device::GfxPhysicalDevice;
use crate::vulkan::surface::GfxSurface;

struct VulkanAllocation {
    allocation: vk_mem::Allocation,
    /// 常驻映射的地址，仅 host visible 的 buffer 有
    mapped: Option<*mut u8>,
    size: vk::DeviceSize,
}

/// 基于 ash + vk-mem 的 [`GfxDriver`] 实现
///
/// 只使用一个同时支持 graphics 与 present 的 queue
pub struct VulkanDriver {
    caps: GfxCaps,

    /// 仅仅是函数指针，需要比 instance 活得更久
    _entry: ash::Entry,
    instance: GfxInstance,
    debug_msger: Option<GfxDebugMsger>,
    physical_device: GfxPhysicalDevice,
    surface: Option<GfxSurface>,

    device: ash::Device,
    swapchain_pf: ash::khr::swapchain::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    queue: vk::Queue,

    /// 需要在 device 之前销毁
    allocator: ManuallyDrop<vk_mem::Allocator>,
    allocations: RefCell<SlotMap<AllocationKey, VulkanAllocation>>,
}

// new & init
impl VulkanDriver {
    /// 创建 instance、device 以及内存分配器
    ///
    /// `window` 为 None 时不创建 surface，只能用于离屏渲染
    pub fn new(app_name: &str, window: Option<(RawDisplayHandle, RawWindowHandle)>) -> GfxResult<Self> {
        let _span = tracy_client::span!("VulkanDriver::new");

        let entry = unsafe { ash::Entry::load() }.map_err(GfxError::from).map_err(log_creation_error("vulkan entry"))?;

        let mut required_exts: Vec<&'static CStr> = Vec::new();
        if let Some((display, _)) = window {
            let exts = ash_window::enumerate_required_extensions(display)
                .map_err(|e| GfxError::MissingExtension(format!("surface extensions for this platform: {:?}", e)))
                .map_err(log_creation_error("instance"))?;
            required_exts.extend(exts.iter().map(|ext| unsafe { CStr::from_ptr(*ext) }));
        }
        let instance =
            GfxInstance::new(&entry, app_name, &required_exts).map_err(log_creation_error("instance"))?;

        let debug_msger = if instance.debug_utils_enabled {
            GfxDebugMsger::new(&entry, instance.ash_instance())
                .inspect_err(|e| log::warn!("failed to create debug messenger: {:?}", e))
                .ok()
        } else {
            None
        };

        let surface = match window {
            Some((display, window)) => Some(
                GfxSurface::new(&entry, instance.ash_instance(), display, window)
                    .map_err(log_creation_error("surface"))?,
            ),
            None => None,
        };

        let physical_device = GfxPhysicalDevice::select(instance.ash_instance(), surface.as_ref())
            .map_err(log_creation_error("physical device"))?;
        log::info!("use gpu: {}", physical_device.name);

        let device = Self::create_device(&instance, &physical_device, surface.is_some())
            .map_err(log_creation_error("device"))?;
        let queue = unsafe { device.get_device_queue(physical_device.queue_family_index, 0) };
        let swapchain_pf = ash::khr::swapchain::Device::new(instance.ash_instance(), &device);
        let debug_utils = instance
            .debug_utils_enabled
            .then(|| ash::ext::debug_utils::Device::new(instance.ash_instance(), &device));

        // vma 需要引用 instance 和 device，因此在其他部分初始化完成后再初始化
        let allocator = {
            let mut vma_ci = vk_mem::AllocatorCreateInfo::new(instance.ash_instance(), &device, physical_device.handle);
            vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
            unsafe { vk_mem::Allocator::new(vma_ci) }
                .map_err(GfxError::from)
                .map_err(log_creation_error("memory allocator"))?
        };

        let min_swapchain_images = match &surface {
            Some(surface) => surface.capabilities(physical_device.handle)?.min_image_count,
            None => 0,
        };

        let limits = &physical_device.basic_props.limits;
        let caps = GfxCaps {
            device_name: physical_device.name.clone(),
            descriptor_indexing: physical_device.descriptor_indexing,
            max_bindless_sampled_images: physical_device.max_update_after_bind_sampled_images,
            host_visible_heap_size: physical_device.host_visible_heap_size(),
            optimal_copy_offset_alignment: limits.optimal_buffer_copy_offset_alignment,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            min_swapchain_images,
            sampler_anisotropy: physical_device.sampler_anisotropy,
        };
        log::info!("gfx caps: {:#?}", caps);

        Ok(Self {
            caps,
            _entry: entry,
            instance,
            debug_msger,
            physical_device,
            surface,
            device,
            swapchain_pf,
            debug_utils,
            queue,
            allocator: ManuallyDrop::new(allocator),
            allocations: RefCell::new(SlotMap::with_key()),
        })
    }

    fn create_device(
        instance: &GfxInstance,
        physical_device: &GfxPhysicalDevice,
        with_swapchain: bool,
    ) -> GfxResult<ash::Device> {
        let priorities = [1.0_f32];
        let queue_ci = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(physical_device.queue_family_index)
            .queue_priorities(&priorities)];

        let device_exts = if with_swapchain { vec![ash::khr::swapchain::NAME.as_ptr()] } else { vec![] };

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        if physical_device.descriptor_indexing {
            features12 = features12
                .descriptor_indexing(true)
                .runtime_descriptor_array(true)
                .descriptor_binding_partially_bound(true) // 即使一些 descriptor 是 invalid
                .descriptor_binding_sampled_image_update_after_bind(true)
                .descriptor_binding_variable_descriptor_count(true)
                .shader_sampled_image_array_non_uniform_indexing(true);
        }
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(physical_device.sampler_anisotropy);

        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_ci)
            .enabled_extension_names(&device_exts)
            .enabled_features(&features)
            .push_next(&mut features12)
            .push_next(&mut features13);

        Ok(unsafe { instance.ash_instance().create_device(physical_device.handle, &device_ci, None)? })
    }
}

// tools
impl VulkanDriver {
    fn set_debug_name<T: vk::Handle + Copy>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        unsafe {
            // 命名失败不影响渲染
            let _ = debug_utils.set_debug_utils_object_name(
                &vk::DebugUtilsObjectNameInfoEXT::default().object_name(name.as_c_str()).object_handle(handle),
            );
        }
    }

    #[inline]
    fn surface(&self) -> GfxResult<&GfxSurface> {
        self.surface.as_ref().ok_or_else(|| GfxError::Surface("driver is created without surface".to_string()))
    }
}

impl GfxDriver for VulkanDriver {
    #[inline]
    fn caps(&self) -> &GfxCaps {
        &self.caps
    }

    fn create_fence(&self, signaled: bool, name: &str) -> GfxResult<vk::Fence> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None)? };
        self.set_debug_name(fence, name);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GfxResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns)? };
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> GfxResult<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GfxResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn create_semaphore(&self, name: &str) -> GfxResult<vk::Semaphore> {
        let semaphore = unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
        self.set_debug_name(semaphore, name);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn device_wait_idle(&self) -> GfxResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags, name: &str) -> GfxResult<vk::CommandPool> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.physical_device.queue_family_index)
            .flags(flags);
        let pool = unsafe { self.device.create_command_pool(&pool_ci, None)? };
        self.set_debug_name(pool, name);
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()> {
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES)? };
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, name: &str) -> GfxResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&info)? }[0];
        self.set_debug_name(cmd, name);
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time_submit: bool) -> GfxResult<()> {
        let flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        unsafe { self.device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default().flags(flags))? };
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()> {
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    fn queue_submit(&self, batch: &SubmitBatch, fence: vk::Fence) -> GfxResult<()> {
        let _span = tracy_client::span!("VulkanDriver::queue_submit");
        let cmd_infos = batch
            .command_buffers
            .iter()
            .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(*cmd))
            .collect_vec();
        let wait_infos = batch
            .wait_semaphore
            .iter()
            .map(|(semaphore, stage)| vk::SemaphoreSubmitInfo::default().semaphore(*semaphore).stage_mask(*stage))
            .collect_vec();
        let signal_infos = batch
            .signal_semaphore
            .iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(*semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect_vec();

        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&cmd_infos)
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos);
        unsafe { self.device.queue_submit2(self.queue, std::slice::from_ref(&submit_info), fence)? };
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image_barriers: &[GfxImageBarrier],
        buffer_barriers: &[GfxBufferBarrier],
    ) {
        let image_barriers = image_barriers.iter().map(|b| *b.inner()).collect_vec();
        let buffer_barriers = buffer_barriers.iter().map(|b| *b.inner()).collect_vec();
        let dependency_info = vk::DependencyInfo::default()
            .image_memory_barriers(&image_barriers)
            .buffer_memory_barriers(&buffer_barriers)
            .dependency_flags(vk::DependencyFlags::BY_REGION);
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency_info) }
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer_to_image(cmd, src, dst, dst_layout, regions) }
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: begin.extent,
            })
            .clear_values(begin.clear_values);
        unsafe { self.device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE) }
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) }
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline) }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, layout, first_set, sets, &[])
        }
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, binding: u32, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe { self.device.cmd_bind_vertex_buffers(cmd, binding, &[buffer], &[offset]) }
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe { self.device.cmd_bind_index_buffer(cmd, buffer, offset, index_type) }
    }

    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, offset: u32, data: &[u8]) {
        unsafe {
            self.device.cmd_push_constants(cmd, layout, vk::ShaderStageFlags::ALL_GRAPHICS, offset, data);
        }
    }

    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        // viewport 翻转 y 轴，与 OpenGL 的坐标系保持一致
        let viewport = vk::Viewport {
            x: 0.0,
            y: extent.height as f32,
            width: extent.width as f32,
            height: -(extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        unsafe {
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe { self.device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance) }
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(cmd, index_count, instance_count, first_index, vertex_offset, first_instance)
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GfxResult<GfxBuffer> {
        let host_visible = desc.location == MemoryLocation::CpuToGpu;
        if host_visible && desc.size > self.caps.host_visible_heap_size {
            return Err(GfxError::OutOfHostVisibleMemory {
                requested: desc.size,
                heap: self.caps.host_visible_heap_size,
            });
        }

        let buffer_ci = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: if host_visible {
                vk_mem::MemoryUsage::AutoPreferHost
            } else {
                vk_mem::MemoryUsage::AutoPreferDevice
            },
            flags: if host_visible {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let (handle, mut allocation) = unsafe { self.allocator.create_buffer(&buffer_ci, &alloc_ci)? };
        let mapped = if host_visible {
            match unsafe { self.allocator.map_memory(&mut allocation) } {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    unsafe { self.allocator.destroy_buffer(handle, &mut allocation) };
                    return Err(e.into());
                }
            }
        } else {
            None
        };
        self.set_debug_name(handle, desc.name);

        let key = self.allocations.borrow_mut().insert(VulkanAllocation {
            allocation,
            mapped,
            size: desc.size,
        });
        Ok(GfxBuffer {
            handle,
            size: desc.size,
            allocation: key,
            location: desc.location,
        })
    }

    fn destroy_buffer(&self, buffer: GfxBuffer) {
        let Some(mut alloc) = self.allocations.borrow_mut().remove(buffer.allocation) else {
            log::error!("destroy buffer {:?} with unknown allocation", buffer.handle);
            return;
        };
        unsafe {
            if alloc.mapped.is_some() {
                self.allocator.unmap_memory(&mut alloc.allocation);
            }
            self.allocator.destroy_buffer(buffer.handle, &mut alloc.allocation);
        }
    }

    fn write_buffer(&self, buffer: &GfxBuffer, offset: vk::DeviceSize, data: &[u8]) {
        let allocations = self.allocations.borrow();
        let alloc = allocations.get(buffer.allocation).expect("write to a destroyed buffer");
        let ptr = alloc.mapped.expect("write to a buffer which is not host visible");
        assert!(offset + data.len() as vk::DeviceSize <= alloc.size, "write out of buffer range");

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
            // 对于 coherent 的内存，flush 不会有任何操作
            self.allocator
                .flush_allocation(&alloc.allocation, offset, data.len() as vk::DeviceSize)
                .expect("failed to flush allocation");
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> GfxResult<GfxImage> {
        let image_ci = vk::ImageCreateInfo::default()
            .flags(desc.flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (handle, allocation) = unsafe { self.allocator.create_image(&image_ci, &alloc_ci)? };
        self.set_debug_name(handle, desc.name);

        let key = self.allocations.borrow_mut().insert(VulkanAllocation {
            allocation,
            mapped: None,
            size: 0,
        });
        Ok(GfxImage { handle, allocation: key })
    }

    fn destroy_image(&self, image: GfxImage) {
        let Some(mut alloc) = self.allocations.borrow_mut().remove(image.allocation) else {
            log::error!("destroy image {:?} with unknown allocation", image.handle);
            return;
        };
        unsafe { self.allocator.destroy_image(image.handle, &mut alloc.allocation) }
    }

    fn create_image_view(&self, image: vk::Image, desc: &ImageViewDesc, name: &str) -> GfxResult<vk::ImageView> {
        let view_ci = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: desc.array_layers,
            });
        let view = unsafe { self.device.create_image_view(&view_ci, None)? };
        self.set_debug_name(view, name);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, desc: &SamplerDesc, name: &str) -> GfxResult<vk::Sampler> {
        let anisotropy = desc.anisotropy && self.caps.sampler_anisotropy;
        let sampler_ci = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { 16.0 } else { 1.0 })
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
        let sampler = unsafe { self.device.create_sampler(&sampler_ci, None)? };
        self.set_debug_name(sampler, name);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn create_descriptor_set_layout(&self, desc: &DescriptorSetLayoutDesc) -> GfxResult<vk::DescriptorSetLayout> {
        let bindings = desc
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect_vec();

        let binding_flags = if desc.update_after_bind {
            vk::DescriptorBindingFlags::UPDATE_AFTER_BIND | vk::DescriptorBindingFlags::PARTIALLY_BOUND
        } else {
            vk::DescriptorBindingFlags::empty()
        };
        let binding_flags = vec![binding_flags; bindings.len()];
        let mut binding_flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let mut layout_ci = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        if desc.update_after_bind {
            layout_ci = layout_ci
                .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                .push_next(&mut binding_flags_ci);
        }

        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_ci, None)? };
        self.set_debug_name(layout, desc.name);
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> GfxResult<vk::DescriptorPool> {
        let flags = if desc.update_after_bind {
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND
        } else {
            vk::DescriptorPoolCreateFlags::empty()
        };
        let pool_ci = vk::DescriptorPoolCreateInfo::default().flags(flags).max_sets(desc.max_sets).pool_sizes(desc.sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_ci, None)? };
        self.set_debug_name(pool, desc.name);
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
        variable_count: Option<u32>,
    ) -> GfxResult<Vec<vk::DescriptorSet>> {
        let counts = variable_count.map(|count| vec![count; layouts.len()]).unwrap_or_default();
        let mut variable_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);

        let mut alloc_info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(layouts);
        if variable_count.is_some() {
            alloc_info = alloc_info.push_next(&mut variable_info);
        }
        Ok(unsafe { self.device.allocate_descriptor_sets(&alloc_info)? })
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        // 先把所有的 info 收集起来，保证 write 中的指针有效
        let image_infos = writes
            .iter()
            .map(|w| match w.info {
                DescriptorInfo::Image { sampler, view, layout } => vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                },
                DescriptorInfo::Buffer { .. } => vk::DescriptorImageInfo::default(),
            })
            .collect_vec();
        let buffer_infos = writes
            .iter()
            .map(|w| match w.info {
                DescriptorInfo::Buffer { buffer, offset, range } => vk::DescriptorBufferInfo { buffer, offset, range },
                DescriptorInfo::Image { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect_vec();

        let vk_writes = writes
            .iter()
            .enumerate()
            .map(|(idx, w)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(w.set)
                    .dst_binding(w.binding)
                    .dst_array_element(w.array_element)
                    .descriptor_type(w.ty);
                match w.info {
                    DescriptorInfo::Image { .. } => write.image_info(std::slice::from_ref(&image_infos[idx])),
                    DescriptorInfo::Buffer { .. } => write.buffer_info(std::slice::from_ref(&buffer_infos[idx])),
                }
            })
            .collect_vec();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> GfxResult<vk::RenderPass> {
        let mut attachments = Vec::with_capacity(2);
        let mut color_ref = None;
        let mut depth_ref = None;
        for (attachment, is_depth) in [(desc.color, false), (desc.depth, true)] {
            let Some(attachment) = attachment else {
                continue;
            };
            let layout = if is_depth {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            };
            let reference = vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout,
            };
            if is_depth {
                depth_ref = Some(reference);
            } else {
                color_ref = Some(reference);
            }
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(attachment.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(attachment.load_op)
                    .store_op(attachment.store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(attachment.initial_layout)
                    .final_layout(attachment.final_layout),
            );
        }

        let mut subpass = vk::SubpassDescription::default().pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS);
        if let Some(color_ref) = &color_ref {
            subpass = subpass.color_attachments(std::slice::from_ref(color_ref));
        }
        if let Some(depth_ref) = &depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let dependencies = render_pass_dependencies();

        let render_pass_ci = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&dependencies);
        let render_pass = unsafe { self.device.create_render_pass(&render_pass_ci, None)? };
        self.set_debug_name(render_pass, desc.name);
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> GfxResult<vk::Framebuffer> {
        let framebuffer_ci = vk::FramebufferCreateInfo::default()
            .render_pass(desc.render_pass)
            .attachments(desc.attachments)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_ci, None)? };
        self.set_debug_name(framebuffer, desc.name);
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_shader_module(&self, spirv: &[u32], name: &str) -> GfxResult<vk::ShaderModule> {
        let module = unsafe { self.device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(spirv), None)? };
        self.set_debug_name(module, name);
        Ok(module)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> GfxResult<vk::PipelineLayout> {
        let push_constant_ranges = if desc.push_constant_size > 0 {
            vec![vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::ALL_GRAPHICS,
                offset: 0,
                size: desc.push_constant_size,
            }]
        } else {
            vec![]
        };
        let layout_ci = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(desc.set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&layout_ci, None)? };
        self.set_debug_name(layout, desc.name);
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> GfxResult<vk::Pipeline> {
        let entry_name = c"main";
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(desc.vertex_shader)
                .name(entry_name),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(desc.fragment_shader)
                .name(entry_name),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(desc.vertex_bindings)
            .vertex_attribute_descriptions(desc.vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.topology);
        let viewport = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
        // viewport 的 y 轴翻转之后，正面为逆时针
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(desc.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(desc.alpha_blend)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(std::slice::from_ref(&blend_attachment));
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_ci = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(desc.layout)
            .render_pass(desc.render_pass)
            .subpass(0);

        let pipeline = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&pipeline_ci), None)
                .map_err(|(_, e)| e)?[0]
        };
        self.set_debug_name(pipeline, desc.name);
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn surface_capabilities(&self) -> GfxResult<vk::SurfaceCapabilitiesKHR> {
        self.surface()?.capabilities(self.physical_device.handle)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> GfxResult<GfxSwapchain> {
        let _span = tracy_client::span!("VulkanDriver::create_swapchain");
        let surface = self.surface()?;
        let pdevice = self.physical_device.handle;

        let capabilities = surface.capabilities(pdevice)?;
        let surface_format = surface.choose_format(pdevice, desc.surface_format)?;
        let present_mode = surface.choose_present_mode(pdevice, desc.present_mode)?;
        let extent = calculate_swapchain_extent(&capabilities, desc.window_extent);

        let mut image_count = desc.min_image_count.max(capabilities.min_image_count);
        if capabilities.max_image_count != 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let swapchain_ci = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);

        let handle = unsafe { self.swapchain_pf.create_swapchain(&swapchain_ci, None)? };
        let images = match unsafe { self.swapchain_pf.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.swapchain_pf.destroy_swapchain(handle, None) };
                return Err(e.into());
            }
        };
        for (idx, image) in images.iter().enumerate() {
            self.set_debug_name(*image, &format!("swapchain-image-{}", idx));
        }
        log::info!(
            "create swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode
        );

        Ok(GfxSwapchain {
            handle,
            images,
            format: surface_format.format,
            color_space: surface_format.color_space,
            present_mode,
            extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_pf.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> GfxResult<AcquireOutcome> {
        let result =
            unsafe { self.swapchain_pf.acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null()) };
        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> GfxResult<PresentOutcome> {
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(std::slice::from_ref(&wait_semaphore))
            .swapchains(std::slice::from_ref(&swapchain))
            .image_indices(std::slice::from_ref(&image_index));
        match unsafe { self.swapchain_pf.queue_present(self.queue, &present_info) } {
            Ok(suboptimal) => Ok(PresentOutcome::Presented { suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        log::info!("destroying vulkan driver");
        unsafe {
            let _ = self.device.device_wait_idle();

            let leaked = self.allocations.borrow().len();
            if leaked != 0 {
                log::warn!("{} allocations are still alive when the driver is destroyed", leaked);
            }

            // vma 需要在 device 之前销毁
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        if let Some(surface) = &self.surface {
            surface.destroy();
        }
        if let Some(debug_msger) = &self.debug_msger {
            debug_msger.destroy();
        }
        self.instance.destroy();
    }
}
