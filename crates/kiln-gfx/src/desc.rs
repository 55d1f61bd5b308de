//! driver 入口使用的描述结构体，以及 driver 返回的资源句柄

use ash::vk;

slotmap::new_key_type! {
    /// driver 内部的内存分配记录
    pub struct AllocationKey;
}

/// 内存位置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// device local，CPU 不可见
    GpuOnly,
    /// host visible 并且常驻映射，用于 staging 以及 uniform
    CpuToGpu,
}

/// driver 创建出来的 buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GfxBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    pub allocation: AllocationKey,
    pub location: MemoryLocation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GfxImage {
    pub handle: vk::Image,
    pub allocation: AllocationKey,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc<'a> {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    /// cube 纹理需要 CUBE_COMPATIBLE
    pub flags: vk::ImageCreateFlags,
    pub name: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageViewDesc {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
}

/// sampler 的描述，也是 sampler cache 的 key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// 深度比较采样
    pub compare_op: Option<vk::CompareOp>,
    pub anisotropy: bool,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            compare_op: None,
            anisotropy: false,
        }
    }
}

impl SamplerDesc {
    /// bindless 中深度比较分类使用的 sampler
    pub fn depth_compare() -> Self {
        Self {
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            compare_op: Some(vk::CompareOp::LESS_OR_EQUAL),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Clone, Copy, Debug)]
pub struct DescriptorSetLayoutDesc<'a> {
    pub bindings: &'a [DescriptorBindingDesc],
    /// 为 true 时所有 binding 带上 UPDATE_AFTER_BIND | PARTIALLY_BOUND
    pub update_after_bind: bool,
    pub name: &'a str,
}

#[derive(Clone, Copy, Debug)]
pub struct DescriptorPoolDesc<'a> {
    pub max_sets: u32,
    pub sizes: &'a [vk::DescriptorPoolSize],
    pub update_after_bind: bool,
    pub name: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorInfo {
    Image {
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
}

/// 写入一个 descriptor
#[derive(Clone, Copy, Debug)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub ty: vk::DescriptorType,
    pub info: DescriptorInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// 单 subpass 的 render pass，最多一个颜色附件和一个深度附件
#[derive(Clone, Copy, Debug)]
pub struct RenderPassDesc<'a> {
    pub color: Option<AttachmentDesc>,
    pub depth: Option<AttachmentDesc>,
    pub name: &'a str,
}

/// attachments 的顺序：先颜色，后深度
#[derive(Clone, Copy, Debug)]
pub struct FramebufferDesc<'a> {
    pub render_pass: vk::RenderPass,
    pub attachments: &'a [vk::ImageView],
    pub extent: vk::Extent2D,
    pub name: &'a str,
}

#[derive(Clone, Copy)]
pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_values: &'a [vk::ClearValue],
}

#[derive(Clone, Copy, Debug)]
pub struct PipelineLayoutDesc<'a> {
    pub set_layouts: &'a [vk::DescriptorSetLayout],
    /// 0 表示没有 push constant
    pub push_constant_size: u32,
    pub name: &'a str,
}

#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineDesc<'a> {
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub vertex_shader: vk::ShaderModule,
    pub fragment_shader: vk::ShaderModule,
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub alpha_blend: bool,
    pub name: &'a str,
}

#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    /// 窗口的 extent，仅在 surface 允许窗口决定尺寸时使用
    pub window_extent: vk::Extent2D,
    /// 期望的最少 image 数量，driver 会限制在 surface 允许的范围内
    pub min_image_count: u32,
    pub old_swapchain: vk::SwapchainKHR,
}

/// driver 创建出来的 swapchain 以及它的 images
#[derive(Clone, Debug)]
pub struct GfxSwapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

/// 一次 queue submit
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags2)>,
    pub signal_semaphore: Option<vk::Semaphore>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented { suboptimal: bool },
    OutOfDate,
}

/// 计算 swapchain 的 extent
///
/// surface 的 current_extent 为 u32::MAX 时表示由窗口决定尺寸，此时在 min 和 max 之间取窗口的尺寸
pub fn calculate_swapchain_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: window_extent.width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: window_extent
            .height
            .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_surface_extent() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 800, height: 600 },
            ..Default::default()
        };
        let extent = calculate_swapchain_extent(&caps, vk::Extent2D { width: 1, height: 1 });
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_window_decides_extent() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 64, height: 64 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        };
        let extent = calculate_swapchain_extent(
            &caps,
            vk::Extent2D {
                width: 10,
                height: 8000,
            },
        );
        assert_eq!((extent.width, extent.height), (64, 4096));
    }
}
