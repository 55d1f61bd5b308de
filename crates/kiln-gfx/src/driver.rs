use ash::vk;

use crate::barrier::{GfxBufferBarrier, GfxImageBarrier};
use crate::caps::GfxCaps;
use crate::desc::{
    AcquireOutcome, BufferDesc, DescriptorPoolDesc, DescriptorSetLayoutDesc, DescriptorWrite, FramebufferDesc,
    GfxBuffer, GfxImage, GfxSwapchain, GraphicsPipelineDesc, ImageDesc, ImageViewDesc, PipelineLayoutDesc,
    PresentOutcome, RenderPassBegin, RenderPassDesc, SamplerDesc, SubmitBatch, SwapchainDesc,
};
use crate::error::GfxResult;

/// 调度核心与 GPU 之间的边界
///
/// 语义与 Vulkan 一致：fence、binary semaphore、command pool、descriptor pool 都是 Vulkan 的对象，
/// 该 trait 的存在只是为了让调度核心可以在模拟的 GPU 上测试。
///
/// 创建类的接口返回 [`GfxResult`]；录制类的接口没有返回值，失败时由实现直接 panic
pub trait GfxDriver {
    fn caps(&self) -> &GfxCaps;

    // ========== 同步 ==========
    fn create_fence(&self, signaled: bool, name: &str) -> GfxResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// 超时返回 `vk::Result::TIMEOUT`
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GfxResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> GfxResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> GfxResult<bool>;

    fn create_semaphore(&self, name: &str) -> GfxResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn device_wait_idle(&self) -> GfxResult<()>;

    // ========== command ==========
    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags, name: &str) -> GfxResult<vk::CommandPool>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool, name: &str) -> GfxResult<vk::CommandBuffer>;

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time_submit: bool) -> GfxResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()>;

    fn queue_submit(&self, batch: &SubmitBatch, fence: vk::Fence) -> GfxResult<()>;

    // ========== 录制 ==========
    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image_barriers: &[GfxImageBarrier],
        buffer_barriers: &[GfxBufferBarrier],
    );
    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin);
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, binding: u32, buffer: vk::Buffer, offset: vk::DeviceSize);
    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, offset: u32, data: &[u8]);
    /// 设置覆盖整个 extent 的 viewport 和 scissor
    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D);
    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    // ========== 内存 ==========
    fn create_buffer(&self, desc: &BufferDesc) -> GfxResult<GfxBuffer>;
    fn destroy_buffer(&self, buffer: GfxBuffer);
    /// 写入常驻映射的内存，buffer 必须是 [`crate::desc::MemoryLocation::CpuToGpu`]
    fn write_buffer(&self, buffer: &GfxBuffer, offset: vk::DeviceSize, data: &[u8]);

    fn create_image(&self, desc: &ImageDesc) -> GfxResult<GfxImage>;
    fn destroy_image(&self, image: GfxImage);
    fn create_image_view(&self, image: vk::Image, desc: &ImageViewDesc, name: &str) -> GfxResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, desc: &SamplerDesc, name: &str) -> GfxResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // ========== descriptor ==========
    fn create_descriptor_set_layout(&self, desc: &DescriptorSetLayoutDesc) -> GfxResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> GfxResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// `variable_count` 为最后一个 binding 的实际数量（variable descriptor count）
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
        variable_count: Option<u32>,
    ) -> GfxResult<Vec<vk::DescriptorSet>>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // ========== pipeline ==========
    fn create_render_pass(&self, desc: &RenderPassDesc) -> GfxResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, desc: &FramebufferDesc) -> GfxResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn create_shader_module(&self, spirv: &[u32], name: &str) -> GfxResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> GfxResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> GfxResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // ========== 呈现 ==========
    fn surface_capabilities(&self) -> GfxResult<vk::SurfaceCapabilitiesKHR>;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> GfxResult<GfxSwapchain>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> GfxResult<AcquireOutcome>;
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> GfxResult<PresentOutcome>;
}
