//! barrier 的构建工具，以及资源状态到 Vulkan stage/access/layout 的映射

use ash::vk;

/// 资源在某一时刻的使用方式
///
/// 上层只需要描述"从什么状态到什么状态"，具体的 stage、access、layout 由 [`ResourceState::state`] 给出
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// 未定义状态（初始状态或不关心内容）
    Undefined,
    ColorAttachment,
    DepthAttachment,
    /// 片段着色器采样
    ShaderRead,
    TransferSrc,
    TransferDst,
    /// swapchain image 的呈现状态
    Present,
    VertexBuffer,
    IndexBuffer,
    UniformBuffer,
}

/// 一个资源状态对应的 Vulkan 三元组
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GfxResourceState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    /// buffer 的状态中该字段无意义，始终为 UNDEFINED
    pub layout: vk::ImageLayout,
}

impl GfxResourceState {
    #[inline]
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2, layout: vk::ImageLayout) -> Self {
        Self { stage, access, layout }
    }
}

impl ResourceState {
    pub const fn state(self) -> GfxResourceState {
        match self {
            ResourceState::Undefined => GfxResourceState::new(
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::AccessFlags2::NONE,
                vk::ImageLayout::UNDEFINED,
            ),
            ResourceState::ColorAttachment => GfxResourceState::new(
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
                        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
                ),
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
            ResourceState::DepthAttachment => GfxResourceState::new(
                vk::PipelineStageFlags2::from_raw(
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
                ),
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
                ),
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
            ResourceState::ShaderRead => GfxResourceState::new(
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            ResourceState::TransferSrc => GfxResourceState::new(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_READ,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ),
            ResourceState::TransferDst => GfxResourceState::new(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
            ResourceState::Present => GfxResourceState::new(
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ),
            ResourceState::VertexBuffer => GfxResourceState::new(
                vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
                vk::ImageLayout::UNDEFINED,
            ),
            ResourceState::IndexBuffer => GfxResourceState::new(
                vk::PipelineStageFlags2::INDEX_INPUT,
                vk::AccessFlags2::INDEX_READ,
                vk::ImageLayout::UNDEFINED,
            ),
            ResourceState::UniformBuffer => GfxResourceState::new(
                vk::PipelineStageFlags2::from_raw(
                    vk::PipelineStageFlags2::VERTEX_SHADER.as_raw() | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw(),
                ),
                vk::AccessFlags2::UNIFORM_READ,
                vk::ImageLayout::UNDEFINED,
            ),
        }
    }

    /// 用作 barrier 的 src 时只需要保留写操作
    #[inline]
    pub const fn src_access(self) -> vk::AccessFlags2 {
        let access = self.state().access;
        vk::AccessFlags2::from_raw(
            access.as_raw()
                & !(vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw()
                    | vk::AccessFlags2::TRANSFER_READ.as_raw()
                    | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw()
                    | vk::AccessFlags2::INDEX_READ.as_raw()
                    | vk::AccessFlags2::UNIFORM_READ.as_raw()),
        )
    }
}

/// 便捷创建 image memory barrier 的结构体
pub struct GfxImageBarrier {
    inner: vk::ImageMemoryBarrier2<'static>,
}

impl Default for GfxImageBarrier {
    fn default() -> Self {
        Self {
            inner: vk::ImageMemoryBarrier2 {
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::UNDEFINED,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::empty(),
                    base_array_layer: 0,
                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                    base_mip_level: 0,
                    level_count: vk::REMAINING_MIP_LEVELS,
                },
                ..Default::default()
            },
        }
    }
}

impl GfxImageBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从一个资源状态转换到另一个资源状态，覆盖所有的 mip 和 layer
    pub fn transition(image: vk::Image, aspect: vk::ImageAspectFlags, from: ResourceState, to: ResourceState) -> Self {
        let src = from.state();
        let dst = to.state();
        Self::new()
            .image(image)
            .image_aspect_flag(aspect)
            .layout_transfer(src.layout, dst.layout)
            .src_mask(src.stage, from.src_access())
            .dst_mask(dst.stage, dst.access)
    }

    #[inline]
    pub fn inner(&self) -> &vk::ImageMemoryBarrier2<'_> {
        &self.inner
    }

    /// builder
    #[inline]
    pub fn layout_transfer(mut self, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        self.inner.old_layout = old_layout;
        self.inner.new_layout = new_layout;
        self
    }

    /// builder
    #[inline]
    pub fn src_mask(mut self, src_stage_mask: vk::PipelineStageFlags2, src_access_mask: vk::AccessFlags2) -> Self {
        self.inner.src_stage_mask = src_stage_mask;
        self.inner.src_access_mask = src_access_mask;
        self
    }

    /// builder
    #[inline]
    pub fn dst_mask(mut self, dst_stage_mask: vk::PipelineStageFlags2, dst_access_mask: vk::AccessFlags2) -> Self {
        self.inner.dst_stage_mask = dst_stage_mask;
        self.inner.dst_access_mask = dst_access_mask;
        self
    }

    /// builder
    #[inline]
    pub fn image_aspect_flag(mut self, aspect_mask: vk::ImageAspectFlags) -> Self {
        self.inner.subresource_range.aspect_mask = aspect_mask;
        self
    }

    /// builder
    #[inline]
    pub fn image(mut self, image: vk::Image) -> Self {
        self.inner.image = image;
        self
    }
}

pub struct GfxBufferBarrier {
    inner: vk::BufferMemoryBarrier2<'static>,
}

impl Default for GfxBufferBarrier {
    fn default() -> Self {
        Self {
            inner: vk::BufferMemoryBarrier2 {
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                size: vk::WHOLE_SIZE,
                ..Default::default()
            },
        }
    }
}

impl GfxBufferBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transition(
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        from: ResourceState,
        to: ResourceState,
    ) -> Self {
        let dst = to.state();
        Self::new()
            .buffer(buffer, offset, size)
            .src_mask(from.state().stage, from.src_access())
            .dst_mask(dst.stage, dst.access)
    }

    #[inline]
    pub fn inner(&self) -> &vk::BufferMemoryBarrier2<'_> {
        &self.inner
    }

    #[inline]
    pub fn src_mask(mut self, src_stage_mask: vk::PipelineStageFlags2, src_access_mask: vk::AccessFlags2) -> Self {
        self.inner.src_stage_mask = src_stage_mask;
        self.inner.src_access_mask = src_access_mask;
        self
    }

    #[inline]
    pub fn dst_mask(mut self, dst_stage_mask: vk::PipelineStageFlags2, dst_access_mask: vk::AccessFlags2) -> Self {
        self.inner.dst_stage_mask = dst_stage_mask;
        self.inner.dst_access_mask = dst_access_mask;
        self
    }

    #[inline]
    pub fn buffer(mut self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        self.inner.buffer = buffer;
        self.inner.offset = offset;
        self.inner.size = size;
        self
    }
}

/// render pass 与外部的同步：layout 转换由外部的 barrier 完成，这里只处理执行与内存依赖
///
/// - 进入：等待之前对附件的写入，以及之前片段着色器对同一纹理的采样
/// - 离开：附件的写入对之后片段着色器的采样可见
pub fn render_pass_dependencies() -> [vk::SubpassDependency; 2] {
    let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let attachment_writes = vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    let attachment_access = attachment_writes
        | vk::AccessFlags::COLOR_ATTACHMENT_READ
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;

    let incoming = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(attachment_stages | vk::PipelineStageFlags::FRAGMENT_SHADER)
        .dst_stage_mask(attachment_stages)
        .src_access_mask(attachment_writes)
        .dst_access_mask(attachment_access);
    let outgoing = vk::SubpassDependency::default()
        .src_subpass(0)
        .dst_subpass(vk::SUBPASS_EXTERNAL)
        .src_stage_mask(attachment_stages)
        .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
        .src_access_mask(attachment_writes)
        .dst_access_mask(vk::AccessFlags::SHADER_READ);
    [incoming, outgoing]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_pass_dependencies_cover_sampling() {
        let [incoming, outgoing] = render_pass_dependencies();

        // 之前的采样结束后才能写入附件
        assert_eq!(incoming.src_subpass, vk::SUBPASS_EXTERNAL);
        assert!(incoming.src_stage_mask.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(incoming.dst_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));

        // 附件的写入对之后的采样可见
        assert_eq!(outgoing.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert!(outgoing.src_access_mask.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert!(outgoing.dst_stage_mask.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert_eq!(outgoing.dst_access_mask, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_first_use_transition_discards_content() {
        let barrier = GfxImageBarrier::transition(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            ResourceState::Undefined,
            ResourceState::ColorAttachment,
        );
        let inner = barrier.inner();
        assert_eq!(inner.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(inner.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(inner.src_access_mask, vk::AccessFlags2::NONE);
        assert!(inner.dst_access_mask.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn test_present_transition() {
        let barrier = GfxImageBarrier::transition(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            ResourceState::ColorAttachment,
            ResourceState::Present,
        );
        let inner = barrier.inner();
        assert_eq!(inner.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(inner.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        // 只有写操作需要 flush
        assert_eq!(inner.src_access_mask, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        assert_eq!(inner.subresource_range.level_count, vk::REMAINING_MIP_LEVELS);
    }

    #[test]
    fn test_read_only_states_have_no_src_access() {
        for state in [
            ResourceState::ShaderRead,
            ResourceState::TransferSrc,
            ResourceState::VertexBuffer,
            ResourceState::IndexBuffer,
            ResourceState::UniformBuffer,
        ] {
            assert!(state.src_access().is_empty(), "{:?}", state);
        }
        assert_eq!(ResourceState::TransferDst.src_access(), vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn test_buffer_transition() {
        let barrier =
            GfxBufferBarrier::transition(vk::Buffer::null(), 16, 64, ResourceState::TransferDst, ResourceState::VertexBuffer);
        let inner = barrier.inner();
        assert_eq!((inner.offset, inner.size), (16, 64));
        assert_eq!(inner.src_stage_mask, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(inner.dst_access_mask, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ);
    }
}
