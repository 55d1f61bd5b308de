use std::collections::VecDeque;
use std::rc::Rc;

use ash::vk;
use kiln_gfx::barrier::{GfxBufferBarrier, GfxImageBarrier, ResourceState};
use kiln_gfx::caps::GfxCaps;
use kiln_gfx::desc::{BufferDesc, GfxBuffer, GfxImage, ImageDesc, ImageViewDesc, MemoryLocation, SubmitBatch};
use kiln_gfx::driver::GfxDriver;
use kiln_gfx::error::{GfxError, GfxResult, log_creation_error};
use kiln_gfx::flags::{BindlessCategory, format};
use slotmap::SlotMap;

use crate::frame_counter::FrameCounter;
use crate::handles::{BufferHandle, TextureHandle, Uid, UidAllocator};
use crate::settings::FrameLabel;

/// 等待延迟销毁的 GPU 对象
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GfxObject {
    Buffer(GfxBuffer),
    Image(GfxImage),
    ImageView(vk::ImageView),
    Framebuffer(vk::Framebuffer),
    Pipeline(vk::Pipeline),
    ShaderModule(vk::ShaderModule),
}

impl GfxObject {
    fn destroy(self, driver: &dyn GfxDriver) {
        match self {
            GfxObject::Buffer(buffer) => driver.destroy_buffer(buffer),
            GfxObject::Image(image) => driver.destroy_image(image),
            GfxObject::ImageView(view) => driver.destroy_image_view(view),
            GfxObject::Framebuffer(framebuffer) => driver.destroy_framebuffer(framebuffer),
            GfxObject::Pipeline(pipeline) => driver.destroy_pipeline(pipeline),
            GfxObject::ShaderModule(module) => driver.destroy_shader_module(module),
        }
    }
}

pub struct RenderBuffer {
    uid: Uid,
    buffer: GfxBuffer,
    usage: vk::BufferUsageFlags,
    /// 第一次写入之前，上传时不需要等待之前的读取
    initialized: bool,
    name: String,
}

// getters
impl RenderBuffer {
    #[inline]
    pub fn uid(&self) -> Uid {
        self.uid
    }
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle
    }
    #[inline]
    pub fn gfx_buffer(&self) -> &GfxBuffer {
        &self.buffer
    }
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size
    }
    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 上传完成之后 buffer 所处的状态
    pub fn steady_state(&self) -> ResourceState {
        if self.usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
            ResourceState::VertexBuffer
        } else if self.usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
            ResourceState::IndexBuffer
        } else if self.usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            ResourceState::UniformBuffer
        } else {
            ResourceState::TransferSrc
        }
    }
}

// tools
impl RenderBuffer {
    /// 录制从 staging 到该 buffer 的 copy，以及 copy 前后的 barrier
    pub(crate) fn record_upload(
        &mut self,
        driver: &dyn GfxDriver,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        assert!(
            dst_offset + size <= self.size(),
            "upload [{}, {}) out of buffer {} ({} bytes)",
            dst_offset,
            dst_offset + size,
            self.name,
            self.size()
        );
        let steady = self.steady_state();
        let before = if self.initialized { steady } else { ResourceState::Undefined };

        driver.cmd_pipeline_barrier(
            cmd,
            &[],
            &[GfxBufferBarrier::transition(self.handle(), dst_offset, size, before, ResourceState::TransferDst)],
        );
        driver.cmd_copy_buffer(
            cmd,
            src,
            self.handle(),
            &[vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            }],
        );
        driver.cmd_pipeline_barrier(
            cmd,
            &[],
            &[GfxBufferBarrier::transition(self.handle(), dst_offset, size, ResourceState::TransferDst, steady)],
        );
        self.initialized = true;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureKind {
    Texture2D,
    /// 6 个 layer 的 cube map
    Cube,
}

#[derive(Clone, Copy, Debug)]
pub struct TextureDesc<'a> {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub kind: TextureKind,
    pub mip_levels: u32,
    /// TRANSFER_DST 总是会被加上
    pub usage: vk::ImageUsageFlags,
    pub name: &'a str,
}

impl<'a> TextureDesc<'a> {
    /// 只用于采样的 2D 纹理
    pub fn sampled_2d(width: u32, height: u32, format: vk::Format, name: &'a str) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            format,
            kind: TextureKind::Texture2D,
            mip_levels: 1,
            usage: vk::ImageUsageFlags::SAMPLED,
            name,
        }
    }

    /// 可以作为 attachment 并且可以被采样的 2D 纹理
    pub fn render_target(width: u32, height: u32, format: vk::Format, name: &'a str) -> Self {
        let attachment = if format::is_depth(format) {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
        Self {
            usage: attachment | vk::ImageUsageFlags::SAMPLED,
            ..Self::sampled_2d(width, height, format, name)
        }
    }
}

pub struct RenderTexture {
    uid: Uid,
    image: GfxImage,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
    kind: TextureKind,
    mip_levels: u32,
    usage: vk::ImageUsageFlags,
    /// 内容是否有效；未初始化时 layout 为 UNDEFINED
    initialized: bool,
    name: String,
}

// getters
impl RenderTexture {
    #[inline]
    pub fn uid(&self) -> Uid {
        self.uid
    }
    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image.handle
    }
    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
    #[inline]
    pub fn kind(&self) -> TextureKind {
        self.kind
    }
    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
    #[inline]
    pub fn layers(&self) -> u32 {
        match self.kind {
            TextureKind::Texture2D => 1,
            TextureKind::Cube => 6,
        }
    }
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
    #[inline]
    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
    #[inline]
    pub fn is_sampled(&self) -> bool {
        self.usage.contains(vk::ImageUsageFlags::SAMPLED)
    }
    #[inline]
    pub fn is_depth(&self) -> bool {
        format::is_depth(self.format)
    }
    /// barrier 使用的 aspect
    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        format::aspect(self.format)
    }

    /// 空闲时纹理所处的状态：可采样的纹理为 ShaderRead，否则停留在 attachment 的状态
    pub fn steady_state(&self) -> ResourceState {
        if self.is_sampled() {
            ResourceState::ShaderRead
        } else if self.is_depth() {
            ResourceState::DepthAttachment
        } else {
            ResourceState::ColorAttachment
        }
    }

    pub fn bindless_category(&self) -> BindlessCategory {
        if self.kind == TextureKind::Cube {
            BindlessCategory::TextureCube
        } else if self.is_depth() {
            BindlessCategory::DepthCompare
        } else {
            BindlessCategory::Texture2D
        }
    }

    /// 第 0 级 mip 所有 layer 的字节数，格式无法上传时为 None
    pub fn upload_size(&self) -> Option<vk::DeviceSize> {
        let texel = format::texel_size(self.format)?;
        Some(
            self.extent.width as vk::DeviceSize
                * self.extent.height as vk::DeviceSize
                * self.layers() as vk::DeviceSize
                * texel as vk::DeviceSize,
        )
    }
}

// tools
impl RenderTexture {
    /// 录制从 staging 到第 0 级 mip 的 copy，以及 copy 前后的 layout 转换
    pub(crate) fn record_upload(
        &mut self,
        driver: &dyn GfxDriver,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        src_offset: vk::DeviceSize,
    ) {
        let steady = self.steady_state();
        let before = if self.initialized { steady } else { ResourceState::Undefined };
        let copy_aspect = if self.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };

        driver.cmd_pipeline_barrier(
            cmd,
            &[GfxImageBarrier::transition(self.image(), self.aspect(), before, ResourceState::TransferDst)],
            &[],
        );
        driver.cmd_copy_buffer_to_image(
            cmd,
            src,
            self.image(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[vk::BufferImageCopy {
                buffer_offset: src_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: copy_aspect,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: self.layers(),
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: self.extent.width,
                    height: self.extent.height,
                    depth: 1,
                },
            }],
        );
        driver.cmd_pipeline_barrier(
            cmd,
            &[GfxImageBarrier::transition(self.image(), self.aspect(), ResourceState::TransferDst, steady)],
            &[],
        );
        self.initialized = true;
    }
}

/// 全局的创建入口，以及 GPU 对象的延迟销毁
///
/// 所有延迟销毁的对象都带有登记时的帧序号，只有在 [`FrameCounter::FIF_COUNT`] 帧之后才会真正销毁
pub struct RenderDevice {
    driver: Rc<dyn GfxDriver>,
    frame_counter: FrameCounter,
    uids: UidAllocator,

    buffers: SlotMap<BufferHandle, RenderBuffer>,
    textures: SlotMap<TextureHandle, RenderTexture>,

    destroy_queue: VecDeque<(u64, GfxObject)>,
    texture_destroy_queue: VecDeque<(u64, RenderTexture)>,

    /// immediate 上传使用的 command pool
    immediate_pool: Option<vk::CommandPool>,

    destroyed: bool,
}

// new & init
impl RenderDevice {
    pub fn new(driver: Rc<dyn GfxDriver>) -> Self {
        log::info!("create render device on {}", driver.caps().device_name);
        Self {
            driver,
            frame_counter: FrameCounter::default(),
            uids: UidAllocator::default(),
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            destroy_queue: VecDeque::new(),
            texture_destroy_queue: VecDeque::new(),
            immediate_pool: None,
            destroyed: false,
        }
    }
}

// destroy
impl RenderDevice {
    /// 调用之前 GPU 必须处于 idle 状态
    pub fn destroy(&mut self) {
        let _span = tracy_client::span!("RenderDevice::destroy");
        self.process_destroy_queue_ignore_frame();

        for (_, buffer) in self.buffers.drain() {
            log::debug!("destroy leaked buffer {}", buffer.name);
            self.driver.destroy_buffer(buffer.buffer);
        }
        for (_, texture) in self.textures.drain() {
            log::debug!("destroy leaked texture {}", texture.name);
            self.driver.destroy_image_view(texture.view);
            self.driver.destroy_image(texture.image);
        }
        if let Some(pool) = self.immediate_pool.take() {
            self.driver.destroy_command_pool(pool);
        }
        self.destroyed = true;
    }
}
impl Drop for RenderDevice {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "RenderDevice dropped without destroy");
        }
    }
}

// getters
impl RenderDevice {
    #[inline]
    pub fn driver(&self) -> &Rc<dyn GfxDriver> {
        &self.driver
    }
    #[inline]
    pub fn caps(&self) -> &GfxCaps {
        self.driver.caps()
    }
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_counter.frame_id()
    }
    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        self.frame_counter.frame_label()
    }
    #[inline]
    pub fn frame_name(&self) -> String {
        self.frame_counter.frame_name()
    }
    #[inline]
    pub fn frame_counter(&self) -> &FrameCounter {
        &self.frame_counter
    }
    #[inline]
    pub fn buffer(&self, handle: BufferHandle) -> Option<&RenderBuffer> {
        self.buffers.get(handle)
    }
    #[inline]
    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Option<&mut RenderBuffer> {
        self.buffers.get_mut(handle)
    }
    #[inline]
    pub fn texture(&self, handle: TextureHandle) -> Option<&RenderTexture> {
        self.textures.get(handle)
    }
    #[inline]
    pub fn texture_mut(&mut self, handle: TextureHandle) -> Option<&mut RenderTexture> {
        self.textures.get_mut(handle)
    }
    /// 尚未真正销毁的对象数量
    #[inline]
    pub fn pending_destroy_count(&self) -> usize {
        self.destroy_queue.len() + self.texture_destroy_queue.len()
    }
}

// update
impl RenderDevice {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_counter.next_frame();
    }

    #[inline]
    pub fn next_uid(&mut self) -> Uid {
        self.uids.next()
    }
}

// create & destroy
impl RenderDevice {
    pub fn create_buffer(&mut self, desc: &BufferDesc) -> GfxResult<BufferHandle> {
        let buffer = self
            .driver
            .create_buffer(&BufferDesc {
                usage: desc.usage | vk::BufferUsageFlags::TRANSFER_DST,
                ..*desc
            })
            .map_err(log_creation_error("buffer"))?;
        let uid = self.next_uid();
        Ok(self.buffers.insert(RenderBuffer {
            uid,
            buffer,
            usage: desc.usage,
            initialized: false,
            name: desc.name.to_string(),
        }))
    }

    /// 立即从表中移除，GPU 对象延迟销毁
    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(handle) {
            self.schedule_object_to_destroy(GfxObject::Buffer(buffer.buffer));
        }
    }

    pub fn create_texture(&mut self, desc: &TextureDesc) -> GfxResult<TextureHandle> {
        let (layers, flags, view_type) = match desc.kind {
            TextureKind::Texture2D => (1, vk::ImageCreateFlags::empty(), vk::ImageViewType::TYPE_2D),
            TextureKind::Cube => (6, vk::ImageCreateFlags::CUBE_COMPATIBLE, vk::ImageViewType::CUBE),
        };
        let image = self
            .driver
            .create_image(&ImageDesc {
                extent: vk::Extent3D {
                    width: desc.extent.width,
                    height: desc.extent.height,
                    depth: 1,
                },
                format: desc.format,
                usage: desc.usage | vk::ImageUsageFlags::TRANSFER_DST,
                mip_levels: desc.mip_levels,
                array_layers: layers,
                flags,
                name: desc.name,
            })
            .map_err(log_creation_error("image"))?;

        // 采样深度纹理时 view 只能包含 depth
        let view_aspect = if format::is_depth(desc.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let view = match self.driver.create_image_view(
            image.handle,
            &ImageViewDesc {
                view_type,
                format: desc.format,
                aspect: view_aspect,
                mip_levels: desc.mip_levels,
                array_layers: layers,
            },
            desc.name,
        ) {
            Ok(view) => view,
            Err(e) => {
                self.driver.destroy_image(image);
                return Err(log_creation_error("image view")(e));
            }
        };

        let uid = self.next_uid();
        Ok(self.textures.insert(RenderTexture {
            uid,
            image,
            view,
            format: desc.format,
            extent: desc.extent,
            kind: desc.kind,
            mip_levels: desc.mip_levels,
            usage: desc.usage,
            initialized: false,
            name: desc.name.to_string(),
        }))
    }

    /// 立即从表中移除纹理，并返回它的 uid
    ///
    /// 调用方需要用该 uid 通知 descriptor 与 framebuffer 的 cache
    pub fn schedule_texture_to_destroy(&mut self, handle: TextureHandle) -> Option<Uid> {
        let texture = self.textures.remove(handle)?;
        let uid = texture.uid;
        log::debug!("{} schedule texture {} ({}) to destroy", self.frame_name(), texture.name, uid);
        self.texture_destroy_queue.push_back((self.frame_id(), texture));
        Some(uid)
    }

    pub fn schedule_object_to_destroy(&mut self, object: GfxObject) {
        self.destroy_queue.push_back((self.frame_id(), object));
    }

    /// 销毁所有在 [`FrameCounter::FIF_COUNT`] 帧之前登记的对象
    ///
    /// 调用方需要保证当前帧开始之前已经等待过 `FIF_COUNT` 帧之前的提交
    pub fn process_destroy_queue(&mut self) {
        let _span = tracy_client::span!("RenderDevice::process_destroy_queue");

        // 两个队列都按帧序号递增排列
        while let Some((frame, _)) = self.destroy_queue.front() {
            if !self.frame_counter.is_retired(*frame) {
                break;
            }
            if let Some((_, object)) = self.destroy_queue.pop_front() {
                object.destroy(self.driver.as_ref());
            }
        }
        while let Some((frame, _)) = self.texture_destroy_queue.front() {
            if !self.frame_counter.is_retired(*frame) {
                break;
            }
            if let Some((_, texture)) = self.texture_destroy_queue.pop_front() {
                self.driver.destroy_image_view(texture.view);
                self.driver.destroy_image(texture.image);
            }
        }
    }

    /// 忽略帧序号销毁所有登记的对象，只能在 GPU idle 时调用
    pub fn process_destroy_queue_ignore_frame(&mut self) {
        let _span = tracy_client::span!("RenderDevice::process_destroy_queue_ignore_frame");
        for (_, object) in self.destroy_queue.drain(..) {
            object.destroy(self.driver.as_ref());
        }
        for (_, texture) in self.texture_destroy_queue.drain(..) {
            self.driver.destroy_image_view(texture.view);
            self.driver.destroy_image(texture.image);
        }
    }
}

// immediate upload
impl RenderDevice {
    /// 同步上传：使用临时的 staging buffer 与 command buffer，等待 GPU 完成后返回
    pub fn upload_buffer_immediate(
        &mut self,
        handle: BufferHandle,
        dst_offset: vk::DeviceSize,
        data: &[u8],
    ) -> GfxResult<()> {
        let name = match self.buffers.get(handle) {
            Some(buffer) => format!("immediate-upload-{}", buffer.name),
            None => return Err(GfxError::InvalidHandle("buffer")),
        };
        let driver = self.driver.clone();
        let buffers = &mut self.buffers;
        Self::one_time_exec(driver.as_ref(), &mut self.immediate_pool, data, &name, |cmd, staging| {
            if let Some(buffer) = buffers.get_mut(handle) {
                buffer.record_upload(driver.as_ref(), cmd, staging, 0, dst_offset, data.len() as vk::DeviceSize);
            }
        })
    }

    /// 同步上传第 0 级 mip 的所有 layer
    pub fn upload_texture_immediate(&mut self, handle: TextureHandle, data: &[u8]) -> GfxResult<()> {
        let name = match self.textures.get(handle) {
            Some(texture) => {
                let Some(expected) = texture.upload_size() else {
                    log::error!("texture {} has format {:?} which cannot be uploaded", texture.name, texture.format);
                    return Err(GfxError::UnsupportedFormat(texture.format));
                };
                assert_eq!(
                    data.len() as vk::DeviceSize,
                    expected,
                    "texture {} expects {} bytes",
                    texture.name,
                    expected
                );
                format!("immediate-upload-{}", texture.name)
            }
            None => return Err(GfxError::InvalidHandle("texture")),
        };
        let driver = self.driver.clone();
        let textures = &mut self.textures;
        Self::one_time_exec(driver.as_ref(), &mut self.immediate_pool, data, &name, |cmd, staging| {
            if let Some(texture) = textures.get_mut(handle) {
                texture.record_upload(driver.as_ref(), cmd, staging, 0);
            }
        })
    }

    fn one_time_exec<F>(
        driver: &dyn GfxDriver,
        pool: &mut Option<vk::CommandPool>,
        data: &[u8],
        name: &str,
        record: F,
    ) -> GfxResult<()>
    where
        F: FnOnce(vk::CommandBuffer, vk::Buffer),
    {
        let _span = tracy_client::span!("RenderDevice::one_time_exec");
        let pool = match *pool {
            Some(pool) => pool,
            None => {
                let created = driver
                    .create_command_pool(vk::CommandPoolCreateFlags::TRANSIENT, "immediate-upload")
                    .map_err(log_creation_error("command pool"))?;
                *pool = Some(created);
                created
            }
        };

        let staging = driver
            .create_buffer(&BufferDesc {
                size: data.len() as vk::DeviceSize,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                name,
            })
            .map_err(log_creation_error("staging buffer"))?;
        let fence = match driver.create_fence(false, name) {
            Ok(fence) => fence,
            Err(e) => {
                driver.destroy_buffer(staging);
                return Err(log_creation_error("fence")(e));
            }
        };
        let cmd = match driver.allocate_command_buffer(pool, name) {
            Ok(cmd) => cmd,
            Err(e) => {
                driver.destroy_fence(fence);
                driver.destroy_buffer(staging);
                return Err(log_creation_error("command buffer")(e));
            }
        };

        driver.write_buffer(&staging, 0, data);
        driver.begin_command_buffer(cmd, true).expect("failed to begin command buffer");
        record(cmd, staging.handle);
        driver.end_command_buffer(cmd).expect("failed to end command buffer");
        driver
            .queue_submit(
                &SubmitBatch {
                    command_buffers: std::slice::from_ref(&cmd),
                    ..Default::default()
                },
                fence,
            )
            .expect("failed to submit immediate upload");
        driver.wait_for_fence(fence, u64::MAX).expect("failed to wait immediate upload");

        driver.destroy_fence(fence);
        driver.destroy_buffer(staging);
        driver.reset_command_pool(pool).expect("failed to reset command pool");
        Ok(())
    }
}
