//! 每帧的录制上下文
//!
//! 组合 [`RenderDevice`]、[`RenderSwapchain`]、[`SubmitScheduler`]、[`RingCommandContext`]、
//! [`DescriptorManager`] 与 [`RenderCache`]，向渲染器提供资源创建、render pass、绑定、绘制、
//! 上传以及帧循环的接口。所有录制都写入 ring 当前 slot 的 command buffer。

use std::rc::Rc;

use ash::vk;
use itertools::Itertools;
use kiln_gfx::barrier::{GfxImageBarrier, ResourceState};
use kiln_gfx::desc::{BufferDesc, DescriptorInfo, RenderPassBegin, SamplerDesc};
use kiln_gfx::driver::GfxDriver;
use kiln_gfx::error::{GfxResult, log_creation_error};
use kiln_gfx::flags::{AttachmentOps, DescriptorKind, LoadOp, StoreOp};

use crate::descriptor::{BindlessIndex, DescriptorManager};
use crate::device::{RenderDevice, TextureDesc};
use crate::frame_counter::FrameCounter;
use crate::handles::{BufferHandle, TextureHandle};
use crate::render_cache::{
    AttachmentKey, CachedPipeline, CachedRenderPass, DescriptorShape, PipelineDesc, RenderCache, RenderPassKey,
};
use crate::ring::RingCommandContext;
use crate::settings::CoreSettings;
use crate::submit::{SubmitHandle, SubmitScheduler};
use crate::swapchain::{BackbufferKey, RenderSwapchain};

/// render pass 开始时的 clear 值，只有 load op 为 Clear 的 attachment 会使用
#[derive(Clone, Copy, Debug)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
        }
    }
}

impl ClearValues {
    fn to_vk(self, has_color: bool, has_depth: bool) -> Vec<vk::ClearValue> {
        let mut values = Vec::with_capacity(2);
        if has_color {
            values.push(vk::ClearValue {
                color: vk::ClearColorValue { float32: self.color },
            });
        }
        if has_depth {
            values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.depth,
                    stencil: 0,
                },
            });
        }
        values
    }
}

/// 离屏 render pass 的一个 attachment
#[derive(Clone, Copy, Debug)]
pub struct PassAttachment {
    pub texture: TextureHandle,
    pub ops: AttachmentOps,
}

/// 正在录制的 render pass
struct ActivePass {
    render_pass: CachedRenderPass,
    extent: vk::Extent2D,
    /// pass 结束后内容有效的纹理
    stored: Vec<TextureHandle>,
    pipeline: Option<CachedPipeline>,
}

pub struct RenderContext {
    driver: Rc<dyn GfxDriver>,

    device: RenderDevice,
    swapchain: Option<RenderSwapchain>,
    scheduler: SubmitScheduler,
    ring: RingCommandContext,
    descriptors: DescriptorManager,
    cache: RenderCache,

    /// 每一帧最后一次提交，由 frame label 索引
    frame_last_submit: [Option<SubmitHandle>; FrameCounter::FIF_COUNT],
    pass: Option<ActivePass>,

    destroyed: bool,
}

// new & init
impl RenderContext {
    /// `window_extent` 为 None 时不创建 swapchain，只能用于离屏渲染与上传
    pub fn new(
        driver: Rc<dyn GfxDriver>,
        settings: &CoreSettings,
        window_extent: Option<vk::Extent2D>,
    ) -> GfxResult<Self> {
        let _span = tracy_client::span!("RenderContext::new");
        let device = RenderDevice::new(driver.clone());
        let scheduler = SubmitScheduler::new(driver.clone())?;
        let ring = RingCommandContext::new(driver.clone(), settings)?;
        let descriptors = DescriptorManager::new(driver.clone(), settings)?;
        let swapchain = window_extent
            .map(|extent| RenderSwapchain::new(driver.clone(), extent, settings.present_mode.to_vk()))
            .transpose()?;
        let cache = RenderCache::new(driver.clone());

        log::info!(
            "render context ready: swapchain {}, bindless {}, staging {} bytes",
            swapchain.is_some(),
            descriptors.is_bindless_enabled(),
            ring.staging_capacity()
        );
        Ok(Self {
            driver,
            device,
            swapchain,
            scheduler,
            ring,
            descriptors,
            cache,
            frame_last_submit: [None; FrameCounter::FIF_COUNT],
            pass: None,
            destroyed: false,
        })
    }
}

// destroy
impl RenderContext {
    /// 等待 GPU idle，然后按依赖顺序销毁所有组件
    pub fn shutdown(&mut self) {
        let _span = tracy_client::span!("RenderContext::shutdown");
        assert!(self.pass.is_none(), "shutdown inside a render pass");
        self.ring.flush(&mut self.scheduler);
        self.scheduler.wait_idle();

        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy();
        }
        self.ring.destroy();
        self.cache.destroy();
        self.descriptors.destroy();
        self.device.destroy();
        self.scheduler.destroy();
        log::info!("render context shut down");
        self.destroyed = true;
    }
}
impl Drop for RenderContext {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "RenderContext dropped without shutdown");
        }
    }
}

// getters
impl RenderContext {
    #[inline]
    pub fn driver(&self) -> &Rc<dyn GfxDriver> {
        &self.driver
    }
    #[inline]
    pub fn device(&self) -> &RenderDevice {
        &self.device
    }
    #[inline]
    pub fn device_mut(&mut self) -> &mut RenderDevice {
        &mut self.device
    }
    #[inline]
    pub fn swapchain(&self) -> Option<&RenderSwapchain> {
        self.swapchain.as_ref()
    }
    #[inline]
    pub fn scheduler(&self) -> &SubmitScheduler {
        &self.scheduler
    }
    #[inline]
    pub fn scheduler_mut(&mut self) -> &mut SubmitScheduler {
        &mut self.scheduler
    }
    #[inline]
    pub fn ring(&self) -> &RingCommandContext {
        &self.ring
    }
    #[inline]
    pub fn descriptors(&self) -> &DescriptorManager {
        &self.descriptors
    }
    #[inline]
    pub fn cache(&self) -> &RenderCache {
        &self.cache
    }
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.device.frame_id()
    }
    /// 当前帧是否持有 swapchain image
    #[inline]
    pub fn is_frame_acquired(&self) -> bool {
        self.swapchain.as_ref().is_some_and(|s| s.acquired_index().is_some())
    }
    #[inline]
    pub fn in_render_pass(&self) -> bool {
        self.pass.is_some()
    }
}

// resources
impl RenderContext {
    pub fn create_buffer(&mut self, desc: &BufferDesc) -> GfxResult<BufferHandle> {
        self.device.create_buffer(desc)
    }

    /// 使引用该 buffer 的 descriptor set 失效，GPU 对象延迟销毁
    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        let Some(uid) = self.device.buffer(handle).map(|b| b.uid()) else {
            return;
        };
        self.descriptors.on_resource_destroy(uid, self.device.frame_id());
        self.device.destroy_buffer(handle);
    }

    pub fn create_texture(&mut self, desc: &TextureDesc) -> GfxResult<TextureHandle> {
        self.device.create_texture(desc)
    }

    /// 使 descriptor 与 framebuffer cache 中引用该纹理的条目失效，GPU 对象延迟销毁
    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        let Some(uid) = self.device.texture(handle).map(|t| t.uid()) else {
            return;
        };
        self.descriptors.on_texture_destroy(uid, self.device.frame_id());
        self.cache.on_texture_destroy(uid, &mut self.device);
        self.device.schedule_texture_to_destroy(handle);
    }

    pub fn create_shader_module(&mut self, spirv: &[u32], name: &str) -> GfxResult<vk::ShaderModule> {
        self.driver.create_shader_module(spirv, name).map_err(log_creation_error("shader module"))
    }

    /// 使用该 module 的 pipeline 会被一起延迟销毁
    pub fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        self.cache.on_shader_destroy(module, &mut self.device);
    }
}

// frame
impl RenderContext {
    /// 申请当前帧的 swapchain image，需要时先重建 swapchain
    ///
    /// 返回 false 表示本帧没有 backbuffer（无 swapchain，或者重建后仍然 out of date），
    /// 此时仍然需要调用 [`Self::end_frame`]
    pub fn begin_frame(&mut self) -> GfxResult<bool> {
        let _span = tracy_client::span!("RenderContext::begin_frame");
        let label = self.device.frame_label();
        let Some(swapchain) = self.swapchain.as_mut() else {
            return Ok(false);
        };

        // 第一次失败后重建，再尝试一次
        for _ in 0..2 {
            if swapchain.needs_recreate() {
                let extent = swapchain.window_extent();
                swapchain.recreate(extent)?;
            }
            if self.scheduler.acquire_next_image(swapchain, label) {
                return Ok(true);
            }
        }
        log::warn!("{} skip frame: swapchain is still out of date after recreation", self.device.frame_name());
        Ok(false)
    }

    /// 提交本帧的所有录制，present，然后进入下一帧
    ///
    /// 进入下一帧时会等待该 frame label 上一次使用时的提交，再处理延迟销毁与 descriptor 释放
    pub fn end_frame(&mut self) {
        let _span = tracy_client::span!("RenderContext::end_frame");
        assert!(self.pass.is_none(), "end frame inside a render pass");
        let label = self.device.frame_label();

        self.ring.flush(&mut self.scheduler);
        match self.swapchain.as_mut() {
            Some(swapchain) if swapchain.acquired_index().is_some() => {
                if !self.scheduler.present(swapchain, label) {
                    log::warn!("{} present out of date, recreate at next frame", self.device.frame_name());
                }
            }
            _ => {
                self.scheduler.flush();
            }
        }
        self.frame_last_submit[*label] = self.scheduler.last_submitted();

        self.device.next_frame();
        let next = self.device.frame_label();
        if let Some(handle) = self.frame_last_submit[*next].take() {
            self.scheduler.wait_until_free(handle);
        }
        self.scheduler.begin_frame(next);
        self.device.process_destroy_queue();
        self.descriptors.process_releases(self.device.frame_counter());
    }

    /// 窗口尺寸变化，swapchain 在下一次 [`Self::begin_frame`] 时重建
    pub fn resize(&mut self, width: u32, height: u32) {
        if let Some(swapchain) = self.swapchain.as_mut() {
            log::info!("resize to {}x{}", width, height);
            swapchain.request_recreate(vk::Extent2D { width, height });
        }
    }

    /// 结束当前的 command buffer 并提交给 GPU
    pub fn flush(&mut self) -> SubmitHandle {
        assert!(self.pass.is_none(), "flush inside a render pass");
        self.ring.flush(&mut self.scheduler);
        self.scheduler.flush()
    }

    /// 阻塞直到 `handle` 完成
    pub fn wait_until_free(&mut self, handle: SubmitHandle) {
        self.scheduler.wait_until_free(handle);
    }
}

// render pass
impl RenderContext {
    /// 开始绘制到当前的 swapchain image，`depth` 为 None 时不使用深度缓冲
    pub fn begin_backbuffer_pass(
        &mut self,
        color: AttachmentOps,
        depth: Option<AttachmentOps>,
        clear: ClearValues,
    ) -> GfxResult<()> {
        assert!(self.pass.is_none(), "begin backbuffer pass inside a render pass");
        let Some(swapchain) = self.swapchain.as_mut() else {
            panic!("begin backbuffer pass without a swapchain");
        };
        assert!(swapchain.acquired_index().is_some(), "begin backbuffer pass without an acquired image");

        let key = RenderPassKey {
            color: Some(AttachmentKey {
                format: swapchain.color_format(),
                ops: color,
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            }),
            depth: depth.map(|ops| AttachmentKey {
                format: swapchain.depth_format(),
                ops,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }),
        };
        let render_pass = self.cache.get_or_create_render_pass(&mut self.device, key)?;
        let framebuffer = swapchain.backbuffer_framebuffer(BackbufferKey { color, depth }, render_pass.handle)?;
        let extent = swapchain.extent();

        self.begin_pass(render_pass, framebuffer, extent, clear.to_vk(true, depth.is_some()), vec![]);
        Ok(())
    }

    /// 开始离屏绘制，attachment 在 pass 结束后回到各自的 steady state
    pub fn begin_render_pass(
        &mut self,
        color: Option<PassAttachment>,
        depth: Option<PassAttachment>,
        clear: ClearValues,
    ) -> GfxResult<()> {
        assert!(self.pass.is_none(), "begin render pass inside a render pass");

        let attachments = color.iter().chain(depth.iter()).copied().collect_vec();
        let mut extent = None;
        let mut views = Vec::with_capacity(attachments.len());
        let mut keys = Vec::with_capacity(attachments.len());
        let mut uninitialized_loads = vec![];
        for attachment in &attachments {
            let Some(texture) = self.device.texture(attachment.texture) else {
                panic!("render pass attachment is destroyed");
            };
            match extent {
                None => extent = Some(texture.extent()),
                Some(e) => assert_eq!(e, texture.extent(), "attachment {} extent mismatch", texture.name()),
            }
            if attachment.ops.load == LoadOp::Load && !texture.is_initialized() {
                uninitialized_loads.push((texture.image(), texture.aspect(), texture.steady_state()));
            }
            views.push((texture.uid(), texture.view()));
            keys.push(AttachmentKey {
                format: texture.format(),
                ops: attachment.ops,
                final_layout: texture.steady_state().state().layout,
            });
        }
        let Some(extent) = extent else {
            panic!("render pass without attachments");
        };

        let key = RenderPassKey {
            color: color.map(|_| keys[0]),
            depth: depth.map(|_| keys[keys.len() - 1]),
        };
        let render_pass = self.cache.get_or_create_render_pass(&mut self.device, key)?;
        let framebuffer = self.cache.get_or_create_framebuffer(render_pass, &views, extent)?;

        // load 一个从未写入过的纹理：先转换到 steady state，内容未定义
        if !uninitialized_loads.is_empty() {
            let cmd = self.ring.get_command_buffer(&mut self.scheduler);
            let barriers = uninitialized_loads
                .iter()
                .map(|(image, aspect, steady)| GfxImageBarrier::transition(*image, *aspect, ResourceState::Undefined, *steady))
                .collect_vec();
            self.driver.cmd_pipeline_barrier(cmd, &barriers, &[]);
        }

        let stored = attachments
            .iter()
            .filter(|a| a.ops.store == StoreOp::Store)
            .map(|a| a.texture)
            .collect_vec();
        self.begin_pass(render_pass, framebuffer, extent, clear.to_vk(color.is_some(), depth.is_some()), stored);
        Ok(())
    }

    fn begin_pass(
        &mut self,
        render_pass: CachedRenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: Vec<vk::ClearValue>,
        stored: Vec<TextureHandle>,
    ) {
        let cmd = self.ring.get_command_buffer(&mut self.scheduler);
        self.driver.cmd_begin_render_pass(
            cmd,
            &RenderPassBegin {
                render_pass: render_pass.handle,
                framebuffer,
                extent,
                clear_values: &clear_values,
            },
        );
        self.driver.cmd_set_viewport_scissor(cmd, extent);
        self.pass = Some(ActivePass {
            render_pass,
            extent,
            stored,
            pipeline: None,
        });
    }

    pub fn end_render_pass(&mut self) {
        let Some(pass) = self.pass.take() else {
            panic!("end render pass outside a render pass");
        };
        let cmd = self.ring.get_command_buffer(&mut self.scheduler);
        self.driver.cmd_end_render_pass(cmd);
        for handle in pass.stored {
            if let Some(texture) = self.device.texture_mut(handle) {
                texture.mark_initialized();
            }
        }
    }

    /// 当前 pass 的尺寸
    pub fn pass_extent(&self) -> Option<vk::Extent2D> {
        self.pass.as_ref().map(|p| p.extent)
    }
}

// bind & draw
impl RenderContext {
    fn active_pass(&mut self, what: &str) -> &mut ActivePass {
        match self.pass.as_mut() {
            Some(pass) => pass,
            None => panic!("{} outside a render pass", what),
        }
    }

    fn bound_pipeline(&mut self, what: &str) -> CachedPipeline {
        match self.active_pass(what).pipeline {
            Some(pipeline) => pipeline,
            None => panic!("{} without a bound pipeline", what),
        }
    }

    /// 绑定 pipeline；descriptor 形状为 bindless 时同时绑定 bindless set
    pub fn bind_pipeline(&mut self, desc: &PipelineDesc) -> GfxResult<()> {
        let render_pass = self.active_pass("bind pipeline").render_pass;
        let pipeline = self.cache.get_or_create_pipeline(&mut self.descriptors, render_pass, desc)?;

        let cmd = self.ring.get_command_buffer(&mut self.scheduler);
        self.driver.cmd_bind_pipeline(cmd, pipeline.pipeline);
        if pipeline.shape == DescriptorShape::Bindless {
            if let Some(set) = self.descriptors.bindless_set() {
                self.driver.cmd_bind_descriptor_sets(cmd, pipeline.layout, 0, &[set]);
            }
        }
        self.active_pass("bind pipeline").pipeline = Some(pipeline);
        Ok(())
    }

    /// 将纹理依次绑定到 set 0 的 binding 0..n
    pub fn bind_textures(&mut self, textures: &[TextureHandle]) -> GfxResult<()> {
        let pipeline = self.bound_pipeline("bind textures");
        let expected = DescriptorShape::Pooled {
            kind: DescriptorKind::CombinedImageSampler,
            count: textures.len() as u32,
        };
        assert_eq!(pipeline.shape, expected, "bound pipeline does not take {} textures", textures.len());

        let mut uids = Vec::with_capacity(textures.len());
        let mut infos = Vec::with_capacity(textures.len());
        for handle in textures {
            let Some(texture) = self.device.texture(*handle) else {
                panic!("bind a destroyed texture");
            };
            assert!(texture.is_sampled(), "texture {} is not sampleable", texture.name());
            assert!(texture.is_initialized(), "texture {} is sampled before it is written", texture.name());
            let sampler_desc = if texture.is_depth() {
                SamplerDesc::depth_compare()
            } else {
                SamplerDesc::default()
            };
            uids.push(texture.uid());
            infos.push((sampler_desc, texture.view()));
        }
        let infos = infos
            .into_iter()
            .map(|(desc, view)| {
                Ok(DescriptorInfo::Image {
                    sampler: self.cache.get_or_create_sampler(&desc)?,
                    view,
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                })
            })
            .collect::<GfxResult<Vec<_>>>()?;

        let set = self.descriptors.get_single_type_descriptor_set(DescriptorKind::CombinedImageSampler, &uids, &infos)?;
        let cmd = self.ring.get_command_buffer(&mut self.scheduler);
        self.driver.cmd_bind_descriptor_sets(cmd, pipeline.layout, 0, &[set]);
        Ok(())
    }

    #[inline]
    pub fn bind_texture(&mut self, texture: TextureHandle) -> GfxResult<()> {
        self.bind_textures(std::slice::from_ref(&texture))
    }

    /// 纹理在 bindless 表中的 index，通过 push constant 等方式传给 shader
    pub fn texture_index(&mut self, handle: TextureHandle) -> BindlessIndex {
        let Some(texture) = self.device.texture(handle) else {
            panic!("bindless index of a destroyed texture");
        };
        self.descriptors.get_texture_descriptor(texture)
    }

    /// 将 uniform buffer 依次绑定到 set 0 的 binding 0..n
    pub fn bind_uniform_buffers(&mut self, buffers: &[BufferHandle]) -> GfxResult<()> {
        let pipeline = self.bound_pipeline("bind uniform buffers");
        let expected = DescriptorShape::Pooled {
            kind: DescriptorKind::UniformBuffer,
            count: buffers.len() as u32,
        };
        assert_eq!(pipeline.shape, expected, "bound pipeline does not take {} uniform buffers", buffers.len());

        let mut uids = Vec::with_capacity(buffers.len());
        let mut infos = Vec::with_capacity(buffers.len());
        for handle in buffers {
            let Some(buffer) = self.device.buffer(*handle) else {
                panic!("bind a destroyed buffer");
            };
            assert!(
                buffer.usage().contains(vk::BufferUsageFlags::UNIFORM_BUFFER),
                "buffer {} is not a uniform buffer",
                buffer.name()
            );
            uids.push(buffer.uid());
            infos.push(DescriptorInfo::Buffer {
                buffer: buffer.handle(),
                offset: 0,
                range: buffer.size(),
            });
        }

        let set = self.descriptors.get_single_type_descriptor_set(DescriptorKind::UniformBuffer, &uids, &infos)?;
        let cmd = self.ring.get_command_buffer(&mut self.scheduler);
        self.driver.cmd_bind_descriptor_sets(cmd, pipeline.layout, 0, &[set]);
        Ok(())
    }

    #[inline]
    pub fn bind_uniform_buffer(&mut self, buffer: BufferHandle) -> GfxResult<()> {
        self.bind_uniform_buffers(std::slice::from_ref(&buffer))
    }

    pub fn bind_vertex_buffer(&mut self, handle: BufferHandle, offset: vk::DeviceSize) {
        self.active_pass("bind vertex buffer");
        let Some(buffer) = self.device.buffer(handle).map(|b| b.handle()) else {
            panic!("bind a destroyed vertex buffer");
        };
        let cmd = self.ring.get_command_buffer(&mut self.scheduler);
        self.driver.cmd_bind_vertex_buffer(cmd, 0, buffer, offset);
    }

    pub fn bind_index_buffer(&mut self, handle: BufferHandle, offset: vk::DeviceSize, index_type: vk::IndexType) {
        self.active_pass("bind index buffer");
        let Some(buffer) = self.device.buffer(handle).map(|b| b.handle()) else {
            panic!("bind a destroyed index buffer");
        };
        let cmd = self.ring.get_command_buffer(&mut self.scheduler);
        self.driver.cmd_bind_index_buffer(cmd, buffer, offset, index_type);
    }

    pub fn push_constants(&mut self, data: &[u8]) {
        let pipeline = self.bound_pipeline("push constants");
        let cmd = self.ring.get_command_buffer(&mut self.scheduler);
        self.driver.cmd_push_constants(cmd, pipeline.layout, 0, data);
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.bound_pipeline("draw");
        let cmd = self.ring.get_command_buffer(&mut self.scheduler);
        self.driver.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.bound_pipeline("draw indexed");
        let cmd = self.ring.get_command_buffer(&mut self.scheduler);
        self.driver.cmd_draw_indexed(cmd, index_count, instance_count, first_index, vertex_offset, first_instance);
    }
}

// upload
impl RenderContext {
    /// 通过 staging ring 上传，copy 录制在当前的 command buffer 中
    pub fn upload_buffer(&mut self, handle: BufferHandle, dst_offset: vk::DeviceSize, data: &[u8]) {
        assert!(self.pass.is_none(), "upload inside a render pass");
        self.ring.schedule_buffer_upload(&mut self.scheduler, &mut self.device, handle, dst_offset, data);
    }

    pub fn upload_texture(&mut self, handle: TextureHandle, data: &[u8]) {
        assert!(self.pass.is_none(), "upload inside a render pass");
        self.ring.schedule_texture_upload(&mut self.scheduler, &mut self.device, handle, data);
    }

    /// 同步上传，返回时数据已经写入。只适合加载阶段使用
    pub fn upload_buffer_immediate(
        &mut self,
        handle: BufferHandle,
        dst_offset: vk::DeviceSize,
        data: &[u8],
    ) -> GfxResult<()> {
        assert!(self.pass.is_none(), "upload inside a render pass");
        self.device.upload_buffer_immediate(handle, dst_offset, data)
    }

    pub fn upload_texture_immediate(&mut self, handle: TextureHandle, data: &[u8]) -> GfxResult<()> {
        assert!(self.pass.is_none(), "upload inside a render pass");
        self.device.upload_texture_immediate(handle, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_gfx::desc::MemoryLocation;
    use kiln_gfx::fake::FakeDriver;

    fn context(window: bool) -> (Rc<FakeDriver>, RenderContext) {
        let fake = Rc::new(FakeDriver::new());
        let settings = CoreSettings {
            staging_initial_size: 64 * 1024,
            ..Default::default()
        };
        let extent = window.then_some(vk::Extent2D {
            width: 320,
            height: 240,
        });
        let ctx = RenderContext::new(fake.clone(), &settings, extent).unwrap();
        (fake, ctx)
    }

    fn finish(fake: &FakeDriver, mut ctx: RenderContext) {
        ctx.shutdown();
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
        assert_eq!(fake.live_object_count(), 0);
    }

    fn shaders(ctx: &mut RenderContext) -> (vk::ShaderModule, vk::ShaderModule) {
        (
            ctx.create_shader_module(&[0x0723_0203], "vs").unwrap(),
            ctx.create_shader_module(&[0x0723_0203], "fs").unwrap(),
        )
    }

    #[test]
    fn test_headless_frames() {
        let (fake, mut ctx) = context(false);
        for _ in 0..5 {
            assert!(!ctx.begin_frame().unwrap());
            ctx.end_frame();
        }
        assert_eq!(ctx.frame_id(), 5);
        assert_eq!(fake.stats().acquires, 0);
        finish(&fake, ctx);
    }

    #[test]
    fn test_backbuffer_frame() {
        let (fake, mut ctx) = context(true);
        let (vs, fs) = shaders(&mut ctx);
        for _ in 0..6 {
            assert!(ctx.begin_frame().unwrap());
            ctx.begin_backbuffer_pass(AttachmentOps::CLEAR_STORE, Some(AttachmentOps::CLEAR_DISCARD), ClearValues::default())
                .unwrap();
            ctx.bind_pipeline(&PipelineDesc::new(vs, fs)).unwrap();
            ctx.draw(3, 1, 0, 0);
            ctx.end_render_pass();
            ctx.end_frame();
        }
        ctx.destroy_shader_module(vs);
        ctx.destroy_shader_module(fs);
        let stats = fake.stats();
        assert_eq!(stats.presents, 6);
        assert_eq!(stats.pipelines_created, 1);
        assert_eq!(stats.render_passes_created, 1);
        assert!(stats.max_in_flight_fences <= FrameCounter::FIF_COUNT);
        finish(&fake, ctx);
    }

    #[test]
    fn test_offscreen_pass_then_sample() {
        let (fake, mut ctx) = context(true);
        let (vs, fs) = shaders(&mut ctx);
        let target = ctx
            .create_texture(&TextureDesc::render_target(16, 16, vk::Format::R8G8B8A8_UNORM, "offscreen"))
            .unwrap();

        assert!(ctx.begin_frame().unwrap());
        ctx.begin_render_pass(
            Some(PassAttachment {
                texture: target,
                ops: AttachmentOps::CLEAR_STORE,
            }),
            None,
            ClearValues::default(),
        )
        .unwrap();
        ctx.end_render_pass();
        assert!(ctx.device().texture(target).unwrap().is_initialized());

        ctx.begin_backbuffer_pass(AttachmentOps::CLEAR_STORE, None, ClearValues::default()).unwrap();
        ctx.bind_pipeline(&PipelineDesc {
            descriptor_shape: DescriptorShape::Pooled {
                kind: DescriptorKind::CombinedImageSampler,
                count: 1,
            },
            ..PipelineDesc::new(vs, fs)
        })
        .unwrap();
        ctx.bind_texture(target).unwrap();
        ctx.draw(3, 1, 0, 0);
        ctx.end_render_pass();
        ctx.end_frame();

        let image = ctx.device().texture(target).unwrap().image();
        ctx.flush();
        ctx.scheduler.wait_idle();
        assert_eq!(fake.image_layout(image), Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL));

        ctx.destroy_texture(target);
        ctx.destroy_shader_module(vs);
        ctx.destroy_shader_module(fs);
        assert_eq!(ctx.cache().framebuffer_count(), 0);
        finish(&fake, ctx);
    }

    #[test]
    fn test_staged_upload_lands_after_flush() {
        let (fake, mut ctx) = context(false);
        let buffer = ctx
            .create_buffer(&BufferDesc {
                size: 8,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                location: MemoryLocation::GpuOnly,
                name: "vertices",
            })
            .unwrap();
        ctx.upload_buffer(buffer, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let handle = ctx.flush();
        ctx.wait_until_free(handle);

        let vk_buffer = ctx.device().buffer(buffer).unwrap().handle();
        assert_eq!(fake.read_buffer(vk_buffer).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        ctx.destroy_buffer(buffer);
        finish(&fake, ctx);
    }

    #[test]
    #[should_panic(expected = "upload inside a render pass")]
    fn test_upload_inside_pass_panics() {
        let (_fake, mut ctx) = context(true);
        let buffer = ctx
            .create_buffer(&BufferDesc {
                size: 4,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                location: MemoryLocation::GpuOnly,
                name: "vertices",
            })
            .unwrap();
        assert!(ctx.begin_frame().unwrap());
        ctx.begin_backbuffer_pass(AttachmentOps::CLEAR_STORE, None, ClearValues::default()).unwrap();
        ctx.upload_buffer(buffer, 0, &[0; 4]);
    }

    #[test]
    #[should_panic(expected = "draw without a bound pipeline")]
    fn test_draw_without_pipeline_panics() {
        let (_fake, mut ctx) = context(true);
        assert!(ctx.begin_frame().unwrap());
        ctx.begin_backbuffer_pass(AttachmentOps::CLEAR_STORE, None, ClearValues::default()).unwrap();
        ctx.draw(3, 1, 0, 0);
    }

    #[test]
    fn test_resize_recreates_at_next_frame() {
        let (fake, mut ctx) = context(true);
        assert!(ctx.begin_frame().unwrap());
        ctx.end_frame();

        ctx.resize(640, 480);
        fake.set_surface_extent(640, 480);
        assert!(ctx.begin_frame().unwrap());
        ctx.end_frame();

        assert_eq!(fake.stats().swapchains_created, 2);
        assert_eq!(ctx.swapchain().unwrap().extent(), vk::Extent2D { width: 640, height: 480 });
        finish(&fake, ctx);
    }
}
