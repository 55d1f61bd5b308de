//! render pass、framebuffer、pipeline 与 sampler 的缓存
//!
//! cache 只保存 uid 与 driver 句柄，资源本身由 [`RenderDevice`] 持有。
//! 资源销毁时通过 `on_*_destroy` 让引用它的对象失效，对象本身交给 device 延迟销毁

use std::rc::Rc;

use ash::vk;
use itertools::Itertools;
use kiln_gfx::desc::{AttachmentDesc, FramebufferDesc, GraphicsPipelineDesc, PipelineLayoutDesc, RenderPassDesc, SamplerDesc};
use kiln_gfx::driver::GfxDriver;
use kiln_gfx::error::{GfxResult, log_creation_error};
use kiln_gfx::flags::{AttachmentOps, DescriptorKind, LoadOp};
use rustc_hash::FxHashMap;

use crate::descriptor::DescriptorManager;
use crate::device::{GfxObject, RenderDevice};
use crate::handles::Uid;

/// render pass 中一个 attachment 的 key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    pub format: vk::Format,
    pub ops: AttachmentOps,
    /// pass 结束时的 layout，也是 load 时期望的初始 layout
    pub final_layout: vk::ImageLayout,
}

impl AttachmentKey {
    fn desc(&self) -> AttachmentDesc {
        AttachmentDesc {
            format: self.format,
            load_op: self.ops.load.to_vk(),
            store_op: self.ops.store.to_vk(),
            initial_layout: match self.ops.load {
                LoadOp::Load => self.final_layout,
                LoadOp::Clear | LoadOp::DontCare => vk::ImageLayout::UNDEFINED,
            },
            final_layout: self.final_layout,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub color: Option<AttachmentKey>,
    pub depth: Option<AttachmentKey>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CachedRenderPass {
    pub handle: vk::RenderPass,
    /// pipeline 与 framebuffer 的 cache 使用该 uid 作为 key
    pub uid: Uid,
}

/// pipeline layout 中 set 0 的形状
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorShape {
    None,
    Pooled { kind: DescriptorKind, count: u32 },
    Bindless,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// 单个 vertex binding 的布局，stride 为 0 表示没有顶点输入
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

/// 创建 graphics pipeline 所需的全部状态，同时也是 cache 的 key（加上 render pass）
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineDesc {
    pub vertex_shader: vk::ShaderModule,
    pub fragment_shader: vk::ShaderModule,
    pub vertex_layout: VertexLayout,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub alpha_blend: bool,
    pub descriptor_shape: DescriptorShape,
    pub push_constant_size: u32,
}

impl PipelineDesc {
    /// 不带顶点输入和 descriptor 的三角形列表
    pub fn new(vertex_shader: vk::ShaderModule, fragment_shader: vk::ShaderModule) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            vertex_layout: VertexLayout::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            alpha_blend: false,
            descriptor_shape: DescriptorShape::None,
            push_constant_size: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PipelineLayoutKey {
    shape: DescriptorShape,
    push_constant_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PipelineKey {
    render_pass: Uid,
    desc: PipelineDesc,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct FramebufferKey {
    render_pass: Uid,
    attachments: Vec<Uid>,
}

/// 绑定 pipeline 时需要的句柄
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachedPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub shape: DescriptorShape,
}

pub struct RenderCache {
    driver: Rc<dyn GfxDriver>,

    render_passes: FxHashMap<RenderPassKey, CachedRenderPass>,
    framebuffers: FxHashMap<FramebufferKey, vk::Framebuffer>,
    /// 纹理 uid 出现在哪些 framebuffer 中
    framebuffer_refs: FxHashMap<Uid, Vec<FramebufferKey>>,
    pipeline_layouts: FxHashMap<PipelineLayoutKey, vk::PipelineLayout>,
    pipelines: FxHashMap<PipelineKey, vk::Pipeline>,
    samplers: FxHashMap<SamplerDesc, vk::Sampler>,

    destroyed: bool,
}

// new & init
impl RenderCache {
    pub fn new(driver: Rc<dyn GfxDriver>) -> Self {
        Self {
            driver,
            render_passes: FxHashMap::default(),
            framebuffers: FxHashMap::default(),
            framebuffer_refs: FxHashMap::default(),
            pipeline_layouts: FxHashMap::default(),
            pipelines: FxHashMap::default(),
            samplers: FxHashMap::default(),
            destroyed: false,
        }
    }
}

// destroy
impl RenderCache {
    /// 调用之前 GPU 必须处于 idle 状态
    pub fn destroy(&mut self) {
        log::info!(
            "destroy render cache: {} render passes, {} pipelines, {} framebuffers",
            self.render_passes.len(),
            self.pipelines.len(),
            self.framebuffers.len()
        );
        for (_, pipeline) in self.pipelines.drain() {
            self.driver.destroy_pipeline(pipeline);
        }
        for (_, layout) in self.pipeline_layouts.drain() {
            self.driver.destroy_pipeline_layout(layout);
        }
        for (_, framebuffer) in self.framebuffers.drain() {
            self.driver.destroy_framebuffer(framebuffer);
        }
        self.framebuffer_refs.clear();
        for (_, render_pass) in self.render_passes.drain() {
            self.driver.destroy_render_pass(render_pass.handle);
        }
        for (_, sampler) in self.samplers.drain() {
            self.driver.destroy_sampler(sampler);
        }
        self.destroyed = true;
    }
}
impl Drop for RenderCache {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "RenderCache dropped without destroy");
        }
    }
}

// getters
impl RenderCache {
    #[inline]
    pub fn render_pass_count(&self) -> usize {
        self.render_passes.len()
    }
    #[inline]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }
    #[inline]
    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }
    /// 以 `uid` 作为 attachment 的 framebuffer 数量
    #[inline]
    pub fn framebuffer_ref_count(&self, uid: Uid) -> usize {
        self.framebuffer_refs.get(&uid).map_or(0, |keys| keys.len())
    }
}

// get or create
impl RenderCache {
    pub fn get_or_create_render_pass(
        &mut self,
        device: &mut RenderDevice,
        key: RenderPassKey,
    ) -> GfxResult<CachedRenderPass> {
        if let Some(render_pass) = self.render_passes.get(&key) {
            return Ok(*render_pass);
        }

        let uid = device.next_uid();
        let handle = self
            .driver
            .create_render_pass(&RenderPassDesc {
                color: key.color.map(|a| a.desc()),
                depth: key.depth.map(|a| a.desc()),
                name: &format!("render-pass-{}", uid),
            })
            .map_err(log_creation_error("render pass"))?;
        let render_pass = CachedRenderPass { handle, uid };
        self.render_passes.insert(key, render_pass);
        Ok(render_pass)
    }

    /// 离屏 render pass 的 framebuffer，`attachments` 的顺序：先颜色，后深度
    pub fn get_or_create_framebuffer(
        &mut self,
        render_pass: CachedRenderPass,
        attachments: &[(Uid, vk::ImageView)],
        extent: vk::Extent2D,
    ) -> GfxResult<vk::Framebuffer> {
        let key = FramebufferKey {
            render_pass: render_pass.uid,
            attachments: attachments.iter().map(|(uid, _)| *uid).collect(),
        };
        if let Some(framebuffer) = self.framebuffers.get(&key) {
            return Ok(*framebuffer);
        }

        let views = attachments.iter().map(|(_, view)| *view).collect_vec();
        let framebuffer = self
            .driver
            .create_framebuffer(&FramebufferDesc {
                render_pass: render_pass.handle,
                attachments: &views,
                extent,
                name: &format!("framebuffer-{}", key.attachments.iter().join("-")),
            })
            .map_err(log_creation_error("framebuffer"))?;
        for uid in key.attachments.iter().unique() {
            self.framebuffer_refs.entry(*uid).or_default().push(key.clone());
        }
        self.framebuffers.insert(key, framebuffer);
        Ok(framebuffer)
    }

    pub fn get_or_create_pipeline_layout(
        &mut self,
        descriptors: &mut DescriptorManager,
        shape: DescriptorShape,
        push_constant_size: u32,
    ) -> GfxResult<vk::PipelineLayout> {
        let key = PipelineLayoutKey {
            shape,
            push_constant_size,
        };
        if let Some(layout) = self.pipeline_layouts.get(&key) {
            return Ok(*layout);
        }

        let set_layouts = match shape {
            DescriptorShape::None => vec![],
            DescriptorShape::Pooled { kind, count } => vec![descriptors.layout_for(kind, count)?],
            DescriptorShape::Bindless => match descriptors.bindless_layout() {
                Some(layout) => vec![layout],
                None => panic!("pipeline uses bindless descriptors but bindless is not enabled"),
            },
        };
        let layout = self
            .driver
            .create_pipeline_layout(&PipelineLayoutDesc {
                set_layouts: &set_layouts,
                push_constant_size,
                name: &format!("pipeline-layout-{:?}", shape),
            })
            .map_err(log_creation_error("pipeline layout"))?;
        self.pipeline_layouts.insert(key, layout);
        Ok(layout)
    }

    pub fn get_or_create_pipeline(
        &mut self,
        descriptors: &mut DescriptorManager,
        render_pass: CachedRenderPass,
        desc: &PipelineDesc,
    ) -> GfxResult<CachedPipeline> {
        let layout = self.get_or_create_pipeline_layout(descriptors, desc.descriptor_shape, desc.push_constant_size)?;
        let key = PipelineKey {
            render_pass: render_pass.uid,
            desc: desc.clone(),
        };
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Ok(CachedPipeline {
                pipeline: *pipeline,
                layout,
                shape: desc.descriptor_shape,
            });
        }

        let vertex_bindings = if desc.vertex_layout.stride > 0 {
            vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: desc.vertex_layout.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }]
        } else {
            vec![]
        };
        let vertex_attributes = desc
            .vertex_layout
            .attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: 0,
                format: a.format,
                offset: a.offset,
            })
            .collect_vec();

        let pipeline = self
            .driver
            .create_graphics_pipeline(&GraphicsPipelineDesc {
                layout,
                render_pass: render_pass.handle,
                vertex_shader: desc.vertex_shader,
                fragment_shader: desc.fragment_shader,
                vertex_bindings: &vertex_bindings,
                vertex_attributes: &vertex_attributes,
                topology: desc.topology,
                cull_mode: desc.cull_mode,
                depth_test: desc.depth_test,
                depth_write: desc.depth_write,
                alpha_blend: desc.alpha_blend,
                name: &format!("pipeline-{}-{}", render_pass.uid, self.pipelines.len()),
            })
            .map_err(log_creation_error("graphics pipeline"))?;
        self.pipelines.insert(key, pipeline);
        Ok(CachedPipeline {
            pipeline,
            layout,
            shape: desc.descriptor_shape,
        })
    }

    /// 设备不支持各向异性过滤时会忽略 `anisotropy`
    pub fn get_or_create_sampler(&mut self, desc: &SamplerDesc) -> GfxResult<vk::Sampler> {
        let desc = SamplerDesc {
            anisotropy: desc.anisotropy && self.driver.caps().sampler_anisotropy,
            ..*desc
        };
        if let Some(sampler) = self.samplers.get(&desc) {
            return Ok(*sampler);
        }
        let sampler = self
            .driver
            .create_sampler(&desc, &format!("sampler-{}", self.samplers.len()))
            .map_err(log_creation_error("sampler"))?;
        self.samplers.insert(desc, sampler);
        Ok(sampler)
    }
}

// invalidation
impl RenderCache {
    /// 移除所有使用该纹理作为 attachment 的 framebuffer，并交给 device 延迟销毁
    pub fn on_texture_destroy(&mut self, uid: Uid, device: &mut RenderDevice) {
        let Some(keys) = self.framebuffer_refs.remove(&uid) else {
            return;
        };
        for key in keys {
            let Some(framebuffer) = self.framebuffers.remove(&key) else {
                continue;
            };
            device.schedule_object_to_destroy(GfxObject::Framebuffer(framebuffer));

            // 其他 attachment 不再引用这个 framebuffer
            for other in key.attachments.iter().filter(|other| **other != uid) {
                if let Some(other_keys) = self.framebuffer_refs.get_mut(other) {
                    other_keys.retain(|k| *k != key);
                    if other_keys.is_empty() {
                        self.framebuffer_refs.remove(other);
                    }
                }
            }
        }
    }

    /// 移除所有使用该 shader module 的 pipeline，pipeline 与 module 一起延迟销毁
    pub fn on_shader_destroy(&mut self, module: vk::ShaderModule, device: &mut RenderDevice) {
        self.pipelines.retain(|key, pipeline| {
            let uses = key.desc.vertex_shader == module || key.desc.fragment_shader == module;
            if uses {
                device.schedule_object_to_destroy(GfxObject::Pipeline(*pipeline));
            }
            !uses
        });
        device.schedule_object_to_destroy(GfxObject::ShaderModule(module));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_gfx::fake::FakeDriver;

    use crate::device::TextureDesc;
    use crate::settings::CoreSettings;

    struct Fixture {
        fake: Rc<FakeDriver>,
        device: RenderDevice,
        descriptors: DescriptorManager,
        cache: RenderCache,
    }

    impl Fixture {
        fn new() -> Self {
            let fake = Rc::new(FakeDriver::new());
            Self {
                device: RenderDevice::new(fake.clone()),
                descriptors: DescriptorManager::new(fake.clone(), &CoreSettings::default()).unwrap(),
                cache: RenderCache::new(fake.clone()),
                fake,
            }
        }

        fn destroy(mut self) {
            self.cache.destroy();
            self.descriptors.destroy();
            self.device.destroy();
            assert_eq!(self.fake.live_object_count(), 0);
            assert!(self.fake.violations().is_empty(), "{:?}", self.fake.violations());
        }
    }

    fn color_key(ops: AttachmentOps) -> RenderPassKey {
        RenderPassKey {
            color: Some(AttachmentKey {
                format: vk::Format::R8G8B8A8_UNORM,
                ops,
                final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }),
            depth: None,
        }
    }

    #[test]
    fn test_load_keeps_initial_layout() {
        let key = color_key(AttachmentOps::LOAD_STORE).color.unwrap();
        assert_eq!(key.desc().initial_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let key = color_key(AttachmentOps::CLEAR_STORE).color.unwrap();
        assert_eq!(key.desc().initial_layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn test_render_pass_cached_by_ops() {
        let mut f = Fixture::new();
        let a = f.cache.get_or_create_render_pass(&mut f.device, color_key(AttachmentOps::CLEAR_STORE)).unwrap();
        let b = f.cache.get_or_create_render_pass(&mut f.device, color_key(AttachmentOps::CLEAR_STORE)).unwrap();
        let c = f.cache.get_or_create_render_pass(&mut f.device, color_key(AttachmentOps::LOAD_STORE)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.uid, c.uid);
        assert_eq!(f.fake.stats().render_passes_created, 2);
        f.destroy();
    }

    #[test]
    fn test_pipeline_cache_and_shader_invalidation() {
        let mut f = Fixture::new();
        let vs = f.fake.create_shader_module(&[0x0723_0203], "vs").unwrap();
        let fs = f.fake.create_shader_module(&[0x0723_0203], "fs").unwrap();
        let render_pass = f.cache.get_or_create_render_pass(&mut f.device, color_key(AttachmentOps::CLEAR_STORE)).unwrap();

        let desc = PipelineDesc {
            descriptor_shape: DescriptorShape::Pooled {
                kind: DescriptorKind::CombinedImageSampler,
                count: 1,
            },
            ..PipelineDesc::new(vs, fs)
        };
        let a = f.cache.get_or_create_pipeline(&mut f.descriptors, render_pass, &desc).unwrap();
        let b = f.cache.get_or_create_pipeline(&mut f.descriptors, render_pass, &desc).unwrap();
        assert_eq!(a, b);

        let blended = PipelineDesc {
            alpha_blend: true,
            ..desc.clone()
        };
        let c = f.cache.get_or_create_pipeline(&mut f.descriptors, render_pass, &blended).unwrap();
        assert_ne!(a.pipeline, c.pipeline);
        assert_eq!(a.layout, c.layout);
        assert_eq!(f.fake.stats().pipelines_created, 2);

        f.cache.on_shader_destroy(fs, &mut f.device);
        assert_eq!(f.cache.pipeline_count(), 0);
        f.cache.on_shader_destroy(vs, &mut f.device);
        // pipeline 与 module 延迟销毁
        assert!(f.fake.is_alive(a.pipeline));
        assert_eq!(f.device.pending_destroy_count(), 4);
        f.destroy();
    }

    #[test]
    fn test_framebuffer_invalidated_by_attachment() {
        let mut f = Fixture::new();
        let render_pass = f.cache.get_or_create_render_pass(&mut f.device, color_key(AttachmentOps::CLEAR_STORE)).unwrap();
        let handle = f
            .device
            .create_texture(&TextureDesc::render_target(4, 4, vk::Format::R8G8B8A8_UNORM, "rt"))
            .unwrap();
        let (uid, view) = {
            let texture = f.device.texture(handle).unwrap();
            (texture.uid(), texture.view())
        };
        let extent = vk::Extent2D { width: 4, height: 4 };

        let a = f.cache.get_or_create_framebuffer(render_pass, &[(uid, view)], extent).unwrap();
        let b = f.cache.get_or_create_framebuffer(render_pass, &[(uid, view)], extent).unwrap();
        assert_eq!(a, b);

        f.cache.on_texture_destroy(uid, &mut f.device);
        assert_eq!(f.cache.framebuffer_count(), 0);
        f.device.schedule_texture_to_destroy(handle);
        f.destroy();
    }

    #[test]
    fn test_long_lived_attachment_refs_stay_bounded() {
        let mut f = Fixture::new();
        let key = RenderPassKey {
            depth: Some(AttachmentKey {
                format: vk::Format::D32_SFLOAT,
                ops: AttachmentOps::CLEAR_DISCARD,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }),
            ..color_key(AttachmentOps::CLEAR_STORE)
        };
        let render_pass = f.cache.get_or_create_render_pass(&mut f.device, key).unwrap();
        let depth = f
            .device
            .create_texture(&TextureDesc::render_target(4, 4, vk::Format::D32_SFLOAT, "depth"))
            .unwrap();
        let (depth_uid, depth_view) = {
            let texture = f.device.texture(depth).unwrap();
            (texture.uid(), texture.view())
        };
        let extent = vk::Extent2D { width: 4, height: 4 };

        for _ in 0..100 {
            let color = f
                .device
                .create_texture(&TextureDesc::render_target(4, 4, vk::Format::R8G8B8A8_UNORM, "color"))
                .unwrap();
            let (uid, view) = {
                let texture = f.device.texture(color).unwrap();
                (texture.uid(), texture.view())
            };
            f.cache
                .get_or_create_framebuffer(render_pass, &[(uid, view), (depth_uid, depth_view)], extent)
                .unwrap();
            assert_eq!(f.cache.framebuffer_ref_count(depth_uid), 1);

            f.cache.on_texture_destroy(uid, &mut f.device);
            f.device.schedule_texture_to_destroy(color);
            assert_eq!(f.cache.framebuffer_ref_count(depth_uid), 0);
        }
        assert_eq!(f.cache.framebuffer_count(), 0);

        f.cache.on_texture_destroy(depth_uid, &mut f.device);
        f.device.schedule_texture_to_destroy(depth);
        f.destroy();
    }

    #[test]
    fn test_sampler_cache() {
        let mut f = Fixture::new();
        let a = f.cache.get_or_create_sampler(&SamplerDesc::default()).unwrap();
        let b = f.cache.get_or_create_sampler(&SamplerDesc::default()).unwrap();
        let c = f.cache.get_or_create_sampler(&SamplerDesc::depth_compare()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        f.destroy();
    }
}
