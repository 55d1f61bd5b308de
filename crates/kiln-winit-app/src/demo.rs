//! 示例渲染器：每帧 clear backbuffer，配置了 shader 时再绘制一个带棋盘格纹理的 quad

use std::fs::File;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use anyhow::Context;
use ash::vk;
use kiln_gfx::desc::{BufferDesc, MemoryLocation};
use kiln_gfx::driver::GfxDriver;
use kiln_gfx::flags::{AttachmentOps, DescriptorKind};
use kiln_render_core::device::TextureDesc;
use kiln_render_core::handles::{BufferHandle, TextureHandle};
use kiln_render_core::render_cache::{DescriptorShape, PipelineDesc, VertexAttribute, VertexLayout};
use kiln_render_core::render_context::{ClearValues, RenderContext};

use crate::settings::AppSettings;

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    pos: [f32; 2],
    uv: [f32; 2],
}

const QUAD_VERTICES: [Vertex; 4] = [
    Vertex { pos: [-0.5, -0.5], uv: [0.0, 0.0] },
    Vertex { pos: [0.5, -0.5], uv: [1.0, 0.0] },
    Vertex { pos: [0.5, 0.5], uv: [1.0, 1.0] },
    Vertex { pos: [-0.5, 0.5], uv: [0.0, 1.0] },
];
const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

const CHECKER_SIZE: u32 = 64;
const CHECKER_CELL: u32 = 8;

/// 绘制 quad 所需的全部资源
struct QuadResources {
    vertex_shader: vk::ShaderModule,
    fragment_shader: vk::ShaderModule,
    pipeline: PipelineDesc,
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
}

pub struct DemoRenderer {
    ctx: RenderContext,
    checker: TextureHandle,
    quad: Option<QuadResources>,

    start: Instant,
    destroyed: bool,
}

// new & init
impl DemoRenderer {
    pub fn new(driver: Rc<dyn GfxDriver>, settings: &AppSettings, extent: vk::Extent2D) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("DemoRenderer::new");
        let ctx = RenderContext::new(driver, &settings.core, Some(extent))?;

        let checker = TextureHandle::default();
        let mut renderer = Self {
            ctx,
            checker,
            quad: None,
            start: Instant::now(),
            destroyed: false,
        };
        // 加载失败时也要走 destroy，释放已经创建的对象
        if let Err(e) = renderer.init_resources(settings) {
            renderer.destroy();
            return Err(e);
        }
        Ok(renderer)
    }

    fn init_resources(&mut self, settings: &AppSettings) -> anyhow::Result<()> {
        self.checker = self.ctx.create_texture(&TextureDesc::sampled_2d(
            CHECKER_SIZE,
            CHECKER_SIZE,
            vk::Format::R8G8B8A8_UNORM,
            "checker",
        ))?;
        self.ctx.upload_texture(self.checker, &checker_pixels());

        match (&settings.vertex_shader, &settings.fragment_shader) {
            (Some(vs), Some(fs)) => self.quad = Some(Self::create_quad(&mut self.ctx, vs, fs)?),
            _ => log::warn!("no shaders configured, only clearing the backbuffer"),
        }
        Ok(())
    }

    fn create_quad(ctx: &mut RenderContext, vs_path: &Path, fs_path: &Path) -> anyhow::Result<QuadResources> {
        let vertex_shader = ctx.create_shader_module(&load_spirv(vs_path)?, "quad-vs")?;
        let fragment_shader = ctx.create_shader_module(&load_spirv(fs_path)?, "quad-fs")?;

        let pipeline = PipelineDesc {
            vertex_layout: VertexLayout {
                stride: size_of::<Vertex>() as u32,
                attributes: vec![
                    VertexAttribute {
                        location: 0,
                        format: vk::Format::R32G32_SFLOAT,
                        offset: std::mem::offset_of!(Vertex, pos) as u32,
                    },
                    VertexAttribute {
                        location: 1,
                        format: vk::Format::R32G32_SFLOAT,
                        offset: std::mem::offset_of!(Vertex, uv) as u32,
                    },
                ],
            },
            descriptor_shape: DescriptorShape::Pooled {
                kind: DescriptorKind::CombinedImageSampler,
                count: 1,
            },
            push_constant_size: size_of::<f32>() as u32,
            alpha_blend: true,
            ..PipelineDesc::new(vertex_shader, fragment_shader)
        };

        let vertices: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        let vertex_buffer = ctx.create_buffer(&BufferDesc {
            size: vertices.len() as vk::DeviceSize,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            location: MemoryLocation::GpuOnly,
            name: "quad-vertices",
        })?;
        ctx.upload_buffer(vertex_buffer, 0, vertices);

        // index buffer 只在加载时写入一次，直接同步上传
        let indices: &[u8] = bytemuck::cast_slice(&QUAD_INDICES);
        let index_buffer = ctx.create_buffer(&BufferDesc {
            size: indices.len() as vk::DeviceSize,
            usage: vk::BufferUsageFlags::INDEX_BUFFER,
            location: MemoryLocation::GpuOnly,
            name: "quad-indices",
        })?;
        ctx.upload_buffer_immediate(index_buffer, 0, indices)?;

        Ok(QuadResources {
            vertex_shader,
            fragment_shader,
            pipeline,
            vertex_buffer,
            index_buffer,
        })
    }
}

// update
impl DemoRenderer {
    pub fn resize(&mut self, width: u32, height: u32) {
        self.ctx.resize(width, height);
    }

    pub fn render_frame(&mut self) -> anyhow::Result<()> {
        let _span = tracy_client::span!("DemoRenderer::render_frame");
        if !self.ctx.begin_frame().context("failed to acquire the backbuffer")? {
            // swapchain 暂时不可用，跳过这一帧
            return Ok(());
        }

        let t = self.start.elapsed().as_secs_f32();
        let clear = ClearValues {
            color: [0.5 + 0.5 * t.sin(), 0.3, 0.5 + 0.5 * t.cos(), 1.0],
            ..Default::default()
        };
        self.ctx.begin_backbuffer_pass(AttachmentOps::CLEAR_STORE, None, clear)?;

        if let Some(quad) = self.quad.as_ref() {
            self.ctx.bind_pipeline(&quad.pipeline)?;
            self.ctx.bind_texture(self.checker)?;
            self.ctx.push_constants(bytemuck::bytes_of(&t));
            self.ctx.bind_vertex_buffer(quad.vertex_buffer, 0);
            self.ctx.bind_index_buffer(quad.index_buffer, 0, vk::IndexType::UINT16);
            self.ctx.draw_indexed(QUAD_INDICES.len() as u32, 1, 0, 0, 0);
        }

        self.ctx.end_render_pass();
        self.ctx.end_frame();
        Ok(())
    }
}

// destroy
impl DemoRenderer {
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        if let Some(quad) = self.quad.take() {
            self.ctx.destroy_buffer(quad.vertex_buffer);
            self.ctx.destroy_buffer(quad.index_buffer);
            self.ctx.destroy_shader_module(quad.vertex_shader);
            self.ctx.destroy_shader_module(quad.fragment_shader);
        }
        self.ctx.destroy_texture(self.checker);
        self.ctx.shutdown();
        self.destroyed = true;
    }
}

impl Drop for DemoRenderer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "DemoRenderer dropped without destroy()");
        }
    }
}

// tools
fn load_spirv(path: &Path) -> anyhow::Result<Vec<u32>> {
    let mut file = File::open(path).with_context(|| format!("failed to open shader {}", path.display()))?;
    let code = ash::util::read_spv(&mut file).with_context(|| format!("invalid SPIR-V in {}", path.display()))?;
    Ok(code)
}

fn checker_pixels() -> Vec<u8> {
    let mut pixels = Vec::with_capacity((CHECKER_SIZE * CHECKER_SIZE * 4) as usize);
    for y in 0..CHECKER_SIZE {
        for x in 0..CHECKER_SIZE {
            let light = ((x / CHECKER_CELL) + (y / CHECKER_CELL)) % 2 == 0;
            let v = if light { 230 } else { 40 };
            pixels.extend_from_slice(&[v, v, v, 255]);
        }
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checker_pixels() {
        let pixels = checker_pixels();
        assert_eq!(pixels.len(), (CHECKER_SIZE * CHECKER_SIZE * 4) as usize);
        assert_eq!(pixels[0], 230);
        // 同一行的下一个格子
        let next_cell = (CHECKER_CELL * 4) as usize;
        assert_eq!(pixels[next_cell], 40);
    }
}
