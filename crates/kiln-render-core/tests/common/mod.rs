#![allow(dead_code)]

use std::rc::Rc;

use ash::vk;
use kiln_crate_tools::init_log::try_init_log;
use kiln_gfx::desc::{BufferDesc, MemoryLocation};
use kiln_gfx::fake::FakeDriver;
use kiln_render_core::device::TextureDesc;
use kiln_render_core::handles::{BufferHandle, TextureHandle};
use kiln_render_core::render_context::RenderContext;
use kiln_render_core::settings::CoreSettings;

pub const WINDOW: vk::Extent2D = vk::Extent2D {
    width: 800,
    height: 600,
};

pub fn headless(settings: CoreSettings) -> (Rc<FakeDriver>, RenderContext) {
    try_init_log(log::LevelFilter::Debug);
    let fake = Rc::new(FakeDriver::new());
    let ctx = RenderContext::new(fake.clone(), &settings, None).unwrap();
    (fake, ctx)
}

pub fn windowed(settings: CoreSettings) -> (Rc<FakeDriver>, RenderContext) {
    try_init_log(log::LevelFilter::Debug);
    let fake = Rc::new(FakeDriver::new());
    let ctx = RenderContext::new(fake.clone(), &settings, Some(WINDOW)).unwrap();
    (fake, ctx)
}

/// 关闭 context，并检查模拟 GPU 没有记录到任何违规，所有对象都已销毁
pub fn shutdown(fake: &FakeDriver, mut ctx: RenderContext) {
    ctx.shutdown();
    let violations = fake.violations();
    assert!(violations.is_empty(), "{:#?}", violations);
    assert_eq!(fake.live_object_count(), 0);
}

pub fn vertex_buffer(ctx: &mut RenderContext, size: vk::DeviceSize, name: &str) -> BufferHandle {
    ctx.create_buffer(&BufferDesc {
        size,
        usage: vk::BufferUsageFlags::VERTEX_BUFFER,
        location: MemoryLocation::GpuOnly,
        name,
    })
    .unwrap()
}

/// 已经通过 staging 上传内容的 RGBA8 纹理
pub fn uploaded_texture(ctx: &mut RenderContext, fill: u8, name: &str) -> TextureHandle {
    let texture = ctx
        .create_texture(&TextureDesc::sampled_2d(4, 4, vk::Format::R8G8B8A8_UNORM, name))
        .unwrap();
    ctx.upload_texture(texture, &[fill; 4 * 4 * 4]);
    texture
}

/// 内容随 seed 变化的字节序列
pub fn pattern(seed: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed as usize * 31 + i * 7) as u8).collect()
}
