mod common;

use kiln_gfx::flags::AttachmentOps;
use kiln_render_core::frame_counter::FrameCounter;
use kiln_render_core::render_context::{ClearValues, RenderContext};
use kiln_render_core::settings::CoreSettings;
use kiln_render_core::swapchain::SwapchainState;

fn clear_frame(ctx: &mut RenderContext) {
    assert!(ctx.begin_frame().unwrap());
    ctx.begin_backbuffer_pass(AttachmentOps::CLEAR_STORE, Some(AttachmentOps::CLEAR_DISCARD), ClearValues::default())
        .unwrap();
    ctx.end_render_pass();
    ctx.end_frame();
}

#[test]
fn acquire_present_cycles_without_deadlock() {
    const K: usize = 10;
    let (fake, mut ctx) = common::windowed(CoreSettings::default());
    for _ in 0..K {
        clear_frame(&mut ctx);
    }

    let stats = fake.stats();
    assert_eq!(stats.acquires, K);
    assert_eq!(stats.presents, K);
    assert!(stats.max_in_flight_fences <= FrameCounter::FIF_COUNT);
    // 每帧最多等待一次 fence
    assert!(stats.fence_waits <= K + FrameCounter::FIF_COUNT);
    // framebuffer 数量只与 swapchain image 的数量有关
    assert_eq!(stats.framebuffers_created, ctx.swapchain().unwrap().image_count());
    common::shutdown(&fake, ctx);
}

#[test]
fn out_of_date_acquire_recreates_with_old_hint() {
    let (fake, mut ctx) = common::windowed(CoreSettings::default());
    clear_frame(&mut ctx);
    let old = ctx.swapchain().unwrap().handle();

    fake.inject_out_of_date();
    clear_frame(&mut ctx);

    let stats = fake.stats();
    assert_eq!(stats.swapchains_created, 2);
    assert_eq!(stats.old_swapchain_hints, vec![old]);
    assert!(!fake.is_alive(old));
    assert_ne!(ctx.swapchain().unwrap().handle(), old);
    common::shutdown(&fake, ctx);
}

#[test]
fn out_of_date_present_recreates_next_frame() {
    let (fake, mut ctx) = common::windowed(CoreSettings::default());
    assert!(ctx.begin_frame().unwrap());
    fake.inject_out_of_date();
    ctx.end_frame();
    assert_eq!(ctx.swapchain().unwrap().state(), SwapchainState::Invalid);

    clear_frame(&mut ctx);
    assert_eq!(fake.stats().swapchains_created, 2);
    assert_eq!(ctx.swapchain().unwrap().state(), SwapchainState::NotAcquired);
    common::shutdown(&fake, ctx);
}

#[test]
fn suboptimal_acquire_recreates_next_frame() {
    let (fake, mut ctx) = common::windowed(CoreSettings::default());
    fake.inject_suboptimal();
    clear_frame(&mut ctx);
    assert!(ctx.swapchain().unwrap().needs_recreate());
    assert_eq!(fake.stats().swapchains_created, 1);

    clear_frame(&mut ctx);
    assert!(!ctx.swapchain().unwrap().needs_recreate());
    assert_eq!(fake.stats().swapchains_created, 2);
    common::shutdown(&fake, ctx);
}

#[test]
fn resize_rebuilds_backbuffers() {
    let (fake, mut ctx) = common::windowed(CoreSettings::default());
    clear_frame(&mut ctx);

    fake.set_surface_extent(1024, 768);
    ctx.resize(1024, 768);
    clear_frame(&mut ctx);

    let swapchain = ctx.swapchain().unwrap();
    assert_eq!(swapchain.extent().width, 1024);
    assert_eq!(swapchain.extent().height, 768);
    // 重建时旧的 framebuffer 全部销毁
    let stats = fake.stats();
    assert_eq!(stats.framebuffers_destroyed, 1);
    common::shutdown(&fake, ctx);
}
