mod common;

use kiln_render_core::frame_counter::FrameCounter;
use kiln_render_core::settings::CoreSettings;

#[test]
fn handles_increase_and_wait_observes_fence() {
    let (fake, mut ctx) = common::headless(CoreSettings::default());
    let buffer = common::vertex_buffer(&mut ctx, 64, "vb");

    let mut handles = vec![];
    for i in 0..8 {
        ctx.upload_buffer(buffer, 0, &common::pattern(i, 64));
        handles.push(ctx.flush());
    }
    assert!(handles.windows(2).all(|w| w[0] < w[1]));

    // 模拟 GPU 只在等待 fence 时执行，handle 在等待之前不会被认为完成
    let last = *handles.last().unwrap();
    assert!(!ctx.scheduler_mut().is_free(last));
    ctx.wait_until_free(last);
    assert!(ctx.scheduler_mut().is_free(last));
    assert_eq!(fake.pending_batches(), 0);

    let vk_buffer = ctx.device().buffer(buffer).unwrap().handle();
    assert_eq!(fake.read_buffer(vk_buffer).unwrap(), common::pattern(7, 64));

    ctx.destroy_buffer(buffer);
    common::shutdown(&fake, ctx);
}

#[test]
fn submit_returns_current_handle_until_flush() {
    let (fake, mut ctx) = common::headless(CoreSettings::default());
    let before = ctx.scheduler().current_handle();
    let buffer = common::vertex_buffer(&mut ctx, 16, "vb");
    ctx.upload_buffer(buffer, 0, &[1; 16]);
    ctx.upload_buffer(buffer, 0, &[2; 16]);
    assert_eq!(ctx.scheduler().current_handle(), before);
    assert_eq!(fake.stats().submits, 0);

    let flushed = ctx.flush();
    assert_eq!(flushed, before);
    assert!(ctx.scheduler().current_handle() > flushed);
    assert_eq!(fake.stats().submits, 1);

    ctx.destroy_buffer(buffer);
    common::shutdown(&fake, ctx);
}

#[test]
fn frames_in_flight_stay_bounded() {
    let (fake, mut ctx) = common::windowed(CoreSettings::default());
    fake.set_gpu_latency(Some(2));

    for frame in 0..20u32 {
        let buffer = common::vertex_buffer(&mut ctx, 256, "per-frame");
        assert!(ctx.begin_frame().unwrap());
        ctx.upload_buffer(buffer, 0, &common::pattern(frame, 256));
        let vk_buffer = ctx.device().buffer(buffer).unwrap().handle();
        let tagged = ctx.frame_id();
        ctx.destroy_buffer(buffer);
        ctx.end_frame();

        assert!(fake.in_flight_fences() <= FrameCounter::FIF_COUNT);
        // 销毁发生在 FIF_COUNT 帧之后
        if ctx.frame_id() < tagged + FrameCounter::FIF_COUNT as u64 {
            assert!(fake.is_alive(vk_buffer));
        }
    }
    assert!(fake.stats().max_in_flight_fences <= FrameCounter::FIF_COUNT);
    // 最近两帧登记的 buffer 还在队列中
    assert_eq!(ctx.device().pending_destroy_count(), FrameCounter::FIF_COUNT - 1);
    common::shutdown(&fake, ctx);
}

#[test]
fn destroy_queue_respects_frame_lag() {
    let (fake, mut ctx) = common::headless(CoreSettings::default());
    let buffer = common::vertex_buffer(&mut ctx, 64, "vb");
    let vk_buffer = ctx.device().buffer(buffer).unwrap().handle();
    ctx.destroy_buffer(buffer);

    for _ in 0..FrameCounter::FIF_COUNT - 1 {
        ctx.begin_frame().unwrap();
        ctx.end_frame();
        assert!(fake.is_alive(vk_buffer));
    }
    ctx.begin_frame().unwrap();
    ctx.end_frame();
    assert!(!fake.is_alive(vk_buffer));
    common::shutdown(&fake, ctx);
}
