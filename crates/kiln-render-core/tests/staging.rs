mod common;

use ash::vk;
use kiln_gfx::error::GfxError;
use kiln_render_core::device::TextureDesc;
use kiln_render_core::settings::CoreSettings;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

#[test]
fn uploads_never_overwrite_pending_reads() {
    let settings = CoreSettings {
        staging_initial_size: 64 * KIB,
        staging_max_size: 64 * KIB,
        ..Default::default()
    };
    let (fake, mut ctx) = common::headless(settings);
    fake.set_gpu_latency(Some(1));

    let buffers = (0..4).map(|i| common::vertex_buffer(&mut ctx, 32 * KIB, &format!("vb-{}", i))).collect::<Vec<_>>();
    let mut expected = vec![vec![]; buffers.len()];

    for i in 0..60u32 {
        let size = (4 * KIB + (i as u64 * 5 * KIB) % (28 * KIB)) as usize;
        let data = common::pattern(i, size);
        let target = i as usize % buffers.len();
        ctx.upload_buffer(buffers[target], 0, &data);
        // 后写入的内容覆盖前缀
        let slot = &mut expected[target];
        if slot.len() < size {
            slot.resize(size, 0);
        }
        slot[..size].copy_from_slice(&data);

        if i % 3 == 2 {
            ctx.flush();
        }
    }
    ctx.flush();
    ctx.scheduler_mut().wait_idle();

    assert_eq!(ctx.ring().staging_capacity(), 64 * KIB);
    for (buffer, bytes) in buffers.iter().zip(&expected) {
        let vk_buffer = ctx.device().buffer(*buffer).unwrap().handle();
        let content = fake.read_buffer(vk_buffer).unwrap();
        assert_eq!(&content[..bytes.len()], bytes.as_slice());
    }
    for buffer in buffers {
        ctx.destroy_buffer(buffer);
    }
    common::shutdown(&fake, ctx);
}

#[test]
fn growth_keeps_recorded_uploads() {
    let settings = CoreSettings {
        staging_initial_size: 2 * MIB,
        ..Default::default()
    };
    let (fake, mut ctx) = common::headless(settings);
    let small = common::vertex_buffer(&mut ctx, MIB, "one-mib");
    let large = common::vertex_buffer(&mut ctx, 2 * MIB, "two-mib");
    let small_data = common::pattern(1, MIB as usize);
    let large_data = common::pattern(2, 2 * MIB as usize);

    ctx.upload_buffer(small, 0, &small_data);
    let staging_before = ctx.ring().staging_buffer();
    ctx.upload_buffer(large, 0, &large_data);

    // 第二次分配超过剩余空间，staging 被替换为更大的 buffer
    assert_eq!(ctx.ring().staging_capacity(), 4 * MIB);
    assert_ne!(ctx.ring().staging_buffer(), staging_before);
    assert!(fake.is_alive(staging_before));

    let handle = ctx.flush();
    ctx.wait_until_free(handle);

    let small_vk = ctx.device().buffer(small).unwrap().handle();
    let large_vk = ctx.device().buffer(large).unwrap().handle();
    assert_eq!(fake.read_buffer(small_vk).unwrap(), small_data);
    assert_eq!(fake.read_buffer(large_vk).unwrap(), large_data);

    ctx.destroy_buffer(small);
    ctx.destroy_buffer(large);
    common::shutdown(&fake, ctx);
}

#[test]
fn full_ring_flushes_active_recording_and_restarts() {
    let settings = CoreSettings {
        staging_initial_size: 64 * KIB,
        staging_max_size: 64 * KIB,
        ..Default::default()
    };
    let (fake, mut ctx) = common::headless(settings);
    let buffers = (0..3).map(|i| common::vertex_buffer(&mut ctx, 24 * KIB, &format!("vb-{}", i))).collect::<Vec<_>>();
    let data = (0..3).map(|i| common::pattern(10 + i, 24 * KIB as usize)).collect::<Vec<_>>();

    // 前两次上传位于同一次录制中，剩余空间不足以容纳第三次
    ctx.upload_buffer(buffers[0], 0, &data[0]);
    ctx.upload_buffer(buffers[1], 0, &data[1]);
    let submits_before = fake.stats().submits;
    let handle_before = ctx.scheduler().current_handle();

    ctx.upload_buffer(buffers[2], 0, &data[2]);

    // 当前的录制被提交并等待完成，ring 从头开始
    assert_eq!(fake.stats().submits, submits_before + 1);
    assert!(ctx.scheduler().current_handle() > handle_before);
    assert!(ctx.ring().is_recording());
    assert_eq!(ctx.ring().staging_capacity(), 64 * KIB);
    for (buffer, bytes) in buffers.iter().zip(&data).take(2) {
        let vk_buffer = ctx.device().buffer(*buffer).unwrap().handle();
        assert_eq!(&fake.read_buffer(vk_buffer).unwrap(), bytes);
    }

    let handle = ctx.flush();
    ctx.wait_until_free(handle);
    let vk_buffer = ctx.device().buffer(buffers[2]).unwrap().handle();
    assert_eq!(fake.read_buffer(vk_buffer).unwrap(), data[2]);
    assert!(fake.violations().is_empty(), "{:#?}", fake.violations());

    for buffer in buffers {
        ctx.destroy_buffer(buffer);
    }
    common::shutdown(&fake, ctx);
}

#[test]
fn depth_stencil_upload_copies_depth_aspect_only() {
    let (fake, mut ctx) = common::headless(CoreSettings::default());
    let texture = ctx
        .create_texture(&TextureDesc::sampled_2d(8, 8, vk::Format::D32_SFLOAT_S8_UINT, "shadow"))
        .unwrap();
    assert_eq!(ctx.device().texture(texture).unwrap().upload_size(), Some(8 * 8 * 4));

    let depth = common::pattern(7, 8 * 8 * 4);
    ctx.upload_texture(texture, &depth);
    ctx.flush();
    ctx.scheduler_mut().wait_idle();

    let image = ctx.device().texture(texture).unwrap().image();
    assert_eq!(fake.read_image(image).unwrap(), depth);

    ctx.destroy_texture(texture);
    common::shutdown(&fake, ctx);
}

#[test]
fn immediate_upload_rejects_unknown_format() {
    let (fake, mut ctx) = common::headless(CoreSettings::default());
    let texture = ctx
        .create_texture(&TextureDesc::sampled_2d(4, 4, vk::Format::BC7_UNORM_BLOCK, "compressed"))
        .unwrap();
    assert_eq!(ctx.device().texture(texture).unwrap().upload_size(), None);

    let submits = fake.stats().submits;
    let result = ctx.upload_texture_immediate(texture, &[0; 16]);
    assert!(matches!(result, Err(GfxError::UnsupportedFormat(vk::Format::BC7_UNORM_BLOCK))));
    assert_eq!(fake.stats().submits, submits);

    ctx.destroy_texture(texture);
    common::shutdown(&fake, ctx);
}

#[test]
fn old_staging_released_after_frames() {
    let settings = CoreSettings {
        staging_initial_size: 64 * KIB,
        ..Default::default()
    };
    let (fake, mut ctx) = common::headless(settings);
    let buffer = common::vertex_buffer(&mut ctx, 256 * KIB, "big");

    let old = ctx.ring().staging_buffer();
    ctx.upload_buffer(buffer, 0, &common::pattern(3, 128 * KIB as usize));
    assert!(ctx.ring().staging_capacity() >= 128 * KIB);

    for _ in 0..3 {
        assert!(fake.is_alive(old));
        ctx.begin_frame().unwrap();
        ctx.end_frame();
    }
    assert!(!fake.is_alive(old));

    ctx.destroy_buffer(buffer);
    common::shutdown(&fake, ctx);
}

#[test]
#[should_panic(expected = "exceeds the staging cap")]
fn request_above_cap_is_fatal() {
    let settings = CoreSettings {
        staging_initial_size: 64 * KIB,
        staging_max_size: 64 * KIB,
        ..Default::default()
    };
    let (_fake, mut ctx) = common::headless(settings);
    let buffer = common::vertex_buffer(&mut ctx, 128 * KIB, "too-big");
    ctx.upload_buffer(buffer, 0, &vec![0; 128 * KIB as usize]);
}
