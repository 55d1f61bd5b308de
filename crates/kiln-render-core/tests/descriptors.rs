mod common;

use ash::vk;
use kiln_gfx::desc::DescriptorInfo;
use kiln_gfx::flags::{AttachmentOps, DescriptorKind};
use kiln_render_core::frame_counter::FrameCounter;
use kiln_render_core::handles::TextureHandle;
use kiln_render_core::render_cache::{DescriptorShape, PipelineDesc};
use kiln_render_core::render_context::{ClearValues, RenderContext};
use kiln_render_core::settings::CoreSettings;

fn textured_pipeline(vs: vk::ShaderModule, fs: vk::ShaderModule) -> PipelineDesc {
    PipelineDesc {
        descriptor_shape: DescriptorShape::Pooled {
            kind: DescriptorKind::CombinedImageSampler,
            count: 1,
        },
        ..PipelineDesc::new(vs, fs)
    }
}

/// 一帧：绘制一个使用 `texture` 的三角形
fn draw_with(ctx: &mut RenderContext, pipeline: &PipelineDesc, texture: TextureHandle) {
    assert!(ctx.begin_frame().unwrap());
    ctx.begin_backbuffer_pass(AttachmentOps::CLEAR_STORE, None, ClearValues::default()).unwrap();
    ctx.bind_pipeline(pipeline).unwrap();
    ctx.bind_texture(texture).unwrap();
    ctx.draw(3, 1, 0, 0);
    ctx.end_render_pass();
    ctx.end_frame();
}

fn idle_frames(ctx: &mut RenderContext, count: usize) {
    for _ in 0..count {
        assert!(ctx.begin_frame().unwrap());
        ctx.end_frame();
    }
}

#[test]
fn destroyed_texture_never_leaves_a_stale_binding() {
    let settings = CoreSettings {
        descriptor_sets_per_pool: 1,
        ..Default::default()
    };
    let (fake, mut ctx) = common::windowed(settings);
    fake.set_gpu_latency(Some(1));
    let vs = ctx.create_shader_module(&[0x0723_0203], "vs").unwrap();
    let fs = ctx.create_shader_module(&[0x0723_0203], "fs").unwrap();
    let pipeline = textured_pipeline(vs, fs);

    let first = common::uploaded_texture(&mut ctx, 0x11, "first");
    let first_uid = ctx.device().texture(first).unwrap().uid();
    draw_with(&mut ctx, &pipeline, first);
    let set = ctx.descriptors().cached_descriptor_set(DescriptorKind::CombinedImageSampler, &[first_uid]).unwrap();

    ctx.destroy_texture(first);
    assert_eq!(ctx.descriptors().cached_descriptor_set(DescriptorKind::CombinedImageSampler, &[first_uid]), None);

    // slot 只有在 FIF_COUNT 帧之后才会被复用
    idle_frames(&mut ctx, FrameCounter::FIF_COUNT);
    let second = common::uploaded_texture(&mut ctx, 0x22, "second");
    let second_uid = ctx.device().texture(second).unwrap().uid();
    let second_view = ctx.device().texture(second).unwrap().view();
    draw_with(&mut ctx, &pipeline, second);

    let reused = ctx.descriptors().cached_descriptor_set(DescriptorKind::CombinedImageSampler, &[second_uid]).unwrap();
    assert_eq!(reused, set);
    match fake.descriptor(set, 0, 0) {
        Some(DescriptorInfo::Image { view, .. }) => assert_eq!(view, second_view),
        other => panic!("unexpected descriptor {:?}", other),
    }
    assert_eq!(fake.stats().descriptor_pools_created, 1 + 1);

    ctx.destroy_texture(second);
    ctx.destroy_shader_module(vs);
    ctx.destroy_shader_module(fs);
    common::shutdown(&fake, ctx);
}

#[test]
fn slot_is_not_rewritten_while_in_flight() {
    let settings = CoreSettings {
        descriptor_sets_per_pool: 1,
        ..Default::default()
    };
    let (fake, mut ctx) = common::windowed(settings);
    let vs = ctx.create_shader_module(&[0x0723_0203], "vs").unwrap();
    let fs = ctx.create_shader_module(&[0x0723_0203], "fs").unwrap();
    let pipeline = textured_pipeline(vs, fs);

    let first = common::uploaded_texture(&mut ctx, 0x11, "first");
    draw_with(&mut ctx, &pipeline, first);
    ctx.destroy_texture(first);

    // 释放尚未生效，新的纹理只能使用新的 pool
    let second = common::uploaded_texture(&mut ctx, 0x22, "second");
    draw_with(&mut ctx, &pipeline, second);
    assert_eq!(fake.stats().descriptor_pools_created, 1 + 2);

    ctx.destroy_texture(second);
    ctx.destroy_shader_module(vs);
    ctx.destroy_shader_module(fs);
    common::shutdown(&fake, ctx);
}

#[test]
fn bindless_index_versions_detect_reuse() {
    let (fake, mut ctx) = common::headless(CoreSettings::default());
    assert!(ctx.descriptors().is_bindless_enabled());

    let first = common::uploaded_texture(&mut ctx, 0x11, "first");
    let first_index = ctx.texture_index(first);
    assert_eq!(ctx.texture_index(first), first_index);
    ctx.destroy_texture(first);
    // 在 FIF_COUNT 帧之内，旧的 index 仍然有效
    assert!(ctx.descriptors().is_bindless_current(first_index));

    idle_frames_headless(&mut ctx, FrameCounter::FIF_COUNT);
    let second = common::uploaded_texture(&mut ctx, 0x22, "second");
    let second_index = ctx.texture_index(second);
    assert_eq!(second_index.index(), first_index.index());
    assert_ne!(second_index, first_index);
    assert!(ctx.descriptors().is_bindless_current(second_index));
    assert!(!ctx.descriptors().is_bindless_current(first_index));

    let set = ctx.descriptors().bindless_set().unwrap();
    let view = ctx.device().texture(second).unwrap().view();
    match fake.descriptor(set, first_index.category.binding(), second_index.index()) {
        Some(DescriptorInfo::Image { view: written, .. }) => assert_eq!(written, view),
        other => panic!("unexpected descriptor {:?}", other),
    }

    ctx.destroy_texture(second);
    common::shutdown(&fake, ctx);
}

fn idle_frames_headless(ctx: &mut RenderContext, count: usize) {
    for _ in 0..count {
        assert!(!ctx.begin_frame().unwrap());
        ctx.end_frame();
    }
}
