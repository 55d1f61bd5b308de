//! 在 CPU 上模拟的 GPU
//!
//! - queue 中的提交按顺序执行，只有在等待 fence、`device_wait_idle` 或者超过设定的延迟时才会执行
//! - copy 命令在执行时才读取 staging 的内容，因此 host 过早覆盖数据会体现在结果上
//! - 违反同步规则的操作不会 panic，而是记录为 violation，由测试统一检查

use std::cell::RefCell;
use std::collections::VecDeque;

use ash::vk::{self, Handle};
use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::SlotMap;

use crate::barrier::{GfxBufferBarrier, GfxImageBarrier};
use crate::caps::GfxCaps;
use crate::desc::{
    AcquireOutcome, AllocationKey, BufferDesc, DescriptorInfo, DescriptorPoolDesc, DescriptorSetLayoutDesc,
    DescriptorWrite, FramebufferDesc, GfxBuffer, GfxImage, GfxSwapchain, GraphicsPipelineDesc, ImageDesc,
    ImageViewDesc, MemoryLocation, PipelineLayoutDesc, PresentOutcome, RenderPassBegin, RenderPassDesc, SamplerDesc,
    SubmitBatch, SwapchainDesc, calculate_swapchain_extent,
};
use crate::driver::GfxDriver;
use crate::error::{GfxError, GfxResult};
use crate::flags::format;

#[derive(Clone, Debug)]
enum FakeCommand {
    Barrier {
        images: Vec<(vk::Image, vk::ImageLayout, vk::ImageLayout)>,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    /// 每个 region 附带它从 buffer 中读取的字节数
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<(vk::BufferImageCopy, vk::DeviceSize)>,
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    },
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    BindDescriptorSets(Vec<vk::DescriptorSet>),
    BindVertexBuffer(vk::Buffer),
    BindIndexBuffer(vk::Buffer),
    Draw,
}

impl FakeCommand {
    /// 从 `buffer` 中读取的字节区间
    fn buffer_reads(&self, buffer: vk::Buffer) -> Vec<(vk::DeviceSize, vk::DeviceSize)> {
        match self {
            FakeCommand::CopyBuffer { src, regions, .. } if *src == buffer => {
                regions.iter().map(|r| (r.src_offset, r.src_offset + r.size)).collect()
            }
            FakeCommand::CopyBufferToImage { src, regions, .. } if *src == buffer => {
                regions.iter().map(|(r, len)| (r.buffer_offset, r.buffer_offset + len)).collect()
            }
            _ => vec![],
        }
    }

    /// 命令直接引用的对象
    fn handles(&self) -> Vec<u64> {
        match self {
            FakeCommand::Barrier { images } => images.iter().map(|(i, _, _)| i.as_raw()).collect(),
            FakeCommand::CopyBuffer { src, dst, .. } => vec![src.as_raw(), dst.as_raw()],
            FakeCommand::CopyBufferToImage { src, dst, .. } => vec![src.as_raw(), dst.as_raw()],
            FakeCommand::BeginRenderPass {
                render_pass,
                framebuffer,
            } => vec![render_pass.as_raw(), framebuffer.as_raw()],
            FakeCommand::BindPipeline(p) => vec![p.as_raw()],
            FakeCommand::BindDescriptorSets(sets) => sets.iter().map(|s| s.as_raw()).collect(),
            FakeCommand::BindVertexBuffer(b) | FakeCommand::BindIndexBuffer(b) => vec![b.as_raw()],
            FakeCommand::EndRenderPass | FakeCommand::Draw => vec![],
        }
    }
}

#[derive(Default)]
struct FakeCmd {
    pool: vk::CommandPool,
    recording: bool,
    /// 已经提交但是还没有执行
    in_flight: bool,
    /// 最近一次录制的内容已经执行过
    executed: bool,
    commands: Vec<FakeCommand>,
}

#[derive(Clone, Copy, Default)]
struct FakeFence {
    signaled: bool,
    /// 已经随提交进入 queue，尚未执行
    pending: bool,
}

struct FakeBatch {
    cmds: Vec<vk::CommandBuffer>,
    fence: vk::Fence,
    /// present 操作也按顺序进入 queue，执行时检查 image 的 layout
    present_image: Option<vk::Image>,
}

struct FakeBufferMem {
    handle: vk::Buffer,
    location: MemoryLocation,
    bytes: Vec<u8>,
}

struct FakeImageMem {
    handle: vk::Image,
    width: u32,
    height: u32,
    layers: u32,
    texel: u32,
    bytes: Vec<u8>,
}

enum FakeAllocation {
    Buffer(FakeBufferMem),
    Image(FakeImageMem),
}

struct FakeSwapchain {
    images: Vec<vk::Image>,
    acquired: Vec<bool>,
    next: usize,
    out_of_date: bool,
}

struct FakeDescriptorPool {
    max_sets: u32,
    sets: Vec<vk::DescriptorSet>,
    update_after_bind: bool,
}

/// 模拟 GPU 的统计数据
#[derive(Clone, Debug, Default)]
pub struct FakeStats {
    pub submits: usize,
    pub executed_batches: usize,
    pub fence_waits: usize,
    /// 同一时刻处于 in-flight 状态的 fence 数量的最大值
    pub max_in_flight_fences: usize,
    pub command_pool_resets: usize,
    pub acquires: usize,
    pub presents: usize,
    pub swapchains_created: usize,
    /// 创建 swapchain 时传入的非空 old swapchain
    pub old_swapchain_hints: Vec<vk::SwapchainKHR>,
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub images_destroyed: usize,
    pub framebuffers_created: usize,
    pub framebuffers_destroyed: usize,
    pub descriptor_pools_created: usize,
    pub descriptor_writes: usize,
    pub render_passes_created: usize,
    pub pipelines_created: usize,
    pub samplers_created: usize,
}

#[derive(Default)]
struct FakeState {
    next_handle: u64,
    /// 所有尚未销毁的对象
    live: FxHashSet<u64>,

    fences: FxHashMap<vk::Fence, FakeFence>,
    /// binary semaphore 是否处于 signaled（或者已经有一个待执行的 signal）
    semaphores: FxHashMap<vk::Semaphore, bool>,

    pools: FxHashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    cmds: FxHashMap<vk::CommandBuffer, FakeCmd>,
    queue: VecDeque<FakeBatch>,
    gpu_latency: Option<usize>,

    allocations: SlotMap<AllocationKey, FakeAllocation>,
    buffers: FxHashMap<vk::Buffer, AllocationKey>,
    images: FxHashMap<vk::Image, AllocationKey>,
    image_layouts: FxHashMap<vk::Image, vk::ImageLayout>,
    views: FxHashMap<vk::ImageView, vk::Image>,

    render_passes: FxHashMap<vk::RenderPass, Vec<(vk::ImageLayout, vk::ImageLayout)>>,
    framebuffers: FxHashMap<vk::Framebuffer, Vec<vk::ImageView>>,

    descriptor_pools: FxHashMap<vk::DescriptorPool, FakeDescriptorPool>,
    /// set 是否来自 update after bind 的 pool
    descriptor_sets: FxHashMap<vk::DescriptorSet, bool>,
    descriptors: FxHashMap<(vk::DescriptorSet, u32, u32), DescriptorInfo>,

    swapchains: FxHashMap<vk::SwapchainKHR, FakeSwapchain>,
    surface_extent: vk::Extent2D,
    suboptimal_pending: bool,

    stats: FakeStats,
    violations: Vec<String>,
}

impl FakeState {
    fn new_handle<T: Handle>(&mut self) -> T {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        T::from_raw(self.next_handle)
    }

    fn violation(&mut self, msg: String) {
        log::error!("fake gpu violation: {}", msg);
        self.violations.push(msg);
    }

    fn release<T: Handle>(&mut self, handle: T, what: &str) {
        let raw = handle.as_raw();
        if !self.live.remove(&raw) {
            self.violation(format!("destroy {} {:#x} which is not alive", what, raw));
        }
    }

    /// 尚未执行的命令是否引用了该对象
    fn used_by_pending_work(&self, raw: u64) -> bool {
        self.cmds.values().filter(|cmd| !cmd.executed).flat_map(|cmd| cmd.commands.iter()).any(|command| {
            if command.handles().contains(&raw) {
                return true;
            }
            // image view 通过 framebuffer 间接引用
            if let FakeCommand::BeginRenderPass { framebuffer, .. } = command {
                return self
                    .framebuffers
                    .get(framebuffer)
                    .is_some_and(|views| views.iter().any(|v| v.as_raw() == raw || self.view_image_raw(*v) == Some(raw)));
            }
            false
        })
    }

    fn view_image_raw(&self, view: vk::ImageView) -> Option<u64> {
        self.views.get(&view).map(|image| image.as_raw())
    }

    fn check_not_in_use<T: Handle + Copy>(&mut self, handle: T, what: &str) {
        if self.used_by_pending_work(handle.as_raw()) {
            self.violation(format!("destroy {} {:#x} while GPU work referencing it is pending", what, handle.as_raw()));
        }
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: FakeCommand) {
        if !self.cmds.get(&cmd).is_some_and(|c| c.recording) {
            self.violation(format!("record into command buffer {:#x} which is not recording", cmd.as_raw()));
            return;
        }
        if let Some(fake_cmd) = self.cmds.get_mut(&cmd) {
            fake_cmd.commands.push(command);
        }
    }

    fn in_flight_fences(&self) -> usize {
        self.fences.values().filter(|f| f.pending).count()
    }

    fn buffer_mut(&mut self, buffer: vk::Buffer) -> Option<&mut FakeBufferMem> {
        let key = *self.buffers.get(&buffer)?;
        match self.allocations.get_mut(key)? {
            FakeAllocation::Buffer(mem) => Some(mem),
            FakeAllocation::Image(_) => None,
        }
    }

    fn buffer_bytes(&self, buffer: vk::Buffer) -> Option<&[u8]> {
        let key = self.buffers.get(&buffer)?;
        match self.allocations.get(*key)? {
            FakeAllocation::Buffer(mem) => Some(&mem.bytes),
            FakeAllocation::Image(_) => None,
        }
    }

    fn image_mut(&mut self, image: vk::Image) -> Option<&mut FakeImageMem> {
        let key = *self.images.get(&image)?;
        match self.allocations.get_mut(key)? {
            FakeAllocation::Image(mem) => Some(mem),
            FakeAllocation::Buffer(_) => None,
        }
    }

    fn transition(&mut self, image: vk::Image, old: vk::ImageLayout, new: vk::ImageLayout, what: &str) {
        let current = self.image_layouts.get(&image).copied();
        let Some(current) = current else {
            self.violation(format!("{} on destroyed image {:#x}", what, image.as_raw()));
            return;
        };
        if old != vk::ImageLayout::UNDEFINED && old != current {
            self.violation(format!(
                "{} of image {:#x} expects layout {:?}, but the image is in {:?}",
                what,
                image.as_raw(),
                old,
                current
            ));
        }
        self.image_layouts.insert(image, new);
    }

    // ========== 执行 ==========

    fn execute_next(&mut self) -> bool {
        let Some(batch) = self.queue.pop_front() else {
            return false;
        };

        for cmd in &batch.cmds {
            let commands = self.cmds.get(cmd).map(|c| c.commands.clone()).unwrap_or_default();
            for command in &commands {
                self.execute(command);
            }
            if let Some(fake_cmd) = self.cmds.get_mut(cmd) {
                fake_cmd.in_flight = false;
                fake_cmd.executed = true;
            }
        }

        if let Some(image) = batch.present_image {
            let layout = self.image_layouts.get(&image).copied();
            if layout != Some(vk::ImageLayout::PRESENT_SRC_KHR) {
                self.violation(format!("present image {:#x} in layout {:?}", image.as_raw(), layout));
            }
        }

        if let Some(fence) = self.fences.get_mut(&batch.fence) {
            fence.signaled = true;
            fence.pending = false;
        }
        self.stats.executed_batches += 1;
        true
    }

    fn execute(&mut self, command: &FakeCommand) {
        match command {
            FakeCommand::Barrier { images } => {
                for (image, old, new) in images {
                    self.transition(*image, *old, *new, "barrier");
                }
            }
            FakeCommand::CopyBuffer { src, dst, regions } => {
                let Some(src_bytes) = self.buffer_bytes(*src).map(|b| b.to_vec()) else {
                    self.violation(format!("copy from destroyed buffer {:#x}", src.as_raw()));
                    return;
                };
                let Some(dst_mem) = self.buffer_mut(*dst) else {
                    self.violation(format!("copy to destroyed buffer {:#x}", dst.as_raw()));
                    return;
                };
                for r in regions {
                    let (s, d, n) = (r.src_offset as usize, r.dst_offset as usize, r.size as usize);
                    dst_mem.bytes[d..d + n].copy_from_slice(&src_bytes[s..s + n]);
                }
            }
            FakeCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => {
                if self.image_layouts.get(dst) != Some(dst_layout) {
                    let actual = self.image_layouts.get(dst).copied();
                    self.violation(format!(
                        "copy to image {:#x} in layout {:?}, expected {:?}",
                        dst.as_raw(),
                        actual,
                        dst_layout
                    ));
                }
                let Some(src_bytes) = self.buffer_bytes(*src).map(|b| b.to_vec()) else {
                    self.violation(format!("copy from destroyed buffer {:#x}", src.as_raw()));
                    return;
                };
                if self.image_mut(*dst).is_some_and(|image| image.texel == 0) {
                    self.violation(format!("copy to image {:#x} with unknown texel size", dst.as_raw()));
                    return;
                }
                let Some(image) = self.image_mut(*dst) else {
                    self.violation(format!("copy to destroyed image {:#x}", dst.as_raw()));
                    return;
                };
                for (r, _) in regions {
                    let texel = image.texel as usize;
                    let (w, h) = (r.image_extent.width as usize, r.image_extent.height as usize);
                    let (ox, oy) = (r.image_offset.x as usize, r.image_offset.y as usize);
                    let (img_w, img_h) = (image.width as usize, image.height as usize);
                    let base_layer = r.image_subresource.base_array_layer as usize;
                    let layer_count = (r.image_subresource.layer_count as usize).min(image.layers as usize - base_layer);
                    for layer in 0..layer_count {
                        for y in 0..h {
                            let src_off = r.buffer_offset as usize + ((layer * h + y) * w) * texel;
                            let dst_off = (((base_layer + layer) * img_h + oy + y) * img_w + ox) * texel;
                            image.bytes[dst_off..dst_off + w * texel]
                                .copy_from_slice(&src_bytes[src_off..src_off + w * texel]);
                        }
                    }
                }
            }
            FakeCommand::BeginRenderPass {
                render_pass,
                framebuffer,
            } => {
                let layouts = self.render_passes.get(render_pass).cloned();
                let views = self.framebuffers.get(framebuffer).cloned();
                let (Some(layouts), Some(views)) = (layouts, views) else {
                    self.violation("begin render pass with destroyed render pass or framebuffer".to_string());
                    return;
                };
                for (view, (initial, final_layout)) in views.iter().zip(layouts) {
                    match self.views.get(view).copied() {
                        Some(image) => self.transition(image, initial, final_layout, "render pass"),
                        None => self.violation(format!("framebuffer uses destroyed view {:#x}", view.as_raw())),
                    }
                }
            }
            FakeCommand::BindDescriptorSets(sets) => {
                for set in sets {
                    // bindless 的 set 允许保留失效的 descriptor（partially bound）
                    if self.descriptor_sets.get(set).copied().unwrap_or(true) {
                        continue;
                    }
                    let stale = self
                        .descriptors
                        .iter()
                        .filter(|((s, _, _), _)| s == set)
                        .filter_map(|(_, info)| match info {
                            DescriptorInfo::Image { view, .. } if !self.views.contains_key(view) => Some(*view),
                            _ => None,
                        })
                        .collect::<Vec<_>>();
                    for view in stale {
                        self.violation(format!(
                            "descriptor set {:#x} references destroyed view {:#x}",
                            set.as_raw(),
                            view.as_raw()
                        ));
                    }
                }
            }
            FakeCommand::EndRenderPass
            | FakeCommand::BindPipeline(_)
            | FakeCommand::BindVertexBuffer(_)
            | FakeCommand::BindIndexBuffer(_)
            | FakeCommand::Draw => {}
        }
    }

    fn execute_until(&mut self, fence: vk::Fence) -> bool {
        while self.fences.get(&fence).is_some_and(|f| !f.signaled) {
            if !self.execute_next() {
                return false;
            }
        }
        true
    }

    fn apply_latency(&mut self) {
        if let Some(latency) = self.gpu_latency {
            while self.queue.len() > latency {
                self.execute_next();
            }
        }
    }
}

/// 模拟的 GPU
pub struct FakeDriver {
    caps: GfxCaps,
    state: RefCell<FakeState>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

// new & init
impl FakeDriver {
    pub fn new() -> Self {
        Self::with_caps(Self::default_caps())
    }

    pub fn with_caps(caps: GfxCaps) -> Self {
        Self {
            caps,
            state: RefCell::new(FakeState {
                surface_extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                ..Default::default()
            }),
        }
    }

    pub fn default_caps() -> GfxCaps {
        GfxCaps {
            device_name: "fake gpu".to_string(),
            descriptor_indexing: true,
            max_bindless_sampled_images: 1024,
            host_visible_heap_size: 256 * 1024 * 1024,
            optimal_copy_offset_alignment: 4,
            min_uniform_buffer_offset_alignment: 256,
            non_coherent_atom_size: 64,
            min_swapchain_images: 2,
            sampler_anisotropy: true,
        }
    }
}

// 测试用的控制与查询接口
impl FakeDriver {
    /// 允许 queue 中最多积压 `latency` 个提交，超出后最早的提交立即执行；None 表示只在等待时执行
    pub fn set_gpu_latency(&self, latency: Option<usize>) {
        let mut state = self.state.borrow_mut();
        state.gpu_latency = latency;
        state.apply_latency();
    }

    /// 之后的 acquire 和 present 都返回 out of date，直到 swapchain 被重建
    pub fn inject_out_of_date(&self) {
        for swapchain in self.state.borrow_mut().swapchains.values_mut() {
            swapchain.out_of_date = true;
        }
    }

    /// 下一次 acquire 返回 suboptimal
    pub fn inject_suboptimal(&self) {
        self.state.borrow_mut().suboptimal_pending = true;
    }

    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state.borrow_mut().surface_extent = vk::Extent2D { width, height };
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    pub fn stats(&self) -> FakeStats {
        self.state.borrow().stats.clone()
    }

    pub fn pending_batches(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub fn in_flight_fences(&self) -> usize {
        self.state.borrow().in_flight_fences()
    }

    /// 尚未销毁的对象数量（command buffer 与 descriptor set 随 pool 一起释放，不计入）
    pub fn live_object_count(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn is_alive<T: Handle>(&self, handle: T) -> bool {
        self.state.borrow().live.contains(&handle.as_raw())
    }

    /// buffer 当前的内容，GPU 尚未执行的 copy 不会体现在其中
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.borrow().buffer_bytes(buffer).map(|b| b.to_vec())
    }

    /// image 第 0 级 mip 的内容，按 layer、行紧密排列
    pub fn read_image(&self, image: vk::Image) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let key = state.images.get(&image)?;
        match state.allocations.get(*key)? {
            FakeAllocation::Image(mem) => Some(mem.bytes.clone()),
            FakeAllocation::Buffer(_) => None,
        }
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state.borrow().image_layouts.get(&image).copied()
    }

    pub fn descriptor(&self, set: vk::DescriptorSet, binding: u32, element: u32) -> Option<DescriptorInfo> {
        self.state.borrow().descriptors.get(&(set, binding, element)).copied()
    }

    pub fn view_image(&self, view: vk::ImageView) -> Option<vk::Image> {
        self.state.borrow().views.get(&view).copied()
    }
}

impl GfxDriver for FakeDriver {
    fn caps(&self) -> &GfxCaps {
        &self.caps
    }

    fn create_fence(&self, signaled: bool, _name: &str) -> GfxResult<vk::Fence> {
        let mut state = self.state.borrow_mut();
        let fence = state.new_handle();
        state.fences.insert(fence, FakeFence { signaled, pending: false });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.borrow_mut();
        if state.fences.get(&fence).is_some_and(|f| f.pending) {
            state.violation(format!("destroy fence {:#x} which is still pending", fence.as_raw()));
        }
        state.fences.remove(&fence);
        state.release(fence, "fence");
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        state.stats.fence_waits += 1;
        match state.fences.get(&fence).copied() {
            Some(FakeFence { signaled: true, .. }) => Ok(()),
            Some(FakeFence { pending: true, .. }) => {
                state.execute_until(fence);
                Ok(())
            }
            Some(_) => {
                state.violation(format!("wait on fence {:#x} which will never be signaled", fence.as_raw()));
                Err(GfxError::Vulkan(vk::Result::TIMEOUT))
            }
            None => Err(GfxError::InvalidHandle("fence")),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        let Some(f) = state.fences.get(&fence).copied() else {
            return Err(GfxError::InvalidHandle("fence"));
        };
        if f.pending {
            state.violation(format!("reset fence {:#x} which is still pending", fence.as_raw()));
        }
        state.fences.insert(fence, FakeFence::default());
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GfxResult<bool> {
        let state = self.state.borrow();
        state.fences.get(&fence).map(|f| f.signaled).ok_or(GfxError::InvalidHandle("fence"))
    }

    fn create_semaphore(&self, _name: &str) -> GfxResult<vk::Semaphore> {
        let mut state = self.state.borrow_mut();
        let semaphore = state.new_handle();
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.borrow_mut();
        state.semaphores.remove(&semaphore);
        state.release(semaphore, "semaphore");
    }

    fn device_wait_idle(&self) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        while state.execute_next() {}
        Ok(())
    }

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags, _name: &str) -> GfxResult<vk::CommandPool> {
        let mut state = self.state.borrow_mut();
        let pool = state.new_handle();
        state.pools.insert(pool, vec![]);
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        state.stats.command_pool_resets += 1;
        let cmds = state.pools.get(&pool).cloned().ok_or(GfxError::InvalidHandle("command pool"))?;
        for cmd in cmds {
            if state.cmds.get(&cmd).is_some_and(|c| c.in_flight) {
                state.violation(format!(
                    "reset command pool {:#x} while command buffer {:#x} is still executing",
                    pool.as_raw(),
                    cmd.as_raw()
                ));
            }
            if let Some(fake_cmd) = state.cmds.get_mut(&cmd) {
                fake_cmd.recording = false;
                fake_cmd.executed = true;
                fake_cmd.commands.clear();
            }
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.borrow_mut();
        let cmds = state.pools.remove(&pool).unwrap_or_default();
        for cmd in cmds {
            if state.cmds.remove(&cmd).is_some_and(|c| c.in_flight) {
                state.violation(format!("destroy command pool {:#x} while it is still executing", pool.as_raw()));
            }
        }
        state.release(pool, "command pool");
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, _name: &str) -> GfxResult<vk::CommandBuffer> {
        let mut state = self.state.borrow_mut();
        if !state.pools.contains_key(&pool) {
            return Err(GfxError::InvalidHandle("command pool"));
        }
        // command buffer 随 pool 一起释放，不计入存活对象
        state.next_handle += 1;
        let cmd = vk::CommandBuffer::from_raw(state.next_handle);
        state.cmds.insert(
            cmd,
            FakeCmd {
                pool,
                executed: true,
                ..Default::default()
            },
        );
        if let Some(cmds) = state.pools.get_mut(&pool) {
            cmds.push(cmd);
        }
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _one_time_submit: bool) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        let Some(fake_cmd) = state.cmds.get(&cmd) else {
            return Err(GfxError::InvalidHandle("command buffer"));
        };
        if fake_cmd.in_flight {
            let pool = fake_cmd.pool;
            state.violation(format!(
                "begin command buffer {:#x} (pool {:#x}) while it is still executing",
                cmd.as_raw(),
                pool.as_raw()
            ));
        }
        if let Some(fake_cmd) = state.cmds.get_mut(&cmd) {
            fake_cmd.recording = true;
            fake_cmd.executed = false;
            fake_cmd.commands.clear();
        }
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        match state.cmds.get_mut(&cmd) {
            Some(fake_cmd) if fake_cmd.recording => {
                fake_cmd.recording = false;
                Ok(())
            }
            Some(_) => {
                state.violation(format!("end command buffer {:#x} which is not recording", cmd.as_raw()));
                Ok(())
            }
            None => Err(GfxError::InvalidHandle("command buffer")),
        }
    }

    fn queue_submit(&self, batch: &SubmitBatch, fence: vk::Fence) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();

        for cmd in batch.command_buffers {
            match state.cmds.get(cmd).map(|c| (c.recording, c.in_flight)) {
                None => return Err(GfxError::InvalidHandle("command buffer")),
                Some((true, _)) => state.violation(format!("submit command buffer {:#x} which is recording", cmd.as_raw())),
                Some((_, true)) => state.violation(format!("submit command buffer {:#x} twice", cmd.as_raw())),
                _ => {}
            }
            if let Some(fake_cmd) = state.cmds.get_mut(cmd) {
                fake_cmd.in_flight = true;
            }
        }

        if let Some((semaphore, _)) = batch.wait_semaphore {
            if state.semaphores.insert(semaphore, false) != Some(true) {
                state.violation(format!("wait on semaphore {:#x} which has no pending signal", semaphore.as_raw()));
            }
        }
        if let Some(semaphore) = batch.signal_semaphore {
            if state.semaphores.insert(semaphore, true) != Some(false) {
                state.violation(format!("signal semaphore {:#x} which is already signaled", semaphore.as_raw()));
            }
        }

        if fence != vk::Fence::null() {
            match state.fences.get(&fence).copied() {
                None => return Err(GfxError::InvalidHandle("fence")),
                Some(f) if f.signaled || f.pending => {
                    state.violation(format!("submit with fence {:#x} which is not reset", fence.as_raw()))
                }
                _ => {}
            }
            state.fences.insert(
                fence,
                FakeFence {
                    signaled: false,
                    pending: true,
                },
            );
        }

        state.queue.push_back(FakeBatch {
            cmds: batch.command_buffers.to_vec(),
            fence,
            present_image: None,
        });
        state.stats.submits += 1;
        let in_flight = state.in_flight_fences();
        state.stats.max_in_flight_fences = state.stats.max_in_flight_fences.max(in_flight);

        state.apply_latency();
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image_barriers: &[GfxImageBarrier],
        _buffer_barriers: &[GfxBufferBarrier],
    ) {
        let images = image_barriers
            .iter()
            .map(|b| (b.inner().image, b.inner().old_layout, b.inner().new_layout))
            .collect();
        self.state.borrow_mut().record(cmd, FakeCommand::Barrier { images });
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.state.borrow_mut().record(
            cmd,
            FakeCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        let mut state = self.state.borrow_mut();
        let texel = state.image_mut(dst).map(|image| image.texel).unwrap_or(0) as vk::DeviceSize;
        let regions = regions
            .iter()
            .map(|r| {
                let texels = r.image_extent.width as vk::DeviceSize
                    * r.image_extent.height as vk::DeviceSize
                    * r.image_subresource.layer_count as vk::DeviceSize;
                (*r, texels * texel)
            })
            .collect();
        state.record(
            cmd,
            FakeCommand::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            },
        );
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin) {
        self.state.borrow_mut().record(
            cmd,
            FakeCommand::BeginRenderPass {
                render_pass: begin.render_pass,
                framebuffer: begin.framebuffer,
            },
        );
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.state.borrow_mut().record(cmd, FakeCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.state.borrow_mut().record(cmd, FakeCommand::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.state.borrow_mut().record(cmd, FakeCommand::BindDescriptorSets(sets.to_vec()));
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, _binding: u32, buffer: vk::Buffer, _offset: vk::DeviceSize) {
        self.state.borrow_mut().record(cmd, FakeCommand::BindVertexBuffer(buffer));
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _index_type: vk::IndexType,
    ) {
        self.state.borrow_mut().record(cmd, FakeCommand::BindIndexBuffer(buffer));
    }

    fn cmd_push_constants(&self, _cmd: vk::CommandBuffer, _layout: vk::PipelineLayout, _offset: u32, _data: &[u8]) {}

    fn cmd_set_viewport_scissor(&self, _cmd: vk::CommandBuffer, _extent: vk::Extent2D) {}

    fn cmd_draw(&self, cmd: vk::CommandBuffer, _vertex_count: u32, _instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.state.borrow_mut().record(cmd, FakeCommand::Draw);
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        _index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.state.borrow_mut().record(cmd, FakeCommand::Draw);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GfxResult<GfxBuffer> {
        if desc.location == MemoryLocation::CpuToGpu && desc.size > self.caps.host_visible_heap_size {
            return Err(GfxError::OutOfHostVisibleMemory {
                requested: desc.size,
                heap: self.caps.host_visible_heap_size,
            });
        }
        let mut state = self.state.borrow_mut();
        let handle: vk::Buffer = state.new_handle();
        let allocation = state.allocations.insert(FakeAllocation::Buffer(FakeBufferMem {
            handle,
            location: desc.location,
            bytes: vec![0; desc.size as usize],
        }));
        state.buffers.insert(handle, allocation);
        state.stats.buffers_created += 1;
        Ok(GfxBuffer {
            handle,
            size: desc.size,
            allocation,
            location: desc.location,
        })
    }

    fn destroy_buffer(&self, buffer: GfxBuffer) {
        let mut state = self.state.borrow_mut();
        state.check_not_in_use(buffer.handle, "buffer");
        state.buffers.remove(&buffer.handle);
        state.allocations.remove(buffer.allocation);
        state.release(buffer.handle, "buffer");
        state.stats.buffers_destroyed += 1;
    }

    fn write_buffer(&self, buffer: &GfxBuffer, offset: vk::DeviceSize, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        let end = offset + data.len() as vk::DeviceSize;

        // 与尚未执行的 GPU 读取区间重叠
        let conflicts = state
            .cmds
            .values()
            .filter(|cmd| !cmd.executed)
            .flat_map(|cmd| cmd.commands.iter())
            .flat_map(|command| command.buffer_reads(buffer.handle))
            .filter(|(read_begin, read_end)| offset < *read_end && *read_begin < end)
            .collect::<Vec<_>>();
        for (read_begin, read_end) in conflicts {
            state.violation(format!(
                "host write [{}, {}) of buffer {:#x} overlaps pending GPU read [{}, {})",
                offset,
                end,
                buffer.handle.as_raw(),
                read_begin,
                read_end
            ));
        }

        let mem = state.buffer_mut(buffer.handle).expect("write to a destroyed buffer");
        assert_eq!(mem.handle, buffer.handle);
        assert_eq!(mem.location, MemoryLocation::CpuToGpu, "write to a buffer which is not host visible");
        mem.bytes[offset as usize..end as usize].copy_from_slice(data);
    }

    fn create_image(&self, desc: &ImageDesc) -> GfxResult<GfxImage> {
        let mut state = self.state.borrow_mut();
        let handle: vk::Image = state.new_handle();
        // 无法上传的格式不分配内容，向它 copy 会记为 violation
        let texel = format::texel_size(desc.format).unwrap_or(0);
        let allocation = state.allocations.insert(FakeAllocation::Image(FakeImageMem {
            handle,
            width: desc.extent.width,
            height: desc.extent.height,
            layers: desc.array_layers,
            texel,
            bytes: vec![0; (desc.extent.width * desc.extent.height * desc.array_layers * texel) as usize],
        }));
        state.images.insert(handle, allocation);
        state.image_layouts.insert(handle, vk::ImageLayout::UNDEFINED);
        Ok(GfxImage { handle, allocation })
    }

    fn destroy_image(&self, image: GfxImage) {
        let mut state = self.state.borrow_mut();
        state.check_not_in_use(image.handle, "image");
        if let Some(FakeAllocation::Image(mem)) = state.allocations.remove(image.allocation) {
            debug_assert_eq!(mem.handle, image.handle);
        }
        state.images.remove(&image.handle);
        state.image_layouts.remove(&image.handle);
        state.release(image.handle, "image");
        state.stats.images_destroyed += 1;
    }

    fn create_image_view(&self, image: vk::Image, _desc: &ImageViewDesc, _name: &str) -> GfxResult<vk::ImageView> {
        let mut state = self.state.borrow_mut();
        if !state.image_layouts.contains_key(&image) {
            return Err(GfxError::InvalidHandle("image"));
        }
        let view = state.new_handle();
        state.views.insert(view, image);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.borrow_mut();
        state.check_not_in_use(view, "image view");
        state.views.remove(&view);
        state.release(view, "image view");
    }

    fn create_sampler(&self, _desc: &SamplerDesc, _name: &str) -> GfxResult<vk::Sampler> {
        let mut state = self.state.borrow_mut();
        state.stats.samplers_created += 1;
        Ok(state.new_handle())
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.borrow_mut().release(sampler, "sampler");
    }

    fn create_descriptor_set_layout(&self, _desc: &DescriptorSetLayoutDesc) -> GfxResult<vk::DescriptorSetLayout> {
        Ok(self.state.borrow_mut().new_handle())
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.borrow_mut().release(layout, "descriptor set layout");
    }

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> GfxResult<vk::DescriptorPool> {
        let mut state = self.state.borrow_mut();
        let pool = state.new_handle();
        state.descriptor_pools.insert(
            pool,
            FakeDescriptorPool {
                max_sets: desc.max_sets,
                sets: vec![],
                update_after_bind: desc.update_after_bind,
            },
        );
        state.stats.descriptor_pools_created += 1;
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.borrow_mut();
        if let Some(fake_pool) = state.descriptor_pools.remove(&pool) {
            for set in fake_pool.sets {
                state.descriptor_sets.remove(&set);
                state.descriptors.retain(|(s, _, _), _| *s != set);
            }
        }
        state.release(pool, "descriptor pool");
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
        _variable_count: Option<u32>,
    ) -> GfxResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state.borrow_mut();
        let (allocated, max_sets, update_after_bind) = match state.descriptor_pools.get(&pool) {
            Some(p) => (p.sets.len(), p.max_sets as usize, p.update_after_bind),
            None => return Err(GfxError::InvalidHandle("descriptor pool")),
        };
        if allocated + layouts.len() > max_sets {
            return Err(GfxError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }

        let mut sets = Vec::with_capacity(layouts.len());
        for _ in layouts {
            // descriptor set 随 pool 一起释放，不计入存活对象
            state.next_handle += 1;
            let set = vk::DescriptorSet::from_raw(state.next_handle);
            state.descriptor_sets.insert(set, update_after_bind);
            sets.push(set);
        }
        if let Some(p) = state.descriptor_pools.get_mut(&pool) {
            p.sets.extend_from_slice(&sets);
        }
        Ok(sets)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state.borrow_mut();
        for write in writes {
            if let DescriptorInfo::Image { view, .. } = write.info {
                if !state.views.contains_key(&view) {
                    state.violation(format!("write destroyed view {:#x} into descriptor set", view.as_raw()));
                }
            }
            if !state.descriptor_sets.contains_key(&write.set) {
                state.violation(format!("write into unknown descriptor set {:#x}", write.set.as_raw()));
            }
            state.descriptors.insert((write.set, write.binding, write.array_element), write.info);
            state.stats.descriptor_writes += 1;
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> GfxResult<vk::RenderPass> {
        let mut state = self.state.borrow_mut();
        let render_pass = state.new_handle();
        let layouts =
            [desc.color, desc.depth].iter().flatten().map(|a| (a.initial_layout, a.final_layout)).collect();
        state.render_passes.insert(render_pass, layouts);
        state.stats.render_passes_created += 1;
        Ok(render_pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.state.borrow_mut();
        state.check_not_in_use(render_pass, "render pass");
        state.render_passes.remove(&render_pass);
        state.release(render_pass, "render pass");
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> GfxResult<vk::Framebuffer> {
        let mut state = self.state.borrow_mut();
        if let Some(view) = desc.attachments.iter().find(|v| !state.views.contains_key(*v)) {
            let raw = view.as_raw();
            state.violation(format!("create framebuffer with destroyed view {:#x}", raw));
        }
        let framebuffer = state.new_handle();
        state.framebuffers.insert(framebuffer, desc.attachments.to_vec());
        state.stats.framebuffers_created += 1;
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.borrow_mut();
        state.check_not_in_use(framebuffer, "framebuffer");
        state.framebuffers.remove(&framebuffer);
        state.release(framebuffer, "framebuffer");
        state.stats.framebuffers_destroyed += 1;
    }

    fn create_shader_module(&self, _spirv: &[u32], _name: &str) -> GfxResult<vk::ShaderModule> {
        Ok(self.state.borrow_mut().new_handle())
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state.borrow_mut().release(module, "shader module");
    }

    fn create_pipeline_layout(&self, _desc: &PipelineLayoutDesc) -> GfxResult<vk::PipelineLayout> {
        Ok(self.state.borrow_mut().new_handle())
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.borrow_mut().release(layout, "pipeline layout");
    }

    fn create_graphics_pipeline(&self, _desc: &GraphicsPipelineDesc) -> GfxResult<vk::Pipeline> {
        let mut state = self.state.borrow_mut();
        state.stats.pipelines_created += 1;
        Ok(state.new_handle())
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let mut state = self.state.borrow_mut();
        state.check_not_in_use(pipeline, "pipeline");
        state.release(pipeline, "pipeline");
    }

    fn surface_capabilities(&self) -> GfxResult<vk::SurfaceCapabilitiesKHR> {
        let state = self.state.borrow();
        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: self.caps.min_swapchain_images,
            max_image_count: 8,
            current_extent: state.surface_extent,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 16384,
                height: 16384,
            },
            ..Default::default()
        })
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> GfxResult<GfxSwapchain> {
        let capabilities = self.surface_capabilities()?;
        let mut state = self.state.borrow_mut();

        if desc.old_swapchain != vk::SwapchainKHR::null() {
            state.stats.old_swapchain_hints.push(desc.old_swapchain);
            // 旧的 swapchain 被 retire，不能再 acquire
            if let Some(old) = state.swapchains.get_mut(&desc.old_swapchain) {
                old.out_of_date = true;
            }
        }

        let extent = calculate_swapchain_extent(&capabilities, desc.window_extent);
        let image_count = desc
            .min_image_count
            .max(capabilities.min_image_count)
            .min(capabilities.max_image_count);
        let handle = state.new_handle();
        let images: Vec<vk::Image> = (0..image_count)
            .map(|_| {
                state.next_handle += 1;
                vk::Image::from_raw(state.next_handle)
            })
            .collect();
        for image in &images {
            state.image_layouts.insert(*image, vk::ImageLayout::UNDEFINED);
        }
        state.swapchains.insert(
            handle,
            FakeSwapchain {
                images: images.clone(),
                acquired: vec![false; images.len()],
                next: 0,
                out_of_date: false,
            },
        );
        state.stats.swapchains_created += 1;

        Ok(GfxSwapchain {
            handle,
            images,
            format: desc.surface_format.format,
            color_space: desc.surface_format.color_space,
            present_mode: desc.present_mode,
            extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.borrow_mut();
        if let Some(sc) = state.swapchains.remove(&swapchain) {
            for image in sc.images {
                if state.used_by_pending_work(image.as_raw()) {
                    state.violation(format!("destroy swapchain while image {:#x} is still in use", image.as_raw()));
                }
                state.image_layouts.remove(&image);
            }
        }
        state.release(swapchain, "swapchain");
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> GfxResult<AcquireOutcome> {
        let mut state = self.state.borrow_mut();
        state.stats.acquires += 1;

        let suboptimal = std::mem::take(&mut state.suboptimal_pending);
        let Some(sc) = state.swapchains.get_mut(&swapchain) else {
            return Err(GfxError::InvalidHandle("swapchain"));
        };
        if sc.out_of_date {
            return Ok(AcquireOutcome::OutOfDate);
        }

        let count = sc.images.len();
        let Some(index) = (0..count).map(|i| (sc.next + i) % count).find(|i| !sc.acquired[*i]) else {
            state.violation("acquire while every swapchain image is held by the application".to_string());
            return Err(GfxError::Vulkan(vk::Result::TIMEOUT));
        };
        sc.acquired[index] = true;
        sc.next = (index + 1) % count;

        if state.semaphores.insert(semaphore, true) != Some(false) {
            state.violation(format!("acquire with semaphore {:#x} which is already signaled", semaphore.as_raw()));
        }
        Ok(AcquireOutcome::Acquired {
            index: index as u32,
            suboptimal,
        })
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> GfxResult<PresentOutcome> {
        let mut state = self.state.borrow_mut();
        state.stats.presents += 1;

        if state.semaphores.insert(wait_semaphore, false) != Some(true) {
            state.violation(format!("present waits on semaphore {:#x} which has no pending signal", wait_semaphore.as_raw()));
        }

        let Some(sc) = state.swapchains.get_mut(&swapchain) else {
            return Err(GfxError::InvalidHandle("swapchain"));
        };
        let index = image_index as usize;
        let was_acquired = sc.acquired.get(index).copied().unwrap_or(false);
        if let Some(acquired) = sc.acquired.get_mut(index) {
            *acquired = false;
        }
        let out_of_date = sc.out_of_date;
        let image = sc.images.get(index).copied();

        if !was_acquired {
            state.violation(format!("present image {} which is not acquired", image_index));
        }
        if out_of_date {
            return Ok(PresentOutcome::OutOfDate);
        }

        state.queue.push_back(FakeBatch {
            cmds: vec![],
            fence: vk::Fence::null(),
            present_image: image,
        });
        state.apply_latency();
        Ok(PresentOutcome::Presented { suboptimal: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging(driver: &FakeDriver, size: vk::DeviceSize) -> GfxBuffer {
        driver
            .create_buffer(&BufferDesc {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                name: "staging",
            })
            .unwrap()
    }

    fn device_buffer(driver: &FakeDriver, size: vk::DeviceSize) -> GfxBuffer {
        driver
            .create_buffer(&BufferDesc {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::GpuOnly,
                name: "dst",
            })
            .unwrap()
    }

    #[test]
    fn test_copy_reads_staging_at_execution() {
        let driver = FakeDriver::new();
        let src = staging(&driver, 16);
        let dst = device_buffer(&driver, 16);
        let pool = driver.create_command_pool(vk::CommandPoolCreateFlags::TRANSIENT, "pool").unwrap();
        let cmd = driver.allocate_command_buffer(pool, "cmd").unwrap();
        let fence = driver.create_fence(false, "fence").unwrap();

        driver.write_buffer(&src, 0, &[1; 16]);
        driver.begin_command_buffer(cmd, true).unwrap();
        driver.cmd_copy_buffer(cmd, src.handle, dst.handle, &[vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: 16,
        }]);
        driver.end_command_buffer(cmd).unwrap();
        driver
            .queue_submit(
                &SubmitBatch {
                    command_buffers: &[cmd],
                    ..Default::default()
                },
                fence,
            )
            .unwrap();

        // GPU 还没有执行，覆盖 staging 是一次违规，并且会影响结果
        assert_eq!(driver.in_flight_fences(), 1);
        driver.write_buffer(&src, 8, &[2; 8]);
        assert_eq!(driver.violations().len(), 1);

        driver.wait_for_fence(fence, u64::MAX).unwrap();
        assert_eq!(driver.read_buffer(dst.handle).unwrap()[8..], [2; 8]);
        assert!(driver.fence_signaled(fence).unwrap());
        assert_eq!(driver.in_flight_fences(), 0);
    }

    #[test]
    fn test_reset_pool_while_executing_is_a_violation() {
        let driver = FakeDriver::new();
        let pool = driver.create_command_pool(vk::CommandPoolCreateFlags::TRANSIENT, "pool").unwrap();
        let cmd = driver.allocate_command_buffer(pool, "cmd").unwrap();
        let fence = driver.create_fence(false, "fence").unwrap();

        driver.begin_command_buffer(cmd, true).unwrap();
        driver.end_command_buffer(cmd).unwrap();
        driver
            .queue_submit(
                &SubmitBatch {
                    command_buffers: &[cmd],
                    ..Default::default()
                },
                fence,
            )
            .unwrap();
        driver.reset_command_pool(pool).unwrap();
        assert_eq!(driver.violations().len(), 1);
    }

    #[test]
    fn test_wait_on_unsubmitted_fence_times_out() {
        let driver = FakeDriver::new();
        let fence = driver.create_fence(false, "fence").unwrap();
        assert!(driver.wait_for_fence(fence, u64::MAX).is_err());
        assert_eq!(driver.violations().len(), 1);
    }

    #[test]
    fn test_gpu_latency_executes_old_batches() {
        let driver = FakeDriver::new();
        driver.set_gpu_latency(Some(1));
        let pool = driver.create_command_pool(vk::CommandPoolCreateFlags::TRANSIENT, "pool").unwrap();
        let fences: Vec<_> = (0..3).map(|_| driver.create_fence(false, "fence").unwrap()).collect();
        for fence in &fences {
            let cmd = driver.allocate_command_buffer(pool, "cmd").unwrap();
            driver.begin_command_buffer(cmd, true).unwrap();
            driver.end_command_buffer(cmd).unwrap();
            driver
                .queue_submit(
                    &SubmitBatch {
                        command_buffers: &[cmd],
                        ..Default::default()
                    },
                    *fence,
                )
                .unwrap();
        }
        assert_eq!(driver.pending_batches(), 1);
        assert!(driver.fence_signaled(fences[1]).unwrap());
        assert!(!driver.fence_signaled(fences[2]).unwrap());
    }

    #[test]
    fn test_double_destroy_is_a_violation() {
        let driver = FakeDriver::new();
        let sampler = driver.create_sampler(&SamplerDesc::default(), "sampler").unwrap();
        driver.destroy_sampler(sampler);
        assert_eq!(driver.live_object_count(), 0);
        driver.destroy_sampler(sampler);
        assert_eq!(driver.violations().len(), 1);
    }
}
