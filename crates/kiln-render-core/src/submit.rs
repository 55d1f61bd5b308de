use std::collections::VecDeque;
use std::fmt::Display;
use std::rc::Rc;

use ash::vk;
use kiln_gfx::barrier::{GfxImageBarrier, ResourceState};
use kiln_gfx::desc::SubmitBatch;
use kiln_gfx::driver::GfxDriver;
use kiln_gfx::error::{GfxResult, log_creation_error};

use crate::frame_counter::FrameCounter;
use crate::settings::FrameLabel;
use crate::swapchain::RenderSwapchain;

/// 一次批量提交的标识，单调递增
///
/// 在 flush 之前，`submit` 返回的都是同一个（尚未提交的）handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmitHandle(u64);

impl SubmitHandle {
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl Display for SubmitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "submit-{}", self.0)
    }
}

/// acquire 与 present 的 layout 转换使用的 command buffer，每帧一组
struct TransitionPool {
    pool: vk::CommandPool,
    cmds: Vec<vk::CommandBuffer>,
    used: usize,
}

/// 将录制好的 command buffer 合并为按序的 queue submit，并跟踪每次提交的 fence
///
/// fence 一共 [`FrameCounter::FIF_COUNT`] 个，handle `h` 使用第 `h % FIF_COUNT` 个。
/// 复用 fence 之前必须等待它的上一个 handle 完成，因此任意时刻未完成的提交不超过 `FIF_COUNT` 个
pub struct SubmitScheduler {
    driver: Rc<dyn GfxDriver>,

    fences: [vk::Fence; FrameCounter::FIF_COUNT],
    /// 每个 fence 当前对应的未回收 handle
    fence_owners: [Option<SubmitHandle>; FrameCounter::FIF_COUNT],

    /// 下一次 flush 将使用的 handle
    current: u64,
    /// 小于该值的 handle 都已经完成并回收
    retired_until: u64,

    pending: Vec<vk::CommandBuffer>,
    /// 已经提交、尚未回收的 handle，按提交顺序排列
    submitted: VecDeque<(SubmitHandle, usize)>,

    wait_semaphore: Option<(vk::Semaphore, vk::PipelineStageFlags2)>,
    signal_semaphore: Option<vk::Semaphore>,

    /// 由 frame label 索引
    transition_pools: Vec<TransitionPool>,

    destroyed: bool,
}

// new & init
impl SubmitScheduler {
    pub fn new(driver: Rc<dyn GfxDriver>) -> GfxResult<Self> {
        let mut fences = [vk::Fence::null(); FrameCounter::FIF_COUNT];
        for (idx, fence) in fences.iter_mut().enumerate() {
            *fence = driver
                .create_fence(false, &format!("submit-fence-{}", idx))
                .map_err(log_creation_error("fence"))?;
        }

        let mut transition_pools = Vec::with_capacity(FrameCounter::FIF_COUNT);
        for label in FrameCounter::frame_labels() {
            let pool = driver
                .create_command_pool(vk::CommandPoolCreateFlags::TRANSIENT, &format!("transition-{}", label))
                .map_err(log_creation_error("command pool"))?;
            transition_pools.push(TransitionPool {
                pool,
                cmds: vec![],
                used: 0,
            });
        }
        log::info!("create submit scheduler with {} fences", FrameCounter::FIF_COUNT);

        Ok(Self {
            driver,
            fences,
            fence_owners: [None; FrameCounter::FIF_COUNT],
            current: 0,
            retired_until: 0,
            pending: vec![],
            submitted: VecDeque::new(),
            wait_semaphore: None,
            signal_semaphore: None,
            transition_pools,
            destroyed: false,
        })
    }
}

// destroy
impl SubmitScheduler {
    /// 调用之前需要先 [`Self::wait_idle`]
    pub fn destroy(&mut self) {
        assert!(self.submitted.is_empty(), "destroy submit scheduler with unretired submissions");
        for fence in self.fences {
            self.driver.destroy_fence(fence);
        }
        for pool in &self.transition_pools {
            self.driver.destroy_command_pool(pool.pool);
        }
        self.destroyed = true;
    }
}
impl Drop for SubmitScheduler {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "SubmitScheduler dropped without destroy");
        }
    }
}

// getters
impl SubmitScheduler {
    /// 尚未提交的 handle，`submit` 会返回它
    #[inline]
    pub fn current_handle(&self) -> SubmitHandle {
        SubmitHandle(self.current)
    }

    /// 最近一次 flush 使用的 handle
    #[inline]
    pub fn last_submitted(&self) -> Option<SubmitHandle> {
        self.current.checked_sub(1).map(SubmitHandle)
    }

    /// 已经提交、尚未回收的数量
    #[inline]
    pub fn in_flight_count(&self) -> usize {
        self.submitted.len()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// submit & wait
impl SubmitScheduler {
    /// 放入待提交列表，并不会调用 driver 的 submit
    pub fn submit(&mut self, cmd: vk::CommandBuffer) -> SubmitHandle {
        self.pending.push(cmd);
        SubmitHandle(self.current)
    }

    /// 将待提交的 command buffer 以及 acquire/present 的 semaphore 合并为一次 queue submit
    ///
    /// 列表为空时也会提交，保证每个 handle 都有对应的 fence
    pub fn flush(&mut self) -> SubmitHandle {
        let _span = tracy_client::span!("SubmitScheduler::flush");
        let handle = SubmitHandle(self.current);
        let slot = (self.current % FrameCounter::FIF_COUNT as u64) as usize;

        if let Some(owner) = self.fence_owners[slot] {
            self.wait_until_free(owner);
        }

        self.driver
            .queue_submit(
                &SubmitBatch {
                    command_buffers: &self.pending,
                    wait_semaphore: self.wait_semaphore.take(),
                    signal_semaphore: self.signal_semaphore.take(),
                },
                self.fences[slot],
            )
            .unwrap_or_else(|e| panic!("failed to submit {}: {}", handle, e));

        self.fence_owners[slot] = Some(handle);
        self.submitted.push_back((handle, slot));
        self.pending.clear();
        self.current += 1;
        handle
    }

    /// 阻塞直到 `handle` 对应的提交完成，并回收它之前的所有提交
    ///
    /// `handle` 为尚未提交的 current handle 时会先 flush
    pub fn wait_until_free(&mut self, handle: SubmitHandle) {
        let _span = tracy_client::span!("SubmitScheduler::wait_until_free");
        assert!(handle.0 <= self.current, "wait for {} which is not issued yet", handle);
        if handle.0 == self.current {
            self.flush();
        }

        while self.retired_until <= handle.0 {
            let Some((submitted, slot)) = self.submitted.pop_front() else {
                break;
            };
            self.retire(submitted, slot);
        }
    }

    /// 非阻塞地检查 `handle` 是否完成，顺带回收已经完成的提交
    pub fn is_free(&mut self, handle: SubmitHandle) -> bool {
        while let Some((submitted, slot)) = self.submitted.front().copied() {
            let signaled = self
                .driver
                .fence_signaled(self.fences[slot])
                .unwrap_or_else(|e| panic!("failed to query fence of {}: {}", submitted, e));
            if !signaled {
                break;
            }
            self.submitted.pop_front();
            self.retire(submitted, slot);
        }
        handle.0 < self.retired_until
    }

    fn retire(&mut self, handle: SubmitHandle, slot: usize) {
        let fence = self.fences[slot];
        self.driver
            .wait_for_fence(fence, u64::MAX)
            .unwrap_or_else(|e| panic!("failed to wait fence of {}: {}", handle, e));
        self.driver
            .reset_fence(fence)
            .unwrap_or_else(|e| panic!("failed to reset fence of {}: {}", handle, e));
        self.fence_owners[slot] = None;
        self.retired_until = handle.0 + 1;
    }

    /// 提交所有待提交的内容并等待 GPU idle，之后所有 handle 都处于回收状态
    pub fn wait_idle(&mut self) {
        let _span = tracy_client::span!("SubmitScheduler::wait_idle");
        if !self.pending.is_empty() || self.wait_semaphore.is_some() || self.signal_semaphore.is_some() {
            self.flush();
        }
        self.driver.device_wait_idle().expect("failed to wait device idle");
        while let Some((handle, slot)) = self.submitted.pop_front() {
            self.retire(handle, slot);
        }
    }
}

// swapchain
impl SubmitScheduler {
    /// 每帧开始时调用，调用方需要保证该帧上一次使用时的提交已经完成
    pub fn begin_frame(&mut self, label: FrameLabel) {
        let pool = &mut self.transition_pools[*label];
        self.driver
            .reset_command_pool(pool.pool)
            .unwrap_or_else(|e| panic!("failed to reset transition pool {}: {}", label, e));
        pool.used = 0;
    }

    /// 申请下一张 swapchain image，并录制它到 color attachment 的 layout 转换
    ///
    /// surface out of date 时返回 false，调用方需要重建 swapchain
    pub fn acquire_next_image(&mut self, swapchain: &mut RenderSwapchain, label: FrameLabel) -> bool {
        let _span = tracy_client::span!("SubmitScheduler::acquire_next_image");
        let Some(acquired) = swapchain.acquire(label) else {
            return false;
        };

        let before = if acquired.first_use {
            ResourceState::Undefined
        } else {
            ResourceState::Present
        };
        // 与 acquire semaphore 的等待阶段衔接
        let wait_stage = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
        let mut barriers = vec![
            GfxImageBarrier::transition(
                acquired.image,
                vk::ImageAspectFlags::COLOR,
                before,
                ResourceState::ColorAttachment,
            )
            .src_mask(wait_stage, vk::AccessFlags2::NONE),
        ];
        if acquired.depth_first_use {
            barriers.push(GfxImageBarrier::transition(
                swapchain.depth_image(),
                vk::ImageAspectFlags::DEPTH,
                ResourceState::Undefined,
                ResourceState::DepthAttachment,
            ));
        }

        let cmd = self.transition_cmd(label);
        self.driver.begin_command_buffer(cmd, true).expect("failed to begin transition command buffer");
        self.driver.cmd_pipeline_barrier(cmd, &barriers, &[]);
        self.driver.end_command_buffer(cmd).expect("failed to end transition command buffer");

        self.submit(cmd);
        self.wait_semaphore = Some((acquired.acquire_semaphore, wait_stage));
        true
    }

    /// 录制到 present layout 的转换，flush，然后在 render complete semaphore 上 present
    ///
    /// 返回 false 表示 surface out of date
    pub fn present(&mut self, swapchain: &mut RenderSwapchain, label: FrameLabel) -> bool {
        let _span = tracy_client::span!("SubmitScheduler::present");
        let Some(index) = swapchain.acquired_index() else {
            panic!("present without an acquired swapchain image");
        };

        let cmd = self.transition_cmd(label);
        self.driver.begin_command_buffer(cmd, true).expect("failed to begin transition command buffer");
        self.driver.cmd_pipeline_barrier(
            cmd,
            &[GfxImageBarrier::transition(
                swapchain.image(index),
                vk::ImageAspectFlags::COLOR,
                ResourceState::ColorAttachment,
                ResourceState::Present,
            )],
            &[],
        );
        self.driver.end_command_buffer(cmd).expect("failed to end transition command buffer");

        self.submit(cmd);
        self.signal_semaphore = Some(swapchain.render_complete_semaphore(index));
        self.flush();

        swapchain.present()
    }

    fn transition_cmd(&mut self, label: FrameLabel) -> vk::CommandBuffer {
        let pool = &mut self.transition_pools[*label];
        if pool.used == pool.cmds.len() {
            let cmd = self
                .driver
                .allocate_command_buffer(pool.pool, &format!("transition-{}-{}", label, pool.cmds.len()))
                .unwrap_or_else(|e| panic!("failed to allocate transition command buffer: {}", e));
            pool.cmds.push(cmd);
        }
        let cmd = pool.cmds[pool.used];
        pool.used += 1;
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_gfx::fake::FakeDriver;

    fn empty_cmd(driver: &FakeDriver, pool: vk::CommandPool) -> vk::CommandBuffer {
        let cmd = driver.allocate_command_buffer(pool, "cmd").unwrap();
        driver.begin_command_buffer(cmd, true).unwrap();
        driver.end_command_buffer(cmd).unwrap();
        cmd
    }

    fn setup() -> (Rc<FakeDriver>, SubmitScheduler, vk::CommandPool) {
        let fake = Rc::new(FakeDriver::new());
        let scheduler = SubmitScheduler::new(fake.clone()).unwrap();
        let pool = fake.create_command_pool(vk::CommandPoolCreateFlags::empty(), "test").unwrap();
        (fake, scheduler, pool)
    }

    fn teardown(fake: &FakeDriver, mut scheduler: SubmitScheduler, pool: vk::CommandPool) {
        scheduler.wait_idle();
        scheduler.destroy();
        fake.destroy_command_pool(pool);
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    #[test]
    fn test_submits_are_batched() {
        let (fake, mut scheduler, pool) = setup();
        let a = scheduler.submit(empty_cmd(&fake, pool));
        let b = scheduler.submit(empty_cmd(&fake, pool));
        assert_eq!(a, b);
        assert_eq!(fake.stats().submits, 0);

        let flushed = scheduler.flush();
        assert_eq!(flushed, a);
        assert_eq!(fake.stats().submits, 1);
        assert!(scheduler.submit(empty_cmd(&fake, pool)) > a);
        teardown(&fake, scheduler, pool);
    }

    #[test]
    fn test_wait_current_forces_flush() {
        let (fake, mut scheduler, pool) = setup();
        let handle = scheduler.submit(empty_cmd(&fake, pool));
        scheduler.wait_until_free(handle);
        assert_eq!(fake.stats().submits, 1);
        assert_eq!(fake.stats().executed_batches, 1);
        assert_eq!(scheduler.in_flight_count(), 0);
        assert!(scheduler.is_free(handle));
        teardown(&fake, scheduler, pool);
    }

    #[test]
    fn test_fence_reuse_waits_for_previous_owner() {
        let (fake, mut scheduler, pool) = setup();
        let mut handles = vec![];
        for _ in 0..FrameCounter::FIF_COUNT * 3 {
            scheduler.submit(empty_cmd(&fake, pool));
            handles.push(scheduler.flush());
            assert!(fake.in_flight_fences() <= FrameCounter::FIF_COUNT);
        }
        assert!(fake.stats().max_in_flight_fences <= FrameCounter::FIF_COUNT);
        // 最早的提交在 fence 被复用时已经回收
        assert!(scheduler.is_free(handles[0]));
        assert!(!scheduler.is_free(*handles.last().unwrap()));
        teardown(&fake, scheduler, pool);
    }

    #[test]
    fn test_is_free_polls_without_blocking() {
        let (fake, mut scheduler, pool) = setup();
        fake.set_gpu_latency(Some(1));
        scheduler.submit(empty_cmd(&fake, pool));
        let first = scheduler.flush();
        scheduler.submit(empty_cmd(&fake, pool));
        let second = scheduler.flush();

        // latency 为 1，第一个提交已经执行
        assert!(scheduler.is_free(first));
        assert!(!scheduler.is_free(second));
        assert_eq!(scheduler.in_flight_count(), 1);
        teardown(&fake, scheduler, pool);
    }

    #[test]
    #[should_panic(expected = "which is not issued yet")]
    fn test_wait_future_handle_is_fatal() {
        let (_fake, mut scheduler, _pool) = setup();
        scheduler.wait_until_free(SubmitHandle(5));
    }
}
