use std::rc::Rc;

use ash::vk;
use kiln_gfx::desc::{BufferDesc, GfxBuffer, MemoryLocation};
use kiln_gfx::driver::GfxDriver;
use kiln_gfx::error::{GfxResult, log_creation_error};
use kiln_gfx::flags::format;

use crate::device::{GfxObject, RenderDevice};
use crate::frame_counter::FrameCounter;
use crate::handles::{BufferHandle, TextureHandle};
use crate::settings::CoreSettings;
use crate::submit::{SubmitHandle, SubmitScheduler};

#[inline]
const fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// staging buffer 上的环形游标
///
/// `[first, last)` 是尚未被 GPU 消费的区间，`last < first` 表示已经绕回了开头。
/// `first == last` 表示为空，因此绕回之后的分配必须严格小于 `first`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagingRing {
    capacity: u64,
    first: u64,
    last: u64,
}

impl StagingRing {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            first: 0,
            last: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
    #[inline]
    pub fn first(&self) -> u64 {
        self.first
    }
    #[inline]
    pub fn last(&self) -> u64 {
        self.last
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first == self.last
    }

    /// 分配 `size` 字节，返回起始 offset；与未消费的区间冲突时返回 None
    pub fn try_allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        debug_assert!(size > 0);
        if self.is_empty() {
            self.first = 0;
            self.last = 0;
        }

        let offset = align_up(self.last, align);
        if self.last >= self.first {
            if offset + size <= self.capacity {
                self.last = offset + size;
                return Some(offset);
            }
            // 尾部放不下，从头开始
            if size < self.first {
                self.last = size;
                return Some(0);
            }
            None
        } else if offset + size < self.first {
            self.last = offset + size;
            Some(offset)
        } else {
            None
        }
    }

    /// GPU 已经消费完 `end` 之前（按环形顺序）的数据
    pub fn release_until(&mut self, end: u64) {
        self.first = end;
        if self.first == self.last {
            self.first = 0;
            self.last = 0;
        }
    }

    /// 丢弃所有游标，在 buffer 被替换或者确认 GPU 已经消费全部数据之后调用
    pub fn reset(&mut self, capacity: u64) {
        *self = Self::new(capacity);
    }
}

struct RingSlot {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    /// 上一次使用时的提交，复用前必须等待它完成
    handle: Option<SubmitHandle>,
    /// 上一次使用结束时 staging 的 `last` 游标
    staging_end: Option<u64>,
}

/// 环形的 command buffer 以及共享的 staging 内存
///
/// 一共 [`FrameCounter::FIF_COUNT`] 个 slot，每个 slot 有自己的 command pool。
/// slot 按顺序使用，因此 slot 的上一次使用总是最早的那一次
pub struct RingCommandContext {
    driver: Rc<dyn GfxDriver>,

    slots: Vec<RingSlot>,
    active: usize,
    recording: bool,
    /// 当前 slot 是否从 staging 中分配过空间
    active_used_staging: bool,

    staging: GfxBuffer,
    ring: StagingRing,
    max_capacity: u64,
    alignment: u64,

    destroyed: bool,
}

// new & init
impl RingCommandContext {
    pub fn new(driver: Rc<dyn GfxDriver>, settings: &CoreSettings) -> GfxResult<Self> {
        let initial = settings.staging_initial_size;
        let max_capacity = settings.staging_max_size(driver.caps());
        let alignment = driver.caps().staging_alignment();

        let staging = Self::create_staging(driver.as_ref(), initial)?;

        let mut slots = Vec::with_capacity(FrameCounter::FIF_COUNT);
        for idx in 0..FrameCounter::FIF_COUNT {
            let pool = driver
                .create_command_pool(vk::CommandPoolCreateFlags::TRANSIENT, &format!("ring-{}", idx))
                .map_err(log_creation_error("command pool"))?;
            let cmd = driver
                .allocate_command_buffer(pool, &format!("ring-{}", idx))
                .map_err(log_creation_error("command buffer"))?;
            slots.push(RingSlot {
                pool,
                cmd,
                handle: None,
                staging_end: None,
            });
        }

        log::info!("create ring command context: staging {} bytes, max {} bytes", initial, max_capacity);
        Ok(Self {
            driver,
            slots,
            active: 0,
            recording: false,
            active_used_staging: false,
            staging,
            ring: StagingRing::new(initial),
            max_capacity,
            alignment,
            destroyed: false,
        })
    }

    fn create_staging(driver: &dyn GfxDriver, size: u64) -> GfxResult<GfxBuffer> {
        driver
            .create_buffer(&BufferDesc {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
                name: "staging-ring",
            })
            .map_err(log_creation_error("staging buffer"))
    }
}

// destroy
impl RingCommandContext {
    /// 调用之前 GPU 必须处于 idle 状态
    pub fn destroy(&mut self) {
        assert!(!self.recording, "destroy ring command context while recording");
        for slot in self.slots.drain(..) {
            self.driver.destroy_command_pool(slot.pool);
        }
        self.driver.destroy_buffer(self.staging);
        self.destroyed = true;
    }
}
impl Drop for RingCommandContext {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "RingCommandContext dropped without destroy");
        }
    }
}

// getters
impl RingCommandContext {
    #[inline]
    pub fn staging_capacity(&self) -> u64 {
        self.ring.capacity()
    }
    #[inline]
    pub fn max_staging_capacity(&self) -> u64 {
        self.max_capacity
    }
    #[inline]
    pub fn staging_buffer(&self) -> vk::Buffer {
        self.staging.handle
    }
    #[inline]
    pub fn is_recording(&self) -> bool {
        self.recording
    }
}

// command buffer
impl RingCommandContext {
    /// 开始录制当前 slot：等待它上一次的提交完成，然后重置 command pool
    pub fn begin(&mut self, scheduler: &mut SubmitScheduler) {
        assert!(!self.recording, "ring slot {} is already recording", self.active);
        self.retire_slot(self.active, scheduler);

        let slot = &self.slots[self.active];
        self.driver
            .reset_command_pool(slot.pool)
            .unwrap_or_else(|e| panic!("failed to reset ring command pool: {}", e));
        self.driver.begin_command_buffer(slot.cmd, true).expect("failed to begin ring command buffer");
        self.recording = true;
    }

    /// 当前 slot 的 command buffer，必要时开始录制
    pub fn get_command_buffer(&mut self, scheduler: &mut SubmitScheduler) -> vk::CommandBuffer {
        if !self.recording {
            self.begin(scheduler);
        }
        self.slots[self.active].cmd
    }

    /// 结束当前 slot 并交给 scheduler，没有在录制时返回 None
    ///
    /// 只是放入 scheduler 的待提交列表，真正的提交发生在 scheduler 的 flush
    pub fn flush(&mut self, scheduler: &mut SubmitScheduler) -> Option<SubmitHandle> {
        if !self.recording {
            return None;
        }
        let _span = tracy_client::span!("RingCommandContext::flush");

        let staging_end = self.active_used_staging.then_some(self.ring.last());
        let slot = &mut self.slots[self.active];
        self.driver.end_command_buffer(slot.cmd).expect("failed to end ring command buffer");
        let handle = scheduler.submit(slot.cmd);
        slot.handle = Some(handle);
        slot.staging_end = staging_end;

        self.recording = false;
        self.active_used_staging = false;
        self.active = (self.active + 1) % self.slots.len();
        Some(handle)
    }

    /// 等待 slot 上一次的提交完成，并释放它引用的 staging 区间
    fn retire_slot(&mut self, idx: usize, scheduler: &mut SubmitScheduler) {
        let slot = &mut self.slots[idx];
        if let Some(handle) = slot.handle.take() {
            scheduler.wait_until_free(handle);
        }
        if let Some(end) = slot.staging_end.take() {
            self.ring.release_until(end);
        }
    }
}

// staging
impl RingCommandContext {
    /// 在 staging 中分配 `size` 字节
    ///
    /// 依次尝试：直接分配、扩容、按顺序等待 slot 释放空间、flush 当前 slot 并等待全部完成
    pub fn acquire_free_space(
        &mut self,
        scheduler: &mut SubmitScheduler,
        device: &mut RenderDevice,
        size: u64,
        align: u64,
    ) -> u64 {
        let _span = tracy_client::span!("RingCommandContext::acquire_free_space");
        assert!(
            size <= self.max_capacity,
            "staging request of {} bytes exceeds the staging cap of {} bytes",
            size,
            self.max_capacity
        );
        let align = align.max(self.alignment);

        if let Some(offset) = self.ring.try_allocate(size, align) {
            self.active_used_staging = true;
            return offset;
        }

        if self.ring.capacity() < self.max_capacity {
            self.grow(device, size);
            if let Some(offset) = self.ring.try_allocate(size, align) {
                self.active_used_staging = true;
                return offset;
            }
        }

        // 从最早的一次使用开始回收
        for step in 0..self.slots.len() {
            let idx = (self.active + step) % self.slots.len();
            if self.slots[idx].handle.is_none() {
                continue;
            }
            self.retire_slot(idx, scheduler);
            if let Some(offset) = self.ring.try_allocate(size, align) {
                self.active_used_staging = true;
                return offset;
            }
        }

        // 剩下的只有当前 slot 录制的内容
        assert!(self.recording, "staging allocation of {} bytes failed on an idle ring", size);
        log::debug!("staging ring is full, flush and wait for {} bytes", size);
        if let Some(handle) = self.flush(scheduler) {
            scheduler.wait_until_free(handle);
        }
        for slot in &mut self.slots {
            slot.handle = None;
            slot.staging_end = None;
        }
        self.ring.reset(self.ring.capacity());

        let offset = self
            .ring
            .try_allocate(size, align)
            .unwrap_or_else(|| panic!("staging allocation of {} bytes failed after draining the ring", size));
        self.active_used_staging = true;
        offset
    }

    /// 替换为更大的 staging buffer，旧的 buffer 交给 device 延迟销毁
    ///
    /// 已经录制的 copy 仍然引用旧的 buffer，因此不需要搬运数据
    fn grow(&mut self, device: &mut RenderDevice, required: u64) {
        let old_capacity = self.ring.capacity();
        let new_capacity = (old_capacity * 2).max(required).min(self.max_capacity);
        let staging = Self::create_staging(self.driver.as_ref(), new_capacity)
            .unwrap_or_else(|e| panic!("failed to grow staging buffer to {} bytes: {}", new_capacity, e));
        log::warn!("grow staging buffer: {} -> {} bytes", old_capacity, new_capacity);

        let old = std::mem::replace(&mut self.staging, staging);
        device.schedule_object_to_destroy(GfxObject::Buffer(old));

        self.ring.reset(new_capacity);
        for slot in &mut self.slots {
            slot.staging_end = None;
        }
    }

    /// 通过 staging 上传到 buffer 的 `[dst_offset, dst_offset + data.len())`
    pub fn schedule_buffer_upload(
        &mut self,
        scheduler: &mut SubmitScheduler,
        device: &mut RenderDevice,
        handle: BufferHandle,
        dst_offset: vk::DeviceSize,
        data: &[u8],
    ) {
        if data.is_empty() {
            return;
        }
        assert!(device.buffer(handle).is_some(), "upload to a destroyed buffer");
        let size = data.len() as vk::DeviceSize;

        let src_offset = self.acquire_free_space(scheduler, device, size, self.alignment);
        self.driver.write_buffer(&self.staging, src_offset, data);
        let cmd = self.get_command_buffer(scheduler);

        let staging = self.staging.handle;
        if let Some(buffer) = device.buffer_mut(handle) {
            buffer.record_upload(self.driver.as_ref(), cmd, staging, src_offset, dst_offset, size);
        }
    }

    /// 通过 staging 上传纹理第 0 级 mip 的所有 layer
    pub fn schedule_texture_upload(
        &mut self,
        scheduler: &mut SubmitScheduler,
        device: &mut RenderDevice,
        handle: TextureHandle,
        data: &[u8],
    ) {
        let texel = match device.texture(handle) {
            Some(texture) => {
                let (Some(expected), Some(texel)) = (texture.upload_size(), format::texel_size(texture.format())) else {
                    panic!("texture {} has format {:?} which cannot be uploaded", texture.name(), texture.format());
                };
                assert_eq!(
                    data.len() as vk::DeviceSize,
                    expected,
                    "texture {} expects {} bytes",
                    texture.name(),
                    expected
                );
                texel as u64
            }
            None => panic!("upload to a destroyed texture"),
        };
        let size = data.len() as vk::DeviceSize;

        let src_offset = self.acquire_free_space(scheduler, device, size, texel);
        self.driver.write_buffer(&self.staging, src_offset, data);
        let cmd = self.get_command_buffer(scheduler);

        let staging = self.staging.handle;
        if let Some(texture) = device.texture_mut(handle) {
            texture.record_upload(self.driver.as_ref(), cmd, staging, src_offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_allocation_is_aligned() {
        let mut ring = StagingRing::new(256);
        assert_eq!(ring.try_allocate(10, 64), Some(0));
        assert_eq!(ring.try_allocate(10, 64), Some(64));
        assert_eq!(ring.last(), 74);
    }

    #[test]
    fn test_wrap_requires_space_before_first() {
        let mut ring = StagingRing::new(256);
        assert_eq!(ring.try_allocate(128, 64), Some(0));
        assert_eq!(ring.try_allocate(64, 64), Some(128));
        // GPU 消费了前 128 字节
        ring.release_until(128);
        assert_eq!(ring.try_allocate(64, 64), Some(192));

        // 尾部已满，绕回开头，但不能碰到 first
        assert_eq!(ring.try_allocate(128, 64), None);
        assert_eq!(ring.try_allocate(100, 64), Some(0));
        assert_eq!(ring.last(), 100);

        // 绕回之后只能分配到 first 之前
        assert_eq!(ring.try_allocate(28, 4), None);
        assert_eq!(ring.try_allocate(27, 4), Some(100));
    }

    #[test]
    fn test_release_all_resets_cursors() {
        let mut ring = StagingRing::new(256);
        ring.try_allocate(200, 4).unwrap();
        ring.release_until(200);
        assert!(ring.is_empty());
        assert_eq!((ring.first(), ring.last()), (0, 0));
        assert_eq!(ring.try_allocate(256, 4), Some(0));
    }

    #[test]
    fn test_full_ring_rejects() {
        let mut ring = StagingRing::new(128);
        assert_eq!(ring.try_allocate(128, 4), Some(0));
        assert_eq!(ring.try_allocate(4, 4), None);
        ring.reset(512);
        assert_eq!(ring.capacity(), 512);
        assert_eq!(ring.try_allocate(512, 4), Some(0));
    }
}
