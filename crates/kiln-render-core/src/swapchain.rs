use std::rc::Rc;

use ash::vk;
use kiln_gfx::desc::{
    AcquireOutcome, FramebufferDesc, GfxImage, GfxSwapchain, ImageDesc, ImageViewDesc, PresentOutcome, SwapchainDesc,
};
use kiln_gfx::driver::GfxDriver;
use kiln_gfx::error::{GfxResult, log_creation_error};
use kiln_gfx::flags::AttachmentOps;
use rustc_hash::FxHashMap;

use crate::frame_counter::FrameCounter;
use crate::settings::{DefaultRendererSettings, FrameLabel};

/// swapchain 的状态机
///
/// `NotAcquired -> Acquired -> (NotAcquired | Invalid)`，
/// acquire 遇到 out of date 时直接进入 `Invalid`，只有重建可以离开 `Invalid`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    NotAcquired,
    Acquired { image_index: u32 },
    Invalid,
}

/// backbuffer framebuffer cache 的 key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackbufferKey {
    pub color: AttachmentOps,
    /// None 表示不使用深度缓冲
    pub depth: Option<AttachmentOps>,
}

/// 一次成功的 acquire
#[derive(Clone, Copy, Debug)]
pub struct AcquiredImage {
    pub index: u32,
    pub image: vk::Image,
    pub acquire_semaphore: vk::Semaphore,
    /// image 从未被 present 过，layout 为 UNDEFINED
    pub first_use: bool,
    /// 深度缓冲从未被使用过
    pub depth_first_use: bool,
}

struct Backbuffer {
    image: vk::Image,
    view: vk::ImageView,
    presented: bool,
    /// 每个 image 一个，避免 present 尚未等待完成时被下一帧重复 signal
    render_complete: vk::Semaphore,
    framebuffers: FxHashMap<BackbufferKey, vk::Framebuffer>,
}

struct DepthBuffer {
    image: GfxImage,
    view: vk::ImageView,
    initialized: bool,
}

pub struct RenderSwapchain {
    driver: Rc<dyn GfxDriver>,

    swapchain: GfxSwapchain,
    backbuffers: Vec<Backbuffer>,
    depth: DepthBuffer,

    /// 每帧一个，由 frame label 索引
    acquire_semaphores: [vk::Semaphore; FrameCounter::FIF_COUNT],

    present_mode: vk::PresentModeKHR,
    window_extent: vk::Extent2D,

    state: SwapchainState,
    /// acquire 或 present 返回 suboptimal，或者窗口尺寸发生变化
    recreate_requested: bool,

    destroyed: bool,
}

// new & init
impl RenderSwapchain {
    pub fn new(
        driver: Rc<dyn GfxDriver>,
        window_extent: vk::Extent2D,
        present_mode: vk::PresentModeKHR,
    ) -> GfxResult<Self> {
        let swapchain = driver
            .create_swapchain(&SwapchainDesc {
                surface_format: DefaultRendererSettings::DEFAULT_SURFACE_FORMAT,
                present_mode,
                window_extent,
                min_image_count: Self::requested_image_count(driver.as_ref()),
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .map_err(log_creation_error("swapchain"))?;
        log::info!(
            "swapchain created: {}x{}, {} images (surface min {}, {} frames in flight)",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len(),
            driver.caps().min_swapchain_images,
            FrameCounter::FIF_COUNT
        );
        if swapchain.images.len() < FrameCounter::FIF_COUNT {
            log::warn!(
                "swapchain has fewer images than frames in flight, acquire may block: {} < {}",
                swapchain.images.len(),
                FrameCounter::FIF_COUNT
            );
        }

        let mut acquire_semaphores = [vk::Semaphore::null(); FrameCounter::FIF_COUNT];
        for label in FrameCounter::frame_labels() {
            acquire_semaphores[*label] = driver
                .create_semaphore(&format!("image-available-{}", label))
                .map_err(log_creation_error("semaphore"))?;
        }

        let backbuffers = Self::create_backbuffers(driver.as_ref(), &swapchain)?;
        let depth = Self::create_depth(driver.as_ref(), swapchain.extent)?;

        Ok(Self {
            driver,
            swapchain,
            backbuffers,
            depth,
            acquire_semaphores,
            present_mode,
            window_extent,
            state: SwapchainState::NotAcquired,
            recreate_requested: false,
            destroyed: false,
        })
    }

    /// 比 surface 要求的最少数量多一张，且不少于 frames in flight
    fn requested_image_count(driver: &dyn GfxDriver) -> u32 {
        (driver.caps().min_swapchain_images + 1).max(FrameCounter::FIF_COUNT as u32)
    }

    fn create_backbuffers(driver: &dyn GfxDriver, swapchain: &GfxSwapchain) -> GfxResult<Vec<Backbuffer>> {
        swapchain
            .images
            .iter()
            .enumerate()
            .map(|(idx, image)| {
                let view = driver
                    .create_image_view(
                        *image,
                        &ImageViewDesc {
                            view_type: vk::ImageViewType::TYPE_2D,
                            format: swapchain.format,
                            aspect: vk::ImageAspectFlags::COLOR,
                            mip_levels: 1,
                            array_layers: 1,
                        },
                        &format!("swapchain-{}", idx),
                    )
                    .map_err(log_creation_error("swapchain image view"))?;
                let render_complete = driver
                    .create_semaphore(&format!("render-complete-{}", idx))
                    .map_err(log_creation_error("semaphore"))?;
                Ok(Backbuffer {
                    image: *image,
                    view,
                    presented: false,
                    render_complete,
                    framebuffers: FxHashMap::default(),
                })
            })
            .collect()
    }

    fn create_depth(driver: &dyn GfxDriver, extent: vk::Extent2D) -> GfxResult<DepthBuffer> {
        let format = DefaultRendererSettings::DEPTH_FORMAT;
        let image = driver
            .create_image(&ImageDesc {
                extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
                format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                mip_levels: 1,
                array_layers: 1,
                flags: vk::ImageCreateFlags::empty(),
                name: "swapchain-depth",
            })
            .map_err(log_creation_error("depth image"))?;
        let view = driver
            .create_image_view(
                image.handle,
                &ImageViewDesc {
                    view_type: vk::ImageViewType::TYPE_2D,
                    format,
                    aspect: vk::ImageAspectFlags::DEPTH,
                    mip_levels: 1,
                    array_layers: 1,
                },
                "swapchain-depth",
            )
            .map_err(log_creation_error("depth image view"))?;
        Ok(DepthBuffer {
            image,
            view,
            initialized: false,
        })
    }

    /// 重建 swapchain，旧的 swapchain 作为 hint 交给 driver
    ///
    /// 会等待 device idle；per-image 的 framebuffer cache 全部清空
    pub fn recreate(&mut self, window_extent: vk::Extent2D) -> GfxResult<()> {
        let _span = tracy_client::span!("RenderSwapchain::recreate");
        assert!(
            !matches!(self.state, SwapchainState::Acquired { .. }),
            "recreate swapchain while an image is acquired"
        );
        self.driver.device_wait_idle()?;

        self.destroy_images();
        self.window_extent = window_extent;

        let old = self.swapchain.handle;
        let swapchain = self
            .driver
            .create_swapchain(&SwapchainDesc {
                surface_format: DefaultRendererSettings::DEFAULT_SURFACE_FORMAT,
                present_mode: self.present_mode,
                window_extent,
                min_image_count: Self::requested_image_count(self.driver.as_ref()),
                old_swapchain: old,
            })
            .map_err(log_creation_error("swapchain"))?;
        self.driver.destroy_swapchain(old);
        self.swapchain = swapchain;

        self.backbuffers = Self::create_backbuffers(self.driver.as_ref(), &self.swapchain)?;
        self.depth = Self::create_depth(self.driver.as_ref(), self.swapchain.extent)?;

        self.state = SwapchainState::NotAcquired;
        self.recreate_requested = false;
        log::info!(
            "swapchain recreated: {}x{}, {} images",
            self.swapchain.extent.width,
            self.swapchain.extent.height,
            self.backbuffers.len()
        );
        Ok(())
    }
}

// destroy
impl RenderSwapchain {
    fn destroy_images(&mut self) {
        for backbuffer in self.backbuffers.drain(..) {
            for (_, framebuffer) in backbuffer.framebuffers {
                self.driver.destroy_framebuffer(framebuffer);
            }
            self.driver.destroy_image_view(backbuffer.view);
            self.driver.destroy_semaphore(backbuffer.render_complete);
        }
        self.driver.destroy_image_view(self.depth.view);
        self.driver.destroy_image(self.depth.image);
    }

    /// 调用之前 GPU 必须处于 idle 状态
    pub fn destroy(&mut self) {
        log::info!("destroying swapchain");
        self.destroy_images();
        for semaphore in self.acquire_semaphores {
            self.driver.destroy_semaphore(semaphore);
        }
        self.driver.destroy_swapchain(self.swapchain.handle);
        self.destroyed = true;
    }
}
impl Drop for RenderSwapchain {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.destroyed, "RenderSwapchain dropped without destroy");
        }
    }
}

// getters
impl RenderSwapchain {
    #[inline]
    pub fn state(&self) -> SwapchainState {
        self.state
    }
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }
    #[inline]
    pub fn color_format(&self) -> vk::Format {
        self.swapchain.format
    }
    #[inline]
    pub fn depth_format(&self) -> vk::Format {
        DefaultRendererSettings::DEPTH_FORMAT
    }
    #[inline]
    pub fn image_count(&self) -> usize {
        self.backbuffers.len()
    }
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain.handle
    }
    #[inline]
    pub fn window_extent(&self) -> vk::Extent2D {
        self.window_extent
    }

    /// 状态为 Invalid，或者之前收到过 suboptimal / resize
    #[inline]
    pub fn needs_recreate(&self) -> bool {
        self.state == SwapchainState::Invalid || self.recreate_requested
    }

    /// 当前 acquire 到的 image index
    #[inline]
    pub fn acquired_index(&self) -> Option<u32> {
        match self.state {
            SwapchainState::Acquired { image_index } => Some(image_index),
            _ => None,
        }
    }

    #[inline]
    pub fn image(&self, index: u32) -> vk::Image {
        self.backbuffers[index as usize].image
    }

    #[inline]
    pub fn depth_image(&self) -> vk::Image {
        self.depth.image.handle
    }

    #[inline]
    pub fn render_complete_semaphore(&self, index: u32) -> vk::Semaphore {
        self.backbuffers[index as usize].render_complete
    }
}

// update
impl RenderSwapchain {
    /// 窗口尺寸变化时调用，下一帧开始前重建
    pub fn request_recreate(&mut self, window_extent: vk::Extent2D) {
        self.window_extent = window_extent;
        self.recreate_requested = true;
    }

    /// 申请下一张 image；out of date 时返回 None 并进入 `Invalid`
    ///
    /// 在已经持有 image 的情况下再次 acquire 是调用方的错误
    pub fn acquire(&mut self, label: FrameLabel) -> Option<AcquiredImage> {
        let _span = tracy_client::span!("RenderSwapchain::acquire");
        assert!(
            self.state == SwapchainState::NotAcquired,
            "acquire swapchain image in state {:?}",
            self.state
        );

        let semaphore = self.acquire_semaphores[*label];
        let outcome = self
            .driver
            .acquire_next_image(self.swapchain.handle, semaphore, u64::MAX)
            .unwrap_or_else(|e| panic!("failed to acquire next swapchain image: {}", e));

        match outcome {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    log::warn!("swapchain acquire image index {} is not optimal", index);
                    self.recreate_requested = true;
                }
                self.state = SwapchainState::Acquired { image_index: index };

                let backbuffer = &self.backbuffers[index as usize];
                let depth_first_use = !self.depth.initialized;
                self.depth.initialized = true;
                Some(AcquiredImage {
                    index,
                    image: backbuffer.image,
                    acquire_semaphore: semaphore,
                    first_use: !backbuffer.presented,
                    depth_first_use,
                })
            }
            AcquireOutcome::OutOfDate => {
                log::warn!("swapchain is out of date when acquire next image");
                self.state = SwapchainState::Invalid;
                None
            }
        }
    }

    /// 调用 driver 的 present，等待该 image 的 render complete semaphore
    ///
    /// 返回是否成功呈现
    pub fn present(&mut self) -> bool {
        let _span = tracy_client::span!("RenderSwapchain::present");
        let Some(index) = self.acquired_index() else {
            panic!("present swapchain image in state {:?}", self.state);
        };

        let backbuffer = &mut self.backbuffers[index as usize];
        let outcome = self
            .driver
            .queue_present(self.swapchain.handle, index, backbuffer.render_complete)
            .unwrap_or_else(|e| panic!("failed to present swapchain image: {}", e));
        backbuffer.presented = true;

        match outcome {
            PresentOutcome::Presented { suboptimal } => {
                if suboptimal {
                    log::warn!("swapchain present image index {} is not optimal", index);
                    self.recreate_requested = true;
                }
                self.state = SwapchainState::NotAcquired;
                true
            }
            PresentOutcome::OutOfDate => {
                log::warn!("swapchain is out of date when present image");
                self.state = SwapchainState::Invalid;
                false
            }
        }
    }

    /// 当前 image 的 framebuffer，按 load/store 的组合缓存
    pub fn backbuffer_framebuffer(
        &mut self,
        key: BackbufferKey,
        render_pass: vk::RenderPass,
    ) -> GfxResult<vk::Framebuffer> {
        let Some(index) = self.acquired_index() else {
            panic!("backbuffer framebuffer requested in state {:?}", self.state);
        };
        let extent = self.swapchain.extent;
        let depth_view = self.depth.view;
        let backbuffer = &mut self.backbuffers[index as usize];
        if let Some(framebuffer) = backbuffer.framebuffers.get(&key) {
            return Ok(*framebuffer);
        }

        let mut attachments = vec![backbuffer.view];
        if key.depth.is_some() {
            attachments.push(depth_view);
        }
        let framebuffer = self
            .driver
            .create_framebuffer(&FramebufferDesc {
                render_pass,
                attachments: &attachments,
                extent,
                name: &format!("backbuffer-{}", index),
            })
            .map_err(log_creation_error("backbuffer framebuffer"))?;
        backbuffer.framebuffers.insert(key, framebuffer);
        Ok(framebuffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_gfx::caps::GfxCaps;
    use kiln_gfx::fake::FakeDriver;

    fn swapchain() -> (Rc<FakeDriver>, RenderSwapchain) {
        let fake = Rc::new(FakeDriver::new());
        let swapchain = RenderSwapchain::new(
            fake.clone(),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
            vk::PresentModeKHR::FIFO,
        )
        .unwrap();
        (fake, swapchain)
    }

    fn swapchain_with_min_images(min_swapchain_images: u32) -> (Rc<FakeDriver>, RenderSwapchain) {
        let caps = GfxCaps {
            min_swapchain_images,
            ..FakeDriver::default_caps()
        };
        let fake = Rc::new(FakeDriver::with_caps(caps));
        let swapchain = RenderSwapchain::new(
            fake.clone(),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
            vk::PresentModeKHR::FIFO,
        )
        .unwrap();
        (fake, swapchain)
    }

    #[test]
    fn test_image_count_covers_frames_in_flight() {
        // surface 只要求 1 张时，仍然按 frames in flight 申请
        let (_fake, mut swapchain) = swapchain_with_min_images(1);
        assert_eq!(swapchain.image_count(), FrameCounter::FIF_COUNT);
        swapchain
            .recreate(vk::Extent2D {
                width: 640,
                height: 480,
            })
            .unwrap();
        assert_eq!(swapchain.image_count(), FrameCounter::FIF_COUNT);
        swapchain.destroy();

        // surface 要求更多时多申请一张
        let (_fake, mut swapchain) = swapchain_with_min_images(4);
        assert_eq!(swapchain.image_count(), 5);
        swapchain.destroy();
    }

    #[test]
    fn test_acquire_moves_to_acquired() {
        let (_fake, mut swapchain) = swapchain();
        let acquired = swapchain.acquire(FrameLabel::A).unwrap();
        assert!(acquired.first_use);
        assert!(acquired.depth_first_use);
        assert_eq!(swapchain.state(), SwapchainState::Acquired { image_index: acquired.index });
        assert_eq!(swapchain.acquired_index(), Some(acquired.index));
        swapchain.destroy();
    }

    #[test]
    #[should_panic(expected = "acquire swapchain image in state")]
    fn test_double_acquire_is_fatal() {
        let (_fake, mut swapchain) = swapchain();
        swapchain.acquire(FrameLabel::A);
        swapchain.acquire(FrameLabel::B);
    }

    #[test]
    fn test_out_of_date_invalidates() {
        let (fake, mut swapchain) = swapchain();
        fake.inject_out_of_date();
        assert!(swapchain.acquire(FrameLabel::A).is_none());
        assert_eq!(swapchain.state(), SwapchainState::Invalid);
        assert!(swapchain.needs_recreate());

        let old = swapchain.handle();
        swapchain
            .recreate(vk::Extent2D {
                width: 800,
                height: 600,
            })
            .unwrap();
        assert_eq!(swapchain.state(), SwapchainState::NotAcquired);
        assert!(!swapchain.needs_recreate());
        assert_eq!(fake.stats().old_swapchain_hints, vec![old]);
        assert!(!fake.is_alive(old));
        swapchain.destroy();
        assert!(fake.violations().is_empty(), "{:?}", fake.violations());
    }

    #[test]
    fn test_suboptimal_requests_recreate() {
        let (fake, mut swapchain) = swapchain();
        fake.inject_suboptimal();
        assert!(swapchain.acquire(FrameLabel::A).is_some());
        assert!(swapchain.needs_recreate());
        swapchain.destroy();
    }

    #[test]
    fn test_framebuffer_cache_per_ops() {
        let (fake, mut swapchain) = swapchain();
        swapchain.acquire(FrameLabel::A).unwrap();
        let render_pass = vk::RenderPass::null();
        let clear = BackbufferKey {
            color: AttachmentOps::CLEAR_STORE,
            depth: Some(AttachmentOps::CLEAR_DISCARD),
        };
        let load = BackbufferKey {
            color: AttachmentOps::LOAD_STORE,
            depth: None,
        };
        let a = swapchain.backbuffer_framebuffer(clear, render_pass).unwrap();
        let b = swapchain.backbuffer_framebuffer(clear, render_pass).unwrap();
        let c = swapchain.backbuffer_framebuffer(load, render_pass).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(fake.stats().framebuffers_created, 2);
        swapchain.destroy();
        assert_eq!(fake.stats().framebuffers_destroyed, 2);
    }
}
