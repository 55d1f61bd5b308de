use std::rc::Rc;

use ash::vk;
use kiln_gfx::vulkan::VulkanDriver;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowId},
};

use crate::demo::DemoRenderer;
use crate::settings::AppSettings;

pub struct WinitApp {
    settings: AppSettings,

    /// 需要比 renderer 活得更久，surface 引用了它
    window: Option<Window>,
    renderer: Option<DemoRenderer>,

    /// 窗口最小化时 surface 的尺寸为 0，此时暂停绘制
    minimized: bool,
    /// 事件回调中无法返回错误，先记录下来，退出循环后返回
    error: Option<anyhow::Error>,
}

// 总的入口
impl WinitApp {
    pub fn run(settings: AppSettings) -> anyhow::Result<()> {
        let event_loop = EventLoop::new()?;
        let mut app = Self {
            settings,
            window: None,
            renderer: None,
            minimized: false,
            error: None,
        };
        event_loop.run_app(&mut app)?;
        log::info!("end run.");

        app.destroy();
        match app.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// new & init
impl WinitApp {
    /// 在 window 创建之后调用，初始化 driver 与 renderer
    fn init_after_window(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let attributes = Window::default_attributes()
            .with_title(self.settings.window_title.clone())
            .with_inner_size(PhysicalSize::new(self.settings.window_width, self.settings.window_height));
        let window = event_loop.create_window(attributes)?;

        let display = window.display_handle()?.as_raw();
        let handle = window.window_handle()?.as_raw();
        let driver = Rc::new(VulkanDriver::new(&self.settings.window_title, Some((display, handle)))?);

        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        self.renderer = Some(DemoRenderer::new(driver, &self.settings, extent)?);
        self.window = Some(window);
        Ok(())
    }
}

// destroy
impl WinitApp {
    fn destroy(&mut self) {
        // renderer 持有 surface，必须先于 window 销毁
        if let Some(mut renderer) = self.renderer.take() {
            renderer.destroy();
        }
        self.window = None;
    }
}

// 各种 winit 的事件处理
impl ApplicationHandler for WinitApp {
    // 建议在这里创建 window 和 renderer
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        log::info!("winit event: resumed");

        if let Err(e) = self.init_after_window(event_loop) {
            log::error!("failed to initialize: {:#}", e);
            self.error = Some(e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                self.minimized = size.width == 0 || size.height == 0;
                if !self.minimized {
                    if let Some(renderer) = self.renderer.as_mut() {
                        renderer.resize(size.width, size.height);
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                if self.minimized {
                    return;
                }
                let Some(renderer) = self.renderer.as_mut() else {
                    return;
                };
                if let Err(e) = renderer.render_frame() {
                    log::error!("failed to render frame: {:#}", e);
                    self.error = Some(e);
                    event_loop.exit();
                }
                tracy_client::frame_mark();
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        log::warn!("winit event: suspended");
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        log::info!("loop exiting");
        self.destroy();
    }
}
