//! Kiln 的调度核心
//!
//! 位于渲染器的绘制接口与 [`kiln_gfx::driver::GfxDriver`] 之间，负责：
//! - 在 [`frame_counter::FrameCounter::FIF_COUNT`] 帧 in-flight 的约束下批量提交 command buffer（[`submit`]）
//! - 复用 staging 内存与 command buffer（[`ring`]）
//! - descriptor set 的缓存与失效（[`descriptor`]）
//! - swapchain 的 acquire/present 状态机（[`swapchain`]）
//! - GPU 对象的延迟销毁（[`device`]）
//!
//! 所有组件都运行在同一个线程上，正确性完全依赖 frame tag 与 fence 等待。

pub mod descriptor;
pub mod device;
pub mod frame_counter;
pub mod free_list;
pub mod handles;
pub mod render_cache;
pub mod render_context;
pub mod ring;
pub mod settings;
pub mod submit;
pub mod swapchain;
