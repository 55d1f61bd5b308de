//! Vulkan GFX 层
//!
//! 上层的调度核心只通过 [`driver::GfxDriver`] 访问 GPU。该 trait 使用 Vulkan 的语义
//! （fence、binary semaphore、command pool、descriptor pool），有两个实现：
//! - [`vulkan::VulkanDriver`]：基于 ash + vk-mem 的真实后端
//! - `fake::FakeDriver`：在 CPU 上模拟按序执行的 GPU，用于测试（需要 `fake` feature）

pub mod barrier;
pub mod caps;
pub mod desc;
pub mod driver;
pub mod error;
pub mod flags;
pub mod vulkan;

#[cfg(feature = "fake")]
pub mod fake;
