//! 基于 ash + vk-mem 的 Vulkan 1.3 后端

pub mod debug_messenger;
pub mod driver;
pub mod instance;
pub mod physical_device;
pub mod surface;

pub use driver::VulkanDriver;
