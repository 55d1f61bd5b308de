use std::{fmt::Display, ops::Deref};

use ash::vk;
use kiln_gfx::caps::GfxCaps;
use serde::Deserialize;

/// 渲染器默认配置
pub struct DefaultRendererSettings;
impl DefaultRendererSettings {
    pub const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        // shader 输出会被自动改变： liner -> sRGB
        format: vk::Format::B8G8R8A8_SRGB,
        // 通知 OS，将数值按照 sRGB 空间进行处理和显示
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    pub const DEFAULT_PRESENT_MODE: vk::PresentModeKHR = vk::PresentModeKHR::MAILBOX;
    /// 只用于 swapchain 的深度缓冲，不需要 stencil
    pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
}

/// 帧标签（A/B/C）
///
/// 表示当前处于 Frames in Flight 的哪一帧。
/// 通过 `Deref` 转换为索引 0/1/2。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameLabel {
    A,
    B,
    C,
}
impl Deref for FrameLabel {
    type Target = usize;
    #[inline]
    fn deref(&self) -> &Self::Target {
        match self {
            Self::A => &Self::INDEX[0],
            Self::B => &Self::INDEX[1],
            Self::C => &Self::INDEX[2],
        }
    }
}
impl Display for FrameLabel {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
        }
    }
}
impl FrameLabel {
    const INDEX: [usize; 3] = [0, 1, 2];

    #[inline]
    pub fn from_usize(idx: usize) -> Self {
        match idx {
            0 => Self::A,
            1 => Self::B,
            2 => Self::C,
            _ => panic!("Invalid frame index: {idx}"),
        }
    }
}

/// 配置文件中的 present mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeSetting {
    Fifo,
    Mailbox,
    Immediate,
}
impl PresentModeSetting {
    #[inline]
    pub const fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            Self::Fifo => vk::PresentModeKHR::FIFO,
            Self::Mailbox => vk::PresentModeKHR::MAILBOX,
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

/// 调度核心的运行时配置
///
/// 可以通过 `kiln_crate_tools::settings::load_toml` 从文件中读取，缺失的字段使用默认值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// staging buffer 的初始大小（字节）
    pub staging_initial_size: u64,
    /// staging buffer 的容量上限（字节），0 表示根据 host visible heap 推导
    pub staging_max_size: u64,
    /// 是否启用 bindless，最终还取决于 driver 是否支持 descriptor indexing
    pub enable_bindless: bool,
    /// pooled 路径中每个 descriptor pool 预分配的 set 数量
    pub descriptor_sets_per_pool: u32,
    /// bindless 表中每个分类的容量，会被限制在硬件上限之内
    pub bindless_capacity: u32,
    pub present_mode: PresentModeSetting,
    /// pooled 路径中一个 set 最多的 binding 数量
    pub max_pool_binding_count: u32,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            staging_initial_size: 4 * 1024 * 1024,
            staging_max_size: 0,
            enable_bindless: true,
            descriptor_sets_per_pool: 64,
            bindless_capacity: 4096,
            present_mode: PresentModeSetting::Mailbox,
            max_pool_binding_count: 8,
        }
    }
}

impl CoreSettings {
    /// 推导 staging buffer 的上限时，最多使用 1 GiB
    pub const STAGING_MAX_CAP: u64 = 1024 * 1024 * 1024;

    /// staging buffer 的容量上限
    ///
    /// 未配置时取 host visible heap 的 1/8，并限制在 `[staging_initial_size, 1 GiB]` 之间
    pub fn staging_max_size(&self, caps: &GfxCaps) -> u64 {
        if self.staging_max_size != 0 {
            return self.staging_max_size.max(self.staging_initial_size);
        }
        let derived = caps.host_visible_heap_size / 8;
        derived.min(Self::STAGING_MAX_CAP).max(self.staging_initial_size)
    }

    /// bindless 每个分类的实际容量；不启用 bindless 时返回 None
    ///
    /// 三个分类共享同一个 stage 的 sampled image 上限
    pub fn bindless_capacity(&self, caps: &GfxCaps) -> Option<u32> {
        if !self.enable_bindless {
            return None;
        }
        if !caps.descriptor_indexing {
            log::warn!("descriptor indexing is not supported by {}, bindless is disabled", caps.device_name);
            return None;
        }
        let capacity = self.bindless_capacity.min(caps.max_bindless_sampled_images / 3);
        (capacity > 0).then_some(capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_crate_tools::settings::parse_toml;

    fn caps(heap: u64, indexing: bool) -> GfxCaps {
        GfxCaps {
            device_name: "test".to_string(),
            descriptor_indexing: indexing,
            max_bindless_sampled_images: 300,
            host_visible_heap_size: heap,
            optimal_copy_offset_alignment: 4,
            min_uniform_buffer_offset_alignment: 256,
            non_coherent_atom_size: 64,
            min_swapchain_images: 2,
            sampler_anisotropy: false,
        }
    }

    #[test]
    fn test_staging_max_derived_from_heap() {
        let settings = CoreSettings::default();
        assert_eq!(settings.staging_max_size(&caps(256 * 1024 * 1024, true)), 32 * 1024 * 1024);
        // heap 很小时不低于初始大小
        assert_eq!(settings.staging_max_size(&caps(1024, true)), settings.staging_initial_size);
        // heap 很大时不超过 1 GiB
        assert_eq!(settings.staging_max_size(&caps(64 * CoreSettings::STAGING_MAX_CAP, true)), CoreSettings::STAGING_MAX_CAP);
    }

    #[test]
    fn test_explicit_staging_max() {
        let settings = CoreSettings {
            staging_max_size: 8 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(settings.staging_max_size(&caps(1024, true)), 8 * 1024 * 1024);
    }

    #[test]
    fn test_bindless_capacity_gated_by_caps() {
        let settings = CoreSettings::default();
        assert_eq!(settings.bindless_capacity(&caps(0, true)), Some(100));
        assert_eq!(settings.bindless_capacity(&caps(0, false)), None);

        let disabled = CoreSettings {
            enable_bindless: false,
            ..Default::default()
        };
        assert_eq!(disabled.bindless_capacity(&caps(0, true)), None);
    }

    #[test]
    fn test_parse_partial_settings() {
        let settings: CoreSettings = parse_toml(
            r#"
            staging_initial_size = 1048576
            present_mode = "fifo"
            "#,
        )
        .unwrap();
        assert_eq!(settings.staging_initial_size, 1024 * 1024);
        assert_eq!(settings.present_mode.to_vk(), vk::PresentModeKHR::FIFO);
        assert_eq!(settings.descriptor_sets_per_pool, CoreSettings::default().descriptor_sets_per_pool);
    }

    #[test]
    fn test_frame_label() {
        assert_eq!(*FrameLabel::from_usize(2), 2);
        assert_eq!(FrameLabel::B.to_string(), "B");
    }
}
