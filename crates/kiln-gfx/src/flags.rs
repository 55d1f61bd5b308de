//! 上层枚举到 Vulkan 枚举的映射

use ash::vk;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LoadOp {
    Load,
    #[default]
    Clear,
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StoreOp {
    #[default]
    Store,
    DontCare,
}

impl LoadOp {
    #[inline]
    pub const fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            LoadOp::Load => vk::AttachmentLoadOp::LOAD,
            LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
            LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

impl StoreOp {
    #[inline]
    pub const fn to_vk(self) -> vk::AttachmentStoreOp {
        match self {
            StoreOp::Store => vk::AttachmentStoreOp::STORE,
            StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        }
    }
}

/// 一个 attachment 的 load/store 组合
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct AttachmentOps {
    pub load: LoadOp,
    pub store: StoreOp,
}

impl AttachmentOps {
    pub const CLEAR_STORE: Self = Self {
        load: LoadOp::Clear,
        store: StoreOp::Store,
    };
    pub const LOAD_STORE: Self = Self {
        load: LoadOp::Load,
        store: StoreOp::Store,
    };
    pub const CLEAR_DISCARD: Self = Self {
        load: LoadOp::Clear,
        store: StoreOp::DontCare,
    };
}

/// descriptor 的种类，决定了 pooled 路径中 pool 与 layout 的 key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    CombinedImageSampler,
    SampledImage,
    UniformBuffer,
    StorageBuffer,
}

impl DescriptorKind {
    #[inline]
    pub const fn to_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    #[inline]
    pub const fn is_image(self) -> bool {
        matches!(self, DescriptorKind::CombinedImageSampler | DescriptorKind::SampledImage)
    }
}

/// bindless 表中的三个 binding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BindlessCategory {
    Texture2D,
    TextureCube,
    /// 带比较采样器的深度纹理
    DepthCompare,
}

impl BindlessCategory {
    pub const ALL: [BindlessCategory; 3] =
        [BindlessCategory::Texture2D, BindlessCategory::TextureCube, BindlessCategory::DepthCompare];

    #[inline]
    pub const fn binding(self) -> u32 {
        match self {
            BindlessCategory::Texture2D => 0,
            BindlessCategory::TextureCube => 1,
            BindlessCategory::DepthCompare => 2,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.binding() as usize
    }
}

// format 相关的工具函数
pub mod format {
    use ash::vk;

    #[inline]
    pub const fn is_depth(format: vk::Format) -> bool {
        matches!(
            format,
            vk::Format::D16_UNORM
                | vk::Format::D32_SFLOAT
                | vk::Format::D16_UNORM_S8_UINT
                | vk::Format::D24_UNORM_S8_UINT
                | vk::Format::D32_SFLOAT_S8_UINT
        )
    }

    #[inline]
    pub const fn has_stencil(format: vk::Format) -> bool {
        matches!(
            format,
            vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT
        )
    }

    /// 用于 image view 和 barrier 的 aspect
    pub const fn aspect(format: vk::Format) -> vk::ImageAspectFlags {
        if has_stencil(format) {
            vk::ImageAspectFlags::from_raw(
                vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
            )
        } else if is_depth(format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    /// 上传时每个 texel 的字节数
    ///
    /// 深度格式只上传 depth aspect，因此返回 depth 部分的大小。未知格式返回 None
    pub const fn texel_size(format: vk::Format) -> Option<u32> {
        let size = match format {
            vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SRGB => 1,
            vk::Format::R8G8_UNORM
            | vk::Format::R8G8_UINT
            | vk::Format::R16_SFLOAT
            | vk::Format::R16_UNORM
            | vk::Format::R16_UINT
            | vk::Format::D16_UNORM
            | vk::Format::D16_UNORM_S8_UINT => 2,
            vk::Format::R8G8B8A8_UNORM
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::R8G8B8A8_SNORM
            | vk::Format::R8G8B8A8_UINT
            | vk::Format::B8G8R8A8_UNORM
            | vk::Format::B8G8R8A8_SRGB
            | vk::Format::A2B10G10R10_UNORM_PACK32
            | vk::Format::B10G11R11_UFLOAT_PACK32
            | vk::Format::R16G16_SFLOAT
            | vk::Format::R16G16_UNORM
            | vk::Format::R32_SFLOAT
            | vk::Format::R32_UINT
            | vk::Format::R32_SINT
            | vk::Format::D32_SFLOAT
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT => 4,
            vk::Format::R16G16B16A16_SFLOAT
            | vk::Format::R16G16B16A16_UNORM
            | vk::Format::R32G32_SFLOAT
            | vk::Format::R32G32_UINT => 8,
            vk::Format::R32G32B32_SFLOAT => 12,
            vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
            _ => return None,
        };
        Some(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindless_bindings_are_dense() {
        let bindings: Vec<u32> = BindlessCategory::ALL.iter().map(|c| c.binding()).collect();
        assert_eq!(bindings, vec![0, 1, 2]);
    }

    #[test]
    fn test_attachment_ops() {
        assert_eq!(AttachmentOps::default(), AttachmentOps::CLEAR_STORE);
        assert_eq!(AttachmentOps::LOAD_STORE.load.to_vk(), vk::AttachmentLoadOp::LOAD);
        assert_eq!(AttachmentOps::CLEAR_DISCARD.store.to_vk(), vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn test_format_aspect() {
        assert_eq!(format::aspect(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
        assert_eq!(format::aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert!(format::aspect(vk::Format::D24_UNORM_S8_UINT).contains(vk::ImageAspectFlags::STENCIL));
        assert_eq!(format::texel_size(vk::Format::R8G8B8A8_SRGB), Some(4));
    }

    #[test]
    fn test_texel_size_of_depth_formats() {
        // 只拷贝 depth aspect，stencil 部分不计入
        assert_eq!(format::texel_size(vk::Format::D32_SFLOAT_S8_UINT), Some(4));
        assert_eq!(format::texel_size(vk::Format::D24_UNORM_S8_UINT), Some(4));
        assert_eq!(format::texel_size(vk::Format::D16_UNORM_S8_UINT), Some(2));
        assert_eq!(format::texel_size(vk::Format::D32_SFLOAT), Some(4));
    }

    #[test]
    fn test_texel_size_of_unknown_format() {
        assert_eq!(format::texel_size(vk::Format::BC7_UNORM_BLOCK), None);
        assert_eq!(format::texel_size(vk::Format::UNDEFINED), None);
        assert_eq!(format::texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
    }

    #[test]
    fn test_descriptor_kind() {
        assert_eq!(DescriptorKind::UniformBuffer.to_vk(), vk::DescriptorType::UNIFORM_BUFFER);
        assert!(DescriptorKind::CombinedImageSampler.is_image());
        assert!(!DescriptorKind::StorageBuffer.is_image());
    }
}
