use ash::vk;

/// driver 在启动时查询到的能力与限制
#[derive(Clone, Debug)]
pub struct GfxCaps {
    pub device_name: String,

    /// 是否支持 descriptor indexing（runtime array + update after bind + partially bound）
    pub descriptor_indexing: bool,
    /// update after bind 的 sampled image 在单个 stage 中的最大数量
    pub max_bindless_sampled_images: u32,

    /// 所有 host visible 的 memory type 所在 heap 中最大的那个
    pub host_visible_heap_size: vk::DeviceSize,

    pub optimal_copy_offset_alignment: vk::DeviceSize,
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    pub non_coherent_atom_size: vk::DeviceSize,

    /// surface 要求的最少 swapchain image 数量，即 driver 可能同时持有的帧数
    pub min_swapchain_images: u32,

    pub sampler_anisotropy: bool,
}

impl GfxCaps {
    /// staging 区域的对齐要求：copy offset 与 non coherent atom 的较大者
    #[inline]
    pub fn staging_alignment(&self) -> vk::DeviceSize {
        self.optimal_copy_offset_alignment.max(self.non_coherent_atom_size).max(4)
    }
}
