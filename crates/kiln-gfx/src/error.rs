use ash::vk;

/// GFX 层的错误类型
///
/// 只有对象创建这一类操作会返回错误；录制与提交过程中的失败由调用方直接 panic
#[derive(Debug, thiserror::Error)]
pub enum GfxError {
    /// Vulkan API 返回的错误码
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// 无法加载 vulkan 动态库
    #[error("failed to load vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// 没有找到满足要求的显卡
    #[error("no suitable adapter found")]
    NoSuitableAdapter,

    /// 驱动缺少必须的 extension 或 layer
    #[error("missing required extension or layer: {0}")]
    MissingExtension(String),

    #[error("surface error: {0}")]
    Surface(String),

    /// 请求的 host visible 内存超过了 heap 的大小
    #[error("out of host visible memory: requested {requested} bytes, heap is {heap} bytes")]
    OutOfHostVisibleMemory { requested: u64, heap: u64 },

    #[error("invalid handle: {0}")]
    InvalidHandle(&'static str),

    /// 无法计算该格式的上传大小
    #[error("unsupported upload format: {0:?}")]
    UnsupportedFormat(vk::Format),
}

pub type GfxResult<T> = Result<T, GfxError>;

/// 在创建失败的地方打印日志，并原样返回错误
///
/// ```ignore
/// let fence = driver.create_fence(false, "frame").map_err(log_creation_error("fence"))?;
/// ```
pub fn log_creation_error(what: &'static str) -> impl FnOnce(GfxError) -> GfxError {
    move |e| {
        match &e {
            GfxError::Vulkan(vk::Result::ERROR_INCOMPATIBLE_DRIVER) => {
                log::error!("failed to create {}: incompatible driver", what)
            }
            GfxError::Vulkan(vk::Result::ERROR_EXTENSION_NOT_PRESENT) | GfxError::MissingExtension(_) => {
                log::error!("failed to create {}: missing extension ({})", what, e)
            }
            GfxError::Vulkan(vk::Result::ERROR_LAYER_NOT_PRESENT) => {
                log::error!("failed to create {}: missing layer", what)
            }
            _ => log::error!("failed to create {}: {}", what, e),
        }
        e
    }
}
