use std::ffi::{CStr, CString, c_char};

use ash::vk;
use itertools::Itertools;

use crate::error::{GfxError, GfxResult};
use crate::vulkan::debug_messenger::GfxDebugMsger;

pub struct GfxInstance {
    pub(crate) ash_instance: ash::Instance,
    /// 驱动是否支持 VK_EXT_debug_utils
    pub(crate) debug_utils_enabled: bool,
}

// new & init
impl GfxInstance {
    /// 设置所需的 extensions，创建 vk instance
    ///
    /// `required_exts` 缺失时返回 [`GfxError::MissingExtension`]；debug utils 是可选的
    pub fn new(entry: &ash::Entry, app_name: &str, required_exts: &[&'static CStr]) -> GfxResult<Self> {
        let app_name = CString::new(app_name).map_err(|_| GfxError::InvalidHandle("application name"))?;
        let engine_name = c"kiln";
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let all_ext_props = unsafe { entry.enumerate_instance_extension_properties(None)? };
        let is_supported = |ext: &CStr| {
            all_ext_props.iter().any(|props| props.extension_name_as_c_str().is_ok_and(|name| name == ext))
        };

        let mut enabled_exts: Vec<&'static CStr> = Vec::new();
        for ext in required_exts {
            if !is_supported(ext) {
                return Err(GfxError::MissingExtension(ext.to_string_lossy().into_owned()));
            }
            enabled_exts.push(ext);
        }

        // debug utils 可以单独使用，提供 debug messenger 以及 object name
        let debug_utils_enabled = is_supported(vk::EXT_DEBUG_UTILS_NAME);
        if debug_utils_enabled {
            enabled_exts.push(vk::EXT_DEBUG_UTILS_NAME);
        } else {
            log::warn!("VK_EXT_debug_utils is not supported, debug names are disabled");
        }

        let enabled_exts = enabled_exts.into_iter().unique().collect_vec();
        log::info!("instance extensions: {}", enabled_exts.iter().map(|e| format!("\n\t{:?}", e)).join(""));
        let ext_ptrs: Vec<*const c_char> = enabled_exts.iter().map(|e| e.as_ptr()).collect();

        // 无需开启 validation layer，使用 vulkan configurator 控制 validation layer 的开启
        let mut instance_ci = vk::InstanceCreateInfo::default().application_info(&app_info).enabled_extension_names(&ext_ptrs);

        // instance 创建过程中的消息也交给 debug messenger
        let mut debug_utils_messenger_ci = GfxDebugMsger::debug_utils_messenger_ci();
        if debug_utils_enabled {
            instance_ci = instance_ci.push_next(&mut debug_utils_messenger_ci);
        }

        let ash_instance = unsafe { entry.create_instance(&instance_ci, None)? };

        Ok(Self {
            ash_instance,
            debug_utils_enabled,
        })
    }

    pub fn destroy(&self) {
        log::info!("destroying instance");
        unsafe {
            self.ash_instance.destroy_instance(None);
        }
    }
}

// getters
impl GfxInstance {
    #[inline]
    pub fn ash_instance(&self) -> &ash::Instance {
        &self.ash_instance
    }
}
