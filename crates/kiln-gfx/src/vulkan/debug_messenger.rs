use std::ffi::CStr;

use ash::vk;

pub struct GfxDebugMsger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl GfxDebugMsger {
    pub fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self, vk::Result> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let messenger = unsafe { loader.create_debug_utils_messenger(&Self::debug_utils_messenger_ci(), None)? };

        Ok(Self { loader, messenger })
    }

    pub fn destroy(&self) {
        log::info!("destroying debug messenger");
        unsafe {
            self.loader.destroy_debug_utils_messenger(self.messenger, None);
        }
    }

    /// 用于创建 debug messenger 的结构体，也用于 instance 创建过程中的消息
    pub fn debug_utils_messenger_ci() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
        vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR)
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vk_debug_callback))
    }
}

/// debug messenger 的回调函数
unsafe extern "system" fn vk_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };

    let msg = if callback_data.p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message).to_string_lossy() }
    };

    // 新版本的 validation layer 输出 json，MainMessage 中有换行符，需要单独输出
    let mut json_value = serde_json::from_str::<serde_json::Value>(msg.as_ref()).ok();
    let json_obj = json_value.as_mut().and_then(|v| v.as_object_mut());
    let (main_msg, rest_msg) = match json_obj {
        Some(obj) => {
            let main_msg = obj.remove("MainMessage").and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
            let rest = serde_json::to_string_pretty(&obj).unwrap_or_else(|_| msg.to_string());
            (main_msg, rest)
        }
        None => (String::new(), msg.to_string()),
    };

    let format_msg = format!("[{:?}]\n{}\n{}\n", message_type, rest_msg, main_msg);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("{}", format_msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("{}", format_msg),
        _ => log::info!("{}", format_msg),
    };

    // 只有 layer developer 才需要返回 True
    vk::FALSE
}
