use std::path::PathBuf;

use kiln_render_core::settings::CoreSettings;
use serde::Deserialize;

/// 示例程序的配置，`[core]` 一节原样交给 [`CoreSettings`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub window_title: String,
    pub window_width: u32,
    pub window_height: u32,

    /// 绘制带纹理的 quad 所需的 SPIR-V；任意一个缺失时只做 clear
    pub vertex_shader: Option<PathBuf>,
    pub fragment_shader: Option<PathBuf>,

    pub core: CoreSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            window_title: "Kiln".to_string(),
            window_width: 1200,
            window_height: 800,
            vertex_shader: None,
            fragment_shader: None,
            core: CoreSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_crate_tools::settings::parse_toml;

    #[test]
    fn test_core_section() {
        let settings: AppSettings = parse_toml(
            r#"
            window_title = "demo"
            vertex_shader = "shaders/quad.vert.spv"

            [core]
            enable_bindless = false
            "#,
        )
        .unwrap();
        assert_eq!(settings.window_title, "demo");
        assert_eq!(settings.window_width, 1200);
        assert!(settings.fragment_shader.is_none());
        assert!(!settings.core.enable_bindless);
    }
}
