use std::path::Path;

use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// 从 toml 文件中读取配置
///
/// 文件不存在时使用 `T::default()`；文件存在但格式错误时返回错误
pub fn load_toml<T>(path: impl AsRef<Path>) -> Result<T, SettingsError>
where
    T: DeserializeOwned + Default,
{
    let path = path.as_ref();
    let path_str = path.display().to_string();

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("settings file {} not found, use default settings", path_str);
            return Ok(T::default());
        }
        Err(source) => return Err(SettingsError::Io { path: path_str, source }),
    };

    parse_toml(&content).map_err(|source| SettingsError::Parse { path: path_str, source })
}

/// 从字符串解析配置，未出现的字段由 serde 的 default 补齐
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T, toml::de::Error> {
    toml::from_str(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(default)]
    struct DemoSettings {
        size: u64,
        enabled: bool,
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let settings: DemoSettings = load_toml("definitely/not/here.toml").unwrap();
        assert_eq!(settings, DemoSettings::default());
    }

    #[test]
    fn test_partial_toml() {
        let settings: DemoSettings = parse_toml("size = 42").unwrap();
        assert_eq!(settings.size, 42);
        assert!(!settings.enabled);
    }
}
