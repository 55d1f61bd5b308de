//! Kiln 工具集
//!
//! 提供日志初始化、配置文件加载等通用工具。

pub mod init_log;
pub mod settings;
