use std::io::Write;

use anstyle::{AnsiColor, Color, RgbColor, Style};

fn level_style(level: log::Level) -> Style {
    let color = match level {
        log::Level::Error => AnsiColor::Red,
        log::Level::Warn => AnsiColor::Yellow,
        log::Level::Info => AnsiColor::Green,
        log::Level::Debug => AnsiColor::Blue,
        log::Level::Trace => AnsiColor::Magenta,
    };
    Style::new().fg_color(Some(Color::Ansi(color)))
}

fn builder(default_level: log::LevelFilter) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            let level_style = level_style(record.level());
            let grey_style = Style::new().fg_color(Some(Color::Rgb(RgbColor(110, 110, 110))));

            let line = record.line().unwrap_or(!0);
            // windows 和 unix 的路径分隔符都需要处理
            let file = record.file().unwrap_or("").rsplit(['\\', '/']).next().unwrap_or("");
            let time = chrono::Local::now().format("%H:%M:%S");
            let level = record.level();

            writeln!(
                buf,
                "{level_style}[{time}] {level}{level_style:#} {grey_style}[{file}:{line}]{grey_style:#} {}",
                record.args()
            )
        })
        .filter(None, default_level);

    // RUST_LOG 可以覆盖默认的 level
    builder.parse_default_env();
    builder
}

/// 初始化全局 logger，只能调用一次
pub fn init_log() {
    builder(log::LevelFilter::Info).init();
}

/// 测试中可能被多次调用，重复初始化时静默忽略
pub fn try_init_log(default_level: log::LevelFilter) {
    let _ = builder(default_level).is_test(true).try_init();
}
