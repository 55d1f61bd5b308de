mod app;
mod demo;
mod settings;

use app::WinitApp;
use kiln_crate_tools::init_log::init_log;
use settings::AppSettings;

/// 配置文件位于工作目录下，不存在时使用默认配置
const SETTINGS_FILE: &str = "kiln.toml";

fn main() -> anyhow::Result<()> {
    init_log();
    tracy_client::Client::start();

    let settings: AppSettings = kiln_crate_tools::settings::load_toml(SETTINGS_FILE)?;
    log::info!("settings: {:?}", settings);

    WinitApp::run(settings)
}
