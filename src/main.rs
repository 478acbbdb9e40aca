// Demo binary: opens a window and draws the built-in triangle

use anyhow::Result;
use wyvern::{Application, Config, Game};

struct Demo;

impl Game for Demo {
    fn name(&self) -> &str {
        "Wyvern Demo"
    }

    fn initialize(&mut self) -> Result<()> {
        log::info!("Demo initialized (Esc quits, F11 toggles fullscreen)");
        Ok(())
    }
}

fn main() -> Result<()> {
    // Load configuration from config.toml, reported once the logger exists
    let (config, source) = Config::load();

    init_logging(&config);
    log::info!("Starting Wyvern");
    source.report();
    if config.log_level().is_none() {
        log::warn!(
            "Unknown log level '{}', defaulting to info",
            config.debug.log_level
        );
    }
    log::debug!("Config: {:?}", config);
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    Application::run(config, Demo)
}

/// Config sets the default level, RUST_LOG still overrides it
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.log_filter())
        .parse_default_env()
        .init();
}
