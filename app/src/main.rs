use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use quack_core::fields::FileFieldsStore;
use quack_core::settings::{config_dir, Settings};
use quack_tui::TuiError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE: &str = "quack.log";

// The terminal belongs to the UI, so logs go to a file.
fn init_logging(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))?;
    let filter = EnvFilter::try_from_env("QUACK_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}

fn run_app(
    dir: &Path,
    run_tui: impl FnOnce(&Settings, Option<FileFieldsStore>) -> Result<(), TuiError>,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load_from_path(dir.join("settings.toml"))?;
    let fields = match FileFieldsStore::load_from_path(dir.join("fields.toml")) {
        Ok(store) => Some(store),
        Err(error) => {
            warn!(%error, "running without persisted fields");
            None
        }
    };

    info!(table = %settings.table_name, "starting quack");
    run_tui(&settings, fields)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = config_dir()?;
    init_logging(&dir)?;
    run_app(&dir, quack_tui::run)
}
