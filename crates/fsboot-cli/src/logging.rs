use fsboot_config::Settings;
use std::fs::{self, File, OpenOptions};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Environment variable holding an `EnvFilter` directive that beats LOG_LEVEL.
pub const LOG_ENV: &str = "FSBOOT_LOG";

fn filter(settings: &Settings, verbose: bool) -> EnvFilter {
    let default_level = if verbose {
        "debug".to_owned()
    } else {
        settings.log_level.as_tracing().as_str().to_ascii_lowercase()
    };
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn open_run_log(settings: &Settings) -> std::io::Result<File> {
    fs::create_dir_all(&settings.log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(settings.run_log_path())
}

/// Console on stderr plus `LOG_DIR/startup.log`, both at the configured level.
pub fn init(settings: &Settings, verbose: bool) {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter(settings, verbose));

    let file = match open_run_log(settings) {
        Ok(file) => Some(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter(settings, verbose)),
        ),
        Err(e) => {
            eprintln!(
                "warning: cannot open {} ({e}), logging to console only",
                settings.run_log_path().display()
            );
            None
        }
    };

    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init();
}
