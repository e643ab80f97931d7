mod commands;
mod logging;

use clap::{Parser, Subcommand};
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_INTERRUPTED, EXIT_LOCK_ERROR};
use fsboot_config::Settings;
use fsboot_core::{install_signal_handler, StageId};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "fsboot",
    version,
    about = "Ordered, lock-guarded startup of the file server stack"
)]
struct Cli {
    /// Path to the configuration file.
    ///
    /// Defaults to $FSBOOT_CONFIG_FILE, then $CONFIG_FILE, then /etc/fsboot/fsboot.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Force debug logging regardless of LOG_LEVEL.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled stage in order, then write the status summary.
    Run,
    /// Run a single stage on its own, for troubleshooting.
    Stage {
        /// Stage name (network, iscsi, cache, file-sharing, external-nfs, nextcloud).
        name: StageId,
        /// Run the stage even if configuration disables it.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// List stages in execution order.
    Stages,
    /// Probe live services, sessions, and mounts without changing anything.
    Status,
    /// Load and validate configuration, then print the resolved settings.
    CheckConfig,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(i32::from(commands::decided_exit()));
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: config error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    logging::init(&settings, cli.verbose);
    install_signal_handler();

    let json = cli.json;
    let result = match cli.command {
        Commands::Run => commands::run::run(&settings, json),
        Commands::Stage { name, force } => commands::stage::run(&settings, name, force, json),
        Commands::Stages => commands::stages::run(&settings, json),
        Commands::Status => commands::status::run(&settings, json),
        Commands::CheckConfig => commands::check_config::run(&settings, json),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.ends_with("interrupted by signal") {
                EXIT_INTERRUPTED
            } else if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("startup lock:") {
                EXIT_LOCK_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
