//! iTaK process entrypoint.
//!
//! Exit codes: 0 normal, 1 config invalid, 2 unrecoverable init failure,
//! 130 user-initiated shutdown.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

mod logging;
mod wiring;

/// Personal AI agent runtime.
#[derive(Debug, Parser)]
#[command(name = "itak", version, about)]
struct Args {
    /// Data directory (config, sessions, memory, logs).
    #[arg(long, env = "ITAK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Display name for the owner principal on first run.
    #[arg(long, default_value = "owner")]
    owner: String,

    /// Validate configuration and exit.
    #[arg(long)]
    check: bool,
}

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_INVALID: u8 = 1;
const EXIT_INIT_FAILURE: u8 = 2;
const EXIT_USER_SHUTDOWN: u8 = 130;

fn main() -> ExitCode {
    let args = Args::parse();
    let data_dir = args
        .data_dir
        .clone()
        .or_else(|| {
            directories::ProjectDirs::from("dev", "itak", "itak")
                .map(|dirs| dirs.data_dir().to_path_buf())
        })
        .unwrap_or_else(|| PathBuf::from("data"));

    // Config loads before the async runtime so an invalid file exits
    // cleanly with code 1.
    let config = match itak_config::load_or_init(&data_dir.join("config.json")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration invalid: {e}");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        },
    };
    if args.check {
        println!("configuration ok (port {})", config.port);
        return ExitCode::from(EXIT_OK);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("tokio runtime init failed: {e}");
            return ExitCode::from(EXIT_INIT_FAILURE);
        },
    };

    let code = runtime.block_on(run(args, data_dir, config));
    ExitCode::from(code)
}

async fn run(args: Args, data_dir: PathBuf, config: itak_config::ItakConfig) -> u8 {
    let _log_guard = match logging::init(&data_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("logging init failed: {e}");
            return EXIT_INIT_FAILURE;
        },
    };

    let app = match wiring::bootstrap(&data_dir, &config, &args.owner).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Initialization failed");
            return EXIT_INIT_FAILURE;
        },
    };

    app.runtime.fire_init().await;
    let registry = Arc::clone(&app.registry);
    app.runtime
        .resume_all(move |key| registry.resolve_session(key))
        .await;

    let bind = format!("{}:{}", config.deployment_mode.default_bind(), config.port);
    let addr = match bind.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(bind, error = %e, "Bad bind address");
            return EXIT_INIT_FAILURE;
        },
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    };

    info!(%addr, data_dir = %data_dir.display(), "iTaK starting");
    let served = itak_gateway::serve(app.state.clone(), addr, shutdown).await;

    app.runtime.shutdown().await;
    match served {
        Ok(()) => EXIT_USER_SHUTDOWN,
        Err(e) => {
            error!(error = %e, "Gateway failed");
            EXIT_INIT_FAILURE
        },
    }
}
