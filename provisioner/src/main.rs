//! vmprov - Entry Point
//!
//! Provisions a repository onto a set of hosts over SSH and reports the
//! outcome per host.

use std::env;
use std::path::Path;

use anyhow::Context;

use vmprov::app::cli::{CliArgs, USAGE};
use vmprov::app::options::{log_options, AppOptions};
use vmprov::app::run::run;
use vmprov::errors::ProvisionError;
use vmprov::filesys::file::File;
use vmprov::logs::init_logging;
use vmprov::models::report::RunReport;
use vmprov::storage::settings::Settings;
use vmprov::utils::version_info;

use tracing::{error, info};

/// Exit code for configuration errors
const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    let code = provision().await;
    std::process::exit(code);
}

async fn provision() -> i32 {
    let cli = CliArgs::parse(env::args().skip(1));

    // Print version and exit
    let version = version_info();
    if cli.flag("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return 0;
    }
    if cli.flag("help") {
        print!("{}", USAGE);
        return 0;
    }

    // Retrieve the settings file
    let settings = match cli.get("config") {
        Some(path) => match Settings::load(Path::new(path)).await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("{e}");
                return EXIT_CONFIG;
            }
        },
        None => Settings::default(),
    };

    // Initialize logging; the guard flushes the log file on return
    let _log_guard = match log_options(&cli, &settings).and_then(init_logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = match AppOptions::resolve(&cli, settings, |key| env::var(key).ok()) {
        Ok(options) => options,
        Err(e) => {
            error!("{e}");
            return EXIT_CONFIG;
        }
    };
    let report_file = options.report_file.clone();

    info!("Running vmprov {} ({})", version.version, version.git_hash);
    let report = match run(options, await_shutdown_signal()).await {
        Ok(report) => report,
        Err(e @ ProvisionError::NoTargets) | Err(e @ ProvisionError::ConfigError(_)) => {
            error!("{e}");
            return EXIT_CONFIG;
        }
        Err(e) => {
            error!("Run failed: {e}");
            return 1;
        }
    };

    println!("{}", report.render_summary());
    if let Some(path) = report_file {
        if let Err(e) = write_report(&path, &report).await {
            error!("{:#}", e);
        }
    }
    report.exit_code()
}

async fn write_report(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    File::new(path)
        .write_json(report)
        .await
        .with_context(|| format!("Unable to write report {}", path.display()))?;
    info!("Report written to {}", path.display());
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                error!("Unable to install signal handlers, falling back to Ctrl+C");
                await_ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, cancelling...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, cancelling...");
            }
        }
    }

    #[cfg(not(unix))]
    await_ctrl_c().await;
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn await_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, cancelling..."),
        Err(e) => {
            error!("Unable to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await
        }
    }
}
