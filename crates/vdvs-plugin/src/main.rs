use std::process::ExitCode;

use clap::Parser;
use futures::future::join_all;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vdvs_core::config::{socket_path, Config};
use vdvs_plugin::logging::{self, ENV_LOG_FORMAT};
use vdvs_plugin::{build, router, Cli, HostOptions, PluginSocket};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let resolved = Config::resolve(
        &cli.config_path(),
        cli.default_driver(),
        &cli.overrides(),
        |k| std::env::var(k).ok(),
    );
    let config = resolved.config;
    let json = std::env::var(ENV_LOG_FORMAT).is_ok_and(|f| f == "json");
    let log_path = config.log_path_or(cli.default_log_path());
    if let Err(e) = logging::init(&config.log_level, &log_path, json) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }
    if resolved.using_defaults {
        info!("No config file found. Using defaults.");
    }
    for warning in &resolved.warnings {
        warn!("{}", warning);
    }
    info!(
        driver = %config.driver,
        log_level = %config.log_level,
        log_path = %log_path.display(),
        group = %config.group_id,
        config = %cli.config_path().display(),
        "Starting plugin"
    );

    match run(&cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let options = HostOptions {
        esx_port: cli.port,
        mock_esx: cli.mock_esx,
    };
    let plugin = build(config, options, cancel.clone())?;

    let socket = PluginSocket::bind(&socket_path(plugin.kind.as_str()), &config.group_id)?;
    let server = tokio::spawn(socket.serve(router(plugin.driver.clone()), cancel.clone()));

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => warn!(signal = "SIGINT", "Received signal"),
        _ = sigterm.recv() => warn!(signal = "SIGTERM", "Received signal"),
    }
    cancel.cancel();

    server.await??;
    for result in join_all(plugin.tasks).await {
        if let Err(e) = result {
            warn!(error = %e, "background task failed");
        }
    }
    info!("plugin stopped");
    Ok(())
}
