use std::fs::File;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use daemonize::Daemonize;
use log::{error, info, LevelFilter};
use syslog::{BasicLogger, Facility, Formatter3164};
use tokio_util::sync::CancellationToken;

use bladed::agent::ComputeBladeAgent;
use bladed::api;
use bladed::api::credentials::CredentialManager;
use bladed::cli::Cli;
use bladed::config::AgentConfig;
use bladed::hal::simulated::SimulatedHal;
use bladed::metrics;
use bladed::task_manager::TaskManager;

fn init_log(debug: bool) -> Result<()> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "bladed".into(),
        pid: 0,
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|_| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn into_daemon() -> Result<()> {
    File::create("/var/tmp/bladed.log")
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

/// Cancels the root token on SIGINT/SIGTERM/SIGQUIT.
async fn handle_signals(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut quit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            info!("Received SIGINT, shutting down");
        }
        _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        _ = quit.recv() => info!("Received SIGQUIT, shutting down"),
        () = token.cancelled() => return Ok(()),
    }

    token.cancel();
    Ok(())
}

#[tokio::main]
async fn tokio_main(cli: Cli) -> Result<()> {
    let config = AgentConfig::load(cli.config)?;

    info!(
        "Bootstrapping bladed v{} (listen: {}, mode: {:?}, authenticated: {})",
        env!("CARGO_PKG_VERSION"),
        config.listen.grpc,
        config.listen.mode,
        config.listen.authenticated
    );

    let root_token = CancellationToken::new();

    let signal_token = root_token.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(signal_token.clone()).await {
            error!("Signal handler failed: {e:#}");
        }
        signal_token.cancel();
    });

    let hal = SimulatedHal::new(config.hal.initial_temperature);
    let agent = ComputeBladeAgent::new(config.clone(), hal)?;
    let credentials = CredentialManager::new()?;

    let mut tasks = TaskManager::new(root_token.clone());

    let agent_runner = agent.clone();
    tasks.spawn_task("agent", move |token| async move {
        agent_runner.run(token).await
    });

    let rpc_agent = agent.clone();
    let listen = config.listen.clone();
    tasks.spawn_task("rpc_server", move |token| async move {
        api::serve(rpc_agent, &listen, &credentials, token).await
    });

    let metrics_addr = config.listen.metrics.clone();
    tasks.spawn_task("metrics_server", move |token| async move {
        metrics::serve(&metrics_addr, token).await
    });

    root_token.cancelled().await;

    let result = tasks.shutdown_all().await;
    match &result {
        Ok(()) => info!("Exiting"),
        Err(e) => error!("Exiting with error: {e:#}"),
    }
    result
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_log(cli.debug)?;
    if cli.daemonize {
        into_daemon()?;
    }

    tokio_main(cli)
}
