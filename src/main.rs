#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # sandboxd
//!
//! Container-resident sandbox execution server.
//!
//! sandboxd runs inside a container and exposes HTTP and WebSocket APIs that
//! let a remote orchestrator execute commands in persistent bash sessions,
//! manage background processes, run code-interpreter contexts, proxy exposed
//! TCP ports, and attach interactive PTY terminals.

use std::collections::HashSet;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use sandboxd::{AppState, Config};

/// Container-resident sandbox execution server.
#[derive(Parser)]
#[command(name = "sandboxd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before proceeding
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("sandboxd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if let Some(id) = &config.server.sandbox_id {
        info!("Sandbox id: {id}");
    }

    let state = AppState::new(config);
    let app = sandboxd::routes::build_router(state.clone());

    // Periodic sweeps, all cancelled at shutdown:
    // orphaned command temp files (never touching in-flight ids)
    let temp_state = state.clone();
    let temp_sweep = tokio::spawn(async move {
        let max_age = Duration::from_secs(temp_state.config.shell.temp_file_max_age_secs);
        let mut interval = tokio::time::interval(max_age.max(Duration::from_secs(15)));
        loop {
            interval.tick().await;
            let in_flight = temp_state.sessions.all_in_flight_ids().await;
            sandboxd::shell::tempfiles::sweep(temp_state.sessions.temp_dir(), max_age, &in_flight)
                .await;
        }
    });

    // terminal records of finished background processes
    let process_state = state.clone();
    let process_sweep = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(
            process_state.config.process.sweep_interval_secs,
        ));
        loop {
            interval.tick().await;
            process_state.processes.sweep().await;
        }
    });

    // stale inactive port records
    let port_state = state.clone();
    let port_sweep = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(
            port_state.config.ports.sweep_interval_secs,
        ));
        loop {
            interval.tick().await;
            port_state.ports.sweep().await;
        }
    });

    // idle or dead PTY terminals
    let terminal_state = state.clone();
    let terminal_sweep = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            terminal_state.terminals.sweep().await;
        }
    });

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown on SIGINT/SIGTERM
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    temp_sweep.abort();
    process_sweep.abort();
    port_sweep.abort();
    terminal_sweep.abort();

    // Teardown order: terminals close with a 1000 frame, background
    // processes get SIGTERM→SIGKILL, session shells stop, workers stop,
    // and the temp sweeper runs one last unconditional pass.
    state.terminals.shutdown_all().await;
    state.processes.kill_all().await;
    state.code.shutdown_all().await;
    state.sessions.shutdown_all().await;
    sandboxd::shell::tempfiles::sweep(
        state.sessions.temp_dir(),
        Duration::ZERO,
        &HashSet::new(),
    )
    .await;
    info!("Goodbye");
}
