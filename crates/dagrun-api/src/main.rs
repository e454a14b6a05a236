//! dagrun CLI entry point.
//!
//! Binary name: `dagrun`
//!
//! Parses CLI arguments, loads the engine configuration, opens the configured
//! store, then dispatches to a command handler or runs the engine services.

mod cli;
mod services;
mod state;

use clap::Parser;

use cli::{Cli, Commands, TaskCommand};
use dagrun_core::repository::DagStore;
use dagrun_infra::config::load_engine_config;
use dagrun_observe::tracing_setup::{filter_for_verbosity, init_tracing, shutdown_tracing};
use dagrun_types::config::Backend;
use services::Services;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(filter_for_verbosity(cli.verbose, cli.quiet), cli.log_json, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let config = load_engine_config(&cli.config).await;
    let work_dir = cli.work_dir.clone();

    let result = match config.database.backend {
        Backend::Sqlite => {
            let store = state::open_sqlite(&config).await?;
            dispatch(cli, AppState::new(config, store, &work_dir)).await
        }
        Backend::Postgres => {
            let store = state::open_postgres(&config).await?;
            dispatch(cli, AppState::new(config, store, &work_dir)).await
        }
    };

    shutdown_tracing();
    result
}

async fn dispatch<S: DagStore>(cli: Cli, state: AppState<S>) -> anyhow::Result<()> {
    let json = cli.json;

    match cli.command {
        Commands::Validate { file } => cli::definition::validate(&state, &file, json).await?,

        Commands::Apply {
            file,
            name,
            namespace,
        } => cli::definition::apply(&state, &file, name, &namespace, json).await?,

        Commands::Delete { name, namespace } => {
            cli::definition::delete(&state, &name, &namespace, json).await?;
        }

        Commands::Task { command } => match command {
            TaskCommand::Apply {
                file,
                name,
                namespace,
            } => cli::definition::apply_task(&state, &file, name, &namespace, json).await?,
            TaskCommand::Delete { name, namespace } => {
                cli::definition::delete_task(&state, &name, &namespace, json).await?;
            }
        },

        Commands::Run {
            dag,
            instance,
            namespace,
            params,
            secret_params,
        } => {
            let overrides = cli::run::parse_overrides(&params, &secret_params)?;
            cli::run::run(&state, &dag, instance, &namespace, overrides, json).await?;
        }

        Commands::Serve => {
            let services = Services::start(&state, &state.config.namespaces, true)?;

            if !json {
                println!(
                    "  {} dagrun engine '{}' watching {}",
                    console::style("⚡").bold(),
                    console::style(&state.config.engine_id).cyan(),
                    state.config.namespaces.join(", ")
                );
                println!("  {}", console::style("Press Ctrl+C to stop").dim());
            }

            shutdown_signal().await;
            services.shutdown().await;

            if !json {
                println!("\n  Engine stopped.");
            }
        }
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
