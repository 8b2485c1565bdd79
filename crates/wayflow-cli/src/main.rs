//! Wayflow CLI entry point.
//!
//! Binary name: `wayflow`
//!
//! Parses CLI arguments, initializes logging, the database and the engine,
//! then dispatches to the command handler.

mod cli;
mod functions;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;
use wayflow_infra::config::load_engine_config;
use wayflow_infra::sqlite::pool::default_data_dir;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,wayflow_core=debug",
        _ => "trace",
    };
    wayflow_observe::tracing_setup::init_tracing(cli.otel, filter)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    let result = dispatch(cli).await;
    wayflow_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let json = cli.json;

    // Commands that never touch the database.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "wayflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => {
            let config = load_engine_config(&default_data_dir()).await;
            return cli::workflow::validate(file, &config, json).await;
        }
        Commands::Run {
            file,
            input,
            step,
            trace,
        } => {
            let config = load_engine_config(&default_data_dir()).await;
            return cli::workflow::run(file, input.as_deref(), *step, *trace, &config, json)
                .await;
        }
        _ => {}
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Import { file, disabled } => {
            cli::workflow::import(&state, &file, disabled, json).await?;
        }
        Commands::Exec {
            workflow,
            input,
            step,
        } => {
            cli::workflow::exec(&state, &workflow, input.as_deref(), step, json).await?;
        }
        Commands::List { query, deleted } => {
            cli::workflow::list(&state, query, deleted, json).await?;
        }
        Commands::Delete { workflow } => {
            cli::workflow::delete(&state, &workflow, json).await?;
        }
        Commands::Undelete { id } => {
            cli::workflow::undelete(&state, id, json).await?;
        }
        Commands::Sessions {
            workflow,
            status,
            limit,
        } => {
            cli::session::list(&state, workflow.as_deref(), &status, limit, json).await?;
        }
        Commands::Session { id } => {
            cli::session::show(&state, id, json).await?;
        }
        Commands::Resume {
            session,
            state: state_id,
            input,
        } => {
            cli::session::resume(&state, session, state_id, input.as_deref(), json).await?;
        }
        Commands::Cancel { session } => {
            cli::session::cancel(&state, session, json).await?;
        }
        Commands::Functions => {
            cli::workflow::functions(&state, json)?;
        }
        Commands::Completions { .. } | Commands::Validate { .. } | Commands::Run { .. } => {
            unreachable!("handled above")
        }
    }

    // Sessions restored at startup may have reported changes.
    state.service.sessions().flush().await;
    Ok(())
}
