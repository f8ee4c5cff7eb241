//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, opens the data directory, wires the engine, then
//! dispatches to the command handler.

mod cli;
mod state;
mod templates;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::instance::Output;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,stepwise=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let state = AppState::init(cli.data_dir.clone()).await?;
    let out = Output {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Definitions { category } => {
            cli::definition::list_definitions(&state, category.as_deref(), cli.json)?;
        }
        Commands::Definition { id } => {
            cli::definition::show_definition(&state, &id, cli.json)?;
        }
        Commands::Start {
            definition,
            input,
            correlation_id,
        } => {
            cli::instance::start(&state, &definition, input.as_deref(), correlation_id, out).await?;
        }
        Commands::Advance { id } => cli::instance::advance(&state, id, out).await?,
        Commands::Resolve { id, action, edits } => {
            cli::instance::resolve(&state, id, action, edits, out).await?;
        }
        Commands::Cancel { id } => cli::instance::cancel(&state, id, out).await?,
        Commands::Pause { id } => cli::instance::pause(&state, id, out).await?,
        Commands::Resume { id } => cli::instance::resume(&state, id, out).await?,
        Commands::Show { id } => cli::instance::show(&state, id, out).await?,
        Commands::List { status, limit } => {
            cli::instance::list(&state, status, limit, out).await?;
        }
        Commands::Delete { id } => cli::instance::delete(&state, id, out).await?,
        Commands::Watch => cli::instance::watch(&state, out).await?,
    }

    Ok(())
}
