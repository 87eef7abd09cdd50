//! clearkg CLI: runs the CLEAR content update pipeline.
//!
//! Turns SDKG tables, knowledge units and raw AIS points into a
//! navigable knowledge graph with precomputed neighbourhoods.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
