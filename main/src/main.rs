mod args;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use session::RagSession;

use crate::args::{load_string_list, Cli, Command};

const USAGE_EXIT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            if args::is_usage_error(&err) {
                ExitCode::from(USAGE_EXIT)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.build_config()?;
    let mut session = RagSession::open(config).await?;

    match cli.command {
        Command::Index { docs } => {
            let docs = load_string_list(&docs)?;
            let stats = session.index(&docs).await?;
            println!(
                "indexed {} chunks ({} new to the graph, {} extracted)",
                stats.chunks_seen, stats.chunks_new_to_graph, stats.chunks_extracted
            );
        }
        Command::Delete { docs } => {
            let docs = load_string_list(&docs)?;
            let stats = session.delete(&docs).await?;
            println!(
                "removed {} chunks, {} entities, {} facts",
                stats.chunks_removed, stats.entities_removed, stats.facts_removed
            );
        }
        Command::PreOpenie { docs } => {
            let docs = load_string_list(&docs)?;
            let extracted = session.pre_openie(&docs).await?;
            println!("extracted {extracted} passages into the cache");
        }
        Command::Retrieve { queries, k, dpr } => {
            let queries = load_string_list(&queries)?;
            let solutions = if dpr {
                session.retrieve_dpr(&queries, k).await?
            } else {
                session.retrieve(&queries, k).await?
            };
            println!("{}", serde_json::to_string_pretty(&solutions)?);
        }
        Command::Qa { queries } => {
            let queries = load_string_list(&queries)?;
            let output = session.rag_qa(&queries, None, None).await?;
            println!("{}", serde_json::to_string_pretty(&output.solutions)?);
        }
    }
    Ok(())
}
