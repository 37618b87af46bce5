//! QuestionTree CLI: related-questions extraction and change tracking.
//!
//! Extracts the expandable "related questions" tree from a search results
//! page, merges repeated runs into confidence-scored results, and tracks how
//! the questions for a keyword change over time.

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
