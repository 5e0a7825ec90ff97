//! Entry-point for the `quarry` binary.

use clap::Parser;
use quarry_exec::Cli;
use quarry_exec::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_main(cli).await
}
