//! Entry-point for the `desh` binary.

use clap::Parser;
use safesh_cli::Cli;
use safesh_cli::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let exit_code = run_main(cli).await?;
    std::process::exit(exit_code);
}
