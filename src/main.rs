use anyhow::Result;
use clap::Parser;
use gcmrun::cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    match cli::run(args).await {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => Err(e),
    }
}
