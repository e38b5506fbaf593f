use clap::Parser;
use gangway::Cli;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    gangway::run(cli).await
}
