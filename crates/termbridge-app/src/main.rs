use anyhow::Result;
use clap::Parser;

use termbridge::{app, logging, Cli, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_cli(&cli)?;

    logging::init(&config.log_level);

    app::run_web_server(config).await
}
