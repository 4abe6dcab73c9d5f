use anyhow::Result;
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "geoforward", version, about = "Policy-driven DNS forwarder")]
struct Cli {
    /// Path to the YAML config file
    #[arg(default_value = "config.yaml")]
    config: String,

    /// Validate the config and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = geoforward::config::load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();

    info!(path = %cli.config, forwards = config.forwards.len(), "config loaded");
    if cli.check {
        println!("config ok");
        return Ok(());
    }

    let app = geoforward::app::App::new(config)?;
    app.run().await?;

    Ok(())
}
