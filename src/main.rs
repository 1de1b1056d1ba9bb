//! Confidential RFQ CLI binary

use anyhow::Context;
use clap::Parser;
use confidential_rfq::cli::{derive_descriptor, keygen, Cli, Commands, DemoParams, OtcApp};
use confidential_rfq::config::{create_default_config_file, AppConfig, LoggingConfig};
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_with_env_overrides(path)
            .with_context(|| format!("loading {}", path.display())),
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides()?;
            Ok(config)
        }
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| {
        EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    });
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.format.as_deref() == Some("json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Demo {
            size,
            reference_price,
            side,
            csv_delay,
            reclaim_after,
        } => {
            if let Some(csv_delay) = csv_delay {
                config.settlement.csv_delay = csv_delay;
            }

            tracing::info!(size, %reference_price, ?side, csv_delay = config.settlement.csv_delay, "Running demo");
            let app = OtcApp::new(config)?;
            let report = app
                .run_demo(DemoParams {
                    size,
                    reference_price,
                    side: side.into(),
                    reclaim_after,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Descriptor {
            client,
            dealer,
            csv_delay,
        } => {
            let report = derive_descriptor(&client, &dealer, csv_delay)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Keygen {
            participant_id,
            seed,
        } => {
            println!("{}", serde_json::to_string_pretty(&keygen(&participant_id, &seed))?);
        }

        Commands::ConfigInit { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
            }
            create_default_config_file(&path)?;
            tracing::info!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}
