//! CacheMesh CLI - Main entry point.

use cachemesh::cli::{Cli, Commands};
use cachemesh::config::CacheMeshConfig;
use cachemesh::NodeOptions;
use std::path::Path;

fn load_config(path: Option<&Path>, development: bool) -> anyhow::Result<CacheMeshConfig> {
    let config = match path {
        Some(path) => CacheMeshConfig::from_file(path)?,
        None if development => CacheMeshConfig::development(),
        None => CacheMeshConfig::default(),
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Run {
            development,
            capacity,
            sweep_interval,
        } => {
            let mut config = load_config(cli.config.as_deref(), development)?;
            config.observability.log_level = cli.log_level;

            cachemesh::run(
                config,
                NodeOptions {
                    capacity,
                    sweep_interval,
                },
            )
            .await?;
        }

        Commands::Validate { file } => match CacheMeshConfig::from_file(&file) {
            Ok(config) => {
                println!("Configuration is valid: {}", file.display());
                println!("  Node: {}", config.node.name);
                println!("  Edge batch size: {}", config.edge.batch_size);
                println!(
                    "  Invalidation: {}",
                    if config.invalidation.enabled {
                        config.invalidation.channel.as_str()
                    } else {
                        "disabled"
                    }
                );
            }
            Err(e) => {
                eprintln!("Invalid configuration: {}", e);
                std::process::exit(1);
            }
        },

        Commands::ShowConfig { development } => {
            let config = load_config(cli.config.as_deref(), development)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Version => {
            println!("CacheMesh {}", env!("CARGO_PKG_VERSION"));
            println!("Multi-layer cache coordination engine");
        }
    }

    Ok(())
}
