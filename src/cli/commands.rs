use anyhow::Result;
use tracing::info;

use crate::config::{AppConfig, ServerConfig};
use crate::{client, server};

use super::config::{check_config, check_config_file_permissions, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template {
            template_type,
            output,
        } => {
            template::generate_config_template(template_type, output.as_deref())?;
        }
        Commands::Server { config, port } => {
            run_server(config.as_deref(), *port).await?;
        }
        Commands::Agent { config } => {
            run_agent(config).await?;
        }
    }

    Ok(())
}

/// Run the tunnel broker
async fn run_server(config: Option<&str>, port: Option<u16>) -> Result<()> {
    let mut server_config = match config {
        Some(path) => {
            let config_path = expand_path(path)?;
            check_config_file_permissions(&config_path)?;
            info!("Loading server configuration from: {}", config_path);
            AppConfig::load_server_config(&config_path)?
        }
        None => {
            info!("No configuration file given, using defaults");
            ServerConfig::default()
        }
    };

    if let Some(port) = port {
        server_config.bind_port = port;
        server_config.validate()?;
    }

    server::run_server(server_config).await
}

/// Run the tunnel agent
async fn run_agent(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    check_config_file_permissions(&config_path)?;

    info!("Loading agent configuration from: {}", config_path);
    let agent_config = AppConfig::load_agent_config(&config_path)?;

    client::run_client(agent_config).await
}
