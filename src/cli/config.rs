use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::AppConfig;

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // 检查是否其他用户可写（o+w = 0o002）
    if mode & 0o002 != 0 {
        warn!(
            "Config file '{}' is writable by others (permissions: {:o}), \
             anyone on this host can redirect the broker. RECOMMENDATION: chmod 644 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    config_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

impl CheckResult {
    fn print(&self) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(self)?);
        Ok(())
    }
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 配置文件的类型，由顶层表名决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Server,
    Agent,
}

/// 根据顶层表判断配置类型
pub fn detect_config_kind(content: &str) -> Result<ConfigKind> {
    let table: toml::Table = toml::from_str(content).context("Invalid TOML")?;
    match (table.contains_key("server"), table.contains_key("agent")) {
        (true, false) => Ok(ConfigKind::Server),
        (false, true) => Ok(ConfigKind::Agent),
        (true, true) => anyhow::bail!("Configuration contains both [server] and [agent] sections"),
        (false, false) => anyhow::bail!("Configuration has neither a [server] nor an [agent] section"),
    }
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let json = format == "json";
    let fail = |config_type: &str, message: String| -> Result<()> {
        if json {
            CheckResult {
                valid: false,
                config_type: config_type.to_string(),
                warnings: vec![],
                error: Some(message.clone()),
                details: serde_json::json!({}),
            }
            .print()?;
        } else {
            println!("✗ {}", message);
        }
        anyhow::bail!(message)
    };

    if !Path::new(config_path).exists() {
        return fail("unknown", format!("Configuration file not found: {}", config_path));
    }

    if !json {
        println!("Checking configuration file: {}\n", config_path);
    }

    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read configuration file {}", config_path))?;

    let kind = match detect_config_kind(&content) {
        Ok(kind) => kind,
        Err(e) => return fail("unknown", format!("{:#}", e)),
    };

    match kind {
        ConfigKind::Server => {
            let config = match AppConfig::parse_server_config(&content) {
                Ok(config) => config,
                Err(e) => return fail("server", format!("{:#}", e)),
            };

            let mut warnings = Vec::new();
            if config.rate_limit.is_none() {
                warnings.push("No rate limit configured".to_string());
            }

            if json {
                CheckResult {
                    valid: true,
                    config_type: "server".to_string(),
                    warnings,
                    error: None,
                    details: serde_json::json!({
                        "listen": config.listen_addr(),
                        "register_path": config.register_path,
                        "tunnel_wait_ms": config.tunnel_wait_ms,
                        "health_check_interval_ms": config.health_check_interval_ms,
                        "stats_port": config.stats_port,
                    }),
                }
                .print()?;
            } else {
                println!("✓ Configuration type: Server");
                println!("✓ Listen address: {}", config.listen_addr());
                println!("✓ Register path: {}", config.register_path);
                println!("✓ Tunnel wait: {:?}", config.tunnel_wait());
                println!("✓ Health check interval: {:?}", config.health_check_interval());
                if let Some(port) = config.stats_port {
                    println!("✓ Stats port: {}", port);
                }
                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Server configuration is valid!");
            }
        }
        ConfigKind::Agent => {
            let config = match AppConfig::parse_agent_config(&content) {
                Ok(config) => config,
                Err(e) => return fail("agent", format!("{:#}", e)),
            };

            if json {
                CheckResult {
                    valid: true,
                    config_type: "agent".to_string(),
                    warnings: vec![],
                    error: None,
                    details: serde_json::json!({
                        "server": config.server_endpoint(),
                        "local": config.local_endpoint(),
                        "register_path": config.register_path,
                        "tunnels": config.tunnels,
                    }),
                }
                .print()?;
            } else {
                println!("✓ Configuration type: Agent");
                println!("✓ Broker: {}", config.server_endpoint());
                println!("✓ Local service: {}", config.local_endpoint());
                println!("✓ Register path: {}", config.register_path);
                println!("✓ Tunnels: {}", config.tunnels);
                println!("\n✓ Agent configuration is valid!");
            }
        }
    }

    Ok(())
}
