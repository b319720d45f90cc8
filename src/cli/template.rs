use anyhow::{Context, Result};

/// 取得配置模板内容
pub fn config_template(template_type: &str) -> Option<&'static str> {
    match template_type {
        "server" => Some(include_str!("../../templates/server.toml")),
        "agent" => Some(include_str!("../../templates/agent.toml")),
        _ => None,
    }
}

/// Generate configuration template
pub fn generate_config_template(template_type: &str, output: Option<&str>) -> Result<()> {
    let content = config_template(template_type)
        .with_context(|| format!("Unknown template type: {}", template_type))?;

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!(
            "Generated {} configuration template: {}",
            template_type, path
        );
    } else {
        println!("{}", content);
    }

    Ok(())
}
