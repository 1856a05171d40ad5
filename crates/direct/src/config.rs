use std::path::Path;

use anyhow::{Context, Result};
use direct_protocol::DirectConfig;

/// Load configuration from a TOML file. A missing file means defaults.
pub fn load_config(path: &Path) -> Result<DirectConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(DirectConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: DirectConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Log every validation issue. Returns false when any of them is fatal.
pub fn report_issues(config: &DirectConfig) -> bool {
    let Err(issues) = config.validate() else {
        return true;
    };
    let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{}", issue);
        } else {
            tracing::warn!("{}", issue);
        }
    }
    if has_errors {
        tracing::error!(
            "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
            issues.len()
        );
    }
    !has_errors
}
