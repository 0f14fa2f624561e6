//! `revloop config`: Configuration management commands.

use revloop_config::AppConfig;

pub fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    config.api_key = config.api_key.as_deref().map(mask_key);
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub fn init(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = AppConfig::config_dir().join("config.toml");
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )
        .into());
    }
    AppConfig::default().save_to(&path)?;
    println!("Wrote {}", path.display());
    println!("Set ANTHROPIC_API_KEY or add api_key to the file before running `revloop agent`.");
    Ok(())
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}

/// Keep a recognizable prefix of the key, hide the rest.
fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(7).collect();
    if key.chars().count() <= 7 {
        "****".into()
    } else {
        format!("{prefix}****")
    }
}
