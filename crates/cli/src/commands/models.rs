//! `revloop models`: List available models.

use revloop_config::AppConfig;
use revloop_core::Provider;

use super::agent::build_provider;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let provider = build_provider(&config)?;

    let models = provider.list_models().await?;
    if models.is_empty() {
        println!("No models returned.");
    }
    for model in models {
        let marker = if model.id == config.model { "*" } else { " " };
        if model.display_name.is_empty() {
            println!("{marker} {}", model.id);
        } else {
            println!("{marker} {:<40} {}", model.id, model.display_name);
        }
    }
    Ok(())
}
