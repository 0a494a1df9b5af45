//! `loomi serve`: Start the HTTP gateway.

use loomi_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    if !config.has_api_key() {
        return Err("No API key configured (set LOOMI_API_KEY or model.api_key)".into());
    }

    println!("loomi gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {}", config.model.model);
    println!("   Store:     {}", config.store.backend);

    loomi_gateway::start(config).await?;

    Ok(())
}
