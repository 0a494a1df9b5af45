//! `loomi config`: Print the starter configuration or its location.

use loomi_config::AppConfig;

pub fn show_default() {
    print!("{}", AppConfig::default_toml());
}

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}

pub fn validate() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Config error: {e}"))?;
    println!("Config OK");
    println!("   Model:       {}", config.model.model);
    println!("   API key:     {}", if config.has_api_key() { "set" } else { "missing" });
    println!("   Concurrency: {}", config.runtime.max_concurrent_agents);
    println!("   Store:       {}", config.store.backend);
    if let Some(limit) = &config.rate_limit {
        println!(
            "   Rate limit:  {} subagents / {}s",
            limit.max_subagents, limit.window_secs
        );
    }
    Ok(())
}
