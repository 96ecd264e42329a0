//! `tidewire config`: where the config lives and what it may contain.

use tidewire_config::AppConfig;

pub fn path() {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
}

pub fn show_default() {
    print!("{}", AppConfig::default_toml());
}

pub fn validate() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    println!("Config OK");
    println!("  Provider:   {}", config.default_provider);
    println!("  Model:      {}", config.default_model);
    println!("  API key:    {}", if config.has_api_key() { "set" } else { "missing" });
    println!("  Max turns:  {}", config.agent.max_turns);
    println!(
        "  Quality:    {}",
        if config.quality.enabled {
            format!("retry below {}", config.quality.threshold)
        } else {
            "off".into()
        }
    );
    println!("  Schedules:  {}", config.schedules.len());
    Ok(())
}
