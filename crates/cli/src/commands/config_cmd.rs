//! `localapi config` — Print the effective configuration.

use localapi_config::AppConfig;

pub fn show(config: &AppConfig, json: bool) -> anyhow::Result<()> {
    println!("{}", render(config, json)?);
    Ok(())
}

fn render(config: &AppConfig, json: bool) -> anyhow::Result<String> {
    let config = config.redacted();
    let text = if json {
        serde_json::to_string_pretty(&config)?
    } else {
        toml::to_string_pretty(&config)?
    };
    Ok(text)
}
