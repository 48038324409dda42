//! Print the effective configuration.

use std::path::PathBuf;

use framepump_common::config::EngineConfig;

pub fn run(config: &EngineConfig, explicit: Option<PathBuf>) -> anyhow::Result<()> {
    let path = explicit.unwrap_or_else(EngineConfig::default_path);
    let origin = if path.exists() { "loaded" } else { "defaults" };
    eprintln!("# {} ({origin})", path.display());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
