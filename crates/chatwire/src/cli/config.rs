use dotenvy::dotenv;
use eyre::Result;
use std::path::Path;

use chatwire_core::ChatwireConfig;

pub fn load_env() -> Result<()> {
    dotenv().ok();
    Ok(())
}

/// Load the config file named on the command line, or the default one.
pub fn load_config(path: Option<&Path>) -> Result<ChatwireConfig> {
    let config = match path {
        Some(path) => ChatwireConfig::load_from(path)?,
        None => ChatwireConfig::load()?,
    };
    Ok(config)
}
