use std::env;
use std::str::FromStr;

use crate::config::relay_config::Tier;

/// Environment configuration
/// Loads process-level settings; the relay topology itself lives in the
/// JSON config file
pub struct Config {
    pub config_path: String,
    pub bind_addr: String,
    pub tier_override: Option<Tier>,
    pub state_dir: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let config_path =
            env::var("RELAY_CONFIG_PATH").unwrap_or_else(|_| "relay.json".to_string());

        let bind_addr = env::var("RELAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let tier_override = match env::var("RELAY_TIER") {
            Ok(raw) => Some(Tier::from_str(&raw)?),
            Err(_) => None,
        };

        let state_dir = env::var("RELAY_STATE_DIR").ok();

        Ok(Self {
            config_path,
            bind_addr,
            tier_override,
            state_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_tier_rejected() {
        env::set_var("RELAY_TIER", "platinum");
        assert!(Config::from_env().is_err());
        env::remove_var("RELAY_TIER");
    }
}
