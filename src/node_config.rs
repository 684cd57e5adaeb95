// src/node_config.rs
// Runtime configuration, loaded from an optional TOML file plus ELA_SPV_*
// environment overrides.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub network: String,
    pub seeds: Vec<String>,
    pub db_path: String,
    pub user_agent: String,
    pub default_fee_per_kb: u64,
    pub earliest_key_time: u32,
}

impl NodeConfig {
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("network", "mainnet")?
            .set_default("seeds", Vec::<String>::new())?
            .set_default("db_path", "ela_spv_data.sqlite")?
            .set_default(
                "user_agent",
                format!("/ELA-SPV-Rust:{}/", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("default_fee_per_kb", 10_000i64)?
            .set_default("earliest_key_time", 0i64)?;
        if let Some(p) = path {
            builder = builder.add_source(File::with_name(p).required(false));
        }
        builder
            .add_source(Environment::with_prefix("ELA_SPV").separator("__"))
            .build()?
            .try_deserialize()
    }
}
