//! Merge rules: defaults first, later sources override earlier ones.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with the defaults that other layers override.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("storage.backend", "sled")?
        .set_default("explorer.batch_size", 20)?
        .set_default("explorer.variants_per_node", 3)?
        .set_default("budget.limit_usd", 5.0)?
        .set_default("logging.level", "info")
}
