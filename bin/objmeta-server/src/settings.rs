//! Layered configuration: defaults, optional TOML file, environment, flags.

use anyhow::{Context, Result};
use objmeta_common::Config;
use std::path::Path;

/// Prefix of environment overrides, e.g. `OBJMETA__CACHE__OP_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "OBJMETA";
const ENV_SEPARATOR: &str = "__";

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

/// Load configuration from `path` (skipped when missing) and the process
/// environment.
pub fn load(path: &Path) -> Result<Config> {
    load_from(path, environment())
}

fn load_from(path: &Path, env: config::Environment) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(env)
        .build()
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;
    settings
        .try_deserialize::<Config>()
        .context("invalid configuration")
}
