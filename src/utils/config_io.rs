use anyhow::Context;
use config::Config;
use serde::Deserialize;
use std::path::PathBuf;

/// Loads a deserializable config from a file (format picked by extension),
/// with `RX_`-prefixed environment variables layered on top.
pub fn load_cfg<T: for<'a> Deserialize<'a>>(path: impl AsRef<str>) -> anyhow::Result<T> {
    let cfg = Config::builder()
        .add_source(config::File::from(PathBuf::from(path.as_ref())))
        .add_source(config::Environment::with_prefix("RX"))
        .build()
        .with_context(|| format!("failed to read config from {}", path.as_ref()))?;

    let parsed: T = cfg
        .try_deserialize()
        .with_context(|| format!("failed to deserialize config from {}", path.as_ref()))?;

    Ok(parsed)
}
