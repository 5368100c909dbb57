//! Configuration loading

use std::path::{Path, PathBuf};

use crate::{Config, Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "P2PTV_CONFIG_PATH";

/// Pick the config file to load
///
/// Search order:
/// 1. explicit path (the `--config` flag)
/// 2. `P2PTV_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
///
/// An explicit path must exist. The other candidates are skipped when missing.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    let from_env = std::env::var(CONFIG_PATH_ENV)
        .ok()
        .map(PathBuf::from)
        .filter(|p| p.exists());
    if from_env.is_some() {
        return Ok(from_env);
    }

    let cwd = PathBuf::from("config.yaml");
    Ok(cwd.exists().then_some(cwd))
}

/// Load configuration, apply `overrides` and validate the result
///
/// Logging is not initialised yet when this runs, so progress goes to stderr.
pub fn load_config<F>(explicit: Option<&Path>, overrides: F) -> Result<Config>
where
    F: FnOnce(&mut Config),
{
    let mut config = match resolve_config_path(explicit)? {
        Some(path) => {
            eprintln!("Loading config from {}", path.display());
            Config::from_file(&path)?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env()?
        }
    };

    overrides(&mut config);

    // Fail fast on misconfigurations
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(Error::InvalidConfiguration(format!(
            "{} error(s): {}",
            errors.len(),
            errors.join("; ")
        )));
    }

    Ok(config)
}
