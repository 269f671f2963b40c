use std::path::PathBuf;

use sysinfo::System;

const HOSTWATCH_CONFIG: &str = "HOSTWATCH_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Config path from the environment, falling back to `config.json`.
pub fn get_config_path() -> PathBuf {
    let path_from_env = std::env::var(HOSTWATCH_CONFIG);
    path_from_env
        .ok()
        .filter(|path| !path.trim().is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

const DEFAULT_HOST_NAME: &str = "localhost";

pub fn host_name() -> String {
    System::host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_HOST_NAME.to_string())
}
