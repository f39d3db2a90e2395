// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine tunables, loadable from a TOML file.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io { path: Utf8PathBuf, #[source] err: std::io::Error },
    #[error("failed to parse config file {path}")]
    Parse { path: Utf8PathBuf, #[source] err: toml::de::Error },
}

/// Engine configuration. Every field has a sensible default; a config file
/// only needs the fields it wants to override.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Bytes fetched per payload read.
    pub download_chunk_bytes: usize,
    /// Idle timeout on a single payload read.
    pub download_idle_timeout_secs: u64,
    /// First retry delay after a transient download error.
    pub download_retry_initial_ms: u64,
    /// Give up on transient download errors after this long.
    pub download_retry_max_elapsed_secs: u64,
    /// Minimum wall-clock between progress broadcasts.
    pub status_throttle_ms: u64,
    /// Minimum progress delta between progress broadcasts.
    pub status_throttle_progress: f64,
    /// Wall-clock budget for one postinstall invocation.
    pub postinstall_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_chunk_bytes: 1 << 20,
            download_idle_timeout_secs: 30,
            download_retry_initial_ms: 250,
            download_retry_max_elapsed_secs: 60,
            status_throttle_ms: 200,
            status_throttle_progress: 0.005,
            postinstall_timeout_secs: 600,
        }
    }
}

impl Config {
    /// Load a `Config` from the given TOML file.
    pub fn from_file(path: &Utf8Path) -> Result<Config, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Io { path: path.to_owned(), err }
        })?;
        toml::from_str(&data).map_err(|err| ConfigError::Parse {
            path: path.to_owned(),
            err,
        })
    }

    pub fn download_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.download_idle_timeout_secs)
    }

    pub fn download_retry_initial(&self) -> Duration {
        Duration::from_millis(self.download_retry_initial_ms)
    }

    pub fn download_retry_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.download_retry_max_elapsed_secs)
    }

    pub fn status_throttle(&self) -> Duration {
        Duration::from_millis(self.status_throttle_ms)
    }

    pub fn postinstall_timeout(&self) -> Duration {
        Duration::from_secs(self.postinstall_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_are_reasonable() {
        let config = Config::default();
        assert_eq!(config.download_chunk_bytes, 1 << 20);
        assert_eq!(config.status_throttle(), Duration::from_millis(200));
        assert_eq!(config.status_throttle_progress, 0.005);
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "download_chunk_bytes = 4096").unwrap();
        writeln!(file, "status_throttle_ms = 50").unwrap();
        drop(file);

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.download_chunk_bytes, 4096);
        assert_eq!(config.status_throttle_ms, 50);
        // Untouched fields keep their defaults.
        assert_eq!(config.postinstall_timeout_secs, 600);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "no_such_knob = 1\n").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
