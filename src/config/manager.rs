//! Configuration file wrangling
// (c) 2024 Ross Younger

use std::path::{Path, PathBuf};

use figment::providers::{Env, Serialized};
use figment::{Figment, Provider};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{BASE_CONFIG_FILENAME, ConfigFileError, Configuration, ENV_PREFIX, LocalConfigSource};

/// Processes and merges all possible configuration sources.
///
/// In priority order (highest first):
/// 1. Command line options (merged in by the caller with [`Manager::merge_provider`])
/// 1. Environment variables prefixed `INSINT_`
/// 1. The user configuration file
/// 1. The system configuration file
/// 1. Hard-wired defaults (see [`Manager::apply_system_default`])
///
/// To see which files apply, run `insint --config-files`.
#[derive(Debug, Clone)]
pub struct Manager {
    /// Configuration data
    pub(super) data: Figment,
}

impl Manager {
    pub(super) fn new(apply_env: bool, apply_config_files: bool) -> Self {
        let mut new1 = Self {
            data: Figment::new(),
        };
        if apply_config_files {
            new1.add_config("system", system_config_path().as_deref());
            new1.add_config("user", user_config_path().as_deref());
        }
        if apply_env {
            new1.merge_provider(Env::prefixed(ENV_PREFIX));
        }
        new1
    }

    /// General constructor for production use.
    ///
    /// Reads the configuration files and the environment. The system default is not yet applied.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(true, true)
    }

    /// Testing/internal constructor, does not read files or the environment; DOES apply system default.
    #[must_use]
    #[cfg(test)]
    pub(crate) fn without_files() -> Self {
        let mut new1 = Self::new(false, false);
        new1.apply_system_default();
        new1
    }

    fn add_config(&mut self, what: &str, path: Option<&Path>) {
        let Some(path) = path else {
            warn!("could not determine {what} configuration file path");
            return;
        };
        if !path.exists() {
            debug!("{what} configuration file {} not present", path.display());
            return;
        }
        self.merge_config_file(path);
    }

    /// Returns the list of configuration files we read, in the order we read them
    #[must_use]
    pub fn config_files() -> Vec<String> {
        [system_config_path(), user_config_path()]
            .into_iter()
            .flatten()
            .map(|p| p.to_string_lossy().to_string())
            .collect()
    }

    /// Merges in a data set, which is some sort of [figment::Provider](https://docs.rs/figment/latest/figment/trait.Provider.html).
    /// This uses figment's `merge` operation, which prefers to _replace_ existing items.
    pub fn merge_provider<T>(&mut self, provider: T)
    where
        T: Provider,
    {
        let f = std::mem::take(&mut self.data);
        self.data = f.merge(provider);
    }

    /// Merges in the settings from a configuration file.
    ///
    /// A file that cannot be read or parsed is reported and otherwise ignored.
    pub fn merge_config_file<F>(&mut self, file: F)
    where
        F: AsRef<Path>,
    {
        let path = file.as_ref();
        match LocalConfigSource::read(path) {
            Ok(source) => self.merge_provider(source),
            Err(e) => warn!("parsing {}: {e:#}", path.display()),
        }
    }

    /// Applies the system default settings, at a lower priority than everything else
    pub fn apply_system_default(&mut self) {
        let f = std::mem::take(&mut self.data);
        self.data = f.join(Serialized::defaults(Configuration::system_default()));
    }

    /// Attempts to extract a particular struct from the data.
    ///
    /// Within insint, `T` is usually [Configuration], but it isn't intrinsically required to be.
    pub(crate) fn get<'de, T>(&self) -> Result<T, ConfigFileError>
    where
        T: Deserialize<'de>,
    {
        self.data.extract_lossy::<T>().map_err(ConfigFileError::from)
    }

    /// Extracts and validates the full configuration.
    ///
    /// The system default should have been applied first.
    pub fn configuration(&self) -> anyhow::Result<Configuration> {
        let config = self.get::<Configuration>()?;
        config.validate()?;
        Ok(config)
    }
}

/// The system-wide configuration file
fn system_config_path() -> Option<PathBuf> {
    Some(PathBuf::from("/etc").join(BASE_CONFIG_FILENAME))
}

/// The per-user configuration file
fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("insint").join(BASE_CONFIG_FILENAME))
}
