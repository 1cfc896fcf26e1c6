use std::path::PathBuf;

use tracing::{debug, info};

use crate::{
    error::SettingsLoadError,
    settings::{CrawlerSettings, SettingsSource},
    validation::{ConfigWarnings, apply_guard_rails},
};

/// Settings that passed the guard rails, plus what was learned while loading them.
#[derive(Debug, Clone)]
pub struct SettingsLoad {
    pub settings: CrawlerSettings,
    pub source: SettingsSource,
    pub warnings: ConfigWarnings,
    pub env_file_loaded: bool,
}

/// Reads an optional `.env` file into the process environment, then resolves and validates
/// [`CrawlerSettings`].
#[derive(Debug, Clone, Default)]
pub struct SettingsLoader {
    env_file: Option<PathBuf>,
    skip_env_file: bool,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads this file instead of searching for `.env` upwards from the working directory.
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    pub fn without_env_file(mut self) -> Self {
        self.skip_env_file = true;
        self
    }

    pub fn load(&self) -> Result<SettingsLoad, SettingsLoadError> {
        let env_file_loaded = if self.skip_env_file {
            false
        } else {
            self.read_env_file()?
        };

        let (settings, source) =
            CrawlerSettings::load_from_env().map_err(SettingsLoadError::Settings)?;
        let warnings = apply_guard_rails(&settings)?;

        info!(target: "crawl::config", %source, env_file_loaded, warnings = warnings.len(), "crawler settings loaded");
        Ok(SettingsLoad {
            settings,
            source,
            warnings,
            env_file_loaded,
        })
    }

    fn read_env_file(&self) -> Result<bool, SettingsLoadError> {
        let outcome = match &self.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| path.clone()),
            None => dotenvy::dotenv(),
        };
        match outcome {
            Ok(path) => {
                debug!(target: "crawl::config", path = %path.display(), "env file applied");
                Ok(true)
            }
            Err(err) if err.not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
