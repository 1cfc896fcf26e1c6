use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use sprawl_core::orchestration::CrawlerConfig;

const PATH_VAR: &str = "SPRAWL_CONFIG_PATH";
const INLINE_VAR: &str = "SPRAWL_CONFIG_JSON";

const CANDIDATES: &[&str] = &[
    "sprawl.toml",
    "sprawl.json",
    "config/sprawl.toml",
    "config/sprawl.json",
];

/// Where parked requests and cached robots rules live.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreSettings {
    #[default]
    Memory,
    /// `cacache` directory; survives restarts.
    Disk { path: PathBuf },
}

/// Everything a crawl process reads at startup.
///
/// The engine knobs sit at the top level of the document, next to the process-level
/// `node_id` and `store` keys:
///
/// ```toml
/// node_id = "crawler-a"
/// waiting_ttl_secs = 3600
///
/// [scheduler]
/// max_crawl_depth = 4
/// include_domains = ["*.example.com"]
///
/// [throttle]
/// min_crawl_delay_ms = 2000
///
/// [store]
/// kind = "disk"
/// path = "/var/lib/sprawl"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlerSettings {
    /// Overrides the process-derived node id reported on completion events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(flatten)]
    pub crawler: CrawlerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsSource {
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl std::fmt::Display for SettingsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsSource::Default => f.write_str("built-in defaults"),
            SettingsSource::EnvPath(path) => write!(f, "{PATH_VAR}={}", path.display()),
            SettingsSource::EnvInline => f.write_str(INLINE_VAR),
            SettingsSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

impl CrawlerSettings {
    /// Resolves settings from the process environment and working directory.
    ///
    /// Order: `SPRAWL_CONFIG_PATH`, `SPRAWL_CONFIG_JSON`, the first default file that exists,
    /// then built-in defaults. Blank variables count as unset.
    pub fn load_from_env() -> anyhow::Result<(Self, SettingsSource)> {
        Self::load_with(|key| env::var(key).ok(), Path::new("."))
    }

    /// [`CrawlerSettings::load_from_env`] with an explicit variable lookup and base directory
    /// for the default file candidates.
    pub fn load_with<F>(lookup: F, base_dir: &Path) -> anyhow::Result<(Self, SettingsSource)>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path_str) = lookup(PATH_VAR)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str.trim());
            let settings = Self::load_from_file(&path)?;
            return Ok((settings, SettingsSource::EnvPath(path)));
        }

        if let Some(raw) = lookup(INLINE_VAR)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .with_context(|| format!("failed to parse {INLINE_VAR}"))?;
            return Ok((parsed, SettingsSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(base_dir) {
            let settings = Self::load_from_file(&path)?;
            return Ok((settings, SettingsSource::File(path)));
        }

        Ok((Self::default(), SettingsSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read crawler settings from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid crawler settings {}", path.display())),
            Some("toml") | Some("tml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid crawler settings {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    /// Parses a document of unknown format: TOML first, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse crawler settings {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid crawler settings json: {err}"))
    }

    fn find_default_file(base_dir: &Path) -> Option<PathBuf> {
        CANDIDATES
            .iter()
            .map(|candidate| base_dir.join(candidate))
            .find(|path| path.is_file())
    }
}
