//! Configuration loading for Sprawl.
//!
//! Settings come from `SPRAWL_CONFIG_PATH`, `SPRAWL_CONFIG_JSON`, a default `sprawl.toml` /
//! `sprawl.json`, or built-in defaults, in that order. Every load goes through the guard rails
//! in [`validation`] before an engine is built from it. The `sprawl-crawl` binary wires the result
//! into a [`sprawl_core::orchestration::CrawlRuntime`].

#![allow(missing_docs)]

pub mod error;
pub mod loader;
pub mod settings;
pub mod telemetry;
pub mod validation;

pub use error::SettingsLoadError;
pub use loader::{SettingsLoad, SettingsLoader};
pub use settings::{CrawlerSettings, SettingsSource, StoreSettings};
pub use telemetry::init_tracing;
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails};
