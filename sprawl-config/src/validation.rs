use sprawl_core::orchestration::{CrawlerConfig, DomainPattern, WorkerConfig};
use thiserror::Error;

use crate::settings::{CrawlerSettings, StoreSettings};

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{stage} stage max_concurrent_items must be at least 1")]
    ZeroConcurrency { stage: &'static str },
    #[error("{stage} stage item_timeout_ms must be greater than zero")]
    ZeroTimeout { stage: &'static str },
    #[error("throttle.backpressure_backoff_ms must be greater than zero")]
    ZeroBackoff,
    #[error("invalid {list} pattern '{pattern}': {reason}")]
    InvalidDomainPattern {
        list: &'static str,
        pattern: String,
        reason: String,
    },
    #[error("disk store requires a non-empty path")]
    EmptyStorePath,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Rejects settings the engine cannot run with and collects the ones it can run with but
/// probably should not.
pub fn apply_guard_rails(
    settings: &CrawlerSettings,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let config = &settings.crawler;
    let mut warnings = ConfigWarnings::default();

    check_stage("scheduler", &config.scheduler_stage)?;
    check_stage("ingest", &config.ingest_stage)?;

    if config.throttle.backpressure_backoff_ms == 0 {
        return Err(ConfigGuardRailError::ZeroBackoff);
    }

    check_patterns("include_domains", &config.scheduler.include_domains)?;
    check_patterns("exclude_domains", &config.scheduler.exclude_domains)?;

    if let StoreSettings::Disk { path } = &settings.store
        && path.as_os_str().is_empty()
    {
        return Err(ConfigGuardRailError::EmptyStorePath);
    }

    collect_soft_issues(config, &mut warnings);

    Ok(warnings)
}

fn check_stage(stage: &'static str, worker: &WorkerConfig) -> Result<(), ConfigGuardRailError> {
    if worker.max_concurrent_items == 0 {
        return Err(ConfigGuardRailError::ZeroConcurrency { stage });
    }
    if worker.item_timeout_ms == 0 {
        return Err(ConfigGuardRailError::ZeroTimeout { stage });
    }
    Ok(())
}

fn check_patterns(list: &'static str, patterns: &[String]) -> Result<(), ConfigGuardRailError> {
    for pattern in patterns {
        let invalid = |reason: &str| ConfigGuardRailError::InvalidDomainPattern {
            list,
            pattern: pattern.clone(),
            reason: reason.into(),
        };

        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if trimmed.contains("://") || trimmed.contains('/') {
            return Err(invalid("expected a host pattern, not a URL"));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '*')))
        {
            return Err(invalid(&format!("unexpected character {bad:?}")));
        }
        if trimmed.split('.').any(str::is_empty) {
            return Err(invalid("empty label"));
        }
        DomainPattern::new(trimmed).map_err(|err| invalid(&err.to_string()))?;
    }
    Ok(())
}

fn collect_soft_issues(config: &CrawlerConfig, warnings: &mut ConfigWarnings) {
    if config.throttle.min_crawl_delay_ms == 0 {
        warnings.push_with_hint(
            "throttle.min_crawl_delay_ms is 0; consecutive fetches to one domain are not spaced",
            "Set a crawl delay of at least a few hundred milliseconds for public sites",
        );
    }

    if config.throttle.max_pending_ingest == 0 {
        warnings.push("throttle.max_pending_ingest is 0; treating it as 1");
    }

    if !config.scheduler.respect_robots {
        warnings.push_with_hint(
            "scheduler.respect_robots is false; robots.txt rules are ignored",
            "Only disable robots handling for hosts you operate",
        );
    }

    if config.scheduler.respect_robots && config.scheduler.robots_cache_prefix.trim().is_empty() {
        warnings.push(
            "scheduler.robots_cache_prefix is empty; robots entries share the parking keyspace",
        );
    }

    if config.waiting_ttl_secs.is_none() {
        warnings.push_with_hint(
            "waiting_ttl_secs is unset; parked requests never expire",
            "Set waiting_ttl_secs so abandoned robots lookups do not accumulate",
        );
    }

    for pattern in &config.scheduler.include_domains {
        if config
            .scheduler
            .exclude_domains
            .iter()
            .any(|excluded| excluded.trim().eq_ignore_ascii_case(pattern.trim()))
        {
            warnings.push(format!(
                "domain pattern '{pattern}' is both included and excluded; exclusion wins"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_without_warnings() {
        let warnings = apply_guard_rails(&CrawlerSettings::default()).expect("defaults are valid");
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings.items);
    }

    #[test]
    fn zero_concurrency_and_timeout_are_rejected() {
        let mut settings = CrawlerSettings::default();
        settings.crawler.ingest_stage.max_concurrent_items = 0;
        assert!(matches!(
            apply_guard_rails(&settings),
            Err(ConfigGuardRailError::ZeroConcurrency { stage: "ingest" })
        ));

        let mut settings = CrawlerSettings::default();
        settings.crawler.scheduler_stage.item_timeout_ms = 0;
        assert!(matches!(
            apply_guard_rails(&settings),
            Err(ConfigGuardRailError::ZeroTimeout { stage: "scheduler" })
        ));
    }

    #[test]
    fn url_shaped_patterns_are_rejected() {
        for bad in ["https://example.com", "example.com/path", "", "a..b", "ex ample.com"] {
            let mut settings = CrawlerSettings::default();
            settings.crawler.scheduler.include_domains = vec![bad.to_string()];
            assert!(
                matches!(
                    apply_guard_rails(&settings),
                    Err(ConfigGuardRailError::InvalidDomainPattern { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn wildcard_patterns_are_accepted() {
        let mut settings = CrawlerSettings::default();
        settings.crawler.scheduler.include_domains = vec!["*.example.com".into(), "docs.rs".into()];
        settings.crawler.scheduler.exclude_domains = vec!["ads.*.example.com".into()];
        assert!(apply_guard_rails(&settings).is_ok());
    }

    #[test]
    fn soft_issues_become_warnings() {
        let mut settings = CrawlerSettings::default();
        settings.crawler.throttle.min_crawl_delay_ms = 0;
        settings.crawler.scheduler.respect_robots = false;
        settings.crawler.waiting_ttl_secs = None;
        settings.crawler.scheduler.include_domains = vec!["example.com".into()];
        settings.crawler.scheduler.exclude_domains = vec!["EXAMPLE.com".into()];

        let warnings = apply_guard_rails(&settings).expect("still valid");
        assert_eq!(warnings.len(), 4);
        assert!(warnings.items.iter().any(|w| w.message.contains("exclusion wins")));
    }
}
