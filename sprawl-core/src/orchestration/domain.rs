use std::{fmt, net::IpAddr};

use serde::{Deserialize, Serialize};

/// Maps a host to its registrable domain, the key used for per-domain pacing.
pub trait DomainSuffixParser: Send + Sync + fmt::Debug {
    fn is_valid_domain(&self, host: &str) -> bool;

    /// Registrable domain of `host`, or `None` when it has none (IP literals, bare suffixes).
    fn parse(&self, host: &str) -> Option<String>;
}

/// Public suffixes with more than one label that are common enough to matter for pacing.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "ltd.uk", "plc.uk", "me.uk", "net.uk", "com.au",
    "net.au", "org.au", "edu.au", "gov.au", "co.nz", "org.nz", "govt.nz", "co.jp", "ne.jp",
    "or.jp", "ac.jp", "co.kr", "or.kr", "com.br", "net.br", "org.br", "com.cn", "net.cn",
    "org.cn", "com.mx", "com.ar", "com.tr", "co.in", "net.in", "org.in", "co.za", "com.sg",
    "com.hk", "com.tw", "co.il", "github.io", "gitlab.io", "blogspot.com", "herokuapp.com",
];

/// Suffix parser backed by a small built-in list of multi-label suffixes.
///
/// Hosts whose last two labels match the list keep three labels; everything else keeps two.
#[derive(Clone, Debug, Default)]
pub struct SuffixListParser {
    extra_suffixes: Vec<String>,
}

impl SuffixListParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds private or regional suffixes on top of the built-in list.
    pub fn with_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_suffixes.extend(
            suffixes
                .into_iter()
                .map(|suffix| suffix.into().trim_matches('.').to_ascii_lowercase()),
        );
        self
    }

    fn is_multi_label_suffix(&self, candidate: &str) -> bool {
        MULTI_LABEL_SUFFIXES.contains(&candidate)
            || self.extra_suffixes.iter().any(|suffix| suffix == candidate)
    }
}

fn normalise(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl DomainSuffixParser for SuffixListParser {
    fn is_valid_domain(&self, host: &str) -> bool {
        let host = normalise(host);
        if host.is_empty() || host == "localhost" || host.parse::<IpAddr>().is_ok() {
            return false;
        }
        let labels: Vec<&str> = host.split('.').collect();
        labels.len() >= 2
            && labels.iter().all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            })
    }

    fn parse(&self, host: &str) -> Option<String> {
        if !self.is_valid_domain(host) {
            return None;
        }
        let host = normalise(host);
        let labels: Vec<&str> = host.split('.').collect();
        let keep = if labels.len() >= 2
            && self.is_multi_label_suffix(&labels[labels.len() - 2..].join("."))
        {
            3
        } else {
            2
        };
        if labels.len() < keep {
            return None;
        }
        Some(labels[labels.len() - keep..].join("."))
    }
}

/// Release state of one domain inside the ingest scheduler. A domain with no state is `Inactive`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DomainState {
    Inactive,
    /// An entry for the domain sits in the delay queue.
    Queued,
    /// An entry for the domain was handed to the ingest stage and has not completed yet.
    Ingesting,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainState::Inactive => write!(f, "inactive"),
            DomainState::Queued => write!(f, "queued"),
            DomainState::Ingesting => write!(f, "ingesting"),
        }
    }
}
