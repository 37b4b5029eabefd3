//! Declarative path policy.
//!
//! Maps path prefixes to the protection an exchange must carry. The table
//! is evaluated once per request; the longest matching prefix wins.

use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;

/// Protection required on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathPolicy {
    /// Never intercepted.
    Skip,
    /// Protection applied only when the client asks for it.
    #[default]
    Optional,
    TransportRequired,
    LayeredRequired,
    /// Transport envelope around a layered body.
    Both,
}

impl PathPolicy {
    pub fn requires_transport(self) -> bool {
        matches!(self, Self::TransportRequired | Self::Both)
    }

    pub fn requires_layered(self) -> bool {
        matches!(self, Self::LayeredRequired | Self::Both)
    }
}

/// Prefix rules plus a fallback for unmatched paths.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    rules: Vec<(String, PathPolicy)>,
    fallback: PathPolicy,
}

impl PolicyTable {
    pub fn new(fallback: PathPolicy) -> Self {
        Self {
            rules: Vec::new(),
            fallback,
        }
    }

    /// Excluded paths and the session routes are skipped; high-security paths
    /// need both layers.
    pub fn from_config(config: &TransportConfig) -> Self {
        let mut table = Self::new(PathPolicy::Optional);
        for prefix in &config.excluded_paths {
            table = table.with_rule(prefix, PathPolicy::Skip);
        }
        table = table.with_rule(&config.session_route_prefix, PathPolicy::Skip);
        for prefix in &config.high_security_paths {
            table = table.with_rule(prefix, PathPolicy::Both);
        }
        table
    }

    /// Add or replace the rule for `prefix`.
    pub fn with_rule(mut self, prefix: &str, policy: PathPolicy) -> Self {
        match self.rules.iter_mut().find(|(p, _)| p == prefix) {
            Some(rule) => rule.1 = policy,
            None => self.rules.push((prefix.to_string(), policy)),
        }
        self
    }

    pub fn evaluate(&self, path: &str) -> PathPolicy {
        self.rules
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(self.fallback, |(_, policy)| *policy)
    }
}
