//! Shared namespace patterns.

use crate::error::{PluginError, PluginResult};

/// Runtime namespaces every plugin shares with the host.
const RUNTIME_PATTERNS: &[&str] = &["std.*", "core.*", "alloc.*"];

/// Contract packages exposed to every plugin.
const CONTRACT_PATTERNS: &[&str] = &["keel.api.*", "keel.common.*"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    /// Stored without the trailing `*`.
    Prefix(String),
}

impl Pattern {
    fn parse(raw: &str) -> PluginResult<Self> {
        let invalid = |reason: &str| PluginError::InvalidPackageName {
            name: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(invalid("shared pattern must not be empty"));
        }
        match raw.find('*') {
            None => Ok(Self::Exact(raw.to_string())),
            Some(pos) if pos.saturating_add(1) == raw.len() => {
                if pos == 0 {
                    return Err(invalid("a bare '*' would share every symbol"));
                }
                Ok(Self::Prefix(raw[..pos].to_string()))
            },
            Some(_) => Err(invalid("'*' is only allowed as the final character")),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == name,
            Self::Prefix(prefix) => name.len() > prefix.len() && name.starts_with(prefix.as_str()),
        }
    }
}

/// Names resolved through the host before the plugin's own package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedPatterns {
    patterns: Vec<Pattern>,
}

impl Default for SharedPatterns {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedPatterns {
    /// The runtime namespaces plus the contract allow-list.
    #[must_use]
    pub fn new() -> Self {
        let patterns = RUNTIME_PATTERNS
            .iter()
            .chain(CONTRACT_PATTERNS)
            .filter_map(|p| Pattern::parse(p).ok())
            .collect();
        Self { patterns }
    }

    /// Add extra patterns. `foo.bar.*` is a prefix match, anything else is
    /// exact.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidPackageName`] for an empty pattern, a
    /// bare `*`, or a `*` anywhere but the final position.
    pub fn with_patterns<I, S>(mut self, extra: I) -> PluginResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for raw in extra {
            let pattern = Pattern::parse(raw.as_ref())?;
            if !self.patterns.contains(&pattern) {
                self.patterns.push(pattern);
            }
        }
        Ok(self)
    }

    /// Whether `name` is shared with the host.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    /// Number of patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Always false; the defaults are never removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
