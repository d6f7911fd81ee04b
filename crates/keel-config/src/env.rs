//! Environment variable fallbacks.
//!
//! Env vars are **fallback**, not override: they only fill fields that no
//! config file set (fields still at their compiled-in default).

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::merge::{ConfigLayer, FieldSources};

/// Mapping from environment variable name to config field path.
struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: FieldKind,
}

#[derive(Clone, Copy)]
enum FieldKind {
    String,
    Integer,
}

/// All supported `KEEL_*` env var mappings.
const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "KEEL_CACHE_DIR",
        field_path: "cache.dir",
        kind: FieldKind::String,
    },
    EnvMapping {
        var_name: "KEEL_REPOSITORY_ROOT",
        field_path: "repository.root",
        kind: FieldKind::String,
    },
    EnvMapping {
        var_name: "KEEL_INFO_DIR",
        field_path: "info.dir",
        kind: FieldKind::String,
    },
    EnvMapping {
        var_name: "KEEL_LOCK_DIR",
        field_path: "lock.dir",
        kind: FieldKind::String,
    },
    EnvMapping {
        var_name: "KEEL_LOCK_TTL_SECS",
        field_path: "lock.ttl_secs",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "KEEL_SCAN_INTERVAL_SECS",
        field_path: "scanner.interval_secs",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "KEEL_LOG_LEVEL",
        field_path: "logging.level",
        kind: FieldKind::String,
    },
];

/// Snapshot the process environment restricted to `KEEL_*` variables.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("KEEL_"))
        .collect()
}

/// Apply environment variable fallbacks to fields that were **not** set by
/// any config file layer.
///
/// Returns the number of env vars applied.
pub fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env_vars: &HashMap<String, String, S>,
) -> usize {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        if matches!(
            sources.get(mapping.field_path),
            Some(ConfigLayer::User | ConfigLayer::Explicit)
        ) {
            continue;
        }

        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };
        let Some(value) = coerce(mapping.kind, raw) else {
            warn!(
                var = mapping.var_name,
                value = %raw,
                "ignoring env var with a value of the wrong type"
            );
            continue;
        };

        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var fallback"
        );
        set_field(merged, mapping.field_path, value);
        sources.insert(mapping.field_path.to_owned(), ConfigLayer::Environment);
        count = count.saturating_add(1);
    }

    count
}

fn coerce(kind: FieldKind, raw: &str) -> Option<toml::Value> {
    match kind {
        FieldKind::String => Some(toml::Value::String(raw.to_owned())),
        FieldKind::Integer => raw.trim().parse::<i64>().ok().map(toml::Value::Integer),
    }
}

/// Set a dotted field in the TOML tree, creating intermediate tables.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return;
    };

    let mut current = root;
    for segment in segments {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        current = table
            .entry(segment)
            .or_insert(toml::Value::Table(toml::map::Map::new()));
    }
    if let Some(table) = current.as_table_mut() {
        table.insert(leaf.to_owned(), value);
    }
}
