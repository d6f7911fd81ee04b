//! Plugin metadata, info-store records and cached package descriptors.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::plugin::PluginId;

/// File extension of plugin packages.
pub const PACKAGE_EXTENSION: &str = "pkg";

/// Metadata embedded in every package at `META-INF/plugin.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    /// Stable plugin identifier.
    pub id: PluginId,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional version string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Fully-qualified symbol name of the entry-point type.
    pub entry_point: String,
}

impl PluginMetadata {
    /// Deterministic cache filename: `<id>[-<version>].pkg`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidPackageName`] if the version is empty or
    /// contains characters that cannot appear in a filename.
    pub fn filename(&self) -> PluginResult<String> {
        match &self.version {
            None => Ok(format!("{}.{PACKAGE_EXTENSION}", self.id)),
            Some(version) => {
                validate_version(version)?;
                Ok(format!("{}-{version}.{PACKAGE_EXTENSION}", self.id))
            },
        }
    }

    /// Check the fields serde cannot check.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if !is_symbol_name(&self.entry_point) {
            return Err(format!(
                "entryPoint '{}' is not a dotted symbol name",
                self.entry_point
            ));
        }
        if let Some(version) = &self.version {
            validate_version(version).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

fn validate_version(version: &str) -> PluginResult<()> {
    let invalid = |reason: &str| PluginError::InvalidPackageName {
        name: version.to_string(),
        reason: reason.to_string(),
    };
    if version.is_empty() {
        return Err(invalid("version must not be empty"));
    }
    if version.contains(['/', '\\', '\0']) || version.contains("..") {
        return Err(invalid("version must not contain path separators"));
    }
    if version.chars().any(char::is_whitespace) {
        return Err(invalid("version must not contain whitespace"));
    }
    Ok(())
}

/// Whether `name` is a dotted identifier such as `com.example.SysInfo`.
pub(crate) fn is_symbol_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        })
}

/// One known plugin, as kept by the info store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    /// Metadata read from the package.
    pub metadata: PluginMetadata,
    /// Path of the package in the remote repository.
    pub storage_key: String,
    /// Whether the plugin should be active.
    pub enabled: bool,
}

impl PluginRecord {
    /// A new, disabled record.
    #[must_use]
    pub fn new(metadata: PluginMetadata, storage_key: impl Into<String>) -> Self {
        Self {
            metadata,
            storage_key: storage_key.into(),
            enabled: false,
        }
    }

    /// The plugin id.
    #[must_use]
    pub fn id(&self) -> &PluginId {
        &self.metadata.id
    }
}

/// A package persisted in the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPackage {
    /// Cache filename.
    pub filename: String,
    /// Absolute location on disk.
    pub path: PathBuf,
    /// Metadata read from the persisted bytes.
    pub metadata: PluginMetadata,
    /// blake3 hex digest of the package bytes.
    pub digest: String,
    /// Package size in bytes.
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(version: Option<&str>) -> PluginMetadata {
        PluginMetadata {
            id: PluginId::from_static("sysinfo"),
            name: "System Info".into(),
            description: None,
            version: version.map(String::from),
            entry_point: "com.example.SysInfo".into(),
        }
    }

    #[test]
    fn filename_with_and_without_version() {
        assert_eq!(metadata(None).filename().unwrap(), "sysinfo.pkg");
        assert_eq!(metadata(Some("1.0")).filename().unwrap(), "sysinfo-1.0.pkg");
    }

    #[test]
    fn filename_rejects_path_like_versions() {
        for bad in ["../x", "1/0", "", "1 0", "a\\b"] {
            assert!(
                matches!(
                    metadata(Some(bad)).filename(),
                    Err(PluginError::InvalidPackageName { .. })
                ),
                "version {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn metadata_uses_camel_case_json() {
        let json = r#"{"id":"sysinfo","name":"System Info","version":"1.0","entryPoint":"com.example.SysInfo"}"#;
        let parsed: PluginMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, metadata(Some("1.0")));
        assert!(parsed.check().is_ok());
        let out = serde_json::to_string(&parsed).unwrap();
        assert!(out.contains("\"entryPoint\""));
        assert!(!out.contains("description"));
    }

    #[test]
    fn symbol_names() {
        assert!(is_symbol_name("com.example.SysInfo"));
        assert!(is_symbol_name("Main"));
        assert!(!is_symbol_name(""));
        assert!(!is_symbol_name("com..Foo"));
        assert!(!is_symbol_name("com/example/Foo"));
        assert!(!is_symbol_name("1abc"));
    }

    #[test]
    fn record_starts_disabled() {
        let record = PluginRecord::new(metadata(None), "plugins/sysinfo.pkg");
        assert!(!record.enabled);
        assert_eq!(record.id().as_str(), "sysinfo");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"storageKey\":\"plugins/sysinfo.pkg\""));
    }
}
