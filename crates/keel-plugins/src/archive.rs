//! Package archive reader.
//!
//! A package is a gzip-compressed tar. It carries its metadata at
//! [`METADATA_PATH`], code units under `modules/`, and bundled dependency
//! packages under `lib/*.pkg`.
//!
//! Every read goes through one sequential entry walk that guards against:
//! - Path traversal (`../` components) and absolute paths
//! - Symlinks, hard links and device entries
//! - Excessive entry counts and declared sizes (gzip bombs)
//!
//! Reads never write anything, so extracting metadata from the same bytes
//! twice always yields the same result.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::ops::ControlFlow;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use crate::error::{PluginError, PluginResult};
use crate::model::{PACKAGE_EXTENSION, PluginMetadata, is_symbol_name};

/// Fixed path of the metadata entry inside every package.
pub const METADATA_PATH: &str = "META-INF/plugin.json";

/// Directory holding code units.
pub const MODULES_DIR: &str = "modules";

/// Directory holding bundled dependency packages.
pub const LIB_DIR: &str = "lib";

/// Separator between an outer package and a nested entry in a locator.
const NESTED_SEPARATOR: &str = "!/";

/// Maximum number of entries allowed in a package.
const MAX_ENTRY_COUNT: usize = 10_000;

/// Maximum total declared content size (500 MB).
const MAX_EXTRACTED_SIZE: u64 = 500_000_000;

/// Maximum size of the metadata document.
const MAX_METADATA_SIZE: u64 = 1_048_576;

/// Maximum nesting depth of a locator.
const MAX_NESTING_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// Locators
// ---------------------------------------------------------------------------

/// Where a package lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackageLocator {
    /// A package file on the local filesystem.
    Path(PathBuf),
    /// A package stored as an entry inside another package.
    Nested {
        /// The containing package.
        outer: Box<PackageLocator>,
        /// Entry path inside the outer package, e.g. `lib/json.pkg`.
        entry: String,
    },
}

impl PackageLocator {
    /// Locate a package file on disk.
    #[must_use]
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Locate an entry inside this package.
    #[must_use]
    pub fn nested(self, entry: impl Into<String>) -> Self {
        Self::Nested {
            outer: Box::new(self),
            entry: entry.into(),
        }
    }

    /// Parse `outer.pkg!/lib/inner.pkg` style locators.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidPackageName`] for empty segments, too
    /// many nesting levels, or nested entries that are absolute or contain
    /// `..`.
    pub fn parse(s: &str) -> PluginResult<Self> {
        let invalid = |reason: &str| PluginError::InvalidPackageName {
            name: s.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = s.split(NESTED_SEPARATOR);
        let root = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| invalid("locator must start with a file path"))?;
        let mut locator = Self::Path(PathBuf::from(root));

        for (depth, entry) in parts.enumerate() {
            if depth >= MAX_NESTING_DEPTH {
                return Err(invalid("too many nesting levels"));
            }
            if entry.is_empty() {
                return Err(invalid("nested entry must not be empty"));
            }
            validate_entry_path(Path::new(entry)).map_err(|_| invalid("nested entry escapes its container"))?;
            locator = locator.nested(entry);
        }
        Ok(locator)
    }

    /// Read the complete package bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::CorruptArchive`] if the file cannot be read or
    /// a nested entry is missing.
    pub fn read_bytes(&self) -> PluginResult<Vec<u8>> {
        match self {
            Self::Path(path) => std::fs::read(path).map_err(|e| self.corrupt(format!("cannot open: {e}"))),
            Self::Nested { outer, entry } => {
                let outer_bytes = outer.read_bytes()?;
                let mut found = None;
                visit_entries(&outer_bytes[..], &outer.to_string(), |path, reader| {
                    if path != entry.as_str() {
                        return Ok(ControlFlow::Continue(()));
                    }
                    let mut buf = Vec::new();
                    reader
                        .read_to_end(&mut buf)
                        .map_err(|e| self.corrupt(format!("cannot read entry: {e}")))?;
                    found = Some(buf);
                    Ok(ControlFlow::Break(()))
                })?;
                found.ok_or_else(|| self.corrupt(format!("no entry {entry} in {outer}")))
            },
        }
    }

    /// Open a sequential reader over the package bytes.
    fn open(&self) -> PluginResult<Box<dyn Read>> {
        match self {
            Self::Path(path) => {
                let file = File::open(path).map_err(|e| self.corrupt(format!("cannot open: {e}")))?;
                Ok(Box::new(BufReader::new(file)))
            },
            Self::Nested { .. } => Ok(Box::new(std::io::Cursor::new(self.read_bytes()?))),
        }
    }

    fn corrupt(&self, message: String) -> PluginError {
        PluginError::CorruptArchive {
            locator: self.to_string(),
            message,
        }
    }
}

impl fmt::Display for PackageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Nested { outer, entry } => write!(f, "{outer}{NESTED_SEPARATOR}{entry}"),
        }
    }
}

impl FromStr for PackageLocator {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Read the metadata of the package at `locator`.
///
/// # Errors
///
/// Returns [`PluginError::MetadataNotFound`] if the package has no metadata
/// entry, [`PluginError::CorruptArchive`] if the package cannot be opened or
/// the entry does not decode, and the guard errors for hostile archives.
pub fn read_metadata(locator: &PackageLocator) -> PluginResult<PluginMetadata> {
    read_metadata_named(locator.open()?, &locator.to_string())
}

/// Read package metadata from any sequential byte source.
///
/// This is the fallback for sources that cannot be random-accessed, such as
/// a remote download in flight.
///
/// # Errors
///
/// Same as [`read_metadata`].
pub fn read_metadata_from_reader<R: Read>(reader: R) -> PluginResult<PluginMetadata> {
    read_metadata_named(reader, "<stream>")
}

pub(crate) fn read_metadata_named<R: Read>(reader: R, origin: &str) -> PluginResult<PluginMetadata> {
    let mut metadata = None;
    visit_entries(reader, origin, |path, entry| {
        if path != METADATA_PATH {
            return Ok(ControlFlow::Continue(()));
        }
        metadata = Some(parse_metadata(entry, origin)?);
        Ok(ControlFlow::Break(()))
    })?;
    metadata.ok_or_else(|| PluginError::MetadataNotFound {
        locator: origin.to_string(),
    })
}

fn parse_metadata(entry: &mut dyn Read, origin: &str) -> PluginResult<PluginMetadata> {
    let corrupt = |message: String| PluginError::CorruptArchive {
        locator: origin.to_string(),
        message,
    };

    let mut buf = Vec::new();
    entry
        .take(MAX_METADATA_SIZE.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| corrupt(format!("cannot read {METADATA_PATH}: {e}")))?;
    if buf.len() as u64 > MAX_METADATA_SIZE {
        return Err(corrupt(format!(
            "{METADATA_PATH} exceeds {MAX_METADATA_SIZE} bytes"
        )));
    }

    let metadata: PluginMetadata = serde_json::from_slice(&buf)
        .map_err(|e| corrupt(format!("invalid {METADATA_PATH}: {e}")))?;
    metadata
        .check()
        .map_err(|reason| corrupt(format!("invalid {METADATA_PATH}: {reason}")))?;
    Ok(metadata)
}

// ---------------------------------------------------------------------------
// Module table
// ---------------------------------------------------------------------------

/// One code unit read from a package.
#[derive(Debug, Clone)]
pub(crate) struct ModuleSource {
    /// File extension, which selects the module runtime.
    pub(crate) extension: String,
    /// Raw code bytes.
    pub(crate) code: Arc<[u8]>,
    /// Entry the code came from, for diagnostics.
    pub(crate) origin: String,
}

/// Everything a loader needs from a package.
#[derive(Debug)]
pub(crate) struct PackageContents {
    pub(crate) metadata: PluginMetadata,
    /// Keyed by fully-qualified symbol name.
    pub(crate) modules: BTreeMap<String, ModuleSource>,
}

/// Read metadata and the full module table, including modules of bundled
/// `lib/*.pkg` packages.
///
/// The package's own modules win over bundled ones; between bundled packages
/// the first by entry name wins.
pub(crate) fn read_contents(locator: &PackageLocator) -> PluginResult<PackageContents> {
    let origin = locator.to_string();
    let mut metadata = None;
    let mut modules = BTreeMap::new();
    let mut libs: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    visit_entries(locator.open()?, &origin, |path, entry| {
        if path == METADATA_PATH {
            metadata = Some(parse_metadata(entry, &origin)?);
        } else if let Some((name, extension)) = module_symbol(path) {
            let source = read_module(entry, path, extension, &origin)?;
            if modules.insert(name.clone(), source).is_some() {
                return Err(PluginError::CorruptArchive {
                    locator: origin.clone(),
                    message: format!("symbol {name} is defined more than once"),
                });
            }
        } else if is_lib_package(path) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(|e| PluginError::CorruptArchive {
                locator: origin.clone(),
                message: format!("cannot read {path}: {e}"),
            })?;
            libs.insert(path.to_string(), buf);
        }
        Ok(ControlFlow::Continue(()))
    })?;

    let metadata = metadata.ok_or_else(|| PluginError::MetadataNotFound {
        locator: origin.clone(),
    })?;

    for (lib_path, bytes) in libs {
        let lib_origin = format!("{origin}{NESTED_SEPARATOR}{lib_path}");
        visit_entries(&bytes[..], &lib_origin, |path, entry| {
            let Some((name, extension)) = module_symbol(path) else {
                return Ok(ControlFlow::Continue(()));
            };
            if modules.contains_key(&name) {
                debug!(symbol = %name, lib = %lib_path, "bundled module shadowed");
                return Ok(ControlFlow::Continue(()));
            }
            let source = read_module(entry, path, extension, &lib_origin)?;
            modules.insert(name, source);
            Ok(ControlFlow::Continue(()))
        })?;
    }

    Ok(PackageContents { metadata, modules })
}

fn read_module(
    entry: &mut dyn Read,
    path: &str,
    extension: &str,
    origin: &str,
) -> PluginResult<ModuleSource> {
    let mut code = Vec::new();
    entry
        .read_to_end(&mut code)
        .map_err(|e| PluginError::CorruptArchive {
            locator: origin.to_string(),
            message: format!("cannot read {path}: {e}"),
        })?;
    Ok(ModuleSource {
        extension: extension.to_string(),
        code: code.into(),
        origin: format!("{origin}{NESTED_SEPARATOR}{path}"),
    })
}

/// Map `modules/a/b/C.ext` to (`a.b.C`, `ext`).
fn module_symbol(path: &str) -> Option<(String, &str)> {
    let rest = path.strip_prefix(MODULES_DIR)?.strip_prefix('/')?;
    let (stem, extension) = rest.rsplit_once('.')?;
    if stem.contains('.') || extension.is_empty() {
        return None;
    }
    let name = stem.replace('/', ".");
    is_symbol_name(&name).then_some((name, extension))
}

fn is_lib_package(path: &str) -> bool {
    path.strip_prefix(LIB_DIR)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|name| {
            !name.contains('/')
                && Path::new(name)
                    .extension()
                    .is_some_and(|ext| ext == PACKAGE_EXTENSION)
        })
}

// ---------------------------------------------------------------------------
// Guarded entry walk
// ---------------------------------------------------------------------------

/// Walk the regular-file entries of a gzip tar in order.
///
/// `visit` receives the normalized `/`-separated entry path and a reader over
/// the entry's content; returning `Break` stops the walk early.
fn visit_entries<R, F>(reader: R, origin: &str, mut visit: F) -> PluginResult<()>
where
    R: Read,
    F: FnMut(&str, &mut dyn Read) -> PluginResult<ControlFlow<()>>,
{
    let corrupt = |message: String| PluginError::CorruptArchive {
        locator: origin.to_string(),
        message,
    };

    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut entry_count = 0usize;
    let mut total_size: u64 = 0;

    for entry_result in archive
        .entries()
        .map_err(|e| corrupt(format!("failed to read archive entries: {e}")))?
    {
        let mut entry =
            entry_result.map_err(|e| corrupt(format!("failed to read archive entry: {e}")))?;

        entry_count = entry_count.saturating_add(1);
        if entry_count > MAX_ENTRY_COUNT {
            return Err(corrupt(format!(
                "archive exceeds maximum entry count ({MAX_ENTRY_COUNT})"
            )));
        }

        let entry_type = entry.header().entry_type();
        if !is_safe_entry_type(entry_type) {
            let entry_path = entry
                .path()
                .map_or_else(|_| "<unknown>".to_string(), |p| p.display().to_string());
            return Err(PluginError::UnsafeEntryType {
                entry_type: format!("{entry_type:?}"),
                path: entry_path,
            });
        }

        let entry_size = entry
            .header()
            .size()
            .map_err(|e| corrupt(format!("failed to read entry size: {e}")))?;
        total_size = total_size.saturating_add(entry_size);
        if total_size > MAX_EXTRACTED_SIZE {
            return Err(PluginError::PackageTooLarge {
                size: total_size,
                limit: MAX_EXTRACTED_SIZE,
            });
        }

        let raw_path = entry
            .path()
            .map_err(|e| corrupt(format!("failed to read entry path: {e}")))?
            .into_owned();
        validate_entry_path(&raw_path)?;

        if !entry_type.is_file() {
            continue;
        }
        let Some(path) = normalize_entry_path(&raw_path) else {
            return Err(corrupt(format!(
                "entry name is not valid UTF-8: {}",
                raw_path.display()
            )));
        };

        if visit(&path, &mut entry)?.is_break() {
            break;
        }
    }

    Ok(())
}

/// Check whether a tar entry type is safe to read.
///
/// Allows regular files, directories, and metadata headers. Rejects
/// symlinks, hardlinks, block/char devices, FIFOs, and GNU sparse entries.
fn is_safe_entry_type(entry_type: tar::EntryType) -> bool {
    matches!(
        entry_type,
        tar::EntryType::Regular
            | tar::EntryType::Directory
            | tar::EntryType::GNULongName
            | tar::EntryType::XHeader
            | tar::EntryType::XGlobalHeader
    )
}

/// Validate that an entry path has no traversal components or absolute paths.
fn validate_entry_path(path: &Path) -> PluginResult<()> {
    if path.is_absolute() {
        return Err(PluginError::PathTraversal {
            path: path.display().to_string(),
        });
    }

    for component in path.components() {
        if matches!(
            component,
            Component::ParentDir | Component::Prefix(_) | Component::RootDir
        ) {
            return Err(PluginError::PathTraversal {
                path: path.display().to_string(),
            });
        }
    }

    Ok(())
}

/// Join the normal components with `/`, dropping `./` segments.
fn normalize_entry_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        if let Component::Normal(segment) = component {
            parts.push(segment.to_str()?);
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
#[allow(clippy::arithmetic_side_effects)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::test_support::{metadata_json, package_bytes};

    /// Create a gzipped tarball with raw header bytes (bypasses tar crate
    /// validation), to exercise the guards.
    fn raw_tarball(path_bytes: &[u8], typeflag: u8, declared_size: u64, data: &[u8]) -> Vec<u8> {
        let mut header = [0u8; 512];
        let len = path_bytes.len().min(100);
        header[..len].copy_from_slice(&path_bytes[..len]);
        header[100..108].copy_from_slice(b"0000644\0");
        let size_str = format!("{declared_size:011o}\0");
        header[124..136].copy_from_slice(size_str.as_bytes());
        header[156] = typeflag;
        header[148..156].copy_from_slice(b"        ");
        let cksum: u32 = header.iter().map(|&b| u32::from(b)).sum();
        let cksum_str = format!("{cksum:06o}\0 ");
        header[148..156].copy_from_slice(cksum_str.as_bytes());

        let mut tar_data = Vec::new();
        tar_data.extend_from_slice(&header);
        tar_data.extend_from_slice(data);
        let padding = (512 - (data.len() % 512)) % 512;
        tar_data.extend(std::iter::repeat_n(0u8, padding));
        tar_data.extend(std::iter::repeat_n(0u8, 1024));

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&tar_data).unwrap();
        encoder.finish().unwrap()
    }

    fn sysinfo_package() -> Vec<u8> {
        package_bytes(&[
            (
                METADATA_PATH,
                metadata_json("sysinfo", Some("1.0"), "com.example.SysInfo").as_bytes(),
            ),
            ("modules/com/example/SysInfo.json", b"{}"),
        ])
    }

    #[test]
    fn metadata_extraction_is_deterministic() {
        let bytes = sysinfo_package();
        let first = read_metadata_from_reader(&bytes[..]).unwrap();
        let second = read_metadata_from_reader(&bytes[..]).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id.as_str(), "sysinfo");
        assert_eq!(first.version.as_deref(), Some("1.0"));
        assert_eq!(first.entry_point, "com.example.SysInfo");
    }

    #[test]
    fn metadata_from_path_matches_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysinfo.pkg");
        std::fs::write(&path, sysinfo_package()).unwrap();

        let from_path = read_metadata(&PackageLocator::path(&path)).unwrap();
        let from_stream = read_metadata_from_reader(&sysinfo_package()[..]).unwrap();
        assert_eq!(from_path, from_stream);
    }

    #[test]
    fn nested_locator_reads_inner_package() {
        let inner = package_bytes(&[(
            METADATA_PATH,
            metadata_json("json-lib", None, "org.json.Lib").as_bytes(),
        )]);
        let outer = package_bytes(&[
            (
                METADATA_PATH,
                metadata_json("outer", None, "com.example.Outer").as_bytes(),
            ),
            ("lib/json.pkg", &inner),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outer.pkg");
        std::fs::write(&path, outer).unwrap();

        let locator = PackageLocator::parse(&format!("{}!/lib/json.pkg", path.display())).unwrap();
        assert!(matches!(locator, PackageLocator::Nested { .. }));
        let metadata = read_metadata(&locator).unwrap();
        assert_eq!(metadata.id.as_str(), "json-lib");

        let missing = PackageLocator::path(&path).nested("lib/absent.pkg");
        assert!(matches!(
            read_metadata(&missing),
            Err(PluginError::CorruptArchive { .. })
        ));
    }

    #[test]
    fn locator_display_round_trips() {
        let locator = PackageLocator::parse("/tmp/a.pkg!/lib/b.pkg!/lib/c.pkg").unwrap();
        assert_eq!(locator.to_string(), "/tmp/a.pkg!/lib/b.pkg!/lib/c.pkg");
        assert!(PackageLocator::parse("").is_err());
        assert!(PackageLocator::parse("/tmp/a.pkg!/").is_err());
        assert!(PackageLocator::parse("/tmp/a.pkg!/../b.pkg").is_err());
    }

    #[test]
    fn missing_metadata_entry() {
        let bytes = package_bytes(&[("modules/com/example/Foo.json", b"{}")]);
        assert!(matches!(
            read_metadata_from_reader(&bytes[..]),
            Err(PluginError::MetadataNotFound { .. })
        ));
    }

    #[test]
    fn garbage_bytes_are_corrupt() {
        assert!(matches!(
            read_metadata_from_reader(&b"definitely not gzip"[..]),
            Err(PluginError::CorruptArchive { .. })
        ));
    }

    #[test]
    fn undecodable_metadata_is_corrupt() {
        let bytes = package_bytes(&[(METADATA_PATH, b"{ not json")]);
        assert!(matches!(
            read_metadata_from_reader(&bytes[..]),
            Err(PluginError::CorruptArchive { .. })
        ));

        let bad_id = package_bytes(&[(
            METADATA_PATH,
            br#"{"id":"Bad Id","name":"x","entryPoint":"a.B"}"#,
        )]);
        assert!(matches!(
            read_metadata_from_reader(&bad_id[..]),
            Err(PluginError::CorruptArchive { .. })
        ));
    }

    #[test]
    fn missing_file_is_corrupt() {
        let locator = PackageLocator::path("/nonexistent/dir/x.pkg");
        assert!(matches!(
            read_metadata(&locator),
            Err(PluginError::CorruptArchive { .. })
        ));
    }

    #[test]
    fn reject_path_traversal() {
        let tgz = raw_tarball(b"../../etc/passwd", b'0', 9, b"malicious");
        let err = read_metadata_from_reader(&tgz[..]).unwrap_err();
        assert!(matches!(err, PluginError::PathTraversal { .. }), "got: {err}");
    }

    #[test]
    fn reject_symlink_entry() {
        let tgz = raw_tarball(b"META-INF/plugin.json", b'2', 0, b"");
        let err = read_metadata_from_reader(&tgz[..]).unwrap_err();
        assert!(matches!(err, PluginError::UnsafeEntryType { .. }), "got: {err}");
    }

    #[test]
    fn reject_gzip_bomb() {
        let tgz = raw_tarball(b"bomb.bin", b'0', MAX_EXTRACTED_SIZE + 1, b"small");
        let err = read_metadata_from_reader(&tgz[..]).unwrap_err();
        assert!(matches!(err, PluginError::PackageTooLarge { .. }), "got: {err}");
    }

    #[test]
    fn module_table_includes_bundled_libs() {
        let lib = package_bytes(&[
            ("modules/org/json/Parser.json", b"{\"lib\":true}"),
            ("modules/com/example/SysInfo.json", b"{\"shadowed\":true}"),
        ]);
        let bytes = package_bytes(&[
            (
                METADATA_PATH,
                metadata_json("sysinfo", None, "com.example.SysInfo").as_bytes(),
            ),
            ("modules/com/example/SysInfo.json", b"{}"),
            ("modules/README", b"not a module"),
            ("lib/json.pkg", &lib),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysinfo.pkg");
        std::fs::write(&path, bytes).unwrap();

        let contents = read_contents(&PackageLocator::path(&path)).unwrap();
        let names: Vec<&str> = contents.modules.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["com.example.SysInfo", "org.json.Parser"]);
        assert_eq!(&*contents.modules["com.example.SysInfo"].code, b"{}");
        assert_eq!(contents.modules["org.json.Parser"].extension, "json");
    }

    #[test]
    fn module_symbol_mapping() {
        assert_eq!(
            module_symbol("modules/a/b/C.wasm"),
            Some(("a.b.C".to_string(), "wasm"))
        );
        assert_eq!(module_symbol("modules/C.json"), Some(("C".to_string(), "json")));
        assert_eq!(module_symbol("modules/a/b.c/D.wasm"), None);
        assert_eq!(module_symbol("modules/NoExt"), None);
        assert_eq!(module_symbol("other/a/B.wasm"), None);
        assert!(is_lib_package("lib/json.pkg"));
        assert!(!is_lib_package("lib/nested/json.pkg"));
        assert!(!is_lib_package("lib/json.jar"));
    }
}
