//! Local package cache.
//!
//! Packages are stored flat in one directory under their deterministic
//! `<id>[-<version>].pkg` filename. Every write lands in a hidden temp file
//! in the same directory first and is then renamed into place, so a reader
//! never observes a half-written package and a crash leaves at most an
//! orphaned temp file behind.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::archive::{PackageLocator, read_metadata, read_metadata_named};
use crate::error::{PluginError, PluginResult};
use crate::model::{CachedPackage, PACKAGE_EXTENSION, PluginMetadata};

/// Prefix of in-flight temp files. Hidden from [`PackageCache::list`].
const PARTIAL_PREFIX: &str = ".partial-";

/// Maximum accepted package size (500 MB).
pub(crate) const MAX_PACKAGE_SIZE: u64 = 500_000_000;

/// Copy buffer size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Package files on local disk.
#[derive(Debug, Clone)]
pub struct PackageCache {
    dir: PathBuf,
}

impl PackageCache {
    /// Open (and create if needed) a cache rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> PluginResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of `filename` inside the cache (whether or not it exists).
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidPackageName`] if `filename` is not a
    /// plain `*.pkg` file name.
    pub fn path(&self, filename: &str) -> PluginResult<PathBuf> {
        validate_filename(filename)?;
        Ok(self.dir.join(filename))
    }

    /// Whether `filename` is present.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidPackageName`] for invalid filenames.
    pub fn contains(&self, filename: &str) -> PluginResult<bool> {
        Ok(self.path(filename)?.is_file())
    }

    /// Persist a package under an explicit filename.
    ///
    /// The stream is spooled to a temp file, synced, validated as a package,
    /// and atomically renamed into place. With `overwrite = false` an
    /// existing file is left untouched and [`PluginError::AlreadyExists`] is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the archive reader's errors for invalid packages, `AlreadyExists`
    /// on a non-overwrite conflict, and I/O errors.
    pub fn save<R: Read>(
        &self,
        filename: &str,
        reader: R,
        overwrite: bool,
    ) -> PluginResult<CachedPackage> {
        let target = self.path(filename)?;
        if !overwrite && target.exists() {
            return Err(PluginError::AlreadyExists(filename.to_string()));
        }
        let spooled = self.spool(reader)?;
        self.commit(spooled, filename.to_string(), overwrite)
    }

    /// Persist a package under the filename derived from its own metadata.
    ///
    /// # Errors
    ///
    /// Same as [`PackageCache::save`], plus
    /// [`PluginError::InvalidPackageName`] if the derived name is invalid.
    pub fn save_derived<R: Read>(&self, reader: R, overwrite: bool) -> PluginResult<CachedPackage> {
        let spooled = self.spool(reader)?;
        let filename = spooled.metadata.filename()?;
        self.commit(spooled, filename, overwrite)
    }

    /// Metadata of a cached package, or `None` if it is not cached.
    ///
    /// # Errors
    ///
    /// Returns the archive reader's errors if the cached file is unreadable.
    pub fn get(&self, filename: &str) -> PluginResult<Option<PluginMetadata>> {
        let path = self.path(filename)?;
        if !path.is_file() {
            return Ok(None);
        }
        read_metadata(&PackageLocator::Path(path)).map(Some)
    }

    /// Filenames of every cached package. In-flight temp files are skipped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be read.
    pub fn list(&self) -> PluginResult<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if validate_filename(&name).is_ok() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Delete a cached package. Returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error, including `NotFound` when the file is missing and
    /// `if_exists` is false.
    pub fn delete(&self, filename: &str, if_exists: bool) -> PluginResult<bool> {
        let path = self.path(filename)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(filename, "deleted cached package");
                Ok(true)
            },
            Err(e) if e.kind() == ErrorKind::NotFound && if_exists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy the stream into a synced temp file and read its metadata.
    fn spool<R: Read>(&self, mut reader: R) -> PluginResult<Spooled> {
        let mut file = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;

        let mut hasher = blake3::Hasher::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let chunk = buf.get(..n).unwrap_or_default();
            size = size.saturating_add(n as u64);
            if size > MAX_PACKAGE_SIZE {
                return Err(PluginError::PackageTooLarge {
                    size,
                    limit: MAX_PACKAGE_SIZE,
                });
            }
            hasher.update(chunk);
            file.write_all(chunk)?;
        }
        file.as_file().sync_all()?;

        let metadata = read_metadata_named(BufReader::new(file.reopen()?), "<upload>")?;

        Ok(Spooled {
            file,
            metadata,
            digest: hasher.finalize().to_hex().to_string(),
            size,
        })
    }

    /// Rename a spooled file into place.
    fn commit(
        &self,
        spooled: Spooled,
        filename: String,
        overwrite: bool,
    ) -> PluginResult<CachedPackage> {
        let target = self.path(&filename)?;
        let Spooled {
            file,
            metadata,
            digest,
            size,
        } = spooled;

        if overwrite {
            persist_replacing(file, &target)?;
        } else {
            file.persist_noclobber(&target).map_err(|e| {
                if e.error.kind() == ErrorKind::AlreadyExists {
                    PluginError::AlreadyExists(filename.clone())
                } else {
                    PluginError::Io(e.error)
                }
            })?;
        }

        info!(filename = %filename, plugin_id = %metadata.id, size, "cached package");
        Ok(CachedPackage {
            filename,
            path: target,
            metadata,
            digest,
            size,
        })
    }
}

/// A fully written, synced temp file and what was learned while writing it.
struct Spooled {
    file: NamedTempFile,
    metadata: PluginMetadata,
    digest: String,
    size: u64,
}

/// Atomic rename over `target`; if the filesystem refuses, remove the target
/// and retry once.
fn persist_replacing(file: NamedTempFile, target: &Path) -> PluginResult<File> {
    match file.persist(target) {
        Ok(f) => Ok(f),
        Err(e) => {
            warn!(
                target = %target.display(),
                error = %e.error,
                "atomic replace failed, retrying after removing target"
            );
            match std::fs::remove_file(target) {
                Ok(()) => {},
                Err(err) if err.kind() == ErrorKind::NotFound => {},
                Err(err) => return Err(err.into()),
            }
            e.file.persist(target).map_err(|e| PluginError::Io(e.error))
        },
    }
}

/// Accept only plain, visible `*.pkg` names.
fn validate_filename(filename: &str) -> PluginResult<()> {
    let invalid = |reason: &str| PluginError::InvalidPackageName {
        name: filename.to_string(),
        reason: reason.to_string(),
    };
    if filename.is_empty() {
        return Err(invalid("filename must not be empty"));
    }
    if filename.contains(['/', '\\', '\0']) || filename == ".." {
        return Err(invalid("filename must not contain path separators"));
    }
    if filename.starts_with('.') {
        return Err(invalid("filename must not be hidden"));
    }
    if Path::new(filename)
        .extension()
        .is_none_or(|ext| ext != PACKAGE_EXTENSION)
    {
        return Err(invalid("filename must end in .pkg"));
    }
    Ok(())
}
