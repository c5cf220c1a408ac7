//! Migration discovery.
//!
//! Migrations are files named `<version>_<name>.<ext>` in a single directory.
//! Versions are compared as strings, so they must be fixed-width (zero-padded
//! sequence numbers or timestamps) for lexical order to match apply order.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use ring::digest::{SHA256, digest};
use serde::Serialize;
use strata_common::{Error, Result};
use tracing::debug;

/// First-line directive that opts a script out of the wrapping transaction.
pub const NO_TRANSACTION_DIRECTIVE: &str = "-- strata:no-transaction";

static FILE_STEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<version>[0-9]+)_(?P<name>[A-Za-z0-9][A-Za-z0-9_\-]*)$")
        .expect("migration file pattern is valid")
});

/// A single versioned schema change, as found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub version: String,
    pub name: String,
    #[serde(skip)]
    pub script: String,
    pub checksum: String,
    pub path: PathBuf,
}

impl Migration {
    pub fn new(version: impl Into<String>, name: impl Into<String>, script: impl Into<String>) -> Self {
        let script = script.into();
        Self {
            version: version.into(),
            name: name.into(),
            checksum: checksum(script.as_bytes()),
            script,
            path: PathBuf::new(),
        }
    }

    /// Scripts run inside a transaction unless they open with
    /// [`NO_TRANSACTION_DIRECTIVE`].
    pub fn is_transactional(&self) -> bool {
        self.script
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .is_none_or(|first| !first.eq_ignore_ascii_case(NO_TRANSACTION_DIRECTIVE))
    }
}

/// Hex-encoded SHA-256 of the exact script bytes.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(digest(&SHA256, bytes))
}

/// Whether `version` is the reserved bootstrap version (all zeroes).
pub fn is_bootstrap_version(version: &str) -> bool {
    !version.is_empty() && version.bytes().all(|b| b == b'0')
}

/// Split a file stem into `(version, name)`.
pub fn parse_file_stem(stem: &str) -> Option<(String, String)> {
    let caps = FILE_STEM.captures(stem)?;
    Some((caps["version"].to_string(), caps["name"].to_string()))
}

/// Discovers migrations in a directory.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
    extension: String,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// All migrations, sorted ascending by version.
    ///
    /// Fails if the directory cannot be read, a matching file has a malformed
    /// name or non-UTF-8 content, a file uses the reserved bootstrap version,
    /// or two files share a version.
    pub fn list(&self) -> Result<Vec<Migration>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            Error::Registry(format!(
                "failed to read migrations directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| Error::Registry(format!("failed to read directory entry: {e}")))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == self.extension.as_str())
            {
                paths.push(path);
            }
        }
        paths.sort();

        let mut migrations = Vec::with_capacity(paths.len());
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        for path in paths {
            let migration = load_file(&path)?;
            if let Some(previous) = seen.insert(migration.version.clone(), path.clone()) {
                return Err(Error::Registry(format!(
                    "duplicate migration version {}: {} and {}",
                    migration.version,
                    previous.display(),
                    path.display()
                )));
            }
            debug!(version = %migration.version, name = %migration.name, "discovered migration");
            migrations.push(migration);
        }

        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(migrations)
    }
}

fn load_file(path: &Path) -> Result<Migration> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Registry(format!("invalid migration file name: {}", path.display())))?;

    let (version, name) = parse_file_stem(stem).ok_or_else(|| {
        Error::Registry(format!(
            "migration file {} must be named <version>_<name>",
            path.display()
        ))
    })?;

    if is_bootstrap_version(&version) {
        return Err(Error::Registry(format!(
            "version {version} is reserved for the history table ({})",
            path.display()
        )));
    }

    let bytes = fs::read(path)
        .map_err(|e| Error::Registry(format!("failed to read {}: {e}", path.display())))?;
    let checksum = checksum(&bytes);
    let script = String::from_utf8(bytes)
        .map_err(|_| Error::Registry(format!("{} is not valid UTF-8", path.display())))?;

    Ok(Migration {
        version,
        name,
        script,
        checksum,
        path: path.to_path_buf(),
    })
}
