use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use strata_common::{Error, Result};
use tracing::info;

use crate::registry::{Registry, parse_file_stem};

/// Width of the first version in an empty directory.
const FIRST_VERSION_WIDTH: usize = 3;
/// Existing versions at least this wide are treated as `%Y%m%d%H%M%S` timestamps.
const TIMESTAMP_WIDTH: usize = 14;

/// Turn free text into a file-name slug: lowercase, runs of other characters become `_`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

/// The version a new migration should get, given the versions already present.
///
/// Sequential directories continue the sequence at the widest existing
/// width (three digits for an empty directory). Timestamp directories get the
/// current UTC time, bumped past the newest existing version if the clock is
/// behind it. Fails when the next version no longer fits the width, since a
/// wider version would sort before the existing ones.
pub fn next_version<'a>(existing: impl IntoIterator<Item = &'a str>) -> Result<String> {
    let existing: Vec<&str> = existing.into_iter().collect();
    let highest = existing.iter().filter_map(|v| v.parse::<u128>().ok()).max();
    let width = existing
        .iter()
        .map(|v| v.len())
        .max()
        .unwrap_or(FIRST_VERSION_WIDTH);

    let next = if width >= TIMESTAMP_WIDTH {
        let now: u128 = Utc::now()
            .format("%Y%m%d%H%M%S")
            .to_string()
            .parse()
            .unwrap_or(0);
        highest.map_or(now, |h| now.max(h + 1))
    } else {
        highest.map_or(1, |h| h + 1)
    };

    let version = format!("{next:0width$}");
    if version.len() > width {
        return Err(Error::Usage(format!(
            "next version {version} is wider than the existing {width}-digit versions and would \
             sort before them; rename the existing migrations with a wider zero-padded version"
        )));
    }
    Ok(version)
}

/// Create an empty migration file in the registry's directory.
pub fn create_migration(registry: &Registry, name: &str) -> Result<PathBuf> {
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(Error::Usage(format!(
            "migration name {name:?} has no usable characters"
        )));
    }

    fs::create_dir_all(registry.dir()).map_err(|e| {
        Error::Registry(format!(
            "failed to create migrations directory {}: {e}",
            registry.dir().display()
        ))
    })?;

    // Only names are needed here; a broken sibling file should not block scaffolding.
    let mut versions = Vec::new();
    for entry in fs::read_dir(registry.dir())? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == registry.extension()) {
            if let Some((version, _)) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(parse_file_stem)
            {
                versions.push(version);
            }
        }
    }

    let version = next_version(versions.iter().map(String::as_str))?;
    let path = registry
        .dir()
        .join(format!("{version}_{slug}.{}", registry.extension()));

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| Error::Registry(format!("failed to create {}: {e}", path.display())))?;
    write!(
        file,
        "-- Migration: {slug}\n-- Version: {version}\n-- Created: {}\n\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )?;

    info!("created migration {}", path.display());
    Ok(path)
}
