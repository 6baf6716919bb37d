//! Candidate file discovery by file-name suffix.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};
use walkdir::{DirEntry, WalkDir};

use crate::io::config::DiscoveryConfig;

/// Files found under the project root (or the targeted hierarchy).
///
/// Paths are relative to the root, sorted and unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectFiles {
    /// Source files that are not tests.
    pub sources: Vec<PathBuf>,
    pub tests: Vec<PathBuf>,
}

impl ProjectFiles {
    pub fn discover(root: &Path, hierarchy: Option<&Path>, cfg: &DiscoveryConfig) -> Result<Self> {
        let sources = find_source_files(root, hierarchy, false, cfg)?;
        let tests = find_test_files(root, hierarchy, cfg)?;
        debug!(sources = sources.len(), tests = tests.len(), "discovered files");
        Ok(Self { sources, tests })
    }

    /// Sources and tests merged in sorted order.
    pub fn all_sources(&self) -> Vec<PathBuf> {
        let merged: BTreeSet<&PathBuf> = self.sources.iter().chain(&self.tests).collect();
        merged.into_iter().cloned().collect()
    }
}

/// Test files under `root` (narrowed to `hierarchy` when set).
#[instrument(skip(cfg))]
pub fn find_test_files(
    root: &Path,
    hierarchy: Option<&Path>,
    cfg: &DiscoveryConfig,
) -> Result<Vec<PathBuf>> {
    walk(root, hierarchy, cfg, |name| is_test_file(name, cfg))
}

/// Source files under `root`, optionally including test files.
#[instrument(skip(cfg))]
pub fn find_source_files(
    root: &Path,
    hierarchy: Option<&Path>,
    include_tests: bool,
    cfg: &DiscoveryConfig,
) -> Result<Vec<PathBuf>> {
    walk(root, hierarchy, cfg, |name| {
        is_source_file(name, cfg) && (include_tests || !is_test_file(name, cfg))
    })
}

fn is_test_file(name: &str, cfg: &DiscoveryConfig) -> bool {
    cfg.test_suffixes
        .iter()
        .any(|suffix| name.ends_with(suffix.as_str()))
}

fn is_source_file(name: &str, cfg: &DiscoveryConfig) -> bool {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty() && cfg.source_extensions.iter().any(|allowed| allowed == ext)
}

fn walk<F>(
    root: &Path,
    hierarchy: Option<&Path>,
    cfg: &DiscoveryConfig,
    mut accept: F,
) -> Result<Vec<PathBuf>>
where
    F: FnMut(&str) -> bool,
{
    let start = match hierarchy {
        Some(sub) => root.join(sub),
        None => root.to_path_buf(),
    };
    if !start.exists() {
        bail!("hierarchy {} does not exist", start.display());
    }

    let mut found = BTreeSet::new();
    let walker = WalkDir::new(&start)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_ignored_dir(entry, cfg));
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", start.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !accept(&name) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        found.insert(relative);
    }
    Ok(found.into_iter().collect())
}

fn is_ignored_dir(entry: &DirEntry, cfg: &DiscoveryConfig) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    cfg.ignore_dirs.iter().any(|ignored| *ignored == name)
}
