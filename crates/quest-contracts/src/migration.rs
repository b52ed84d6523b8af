use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::paths::{PluginPaths, LOG_FILE_NAME, PLUGIN_SLUG};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovedEntry {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub logs: Vec<MovedEntry>,
    pub settings: Vec<MovedEntry>,
    pub runtime: Vec<MovedEntry>,
}

impl MigrationReport {
    pub fn total(&self) -> usize {
        self.logs.len() + self.settings.len() + self.runtime.len()
    }
}

/// Where a pre-loader-managed install kept its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyLayout {
    pub logs: Vec<PathBuf>,
    pub settings: Vec<PathBuf>,
    pub runtime: Vec<PathBuf>,
}

impl LegacyLayout {
    pub fn for_paths(paths: &PluginPaths) -> Self {
        let config_root = paths.user_home.join(".config").join(PLUGIN_SLUG);
        Self {
            logs: vec![config_root.join(LOG_FILE_NAME)],
            settings: vec![
                paths
                    .host_home
                    .join("settings")
                    .join(format!("{PLUGIN_SLUG}.json")),
                config_root,
            ],
            runtime: vec![
                paths.host_home.join(PLUGIN_SLUG),
                paths
                    .user_home
                    .join(".local")
                    .join("share")
                    .join(PLUGIN_SLUG),
            ],
        }
    }
}

pub fn migrate_legacy(paths: &PluginPaths) -> MigrationReport {
    let legacy = LegacyLayout::for_paths(paths);
    MigrationReport {
        logs: migrate_any(&paths.log_dir, &legacy.logs),
        settings: migrate_any(&paths.settings_dir, &legacy.settings),
        runtime: migrate_any(&paths.runtime_dir, &legacy.runtime),
    }
}

/// Move each source into `target_dir`. A file lands at `<target>/<name>`; a
/// directory has each of its children moved to `<target>/<child name>`.
/// Missing sources are skipped and existing destinations are never replaced.
pub fn migrate_any(target_dir: &Path, sources: &[PathBuf]) -> Vec<MovedEntry> {
    let mut moved = Vec::new();
    for source in sources {
        if !source.exists() {
            continue;
        }
        if source.is_dir() {
            let entries = match fs::read_dir(source) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!("failed listing {}: {err}", source.display());
                    continue;
                }
            };
            for entry in entries.flatten() {
                let child = entry.path();
                if let Some(done) = migrate_entry(target_dir, &child) {
                    moved.push(done);
                }
            }
        } else if let Some(done) = migrate_entry(target_dir, source) {
            moved.push(done);
        }
    }
    moved
}

fn migrate_entry(target_dir: &Path, source: &Path) -> Option<MovedEntry> {
    let name = source.file_name()?;
    let destination = target_dir.join(name);
    if destination.exists() {
        tracing::warn!(
            "not migrating {}: {} already exists",
            source.display(),
            destination.display()
        );
        return None;
    }
    match move_path(source, &destination) {
        Ok(()) => {
            tracing::info!("migrated {} -> {}", source.display(), destination.display());
            Some(MovedEntry {
                from: source.to_path_buf(),
                to: destination,
            })
        }
        Err(err) => {
            tracing::error!("failed migrating {}: {err:#}", source.display());
            None
        }
    }
}

fn move_path(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    // rename cannot cross filesystems
    copy_recursive(source, destination)?;
    let removed = if source.is_dir() {
        fs::remove_dir_all(source)
    } else {
        fs::remove_file(source)
    };
    removed.with_context(|| format!("failed removing {}", source.display()))
}

fn copy_recursive(source: &Path, destination: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(source)
        .with_context(|| format!("failed reading {}", source.display()))?;
    if metadata.is_dir() {
        fs::create_dir_all(destination)
            .with_context(|| format!("failed creating {}", destination.display()))?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &destination.join(entry.file_name()))?;
        }
        return Ok(());
    }
    if metadata.is_file() {
        fs::copy(source, destination).with_context(|| {
            format!(
                "failed copying {} to {}",
                source.display(),
                destination.display()
            )
        })?;
        return Ok(());
    }
    bail!("unsupported file type at {}", source.display())
}
