use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use wait_timeout::ChildExt;

use quest_contracts::paths::{non_empty_env, PluginPaths};

pub const SCREENSHOT_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
pub const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DISPLAY: &str = ":0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotRef {
    pub path: PathBuf,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenshotSource {
    File(PathBuf),
    Display(String),
}

#[derive(Debug, Clone)]
pub struct Screenshot {
    pub bytes: Vec<u8>,
    pub source: ScreenshotSource,
}

/// External screen grab used when no saved screenshot exists.
#[derive(Debug, Clone)]
pub struct CaptureCommand {
    pub program: String,
    pub args: Vec<String>,
    pub display: String,
    pub timeout: Duration,
}

impl CaptureCommand {
    /// ImageMagick `import` of the root window, PNG on stdout.
    pub fn x11_root() -> Self {
        Self {
            program: "import".to_string(),
            args: vec![
                "-window".to_string(),
                "root".to_string(),
                "png:-".to_string(),
            ],
            display: non_empty_env("DISPLAY").unwrap_or_else(|| DEFAULT_DISPLAY.to_string()),
            timeout: CAPTURE_TIMEOUT,
        }
    }

    pub fn run(&self) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("DISPLAY", &self.display)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        // Drain stdout concurrently; a full pipe would otherwise stall the child.
        let mut stdout = child
            .stdout
            .take()
            .context("capture stdout was not piped")?;
        let reader = thread::spawn(move || {
            let mut buffer = Vec::new();
            stdout.read_to_end(&mut buffer).map(|_| buffer)
        });

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                reap(child, reader);
                bail!(
                    "{} timed out after {:.1}s",
                    self.program,
                    self.timeout.as_secs_f64()
                );
            }
            Err(err) => {
                reap(child, reader);
                return Err(err).with_context(|| format!("failed waiting for {}", self.program));
            }
        };
        let bytes = reader
            .join()
            .map_err(|_| anyhow::anyhow!("capture reader thread panicked"))?
            .context("failed reading capture output")?;

        if !status.success() {
            bail!("{} exited with {status}", self.program);
        }
        if bytes.is_empty() {
            bail!("{} produced no output", self.program);
        }
        Ok(bytes)
    }
}

/// Kill the child and wait for it and its stdout reader to finish.
fn reap(mut child: Child, reader: JoinHandle<io::Result<Vec<u8>>>) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = reader.join();
}

#[derive(Debug, Clone)]
pub struct ScreenshotLocator {
    search_dirs: Vec<PathBuf>,
    fallback: Option<CaptureCommand>,
}

impl ScreenshotLocator {
    pub fn new(search_dirs: Vec<PathBuf>, fallback: Option<CaptureCommand>) -> Self {
        Self {
            search_dirs,
            fallback,
        }
    }

    pub fn for_paths(paths: &PluginPaths) -> Self {
        Self::new(paths.screenshot_dirs(), Some(CaptureCommand::x11_root()))
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Newest screenshot across all search dirs; the first one scanned wins a tie.
    pub fn find_latest(&self) -> Option<ScreenshotRef> {
        let mut latest: Option<ScreenshotRef> = None;
        for dir in &self.search_dirs {
            if !dir.is_dir() {
                continue;
            }
            scan_dir(dir, &mut latest);
        }
        latest
    }

    pub fn locate(&self) -> Option<Screenshot> {
        if let Some(found) = self.find_latest() {
            match fs::read(&found.path) {
                Ok(bytes) => {
                    tracing::info!("Screenshot found: {}", found.path.display());
                    return Some(Screenshot {
                        bytes,
                        source: ScreenshotSource::File(found.path),
                    });
                }
                Err(err) => {
                    tracing::error!("Failed to read {}: {err}", found.path.display());
                    return None;
                }
            }
        }

        let Some(fallback) = &self.fallback else {
            tracing::warn!("No recent Steam screenshot found");
            return None;
        };
        tracing::warn!("No recent Steam screenshot found, trying X11 screenshot");
        match fallback.run() {
            Ok(bytes) => {
                tracing::info!("Screenshot captured from display {}", fallback.display);
                Some(Screenshot {
                    bytes,
                    source: ScreenshotSource::Display(fallback.display.clone()),
                })
            }
            Err(err) => {
                tracing::error!("Failed to capture X11 screenshot: {err:#}");
                None
            }
        }
    }
}

fn scan_dir(dir: &Path, latest: &mut Option<ScreenshotRef>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!("skipping {}: {err}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            scan_dir(&path, latest);
            continue;
        }
        if !has_screenshot_extension(&path) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
            continue;
        };
        let newer = latest
            .as_ref()
            .map(|current| modified > current.modified)
            .unwrap_or(true);
        if newer {
            *latest = Some(ScreenshotRef { path, modified });
        }
    }
}

fn has_screenshot_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|ext| {
            SCREENSHOT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
