use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde_json::{Map, Value};

pub const API_KEY_FIELD: &str = "api_key";

/// The plugin's persisted settings file. Only `api_key` is interpreted; other
/// fields found on disk are carried through writes untouched.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored key, or `Ok(None)` when the file does not exist or carries no
    /// non-empty `api_key`.
    pub fn load(&self) -> anyhow::Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let payload = read_json_object(&self.path)?;
        Ok(payload
            .get(API_KEY_FIELD)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string))
    }

    /// Stored key or empty string. Read failures are logged, not returned.
    pub fn get(&self) -> String {
        match self.load() {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                tracing::error!("Failed to get API key: {err:#}");
                String::new()
            }
        }
    }

    pub fn save(&self, api_key: &str) -> anyhow::Result<()> {
        let mut payload = if self.path.exists() {
            read_json_object(&self.path).unwrap_or_default()
        } else {
            Map::new()
        };
        payload.insert(API_KEY_FIELD.to_string(), Value::String(api_key.to_string()));
        write_json_object(&self.path, &payload)
    }
}

fn read_json_object(path: &Path) -> anyhow::Result<Map<String, Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => bail!("{} does not hold a JSON object", path.display()),
    }
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )
    .with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}
