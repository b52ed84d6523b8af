use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const MISSING_CREDENTIAL_MESSAGE: &str =
    "OpenAI API key not configured. Please set your API key first.";
pub const EMPTY_SCREENSHOT_MESSAGE: &str =
    "No screenshot available. Please take a screenshot first.";
pub const CAPTURE_FAILED_MESSAGE: &str =
    "Failed to capture screenshot. Please ensure you have taken a screenshot recently.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelpErrorKind {
    MissingCredential,
    NoScreenshot,
    RemoteCall,
}

impl HelpErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::NoScreenshot => "no_screenshot",
            Self::RemoteCall => "remote_call",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelpError {
    pub kind: HelpErrorKind,
    pub message: String,
}

impl HelpError {
    pub fn missing_credential() -> Self {
        Self {
            kind: HelpErrorKind::MissingCredential,
            message: MISSING_CREDENTIAL_MESSAGE.to_string(),
        }
    }

    pub fn empty_screenshot() -> Self {
        Self {
            kind: HelpErrorKind::NoScreenshot,
            message: EMPTY_SCREENSHOT_MESSAGE.to_string(),
        }
    }

    pub fn capture_failed() -> Self {
        Self {
            kind: HelpErrorKind::NoScreenshot,
            message: CAPTURE_FAILED_MESSAGE.to_string(),
        }
    }

    pub fn remote(detail: &str) -> Self {
        Self {
            kind: HelpErrorKind::RemoteCall,
            message: format!("Failed to get help from AI: {detail}"),
        }
    }
}

impl fmt::Display for HelpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.as_str())
    }
}

impl std::error::Error for HelpError {}

/// Outcome of a quest-help call as handed back to the UI.
///
/// Serializes to `{"success": true, "help_text": ...}` or
/// `{"success": false, "error": ..., "error_kind": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelpResult {
    Success { help_text: String },
    Failure(HelpError),
}

impl HelpResult {
    pub fn success(help_text: impl Into<String>) -> Self {
        Self::Success {
            help_text: help_text.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error(&self) -> Option<&HelpError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure(err) => Some(err),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Success { help_text } => json!({
                "success": true,
                "help_text": help_text,
            }),
            Self::Failure(err) => json!({
                "success": false,
                "error": err.message,
                "error_kind": err.kind,
            }),
        }
    }
}

impl From<HelpError> for HelpResult {
    fn from(err: HelpError) -> Self {
        Self::Failure(err)
    }
}

impl From<Result<String, HelpError>> for HelpResult {
    fn from(result: Result<String, HelpError>) -> Self {
        match result {
            Ok(help_text) => Self::success(help_text),
            Err(err) => Self::Failure(err),
        }
    }
}

impl Serialize for HelpResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}
