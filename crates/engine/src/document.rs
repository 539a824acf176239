use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use folio_core::DomainError;

/// A renderable document description.
///
/// The pipeline treats this as opaque JSON; engines decide what shape they
/// accept. The reference engine expects `{"title": "...", "pages": ["..."]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(JsonValue);

impl Document {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    /// Build a document in the shape the reference engine understands.
    pub fn from_pages(title: impl Into<String>, pages: Vec<String>) -> Self {
        Self(serde_json::json!({
            "title": title.into(),
            "pages": pages,
        }))
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_json(self) -> JsonValue {
        self.0
    }

    pub fn title(&self) -> Option<&str> {
        self.0.get("title").and_then(JsonValue::as_str)
    }
}

/// Output device the document is laid out for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProfile {
    A4,
    Letter,
    Screen,
}

impl DeviceProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceProfile::A4 => "a4",
            DeviceProfile::Letter => "letter",
            DeviceProfile::Screen => "screen",
        }
    }

    /// Page size in PDF points (width, height).
    pub fn page_size(&self) -> (u32, u32) {
        match self {
            DeviceProfile::A4 => (595, 842),
            DeviceProfile::Letter => (612, 792),
            DeviceProfile::Screen => (960, 540),
        }
    }
}

impl FromStr for DeviceProfile {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a4" => Ok(DeviceProfile::A4),
            "letter" => Ok(DeviceProfile::Letter),
            "screen" => Ok(DeviceProfile::Screen),
            other => Err(DomainError::validation(format!(
                "unknown device profile '{other}' (expected a4, letter or screen)"
            ))),
        }
    }
}

impl core::fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job rendering options, persisted with the job and passed through the
/// sandbox to both collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOptions {
    /// Device profile name (resolved by the collaborators).
    pub profile: String,
    /// Produce byte-identical output for identical input.
    #[serde(default)]
    pub deterministic: bool,
    /// Treat rendering warnings as errors.
    #[serde(default)]
    pub strict: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            profile: DeviceProfile::A4.as_str().to_string(),
            deterministic: false,
            strict: false,
        }
    }
}
