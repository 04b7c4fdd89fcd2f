//! Configuration for the generation engine.

use std::path::Path;
use std::time::Duration;

use coursegen_protocol::{DEFAULT_MAX_RECORD_BYTES, DEFAULT_RECORD_MARKER, ParserConfig};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Top-level engine configuration.
///
/// Every field has a default, so a config file only needs the values it
/// changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Generation backend endpoints.
    pub backend: BackendConfig,

    /// Stream decoding and timeouts.
    pub stream: StreamConfig,

    /// Tree view defaults.
    pub tree: TreeConfig,

    /// Capacity of the channel between orchestrators and the store.
    pub dispatch: DispatchConfig,
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    /// Parser settings derived from the stream section.
    pub fn parser_config(&self) -> ParserConfig {
        ParserConfig::default()
            .with_marker(self.stream.record_marker.clone())
            .with_max_record_bytes(self.stream.max_record_bytes)
    }
}

/// Endpoints of the generation backend and course repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL every path is appended to.
    pub base_url: String,

    /// Path of the streaming generation endpoint.
    pub generate_path: String,

    /// Path of the streaming modification endpoint.
    pub modify_path: String,

    /// Path listing a course's materials; `{course_id}` is substituted.
    pub materials_path: String,

    /// TCP connect timeout.
    pub connect_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            generate_path: "/materials/generate/stream".to_string(),
            modify_path: "/materials/modify/stream".to_string(),
            materials_path: "/courses/{course_id}/materials".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    pub(crate) fn materials_url(&self, course_id: &str) -> String {
        self.url(&self.materials_path.replace("{course_id}", course_id))
    }
}

/// Stream decoding settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Prefix that marks a record line.
    pub record_marker: String,

    /// Maximum size of a single record line.
    pub max_record_bytes: usize,

    /// Maximum silence between two chunks before the run fails.
    /// `None` disables the timeout.
    pub idle_timeout_secs: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            record_marker: DEFAULT_RECORD_MARKER.to_string(),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            idle_timeout_secs: Some(120),
        }
    }
}

impl StreamConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Tree view defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Whether modules and chapters start expanded.
    pub expand_by_default: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            expand_by_default: true,
        }
    }
}

/// Dispatch channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}
