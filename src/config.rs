use serde::{Deserialize, Serialize};

/// Executor settings. Every field has a default, so a partial JSON
/// object (or `{}`) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Frames allowed on the call stack, the root frame included.
    pub max_call_depth: usize,
    /// Emit a `trace` event per executed instruction.
    pub trace_execution: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config { max_call_depth: 1024, trace_execution: false }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Config, serde_json::Error> {
        serde_json::from_str(text)
    }
}
