//! Link configuration
//!
//! Timeouts and framing limits for one board link. The defaults match the
//! reference firmware; a `LinkConfig` can be stored next to a project as
//! TOML.
//!
//! # Example
//!
//! ```ignore
//! use boardlink::config::LinkConfig;
//!
//! let mut config = LinkConfig::load("board.toml")?;
//! config.macro_settle_delay_ms = 20;
//! config.save("board.toml")?;
//! ```

use crate::error::{BoardError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest frame that can carry a module, a register and one payload byte
const MIN_FRAME_LEN: usize = 3;

fn default_response_timeout_ms() -> u64 {
    1000
}

fn default_config_read_timeout_ms() -> u64 {
    1500
}

fn default_max_frame_len() -> usize {
    crate::backend::transport::DEFAULT_MAX_FRAME_LEN
}

fn default_true() -> bool {
    true
}

/// Timing and framing parameters of a board link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Budget for most correlated requests (creates, reads, macro begin)
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Budget for each hop of a processor config pull
    #[serde(default = "default_config_read_timeout_ms")]
    pub config_read_timeout_ms: u64,
    /// Commands at least this long are split when stored in a macro
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Pause between starting a macro and writing its commands.
    /// Real boards want ~20 ms; 0 is fine against a simulated board.
    #[serde(default)]
    pub macro_settle_delay_ms: u64,
    /// Append feedback bytes to event entries that request them
    #[serde(default = "default_true")]
    pub event_feedback_enabled: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            config_read_timeout_ms: default_config_read_timeout_ms(),
            max_frame_len: default_max_frame_len(),
            macro_settle_delay_ms: 0,
            event_feedback_enabled: true,
        }
    }
}

impl LinkConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn config_read_timeout(&self) -> Duration {
        Duration::from_millis(self.config_read_timeout_ms)
    }

    pub fn macro_settle_delay(&self) -> Duration {
        Duration::from_millis(self.macro_settle_delay_ms)
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<()> {
        if self.response_timeout_ms == 0 || self.config_read_timeout_ms == 0 {
            return Err(BoardError::Config("timeouts must be non-zero".into()));
        }
        if self.max_frame_len < MIN_FRAME_LEN {
            return Err(BoardError::Config(format!(
                "max_frame_len must be at least {}, got {}",
                MIN_FRAME_LEN, self.max_frame_len
            )));
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: LinkConfig = toml::from_str(content)
            .map_err(|e| BoardError::Config(format!("Failed to parse link config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BoardError::Config(format!("Failed to serialize link config: {}", e)))
    }

    /// Load a link config from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoardError::Config(format!("Failed to read link config {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load a link config, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Save the link config to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BoardError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| {
            BoardError::Config(format!("Failed to write link config {:?}: {}", path, e))
        })
    }
}
