//! Agent loop limits.

use serde::{Deserialize, Serialize};

/// Limits applied to one run of the agent loop.
///
/// Immutable for the duration of a `chat()` call. Every field must be ≥ 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Maximum model requests per `chat()` call (soft cap)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Failed tool calls in a row before the loop gives up
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Identical calls within the recent window that count as a doom loop
    #[serde(default = "default_doom_loop_threshold")]
    pub doom_loop_threshold: u32,
}

fn default_max_iterations() -> u32 {
    50
}
fn default_max_consecutive_errors() -> u32 {
    3
}
fn default_doom_loop_threshold() -> u32 {
    3
}

impl LoopConfig {
    /// Check that every limit is at least one.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_iterations == 0 {
            return Err("max_iterations must be >= 1".into());
        }
        if self.max_consecutive_errors == 0 {
            return Err("max_consecutive_errors must be >= 1".into());
        }
        if self.doom_loop_threshold == 0 {
            return Err("doom_loop_threshold must be >= 1".into());
        }
        Ok(())
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_consecutive_errors: default_max_consecutive_errors(),
            doom_loop_threshold: default_doom_loop_threshold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LoopConfig::default();
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.max_consecutive_errors, 3);
        assert_eq!(config.doom_loop_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_limits_rejected() {
        let config = LoopConfig {
            doom_loop_threshold: 0,
            ..LoopConfig::default()
        };
        assert!(config.validate().unwrap_err().contains("doom_loop_threshold"));
    }

    #[test]
    fn partial_toml_like_input_fills_defaults() {
        let config: LoopConfig = serde_json::from_str(r#"{"max_iterations": 5}"#).unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.max_consecutive_errors, 3);
    }
}
