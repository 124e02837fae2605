//! Builder configuration.
//!
//! Configuration is an explicit value handed to the builder and the reader/writers when they
//! are constructed. [`BuilderConfig::from_env`] exists for binaries that want to honour
//! `GENMETA_VALIDATE_BUILDER`, but nothing in the library reads the environment on its own.
//!
//! ## Environment Variables
//!
//! - `GENMETA_VALIDATE_BUILDER`: validation and logging level
//!   - `"0"` (default): no validation, no builder logs
//!   - `"1"`: validate newly built metadata, summary logs
//!   - `"2"` or higher: validate, and trace every resolved or written pointer
use serde::{Deserialize, Serialize};
use std::env;

pub const VALIDATE_ENV_VAR: &str = "GENMETA_VALIDATE_BUILDER";

/// How much the builder reports through `tracing`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Quiet = 0,
    Summary = 1,
    Verbose = 2,
}

impl Verbosity {
    pub fn from_level(level: u32) -> Self {
        match level {
            0 => Self::Quiet,
            1 => Self::Summary,
            _ => Self::Verbose,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "quiet" => Some(Self::Quiet),
            "summary" => Some(Self::Summary),
            "verbose" => Some(Self::Verbose),
            other => other.parse::<u32>().ok().map(Self::from_level),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub verbosity: Verbosity,
    /// Whether callers should cross-check freshly built metadata with the validator.
    pub validate: bool,
}

impl BuilderConfig {
    pub fn new(verbosity: Verbosity) -> Self {
        Self {
            verbosity,
            validate: false,
        }
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn from_level(level: u32) -> Self {
        Self {
            verbosity: Verbosity::from_level(level),
            validate: level > 0,
        }
    }

    pub fn from_env() -> Self {
        let level = env::var(VALIDATE_ENV_VAR)
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0);
        Self::from_level(level)
    }

    pub fn summary_enabled(&self) -> bool {
        self.verbosity >= Verbosity::Summary
    }

    pub fn verbose_enabled(&self) -> bool {
        self.verbosity >= Verbosity::Verbose
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(BuilderConfig::from_level(0), BuilderConfig::default());

        let summary = BuilderConfig::from_level(1);
        assert!(summary.validate);
        assert!(summary.summary_enabled());
        assert!(!summary.verbose_enabled());

        let verbose = BuilderConfig::from_level(7);
        assert_eq!(verbose.verbosity, Verbosity::Verbose);
        assert!(verbose.verbose_enabled());
    }

    #[test]
    fn test_verbosity_from_str() {
        assert_eq!(Verbosity::from_str("Summary"), Some(Verbosity::Summary));
        assert_eq!(Verbosity::from_str("2"), Some(Verbosity::Verbose));
        assert_eq!(Verbosity::from_str("loud"), None);
    }
}
