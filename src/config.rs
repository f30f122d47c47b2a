// Analyzer configuration
//
// Every heuristic threshold lives here as a named value so tuning never
// touches control flow. The defaults are the values the analyzers were
// calibrated with; none of them is an invariant.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Direction the target architecture's stack grows in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackGrowth {
    /// x86, x64, ARM64: the innermost frame has the lowest stack pointer
    #[default]
    Downward,
    /// The innermost frame has the highest stack pointer
    Upward,
}

/// Limits passed to every object inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectLimits {
    pub max_depth: u32,
    pub max_array_elements: u32,
    pub max_string_length: u32,
}

impl Default for InspectLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_array_elements: 16,
            max_string_length: 1024,
        }
    }
}

/// Indicator-count thresholds for the ahead-of-time classifier
///
/// `min_indicators_with_compiler` never overrides the on-demand compiler
/// veto; it only decides whether mixed evidence is worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AotThresholds {
    pub min_indicators_without_compiler: usize,
    pub min_indicators_with_compiler: usize,
}

impl Default for AotThresholds {
    fn default() -> Self {
        Self {
            min_indicators_without_compiler: 1,
            min_indicators_with_compiler: 3,
        }
    }
}

/// Weight table for the trimming diagnosis confidence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceWeights {
    /// Awarded once when the process is classified as ahead-of-time compiled
    pub aot_classified: u32,
    /// Awarded once when no on-demand compiler module is loaded
    pub compiler_absent: u32,
    pub per_indicator: u32,
    /// Indicators beyond this count add nothing
    pub indicator_cap: u32,
    pub per_reflection_usage: u32,
    pub reflection_cap: u32,
    /// Score at or above which confidence is High
    pub high_threshold: u32,
    /// Score at or above which confidence is Medium
    pub medium_threshold: u32,
}

impl Default for EvidenceWeights {
    fn default() -> Self {
        Self {
            aot_classified: 3,
            compiler_absent: 2,
            per_indicator: 1,
            indicator_cap: 3,
            per_reflection_usage: 1,
            reflection_cap: 2,
            high_threshold: 7,
            medium_threshold: 4,
        }
    }
}

/// Thresholds for the two-snapshot leak rules
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakThresholds {
    /// Total heap growth (bytes) that alone makes a leak highly likely
    pub large_absolute_bytes: u64,
    /// Total heap growth (percent of baseline) that alone makes a leak plausible
    pub large_percent: f64,
    /// Instance growth above which a leak-prone type is suspected
    pub leak_prone_count: u64,
    /// Size growth (bytes) above which string / byte-array growth is suspected
    pub oversized_growth_bytes: u64,
    /// Suspected types needed to escalate to High on their own
    pub suspected_types_for_high: usize,
}

impl Default for LeakThresholds {
    fn default() -> Self {
        Self {
            large_absolute_bytes: 100 * 1024 * 1024,
            large_percent: 50.0,
            leak_prone_count: 1000,
            oversized_growth_bytes: 10 * 1024 * 1024,
            suspected_types_for_high: 3,
        }
    }
}

/// Top-level analyzer configuration
///
/// # Example
/// ```
/// use crashlens::config::AnalyzerConfig;
///
/// let config = AnalyzerConfig::default();
/// assert_eq!(config.max_exception_depth, 20);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Per-command timeout; a timed out command is treated like a backend crash
    pub command_timeout_secs: u64,
    pub stack_growth: StackGrowth,
    /// Stride used to extrapolate a missing stack pointer from one known neighbor
    pub sp_extrapolation_stride: u64,
    /// Hard cap on exception chain length, independent of cycle detection
    pub max_exception_depth: usize,
    /// Cap on member lists emitted by type resolution
    pub max_members: usize,
    pub inspect_limits: InspectLimits,
    pub aot: AotThresholds,
    pub evidence_weights: EvidenceWeights,
    pub leak: LeakThresholds,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 60,
            stack_growth: StackGrowth::Downward,
            sp_extrapolation_stride: 0x10,
            max_exception_depth: 20,
            max_members: 100,
            inspect_limits: InspectLimits::default(),
            aot: AotThresholds::default(),
            evidence_weights: EvidenceWeights::default(),
            leak: LeakThresholds::default(),
        }
    }
}

impl AnalyzerConfig {
    /// Fewer false positives: more evidence needed before flagging leaks
    pub fn strict() -> Self {
        Self {
            leak: LeakThresholds {
                large_percent: 100.0,
                leak_prone_count: 5000,
                suspected_types_for_high: 5,
                ..LeakThresholds::default()
            },
            ..Self::default()
        }
    }

    /// Catch growth early at the cost of noisier leak reports
    pub fn permissive() -> Self {
        Self {
            leak: LeakThresholds {
                large_absolute_bytes: 20 * 1024 * 1024,
                large_percent: 20.0,
                leak_prone_count: 200,
                oversized_growth_bytes: 2 * 1024 * 1024,
                suspected_types_for_high: 2,
            },
            ..Self::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Load a configuration from a TOML file; missing keys take defaults
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: AnalyzerConfig = toml::from_str(contents)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.command_timeout_secs == 0 {
            return Err("command_timeout_secs must be > 0".to_string());
        }

        if self.max_exception_depth == 0 {
            return Err("max_exception_depth must be >= 1".to_string());
        }

        if self.max_members == 0 {
            return Err("max_members must be >= 1".to_string());
        }

        if self.sp_extrapolation_stride == 0 {
            return Err("sp_extrapolation_stride must be > 0".to_string());
        }

        if self.aot.min_indicators_with_compiler < self.aot.min_indicators_without_compiler {
            return Err(format!(
                "aot.min_indicators_with_compiler ({}) must be >= min_indicators_without_compiler ({})",
                self.aot.min_indicators_with_compiler, self.aot.min_indicators_without_compiler
            ));
        }

        let weights = &self.evidence_weights;
        if weights.medium_threshold > weights.high_threshold {
            return Err(format!(
                "evidence_weights.medium_threshold ({}) must be <= high_threshold ({})",
                weights.medium_threshold, weights.high_threshold
            ));
        }

        if self.leak.large_percent.is_nan() || self.leak.large_percent <= 0.0 {
            return Err(format!(
                "leak.large_percent must be positive, got {}",
                self.leak.large_percent
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.max_exception_depth, 20);
        assert_eq!(config.max_members, 100);
        assert_eq!(config.aot.min_indicators_without_compiler, 1);
        assert_eq!(config.aot.min_indicators_with_compiler, 3);
        assert_eq!(config.stack_growth, StackGrowth::Downward);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(AnalyzerConfig::strict().validate().is_ok());
        assert!(AnalyzerConfig::permissive().validate().is_ok());
        assert!(
            AnalyzerConfig::strict().leak.leak_prone_count
                > AnalyzerConfig::permissive().leak.leak_prone_count
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AnalyzerConfig::from_toml_str(
            r#"
            max_members = 25
            stack_growth = "upward"

            [leak]
            leak_prone_count = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.max_members, 25);
        assert_eq!(config.stack_growth, StackGrowth::Upward);
        assert_eq!(config.leak.leak_prone_count, 10);
        assert_eq!(config.leak.large_percent, 50.0);
        assert_eq!(config.max_exception_depth, 20);
    }

    #[test]
    fn test_invalid_toml_value_rejected() {
        let result = AnalyzerConfig::from_toml_str("max_exception_depth = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[allow(clippy::field_reassign_with_default)]
    fn test_invalid_aot_thresholds() {
        let mut config = AnalyzerConfig::default();
        config.aot.min_indicators_with_compiler = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[allow(clippy::field_reassign_with_default)]
    fn test_invalid_weight_thresholds() {
        let mut config = AnalyzerConfig::default();
        config.evidence_weights.medium_threshold = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashlens.toml");
        std::fs::write(&path, "command_timeout_secs = 5\n").unwrap();
        let config = AnalyzerConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
    }
}
