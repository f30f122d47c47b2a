//! CLI argument parsing for crashlens

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

/// Built-in threshold presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    Default,
    /// Fewer false positives
    Strict,
    /// Flag growth earlier
    Permissive,
}

#[derive(Parser, Debug)]
#[command(name = "crashlens")]
#[command(version)]
#[command(
    about = "Crash snapshot analyzer for recorded debugger sessions",
    long_about = None
)]
pub struct Cli {
    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Analyzer configuration file (TOML); missing keys take defaults
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Threshold preset, applied when no --config file is given
    #[arg(long = "preset", value_enum, default_value = "default", global = true)]
    pub preset: Preset,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Analyze one recorded debugger transcript
    Analyze {
        /// Transcript JSON file
        #[arg(value_name = "TRANSCRIPT")]
        transcript: PathBuf,
    },
    /// Compare two snapshots of the same process
    Compare {
        /// Transcript captured first
        #[arg(value_name = "BASELINE")]
        baseline: PathBuf,
        /// Transcript captured later
        #[arg(value_name = "COMPARISON")]
        comparison: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_analyze() {
        let cli = Cli::parse_from(["crashlens", "analyze", "dump.json"]);
        match cli.command {
            Command::Analyze { transcript } => assert_eq!(transcript, PathBuf::from("dump.json")),
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.format, OutputFormat::Text);
        assert_eq!(cli.preset, Preset::Default);
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_parses_compare_with_global_flags() {
        let cli = Cli::parse_from([
            "crashlens",
            "compare",
            "a.json",
            "b.json",
            "--format",
            "json",
            "--preset",
            "strict",
        ]);
        assert!(matches!(cli.command, Command::Compare { .. }));
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.preset, Preset::Strict);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["crashlens"]).is_err());
    }

    #[test]
    fn test_cli_compare_requires_two_files() {
        assert!(Cli::try_parse_from(["crashlens", "compare", "a.json"]).is_err());
    }

    #[test]
    fn test_cli_config_flag() {
        let cli = Cli::parse_from(["crashlens", "--config", "crashlens.toml", "analyze", "x.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("crashlens.toml")));
    }
}
