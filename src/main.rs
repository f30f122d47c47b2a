use anyhow::{Context, Result};
use clap::Parser;
use crashlens::cli::{Cli, Command, OutputFormat, Preset};
use crashlens::config::AnalyzerConfig;
use crashlens::pipeline::{analyze, capture_snapshot};
use crashlens::snapshot_diff::compare_snapshots;
use crashlens::transcript::{ReplayBackend, Transcript};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(path: Option<&Path>, preset: Preset) -> Result<AnalyzerConfig> {
    match path {
        Some(path) => AnalyzerConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(match preset {
            Preset::Default => AnalyzerConfig::default(),
            Preset::Strict => AnalyzerConfig::strict(),
            Preset::Permissive => AnalyzerConfig::permissive(),
        }),
    }
}

fn run_analyze(transcript: &Path, config: &AnalyzerConfig, format: OutputFormat) -> Result<()> {
    let (mut backend, mut introspector) = Transcript::load(transcript)?.into_parts();
    let report = analyze(&mut backend, &mut introspector, config);

    match format {
        OutputFormat::Text => print!("{}", report.to_report_string()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if !report.is_complete() {
        anyhow::bail!(
            "analysis failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn run_compare(
    baseline: &Path,
    comparison: &Path,
    config: &AnalyzerConfig,
    format: OutputFormat,
) -> Result<()> {
    let mut before = ReplayBackend::new(Transcript::load(baseline)?);
    let mut after = ReplayBackend::new(Transcript::load(comparison)?);
    let baseline = capture_snapshot(&mut before, config);
    let comparison = capture_snapshot(&mut after, config);

    let diff = compare_snapshots(&baseline.snapshot, &comparison.snapshot, &config.leak)
        .with_warnings(
            baseline
                .warnings("baseline")
                .into_iter()
                .chain(comparison.warnings("comparison")),
        );
    match format {
        OutputFormat::Text => print!("{}", diff.to_report_string()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&diff)?),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let config = load_config(args.config.as_deref(), args.preset)?;

    match &args.command {
        Command::Analyze { transcript } => run_analyze(transcript, &config, args.format),
        Command::Compare {
            baseline,
            comparison,
        } => run_compare(baseline, comparison, &config, args.format),
    }
}
