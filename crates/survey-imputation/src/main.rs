//! CLI entry point for the survey imputation pipeline.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use polars::io::csv::read::CsvReadOptions;
use polars::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;
use survey_imputation::{
    Backdata, ImputationConfig, ImputationError, ImputationMarker, ImputationOutput, Pipeline,
    ReportGenerator, RunSummary, SicMapping, backdata_from_dataframe, records_from_dataframe,
    sic_mapping_from_dataframe,
};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Imputation engine for business R&D survey returns",
    long_about = "Completes one survey period: apportionment, carry-forward, back-infill,\n\
                  trimmed-mean imputation and short-form expansion.\n\n\
                  EXAMPLES:\n  \
                  # Trimmed-mean imputation only\n  \
                  survey-imputation -i current.csv -m sic_mapping.csv\n\n  \
                  # With prior-period backdata and a config file\n  \
                  survey-imputation -i current.csv -b previous.csv -m sic_mapping.csv -c config.json\n\n  \
                  # Machine-readable summary\n  \
                  survey-imputation -i current.csv -m sic_mapping.csv --json | jq .markers"
)]
struct Args {
    /// Path to the current-period CSV file
    #[arg(short, long)]
    input: String,

    /// Path to the prior-period CSV file
    ///
    /// Carry-forward and back-infill are skipped when not given
    #[arg(short, long)]
    backdata: Option<String>,

    /// Path to the SIC to product-group mapping CSV file
    #[arg(short = 'm', long)]
    sic_mapping: Option<String>,

    /// Path to a JSON configuration file
    ///
    /// Missing fields take their default values
    #[arg(short, long)]
    config: Option<String>,

    /// Output directory for results
    #[arg(short, long, default_value = "./outputs")]
    output: String,

    /// Base name of the output files (defaults to the input file stem)
    #[arg(long)]
    output_name: Option<String>,

    /// Override the trim threshold
    #[arg(long)]
    trim_threshold: Option<usize>,

    /// Disable link-factor scaling of carried-forward values
    #[arg(long)]
    no_back_infill: bool,

    /// Skip the QA tables
    #[arg(long)]
    no_qa: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Suppress progress output (only show errors and final result)
    #[arg(short, long)]
    quiet: bool,

    /// Output JSON to stdout instead of human-readable summary
    ///
    /// Disables all progress logs; only outputs the run summary.
    #[arg(long)]
    json: bool,

    /// Write the run summary to the output directory
    ///
    /// The report will be saved as <output_name>_report.json
    #[arg(short = 'r', long)]
    emit_report: bool,
}

/// Initialize the tracing subscriber for logging.
///
/// When `json_output` is true, logging is disabled so that stdout only
/// carries the JSON summary.
fn init_logging(level: &str, quiet: bool, json_output: bool) {
    if json_output {
        return;
    }

    use tracing_subscriber::EnvFilter;

    let effective_level = if quiet { "warn" } else { level };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(effective_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.quiet, args.json);

    if !Path::new(&args.input).exists() {
        return Err(anyhow!("Input file not found: {}", args.input));
    }

    let config = load_config(&args)?;

    info!("Loading records from: {}", args.input);
    let current = load_csv(&args.input)?;
    let records = records_from_dataframe(&current, &config)?;

    let backdata = match &args.backdata {
        Some(path) => {
            info!("Loading backdata from: {}", path);
            Some(backdata_from_dataframe(&load_csv(path)?, &config)?)
        }
        None => {
            warn!("No backdata given; carry-forward and back-infill will be skipped");
            None
        }
    };

    let mapping = match &args.sic_mapping {
        Some(path) => sic_mapping_from_dataframe(&load_csv(path)?, &config.columns)?,
        None => SicMapping::default(),
    };

    let pipeline = build_pipeline(&args, config, mapping)?;
    run_pipeline(&pipeline, &args, records, backdata.as_ref())
}

/// Read the JSON configuration, if any, and apply command-line overrides.
fn load_config(args: &Args) -> Result<ImputationConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {path}"))?;
            serde_json::from_str::<ImputationConfig>(&raw)
                .with_context(|| format!("Invalid config file: {path}"))?
        }
        None => ImputationConfig::default(),
    };

    if let Some(threshold) = args.trim_threshold {
        config.trim_threshold = threshold;
    }
    if args.no_back_infill {
        config.back_infill = false;
    }
    if args.no_qa {
        config.produce_qa = false;
    }

    config.validate()?;
    debug!("Configuration: {:?}", config);
    Ok(config)
}

fn build_pipeline(args: &Args, config: ImputationConfig, mapping: SicMapping) -> Result<Pipeline> {
    let mut builder = Pipeline::builder().config(config).sic_mapping(mapping);

    if !args.quiet && !args.json {
        builder = builder.on_progress(|update| {
            info!(
                "[{:.0}%] {}: {}",
                update.progress * 100.0,
                update.stage.display_name(),
                update.message
            );
        });
    }

    Ok(builder.build()?)
}

/// Run pipeline and write results.
fn run_pipeline(
    pipeline: &Pipeline,
    args: &Args,
    records: Vec<survey_imputation::SurveyRecord>,
    backdata: Option<&Backdata>,
) -> Result<()> {
    info!("{}", "=".repeat(80));
    info!("Starting imputation of {} records...", records.len());
    info!("{}", "=".repeat(80));

    let start = Instant::now();
    let output = match pipeline.process(records, backdata) {
        Ok(output) => output,
        Err(e) => {
            error!("Imputation failed: {}", e);
            write_partial_qa(&e, args)?;
            return Err(anyhow!("Imputation failed: {}", e));
        }
    };
    let duration_ms = start.elapsed().as_millis();

    handle_pipeline_output(&output, pipeline.config(), args, duration_ms)
}

/// Write the QA tables a failed run built before it stopped.
fn write_partial_qa(error: &ImputationError, args: &Args) -> Result<()> {
    let Some((trim_qa, link_qa)) = error.partial_qa() else {
        return Ok(());
    };
    let base_name = args
        .output_name
        .clone()
        .unwrap_or_else(|| extract_file_stem(&args.input));
    let paths = ReportGenerator::new(PathBuf::from(&args.output))
        .write_qa(trim_qa, link_qa, &base_name)?;
    for path in paths {
        warn!("QA table from the failed run written to: {}", path.display());
    }
    Ok(())
}

/// Handle pipeline output based on CLI flags.
///
/// Output behavior:
/// - Default: Print human-readable summary to stdout
/// - `--json`: Print JSON to stdout only (no logs)
/// - `--emit-report`: Write JSON summary to file
fn handle_pipeline_output(
    output: &ImputationOutput,
    config: &ImputationConfig,
    args: &Args,
    duration_ms: u128,
) -> Result<()> {
    let base_name = args
        .output_name
        .clone()
        .unwrap_or_else(|| extract_file_stem(&args.input));

    let generator = ReportGenerator::new(PathBuf::from(&args.output));
    let written = generator.write_outputs(output, config, &base_name)?;

    let mut summary = RunSummary::from_output(output, duration_ms).with_input_file(&args.input);
    summary.outputs = written.iter().map(|p| p.display().to_string()).collect();

    if args.emit_report {
        let report_path = generator.write_summary(&summary, &base_name)?;
        info!("Report written to: {}", report_path.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    print_human_readable_summary(&summary);
    Ok(())
}

/// Extract the file stem (name without extension) from a path.
fn extract_file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string()
}

/// Print a human-readable summary of the run.
fn print_human_readable_summary(summary: &RunSummary) {
    println!();
    println!("{}", "=".repeat(80));
    println!("IMPUTATION COMPLETE");
    println!("{}", "=".repeat(80));
    println!();

    if let Some(ref input) = summary.input_file {
        println!("Input:  {} ({} records)", input, summary.records);
    }
    for path in &summary.outputs {
        println!("Output: {}", path);
    }
    println!();

    println!("Markers:");
    for marker in [
        ImputationMarker::Responded,
        ImputationMarker::CarriedForward,
        ImputationMarker::BackInfilled,
        ImputationMarker::TrimmedMean,
        ImputationMarker::NoMeanFound,
        ImputationMarker::Constructed,
        ImputationMarker::NoImputation,
    ] {
        let count = summary.marker_count(marker);
        if count > 0 {
            println!("  {:<16} {}", marker.code(), count);
        }
    }
    println!();

    println!("Processing Summary:");
    println!("  Duration: {}ms", summary.duration_ms);
    println!(
        "  Trimmed values: {} of {}",
        summary.trimmed_values, summary.trim_qa_rows
    );
    println!(
        "  Link factors: {} ({} defaulted to 1.0)",
        summary.link_factors, summary.defaulted_link_factors
    );
    for (source, count) in &summary.expansion {
        println!("  Expanded ({}): {}", source, count);
    }

    if summary.marker_count(ImputationMarker::NoMeanFound) > 0 {
        println!();
        println!(
            "  ! {} records had no class mean and need manual follow-up",
            summary.marker_count(ImputationMarker::NoMeanFound)
        );
    }

    println!();
    println!("Use --json for machine-readable output");
    println!("Use --emit-report to save the summary as JSON");
    println!("{}", "=".repeat(80));
}

/// Load a CSV file with headers.
fn load_csv(path: &str) -> Result<DataFrame> {
    CsvReadOptions::default()
        .with_infer_schema_length(Some(1000))
        .with_has_header(true)
        .with_parse_options(CsvParseOptions::default().with_quote_char(Some(b'"')))
        .try_into_reader_with_file_path(Some(PathBuf::from(path)))?
        .finish()
        .with_context(|| format!("Failed to read CSV: {path}"))
}
