//! Integration tests for the imputation pipeline.
//!
//! These tests run whole periods through the pipeline, starting from CSV
//! fixtures, and check the resulting markers and values.

use approx::assert_relative_eq;
use polars::io::csv::read::CsvReadOptions;
use polars::prelude::*;
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use survey_imputation::table::{EXPANSION_SUFFIX, MARKER_COLUMN};
use survey_imputation::{
    Backdata, CivilDefence, ExpansionSource, FormType, ImputationConfig, ImputationMarker,
    ImputationOutput, ImputationStage, Pipeline, ReportGenerator, RunSummary, SicMapping, Status,
    SurveyRecord, VariableGroup, backdata_from_dataframe, records_from_dataframe, records_to_dataframe,
    sic_mapping_from_dataframe,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn fixtures_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn load_csv(filename: &str) -> DataFrame {
    let path = fixtures_path().join(filename);
    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path))
        .expect("Failed to create CSV reader")
        .finish()
        .expect("Failed to read CSV file")
}

fn load_config() -> ImputationConfig {
    let raw = std::fs::read_to_string(fixtures_path().join("config.json"))
        .expect("Failed to read config fixture");
    let config: ImputationConfig = serde_json::from_str(&raw).expect("Invalid config fixture");
    config.validate().expect("Config fixture should validate");
    config
}

struct Inputs {
    config: ImputationConfig,
    records: Vec<SurveyRecord>,
    backdata: Backdata,
    mapping: SicMapping,
}

fn load_inputs(config: ImputationConfig) -> Inputs {
    let records = records_from_dataframe(&load_csv("current.csv"), &config).unwrap();
    let backdata = backdata_from_dataframe(&load_csv("backdata.csv"), &config).unwrap();
    let mapping = sic_mapping_from_dataframe(&load_csv("sic_mapping.csv"), &config.columns).unwrap();
    Inputs {
        config,
        records,
        backdata,
        mapping,
    }
}

fn run(inputs: Inputs, with_backdata: bool) -> ImputationOutput {
    let backdata = with_backdata.then_some(&inputs.backdata);
    Pipeline::builder()
        .config(inputs.config.clone())
        .sic_mapping(inputs.mapping.clone())
        .build()
        .unwrap()
        .process(inputs.records, backdata)
        .unwrap()
}

fn find(output: &ImputationOutput, reference: i64, instance: Option<i64>) -> &SurveyRecord {
    output
        .records
        .iter()
        .find(|r| r.key() == (reference, instance))
        .unwrap_or_else(|| panic!("record {reference}/{instance:?} missing"))
}

fn assert_values(record: &SurveyRecord, expected: [(&str, f64); 3]) {
    for (name, value) in expected {
        assert_relative_eq!(record.value(name).unwrap(), value, epsilon = 1e-9);
    }
}

// ============================================================================
// Full Pipeline Tests
// ============================================================================

#[test]
fn test_full_pipeline_markers() {
    let output = run(load_inputs(load_config()), true);

    assert_eq!(output.records.len(), 13);
    let summary = RunSummary::from_output(&output, 0);
    assert_eq!(summary.marker_count(ImputationMarker::Responded), 7);
    assert_eq!(summary.marker_count(ImputationMarker::BackInfilled), 1);
    assert_eq!(summary.marker_count(ImputationMarker::TrimmedMean), 2);
    assert_eq!(summary.marker_count(ImputationMarker::NoMeanFound), 1);
    assert_eq!(summary.marker_count(ImputationMarker::Constructed), 1);
    assert_eq!(summary.marker_count(ImputationMarker::NoImputation), 1);
    assert_eq!(summary.marker_count(ImputationMarker::CarriedForward), 0);
}

#[test]
fn test_output_sorted_by_key() {
    let output = run(load_inputs(load_config()), true);

    let keys: Vec<(i64, Option<i64>)> = output.records.iter().map(|r| r.key()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    assert_eq!(keys.first(), Some(&(1001, Some(1))));
    assert_eq!(keys.last(), Some(&(6002, Some(1))));
}

#[test]
fn test_carry_forward_with_back_infill() {
    let output = run(load_inputs(load_config()), true);

    // The unresolved reference takes its prior instance and dimensions.
    let record = find(&output, 2001, Some(1));
    assert_eq!(record.marker, ImputationMarker::BackInfilled);
    assert_eq!(record.civil_or_defence, Some(CivilDefence::Civil));
    assert_eq!(record.class.label(), "C_AA");
    assert_values(record, [("211", 80.0), ("202", 50.0), ("203", 30.0)]);

    assert_eq!(output.link_qa.len(), 3);
    for row in &output.link_qa {
        assert_eq!(row.class, "C_AA");
        assert_eq!(row.pair_count, 3);
        assert!(!row.defaulted);
        assert_relative_eq!(row.link_factor, 2.0, epsilon = 1e-12);
    }
}

#[test]
fn test_carry_forward_without_back_infill() {
    let mut config = load_config();
    config.back_infill = false;
    let output = run(load_inputs(config), true);

    let record = find(&output, 2001, Some(1));
    assert_eq!(record.marker, ImputationMarker::CarriedForward);
    assert_values(record, [("211", 40.0), ("202", 25.0), ("203", 15.0)]);
}

#[test]
fn test_trimmed_mean_excludes_set_aside_records() {
    let output = run(load_inputs(load_config()), true);

    // Masters pool long and short forms; breakdowns use long forms only.
    let record = find(&output, 2002, Some(1));
    assert_eq!(record.marker, ImputationMarker::TrimmedMean);
    assert_values(record, [("211", 150.0), ("202", 95.0), ("203", 80.0)]);

    // Nothing exceeds the trim threshold.
    assert_eq!(output.trim_qa.len(), 13);
    assert!(output.trim_qa.iter().all(|r| !r.trimmed));
    assert!(output.trim_qa.iter().all(|r| r.reference != 4001 && r.reference != 4002));
}

#[test]
fn test_dimension_backfill_feeds_trimmed_mean() {
    let output = run(load_inputs(load_config()), true);

    let record = find(&output, 6001, Some(1));
    assert_eq!(record.product_group.as_deref(), Some("AA"));
    assert_eq!(record.civil_or_defence, Some(CivilDefence::Civil));
    assert_eq!(record.marker, ImputationMarker::TrimmedMean);
    assert_values(record, [("211", 150.0), ("202", 95.0), ("203", 80.0)]);
}

#[test]
fn test_unresolvable_records() {
    let output = run(load_inputs(load_config()), true);

    let no_mean = find(&output, 5001, Some(1));
    assert_eq!(no_mean.marker, ImputationMarker::NoMeanFound);
    assert_eq!(no_mean.class.label(), "D_BB");
    assert_eq!(no_mean.value("211"), None);

    let undefined = find(&output, 6002, Some(1));
    assert_eq!(undefined.marker, ImputationMarker::NoImputation);
    assert!(!undefined.class.is_defined());
    assert_eq!(undefined.product_group, None);
    assert_eq!(undefined.value("211"), None);
}

#[test]
fn test_set_aside_records_unchanged() {
    let output = run(load_inputs(load_config()), true);

    let constructed = find(&output, 4001, Some(1));
    assert_eq!(constructed.marker, ImputationMarker::Constructed);
    assert_values(constructed, [("211", 999.0), ("202", 500.0), ("203", 499.0)]);

    let manual = find(&output, 4002, Some(1));
    assert_eq!(manual.marker, ImputationMarker::Responded);
    assert_values(manual, [("211", 5000.0), ("202", 2500.0), ("203", 2500.0)]);
}

#[test]
fn test_short_form_expansion() {
    let output = run(load_inputs(load_config()), true);

    let record = find(&output, 3001, Some(1));
    assert_eq!(record.marker, ImputationMarker::Responded);
    assert_relative_eq!(record.value("211").unwrap(), 50.0);
    assert_relative_eq!(record.value("202").unwrap(), 50.0 * 380.0 / 700.0, epsilon = 1e-9);
    assert_relative_eq!(record.value("203").unwrap(), 50.0 * 320.0 / 700.0, epsilon = 1e-9);
    assert_eq!(record.expansion.get("202"), Some(&ExpansionSource::ImpClassGroup));
    assert_eq!(record.expansion.get("203"), Some(&ExpansionSource::ImpClassGroup));

    // Long forms carry no expansion provenance.
    assert!(find(&output, 2002, Some(1)).expansion.is_empty());
}

#[test]
fn test_apportionment_spreads_instance_zero() {
    let output = run(load_inputs(load_config()), true);

    assert_relative_eq!(find(&output, 1003, Some(1)).value("emp_total").unwrap(), 15.0);
    assert_relative_eq!(find(&output, 1003, Some(2)).value("emp_total").unwrap(), 5.0);
    assert_relative_eq!(find(&output, 1003, Some(0)).value("emp_total").unwrap(), 20.0);
}

// ============================================================================
// Missing Backdata
// ============================================================================

#[test]
fn test_missing_backdata_skips_carry_forward() {
    let output = run(load_inputs(load_config()), false);

    assert!(output.link_qa.is_empty());
    assert!(
        output
            .records
            .iter()
            .all(|r| !matches!(
                r.marker,
                ImputationMarker::CarriedForward | ImputationMarker::BackInfilled
            ))
    );

    // The unresolved reference falls through to the trimmed mean instead.
    let record = find(&output, 2001, None);
    assert_eq!(record.marker, ImputationMarker::TrimmedMean);
    assert_eq!(record.class.label(), "C_AA");
    assert_values(record, [("211", 150.0), ("202", 95.0), ("203", 80.0)]);
}

#[test]
fn test_empty_backdata_behaves_as_missing() {
    let inputs = load_inputs(load_config());
    let empty = Backdata::default();
    let output = Pipeline::builder()
        .config(inputs.config.clone())
        .sic_mapping(inputs.mapping.clone())
        .build()
        .unwrap()
        .process(inputs.records, Some(&empty))
        .unwrap();

    assert!(output.link_qa.is_empty());
    assert_eq!(find(&output, 2001, None).marker, ImputationMarker::TrimmedMean);
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_runs_are_deterministic() {
    let first = run(load_inputs(load_config()), true);
    let second = run(load_inputs(load_config()), true);

    assert_eq!(first.records, second.records);
    assert_eq!(first.trim_qa, second.trim_qa);
    assert_eq!(first.link_qa, second.link_qa);
}

#[test]
fn test_row_order_does_not_matter() {
    let forward = run(load_inputs(load_config()), true);

    let mut inputs = load_inputs(load_config());
    inputs.records.reverse();
    let reversed = run(inputs, true);

    assert_eq!(forward.records, reversed.records);
    assert_eq!(forward.link_qa, reversed.link_qa);
}

#[test]
fn test_every_record_has_one_marker() {
    let output = run(load_inputs(load_config()), true);
    let df = records_to_dataframe(&output.records, &load_config()).unwrap();

    let markers = df.column(MARKER_COLUMN).unwrap();
    assert_eq!(markers.null_count(), 0);
    assert_eq!(df.height(), output.records.len());
}

// ============================================================================
// Failure Tests
// ============================================================================

#[test]
fn test_unknown_variable_rejected() {
    let config = ImputationConfig::builder()
        .variables(vec![VariableGroup::new("211", &["202", "299"])])
        .composite_totals(vec![])
        .without_apportionment()
        .build()
        .unwrap();

    let err = records_from_dataframe(&load_csv("current.csv"), &config).unwrap_err();
    assert_eq!(err.error_code(), "UNKNOWN_VARIABLE");
    assert!(err.is_fatal_config());
}

#[test]
fn test_duplicate_keys_abort_run() {
    let mut inputs = load_inputs(load_config());
    let duplicate = inputs.records[0].clone();
    inputs.records.push(duplicate);

    let result = Pipeline::builder()
        .config(inputs.config.clone())
        .sic_mapping(inputs.mapping.clone())
        .build()
        .unwrap()
        .process(inputs.records, Some(&inputs.backdata));

    let err = result.unwrap_err();
    assert_eq!(err.error_code(), "DUPLICATE_RECORD");
    assert!(err.to_string().contains("at input"));
}

#[test]
fn test_invalid_config_rejected_by_builder() {
    let mut config = load_config();
    config.lower_trim_percent = 60;
    config.upper_trim_percent = 40;

    assert!(Pipeline::builder().config(config).build().is_err());
}

// ============================================================================
// Progress Reporting Tests
// ============================================================================

#[test]
fn test_progress_stages_in_order() {
    let stages: Arc<Mutex<Vec<ImputationStage>>> = Arc::new(Mutex::new(Vec::new()));
    let stages_clone = Arc::clone(&stages);
    let inputs = load_inputs(load_config());

    Pipeline::builder()
        .config(inputs.config.clone())
        .sic_mapping(inputs.mapping.clone())
        .on_progress(move |update| {
            stages_clone.lock().unwrap().push(update.stage);
        })
        .build()
        .unwrap()
        .process(inputs.records, Some(&inputs.backdata))
        .unwrap();

    let stages = stages.lock().unwrap();
    assert_eq!(stages.first(), Some(&ImputationStage::Validation));
    assert_eq!(stages.last(), Some(&ImputationStage::Complete));
    for stage in [
        ImputationStage::Apportionment,
        ImputationStage::MeanOfRatios,
        ImputationStage::TrimmedMean,
        ImputationStage::Expansion,
    ] {
        assert!(stages.contains(&stage), "missing stage {stage:?}");
    }
}

// ============================================================================
// Output Tests
// ============================================================================

#[test]
fn test_outputs_written_to_directory() {
    let config = load_config();
    let output = run(load_inputs(config.clone()), true);
    let dir = std::env::temp_dir().join(format!("survey_imputation_it_{}", std::process::id()));

    let generator = ReportGenerator::new(dir.clone());
    let paths = generator.write_outputs(&output, &config, "current").unwrap();
    assert_eq!(paths.len(), 3);
    assert!(paths.iter().all(|p| p.exists()));

    let imputed = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(paths[0].clone()))
        .unwrap()
        .finish()
        .unwrap();
    assert_eq!(imputed.height(), 13);
    let expansion_column = format!("202{EXPANSION_SUFFIX}");
    let provenance = imputed.column(&expansion_column).unwrap();
    assert_eq!(provenance.len() - provenance.null_count(), 1);

    let summary = RunSummary::from_output(&output, 1).with_input_file("current.csv");
    let report = generator.write_summary(&summary, "current").unwrap();
    let json = std::fs::read_to_string(&report).unwrap();
    assert!(json.contains("\"input_file\": \"current.csv\""));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_qa_tables_suppressed() {
    let mut config = load_config();
    config.produce_qa = false;
    let output = run(load_inputs(config.clone()), true);

    assert!(output.trim_qa.is_empty());
    assert!(output.link_qa.is_empty());

    let dir = std::env::temp_dir().join(format!("survey_imputation_noqa_{}", std::process::id()));
    let paths = ReportGenerator::new(dir.clone())
        .write_outputs(&output, &config, "current")
        .unwrap();
    assert_eq!(paths.len(), 1);
    std::fs::remove_dir_all(&dir).ok();
}

// ============================================================================
// Constructed Records
// ============================================================================

fn small_config() -> ImputationConfig {
    ImputationConfig::builder()
        .variables(vec![VariableGroup::new("211", &["202"])])
        .composite_totals(vec![])
        .without_apportionment()
        .build()
        .unwrap()
}

fn return_of(
    reference: i64,
    form_type: FormType,
    status: Status,
    values: (Option<f64>, Option<f64>),
) -> SurveyRecord {
    SurveyRecord::new(reference, Some(1), 202212, form_type, status)
        .with_dimensions(Some(CivilDefence::Civil), Some("AA"))
        .with_value("211", values.0)
        .with_value("202", values.1)
}

fn constructed(reference: i64, form_type: FormType, forced: bool, master: f64) -> SurveyRecord {
    let mut record = return_of(
        reference,
        form_type,
        Status::FormSentOut,
        (Some(master), Some(master / 2.0)),
    );
    record.constructed = true;
    record.force_imputation = forced;
    record
}

fn run_constructed(extra: Vec<SurveyRecord>) -> ImputationOutput {
    let mut records: Vec<SurveyRecord> = (1..=4)
        .map(|i| return_of(i, FormType::Long, Status::Clear, (Some(10.0), Some(5.0))))
        .collect();
    records.extend(extra);
    Pipeline::builder()
        .config(small_config())
        .build()
        .unwrap()
        .process(records, None)
        .unwrap()
}

#[test]
fn test_forced_constructed_short_form_is_imputed_and_expanded() {
    let output = run_constructed(vec![constructed(50, FormType::Short, true, 40.0)]);
    let forced = find(&output, 50, Some(1));

    assert_eq!(forced.marker, ImputationMarker::TrimmedMean);
    assert_eq!(forced.value("211"), Some(10.0));
    assert_relative_eq!(forced.value("202").unwrap(), 5.0, epsilon = 1e-9);
    assert_eq!(
        forced.expansion.get("202"),
        Some(&ExpansionSource::ImpClassGroup)
    );
}

#[test]
fn test_forced_constructed_long_form_is_imputed() {
    let output = run_constructed(vec![constructed(60, FormType::Long, true, 40.0)]);
    let forced = find(&output, 60, Some(1));

    assert_eq!(forced.marker, ImputationMarker::TrimmedMean);
    assert_eq!(forced.value("211"), Some(10.0));
    assert_eq!(forced.value("202"), Some(5.0));
    assert!(forced.expansion.is_empty());
}

#[test]
fn test_unforced_constructed_records_keep_their_values() {
    let output = run_constructed(vec![
        constructed(70, FormType::Short, false, 60.0),
        constructed(71, FormType::Long, false, 80.0),
    ]);

    let short = find(&output, 70, Some(1));
    assert_eq!(short.marker, ImputationMarker::Constructed);
    assert_eq!(short.value("211"), Some(60.0));
    assert_eq!(short.value("202"), Some(30.0));
    assert_eq!(
        short.expansion.get("202"),
        Some(&ExpansionSource::Constructed)
    );

    let long = find(&output, 71, Some(1));
    assert_eq!(long.marker, ImputationMarker::Constructed);
    assert_eq!(long.value("211"), Some(80.0));
    assert_eq!(long.value("202"), Some(40.0));
}
