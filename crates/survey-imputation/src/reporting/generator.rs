use crate::config::ImputationConfig;
use crate::error::Result;
use crate::table::{link_qa_to_dataframe, records_to_dataframe, trim_qa_to_dataframe};
use crate::types::{ImputationMarker, ImputationOutput, LinkFactorQaRow, TrimQaRow};
use chrono::Local;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

/// Summary of one imputation run, for `--json` and `--emit-report`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Timestamp when the summary was generated
    pub generated_at: String,
    pub input_file: Option<String>,
    pub records: usize,
    /// Record count per imputation marker code
    pub markers: BTreeMap<String, usize>,
    /// Expanded breakdown values per provenance code
    pub expansion: BTreeMap<String, usize>,
    pub trim_qa_rows: usize,
    pub trimmed_values: usize,
    pub link_factors: usize,
    pub defaulted_link_factors: usize,
    pub duration_ms: u128,
    /// Files written by the run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

impl RunSummary {
    /// Summarise an imputation output.
    pub fn from_output(output: &ImputationOutput, duration_ms: u128) -> Self {
        let mut markers: BTreeMap<String, usize> = BTreeMap::new();
        let mut expansion: BTreeMap<String, usize> = BTreeMap::new();
        for record in &output.records {
            *markers.entry(record.marker.code().to_string()).or_default() += 1;
            for source in record.expansion.values() {
                *expansion.entry(source.code().to_string()).or_default() += 1;
            }
        }

        Self {
            generated_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            input_file: None,
            records: output.records.len(),
            markers,
            expansion,
            trim_qa_rows: output.trim_qa.len(),
            trimmed_values: output.trim_qa.iter().filter(|r| r.trimmed).count(),
            link_factors: output.link_qa.len(),
            defaulted_link_factors: output.link_qa.iter().filter(|r| r.defaulted).count(),
            duration_ms,
            outputs: Vec::new(),
        }
    }

    pub fn with_input_file(mut self, path: impl Into<String>) -> Self {
        self.input_file = Some(path.into());
        self
    }

    /// Number of records carrying `marker`.
    pub fn marker_count(&self, marker: ImputationMarker) -> usize {
        self.markers.get(marker.code()).copied().unwrap_or(0)
    }
}

/// Writes imputed tables, QA tables and run summaries to an output directory.
pub struct ReportGenerator {
    output_dir: PathBuf,
}

impl ReportGenerator {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    fn write_csv(&self, df: &mut DataFrame, file_name: &str) -> Result<PathBuf> {
        let path = self.output_dir.join(file_name);
        let mut file = File::create(&path)?;
        CsvWriter::new(&mut file)
            .include_header(true)
            .with_separator(b',')
            .finish(df)?;
        info!("Table saved: {}", path.display());
        Ok(path)
    }

    /// Write the imputed table and, when present, the QA tables.
    ///
    /// Files are named `<base>_imputed.csv`, `<base>_trim_qa.csv` and
    /// `<base>_link_qa.csv`.
    pub fn write_outputs(
        &self,
        output: &ImputationOutput,
        config: &ImputationConfig,
        base_name: &str,
    ) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.output_dir)?;

        let mut paths = Vec::new();
        let mut imputed = records_to_dataframe(&output.records, config)?;
        paths.push(self.write_csv(&mut imputed, &format!("{base_name}_imputed.csv"))?);

        if config.produce_qa {
            paths.extend(self.write_qa(&output.trim_qa, &output.link_qa, base_name)?);
        }
        Ok(paths)
    }

    /// Write the trim and link-factor QA tables on their own, for instance
    /// the tables a failed run built before it stopped.
    pub fn write_qa(
        &self,
        trim_qa: &[TrimQaRow],
        link_qa: &[LinkFactorQaRow],
        base_name: &str,
    ) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.output_dir)?;

        let mut trim = trim_qa_to_dataframe(trim_qa)?;
        let mut link = link_qa_to_dataframe(link_qa)?;
        Ok(vec![
            self.write_csv(&mut trim, &format!("{base_name}_trim_qa.csv"))?,
            self.write_csv(&mut link, &format!("{base_name}_link_qa.csv"))?,
        ])
    }

    /// Write a run summary as `<base>_report.json`.
    pub fn write_summary(&self, summary: &RunSummary, base_name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;

        let path = self.output_dir.join(format!("{base_name}_report.json"));
        let mut file = File::create(&path)?;
        file.write_all(serde_json::to_string_pretty(summary)?.as_bytes())?;

        info!("Report saved: {}", path.display());
        Ok(path)
    }
}
