//! Conversion between polars `DataFrame`s and survey records.
//!
//! The engine itself works on [`SurveyRecord`]s; this module is the only place
//! that knows about column layout. Identity columns are required, configured
//! numeric columns must exist, and every other known column is optional.

use crate::config::{ColumnNames, ImputationConfig};
use crate::error::{ImputationError, Result, ResultExt};
use crate::imputers::{Backdata, SicMapping};
use crate::types::{
    CivilDefence, FormType, LinkFactorQaRow, Status, SurveyRecord, TrimQaRow,
};
use polars::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Output column holding the imputation class label.
pub const CLASS_COLUMN: &str = "imp_class";
/// Output column holding the imputation marker.
pub const MARKER_COLUMN: &str = "imp_marker";
/// Suffix of the per-breakdown expansion provenance columns.
pub const EXPANSION_SUFFIX: &str = "_expansion";

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

fn require_column(df: &DataFrame, name: &str, stage: &'static str) -> Result<()> {
    if has_column(df, name) {
        Ok(())
    } else {
        Err(ImputationError::MissingField {
            stage,
            field: name.to_string(),
        })
    }
}

/// Trimmed, non-empty strings of a column.
pub(crate) fn string_values(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let column = df.column(name)?.cast(&DataType::String)?;
    Ok(column
        .str()?
        .into_iter()
        .map(|v| v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string))
        .collect())
}

pub(crate) fn float_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let column = df.column(name)?.cast(&DataType::Float64)?;
    Ok(column.f64()?.into_iter().collect())
}

pub(crate) fn int_values(df: &DataFrame, name: &str) -> Result<Vec<Option<i64>>> {
    let column = df.column(name)?.cast(&DataType::Int64)?;
    Ok(column.i64()?.into_iter().collect())
}

/// Optional column reader: all-missing when the column is absent.
fn optional<T: Clone>(
    df: &DataFrame,
    name: &str,
    read: fn(&DataFrame, &str) -> Result<Vec<Option<T>>>,
) -> Result<Vec<Option<T>>> {
    if has_column(df, name) {
        read(df, name)
    } else {
        Ok(vec![None; df.height()])
    }
}

fn invalid(column: &str, value: &str) -> ImputationError {
    ImputationError::InvalidValue {
        column: column.to_string(),
        value: value.to_string(),
    }
}

/// Parse a yes/no style answer.
pub fn parse_yes_no(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "t" | "1" => Some(true),
        "no" | "n" | "false" | "f" | "0" => Some(false),
        _ => None,
    }
}

fn parse_flags(df: &DataFrame, name: &str) -> Result<Vec<bool>> {
    optional(df, name, string_values)?
        .into_iter()
        .map(|v| match v {
            None => Ok(false),
            Some(raw) => parse_yes_no(&raw).ok_or_else(|| invalid(name, &raw)),
        })
        .collect()
}

/// Read records with the given numeric fields; numeric fields absent from the
/// frame are skipped.
fn read_records(
    df: &DataFrame,
    columns: &ColumnNames,
    numeric: &[String],
    stage: &'static str,
) -> Result<Vec<SurveyRecord>> {
    for name in columns.required() {
        require_column(df, name, stage)?;
    }

    let references = int_values(df, &columns.reference)?;
    let instances = int_values(df, &columns.instance)?;
    let periods = int_values(df, &columns.period)?;
    let form_types = string_values(df, &columns.form_type)?;
    let statuses = string_values(df, &columns.status)?;
    let civil_defence = optional(df, &columns.civil_or_defence, string_values)?;
    let product_groups = optional(df, &columns.product_group, string_values)?;
    let sics = optional(df, &columns.sic, int_values)?;
    let cells = optional(df, &columns.cell_number, int_values)?;
    let employees = optional(df, &columns.employees, float_values)?;
    let rd_activity = optional(df, &columns.rd_activity, string_values)?;
    let constructed = parse_flags(df, &columns.constructed)?;
    let forced = parse_flags(df, &columns.force_imputation)?;
    let manual_trim = parse_flags(df, &columns.manual_trim)?;

    let mut values = Vec::new();
    for name in numeric {
        if has_column(df, name) {
            values.push((name.as_str(), float_values(df, name)?));
        }
    }

    let mut records = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let reference =
            references[row].ok_or_else(|| invalid(&columns.reference, "null"))?;
        let period = periods[row].ok_or_else(|| invalid(&columns.period, "null"))?;
        let form_raw = form_types[row].as_deref().unwrap_or("");
        let form_type =
            FormType::parse(form_raw).ok_or_else(|| invalid(&columns.form_type, form_raw))?;
        let status = statuses[row]
            .as_deref()
            .map(Status::parse)
            .ok_or_else(|| invalid(&columns.status, "null"))?;

        let mut record = SurveyRecord::new(reference, instances[row], period, form_type, status);
        record.civil_or_defence = match civil_defence[row].as_deref() {
            Some(raw) => Some(
                CivilDefence::parse(raw).ok_or_else(|| invalid(&columns.civil_or_defence, raw))?,
            ),
            None => None,
        };
        record.product_group = product_groups[row].clone();
        record.sic = sics[row];
        record.cell_number = cells[row];
        record.employees = employees[row];
        record.rd_activity = rd_activity[row].as_deref().and_then(parse_yes_no);
        record.constructed = constructed[row];
        record.force_imputation = forced[row];
        record.manual_trim = manual_trim[row];
        for (name, column) in &values {
            record.set_value(name, column[row]);
        }
        records.push(record);
    }

    Ok(records)
}

/// Build current-period records from a DataFrame.
///
/// Missing identity columns are a `MissingField` error. A configured variable
/// with no column is an `UnknownVariable` error. Apportionment fields are read
/// when present and checked by the apportionment stage.
pub fn records_from_dataframe(df: &DataFrame, config: &ImputationConfig) -> Result<Vec<SurveyRecord>> {
    for name in config.carried_variables() {
        if !has_column(df, name) {
            return Err(ImputationError::UnknownVariable(name.to_string()));
        }
    }
    let numeric: Vec<String> = config
        .required_numeric_fields()
        .into_iter()
        .map(str::to_string)
        .collect();

    let records = read_records(df, &config.columns, &numeric, "ingestion")
        .context("Reading record table")?;
    info!("Read {} records ({} numeric fields)", records.len(), numeric.len());
    Ok(records)
}

/// Build prior-period records from a DataFrame.
///
/// Numeric fields may carry the configured legacy prefix; both spellings are
/// read and normalised by the carry-forward stage.
pub fn backdata_from_dataframe(df: &DataFrame, config: &ImputationConfig) -> Result<Backdata> {
    let mut numeric = Vec::new();
    for name in config.required_numeric_fields() {
        numeric.push(name.to_string());
        if !config.backdata_prefix.is_empty() {
            numeric.push(format!("{}{}", config.backdata_prefix, name));
        }
    }

    let records = read_records(df, &config.columns, &numeric, "backdata")
        .context("Reading backdata table")?;
    debug!("Read {} backdata records", records.len());
    Ok(Backdata::new(records))
}

/// Build the SIC to product-group mapping from a DataFrame.
pub fn sic_mapping_from_dataframe(df: &DataFrame, columns: &ColumnNames) -> Result<SicMapping> {
    require_column(df, &columns.mapping_sic, "sic_mapping")?;
    require_column(df, &columns.mapping_product_group, "sic_mapping")?;

    let sics = int_values(df, &columns.mapping_sic)?;
    let groups = string_values(df, &columns.mapping_product_group)?;
    let mapping = SicMapping::from_pairs(
        sics.into_iter()
            .zip(groups)
            .filter_map(|(sic, pg)| Some((sic?, pg?))),
    );
    debug!("Loaded {} SIC mappings", mapping.len());
    Ok(mapping)
}

/// Numeric output columns: configured fields first, then any others.
fn numeric_columns(records: &[SurveyRecord], config: &ImputationConfig) -> Vec<String> {
    let mut names: Vec<String> = config
        .required_numeric_fields()
        .into_iter()
        .map(str::to_string)
        .collect();
    let extra: BTreeSet<&String> = records
        .iter()
        .flat_map(|r| r.values.keys())
        .filter(|k| !names.contains(k))
        .collect();
    names.extend(extra.into_iter().cloned());
    names
}

/// Convert imputed records back to a DataFrame.
pub fn records_to_dataframe(records: &[SurveyRecord], config: &ImputationConfig) -> Result<DataFrame> {
    let c = &config.columns;
    let mut columns = vec![
        Column::new(c.reference.as_str().into(), records.iter().map(|r| r.reference).collect::<Vec<_>>()),
        Column::new(c.instance.as_str().into(), records.iter().map(|r| r.instance).collect::<Vec<_>>()),
        Column::new(c.period.as_str().into(), records.iter().map(|r| r.period).collect::<Vec<_>>()),
        Column::new(
            c.form_type.as_str().into(),
            records.iter().map(|r| r.form_type.code()).collect::<Vec<_>>(),
        ),
        Column::new(
            c.status.as_str().into(),
            records.iter().map(|r| r.status.label().to_string()).collect::<Vec<_>>(),
        ),
        Column::new(
            c.civil_or_defence.as_str().into(),
            records
                .iter()
                .map(|r| r.civil_or_defence.map(|cd| cd.code()))
                .collect::<Vec<_>>(),
        ),
        Column::new(
            c.product_group.as_str().into(),
            records.iter().map(|r| r.product_group.clone()).collect::<Vec<_>>(),
        ),
        Column::new(c.sic.as_str().into(), records.iter().map(|r| r.sic).collect::<Vec<_>>()),
        Column::new(
            c.cell_number.as_str().into(),
            records.iter().map(|r| r.cell_number).collect::<Vec<_>>(),
        ),
        Column::new(
            c.employees.as_str().into(),
            records.iter().map(|r| r.employees).collect::<Vec<_>>(),
        ),
        Column::new(
            c.rd_activity.as_str().into(),
            records
                .iter()
                .map(|r| r.rd_activity.map(|yes| if yes { "Yes" } else { "No" }))
                .collect::<Vec<_>>(),
        ),
        Column::new(
            c.constructed.as_str().into(),
            records.iter().map(|r| r.constructed).collect::<Vec<_>>(),
        ),
        Column::new(
            c.force_imputation.as_str().into(),
            records.iter().map(|r| r.force_imputation).collect::<Vec<_>>(),
        ),
        Column::new(
            c.manual_trim.as_str().into(),
            records.iter().map(|r| r.manual_trim).collect::<Vec<_>>(),
        ),
    ];

    for name in numeric_columns(records, config) {
        let values: Vec<Option<f64>> = records.iter().map(|r| r.value(&name)).collect();
        columns.push(Column::new(name.as_str().into(), values));
    }

    columns.push(Column::new(
        CLASS_COLUMN.into(),
        records.iter().map(|r| r.class.label()).collect::<Vec<_>>(),
    ));
    columns.push(Column::new(
        MARKER_COLUMN.into(),
        records.iter().map(|r| r.marker.code()).collect::<Vec<_>>(),
    ));
    for breakdown in config.breakdown_variables() {
        let sources: Vec<Option<&str>> = records
            .iter()
            .map(|r| r.expansion.get(breakdown).map(|s| s.code()))
            .collect();
        columns.push(Column::new(
            format!("{breakdown}{EXPANSION_SUFFIX}").as_str().into(),
            sources,
        ));
    }

    DataFrame::new(columns).context("Building imputed table")
}

/// Trim QA rows as a DataFrame.
pub fn trim_qa_to_dataframe(rows: &[TrimQaRow]) -> Result<DataFrame> {
    let df = DataFrame::new(vec![
        Column::new("reference".into(), rows.iter().map(|r| r.reference).collect::<Vec<_>>()),
        Column::new("instance".into(), rows.iter().map(|r| r.instance).collect::<Vec<_>>()),
        Column::new(CLASS_COLUMN.into(), rows.iter().map(|r| r.class.clone()).collect::<Vec<_>>()),
        Column::new("variable".into(), rows.iter().map(|r| r.variable.clone()).collect::<Vec<_>>()),
        Column::new("value".into(), rows.iter().map(|r| r.value).collect::<Vec<_>>()),
        Column::new("trimmed".into(), rows.iter().map(|r| r.trimmed).collect::<Vec<_>>()),
    ])?;
    Ok(df)
}

/// Link-factor QA rows as a DataFrame.
pub fn link_qa_to_dataframe(rows: &[LinkFactorQaRow]) -> Result<DataFrame> {
    let df = DataFrame::new(vec![
        Column::new(CLASS_COLUMN.into(), rows.iter().map(|r| r.class.clone()).collect::<Vec<_>>()),
        Column::new("variable".into(), rows.iter().map(|r| r.variable.clone()).collect::<Vec<_>>()),
        Column::new("link_factor".into(), rows.iter().map(|r| r.link_factor).collect::<Vec<_>>()),
        Column::new(
            "pair_count".into(),
            rows.iter().map(|r| r.pair_count as u64).collect::<Vec<_>>(),
        ),
        Column::new("defaulted".into(), rows.iter().map(|r| r.defaulted).collect::<Vec<_>>()),
    ])?;
    Ok(df)
}
