//! Record and output types shared by every stage.

use crate::classifier::ImputationClass;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Questionnaire variant a record was returned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormType {
    /// Full breakdown questionnaire ("0001").
    Long,
    /// Aggregate-only questionnaire ("0006").
    Short,
}

impl FormType {
    /// Parse a form-type code, tolerating leading zeros and names.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        match trimmed.trim_start_matches('0') {
            "1" => Some(Self::Long),
            "6" => Some(Self::Short),
            _ => match trimmed.to_ascii_lowercase().as_str() {
                "long" => Some(Self::Long),
                "short" => Some(Self::Short),
                _ => None,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Long => "0001",
            Self::Short => "0006",
        }
    }
}

/// Response status of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Clear,
    ClearOverridden,
    FormSentOut,
    CheckNeeded,
    Other(String),
}

impl Status {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "clear" => Self::Clear,
            "clear - overridden" | "clear-overridden" => Self::ClearOverridden,
            "form sent out" => Self::FormSentOut,
            "check needed" => Self::CheckNeeded,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    /// Whether the return has been validated and can be used as a donor.
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear | Self::ClearOverridden)
    }

    /// Whether the record is a candidate for carry-forward.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::FormSentOut | Self::CheckNeeded)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Clear => "Clear",
            Self::ClearOverridden => "Clear - overridden",
            Self::FormSentOut => "Form sent out",
            Self::CheckNeeded => "Check needed",
            Self::Other(label) => label,
        }
    }
}

/// Civil or defence R&D indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CivilDefence {
    Civil,
    Defence,
}

impl CivilDefence {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "C" | "CIVIL" => Some(Self::Civil),
            "D" | "DEFENCE" => Some(Self::Defence),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Civil => "C",
            Self::Defence => "D",
        }
    }
}

impl fmt::Display for CivilDefence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Provenance of a record's values after imputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ImputationMarker {
    /// Clear return, values as reported.
    Responded,
    /// Not yet resolved by any stage.
    NoImputation,
    /// Copied from the prior period.
    CarriedForward,
    /// Copied from the prior period and scaled by a link factor.
    BackInfilled,
    /// Replaced by the trimmed class mean.
    TrimmedMean,
    /// Class had no clear responders; left for manual follow-up.
    NoMeanFound,
    /// Values set by the construction process.
    Constructed,
}

impl ImputationMarker {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Responded => "R",
            Self::NoImputation => "no_imputation",
            Self::CarriedForward => "CF",
            Self::BackInfilled => "BI",
            Self::TrimmedMean => "TMI",
            Self::NoMeanFound => "No mean found",
            Self::Constructed => "constructed",
        }
    }

    /// Whether the record's values were produced by an imputation stage.
    pub fn is_imputed(&self) -> bool {
        matches!(
            self,
            Self::CarriedForward | Self::BackInfilled | Self::TrimmedMean
        )
    }
}

impl fmt::Display for ImputationMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// How a short-form breakdown value was estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionSource {
    /// Ratio from all responders with the same civil/defence indicator.
    CivilDefenceFallback,
    /// Ratio from responders in the same imputation class.
    ImpClassGroup,
    /// Known value of a constructed record copied through.
    Constructed,
}

impl ExpansionSource {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CivilDefenceFallback => "civil_defence_fallback",
            Self::ImpClassGroup => "imp_class_group",
            Self::Constructed => "constructed",
        }
    }
}

/// One (reference, instance) return for one survey period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyRecord {
    pub reference: i64,
    pub instance: Option<i64>,
    pub period: i64,
    pub form_type: FormType,
    pub status: Status,
    pub civil_or_defence: Option<CivilDefence>,
    pub product_group: Option<String>,
    pub sic: Option<i64>,
    pub cell_number: Option<i64>,
    /// Business size, used to order trimming candidates.
    pub employees: Option<f64>,
    /// Answer to "did the business do any R&D"; `Some(false)` is a no-R&D return.
    pub rd_activity: Option<bool>,
    /// Canonical numeric fields.
    pub values: BTreeMap<String, Option<f64>>,
    /// Working values written by the imputation stages.
    pub imputed: BTreeMap<String, Option<f64>>,
    pub constructed: bool,
    pub force_imputation: bool,
    pub manual_trim: bool,
    pub marker: ImputationMarker,
    pub class: ImputationClass,
    /// Variables for which this record was trimmed from the class mean.
    pub trimmed: BTreeSet<String>,
    /// Provenance of expanded short-form breakdown values.
    pub expansion: BTreeMap<String, ExpansionSource>,
}

impl SurveyRecord {
    /// Create a record with no dimensions, values or flags.
    pub fn new(reference: i64, instance: Option<i64>, period: i64, form_type: FormType, status: Status) -> Self {
        Self {
            reference,
            instance,
            period,
            form_type,
            status,
            civil_or_defence: None,
            product_group: None,
            sic: None,
            cell_number: None,
            employees: None,
            rd_activity: None,
            values: BTreeMap::new(),
            imputed: BTreeMap::new(),
            constructed: false,
            force_imputation: false,
            manual_trim: false,
            marker: ImputationMarker::NoImputation,
            class: ImputationClass::Undefined,
            trimmed: BTreeSet::new(),
            expansion: BTreeMap::new(),
        }
    }

    /// Record key used for sorting and merging.
    pub fn key(&self) -> (i64, Option<i64>) {
        (self.reference, self.instance)
    }

    /// Instance 0 holds reference-level answers on the long form.
    pub fn is_instance_zero(&self) -> bool {
        self.instance == Some(0)
    }

    pub fn is_no_rd(&self) -> bool {
        self.rd_activity == Some(false)
    }

    /// Constructed values stand unless the record is flagged for imputation.
    pub fn keeps_constructed_values(&self) -> bool {
        self.constructed && !self.force_imputation
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied().flatten()
    }

    pub fn set_value(&mut self, name: &str, value: Option<f64>) {
        self.values.insert(name.to_string(), value);
    }

    /// Working value of a field.
    pub fn working(&self, name: &str) -> Option<f64> {
        self.imputed.get(name).copied().flatten()
    }

    pub fn set_working(&mut self, name: &str, value: Option<f64>) {
        self.imputed.insert(name.to_string(), value);
    }

    /// Copy the canonical values into the working fields.
    pub fn snapshot(&mut self) {
        self.imputed = self.values.clone();
    }

    /// Replace the canonical values with the working fields.
    pub fn commit(&mut self) {
        for (name, value) in &self.imputed {
            self.values.insert(name.clone(), *value);
        }
    }

    /// Builder-style helpers used by callers assembling tables in code.
    pub fn with_dimensions(
        mut self,
        civil_or_defence: Option<CivilDefence>,
        product_group: Option<&str>,
    ) -> Self {
        self.civil_or_defence = civil_or_defence;
        self.product_group = product_group.map(str::to_string);
        self
    }

    pub fn with_value(mut self, name: &str, value: Option<f64>) -> Self {
        self.set_value(name, value);
        self
    }
}

/// Per (record, variable) trimming decision of the trimmed-mean stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimQaRow {
    pub reference: i64,
    pub instance: Option<i64>,
    pub class: String,
    pub variable: String,
    pub value: f64,
    pub trimmed: bool,
}

/// Per (class, variable) link factor of the mean-of-ratios stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkFactorQaRow {
    pub class: String,
    pub variable: String,
    pub link_factor: f64,
    pub pair_count: usize,
    /// True when too few pairs existed and the factor defaulted to 1.0.
    pub defaulted: bool,
}

/// Everything an imputation run hands back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImputationOutput {
    pub records: Vec<SurveyRecord>,
    pub trim_qa: Vec<TrimQaRow>,
    pub link_qa: Vec<LinkFactorQaRow>,
}
