//! Configuration types for the imputation engine.
//!
//! This module provides the run configuration using the builder pattern.
//! The configuration is validated once, before any record is touched, and then
//! threaded explicitly through every stage.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A master (target) variable and the breakdown variables that sum into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableGroup {
    /// The aggregate question reported on both form types.
    pub master: String,
    /// Fine-grained questions reported only on the long form.
    pub breakdowns: Vec<String>,
}

impl VariableGroup {
    pub fn new(master: impl Into<String>, breakdowns: &[&str]) -> Self {
        Self {
            master: master.into(),
            breakdowns: breakdowns.iter().map(|b| b.to_string()).collect(),
        }
    }
}

/// A derived total recomputed as the sum of its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeTotal {
    pub total: String,
    pub parts: Vec<String>,
}

impl CompositeTotal {
    pub fn new(total: impl Into<String>, parts: &[&str]) -> Self {
        Self {
            total: total.into(),
            parts: parts.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Which sibling instances share the apportionment total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApportionScope {
    /// All instances of the reference.
    #[default]
    Reference,
    /// Instances of the reference with the same civil/defence indicator.
    ReferenceCivilDefence,
}

/// A field held at instance 0 that is spread over the other instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApportionedField {
    pub name: String,
    #[serde(default)]
    pub scope: ApportionScope,
}

impl ApportionedField {
    pub fn new(name: impl Into<String>, scope: ApportionScope) -> Self {
        Self {
            name: name.into(),
            scope,
        }
    }
}

/// Apportionment settings: the measure the shares are proportional to and
/// the fields to spread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApportionmentConfig {
    pub measure: String,
    pub fields: Vec<ApportionedField>,
}

impl Default for ApportionmentConfig {
    fn default() -> Self {
        let fields = [
            "emp_researcher",
            "emp_technician",
            "emp_other",
            "emp_total",
        ]
        .into_iter()
        .map(|name| ApportionedField::new(name, ApportionScope::Reference))
        .collect();

        Self {
            measure: "211".to_string(),
            fields,
        }
    }
}

/// Column names of the record table, keyed by logical role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub reference: String,
    pub instance: String,
    pub period: String,
    pub form_type: String,
    pub status: String,
    pub civil_or_defence: String,
    pub product_group: String,
    pub sic: String,
    pub cell_number: String,
    pub employees: String,
    pub rd_activity: String,
    pub constructed: String,
    pub force_imputation: String,
    pub manual_trim: String,
    /// SIC column of the SIC to product-group mapping table.
    pub mapping_sic: String,
    /// Product-group column of the SIC to product-group mapping table.
    pub mapping_product_group: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            reference: "reference".to_string(),
            instance: "instance".to_string(),
            period: "period".to_string(),
            form_type: "formtype".to_string(),
            status: "status".to_string(),
            civil_or_defence: "200".to_string(),
            product_group: "201".to_string(),
            sic: "rusic".to_string(),
            cell_number: "cellnumber".to_string(),
            employees: "employees".to_string(),
            rd_activity: "604".to_string(),
            constructed: "is_constructed".to_string(),
            force_imputation: "force_imputation".to_string(),
            manual_trim: "manual_trim".to_string(),
            mapping_sic: "sic".to_string(),
            mapping_product_group: "pg".to_string(),
        }
    }
}

impl ColumnNames {
    /// Ordered (role, column) pairs for every column the engine knows about.
    pub fn schema(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("reference", self.reference.as_str()),
            ("instance", self.instance.as_str()),
            ("period", self.period.as_str()),
            ("form_type", self.form_type.as_str()),
            ("status", self.status.as_str()),
            ("civil_or_defence", self.civil_or_defence.as_str()),
            ("product_group", self.product_group.as_str()),
            ("sic", self.sic.as_str()),
            ("cell_number", self.cell_number.as_str()),
            ("employees", self.employees.as_str()),
            ("rd_activity", self.rd_activity.as_str()),
            ("constructed", self.constructed.as_str()),
            ("force_imputation", self.force_imputation.as_str()),
            ("manual_trim", self.manual_trim.as_str()),
            ("mapping_sic", self.mapping_sic.as_str()),
            ("mapping_product_group", self.mapping_product_group.as_str()),
        ]
    }

    /// Identity columns every record table must carry.
    pub fn required(&self) -> [&str; 5] {
        [
            self.reference.as_str(),
            self.instance.as_str(),
            self.period.as_str(),
            self.form_type.as_str(),
            self.status.as_str(),
        ]
    }
}

/// Configuration for an imputation run.
///
/// Use [`ImputationConfig::builder()`] to create a new configuration
/// with fluent API.
///
/// # Example
///
/// ```rust,ignore
/// use survey_imputation::config::{ImputationConfig, VariableGroup};
///
/// let config = ImputationConfig::builder()
///     .trim_threshold(10)
///     .trim_percentiles(15, 15)
///     .variables(vec![VariableGroup::new("211", &["202", "203"])])
///     .build()?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputationConfig {
    /// A class+variable is trimmed only when it has more non-zero clear values
    /// than this.
    /// Default: 10
    pub trim_threshold: usize,

    /// Percentage of the lowest non-zero values trimmed from a class mean.
    /// Default: 15
    pub lower_trim_percent: u32,

    /// Percentage of the highest non-zero values trimmed from a class mean.
    /// Default: 15
    pub upper_trim_percent: u32,

    /// A class-level expansion ratio replaces the civil/defence ratio only when
    /// the class has more non-zero-master responders than this.
    /// Default: 3
    pub expansion_threshold: usize,

    /// Minimum number of paired observations for a non-default link factor.
    /// Default: 5
    pub mor_min_pairs: usize,

    /// Decimal places apportionment shares are rounded to.
    /// Default: 4
    pub rounding_precision: u32,

    /// Master variables with their breakdowns.
    pub variables: Vec<VariableGroup>,

    /// Totals recomputed from their parts after imputation.
    pub composite_totals: Vec<CompositeTotal>,

    /// Apportionment of instance-0 values. `None` disables the stage.
    pub apportionment: Option<ApportionmentConfig>,

    /// Legacy prefix stripped from backdata field names.
    /// Default: "q"
    pub backdata_prefix: String,

    /// Whether carried-forward values are scaled by link factors.
    /// Default: true
    pub back_infill: bool,

    /// Whether QA tables are produced.
    /// Default: true
    pub produce_qa: bool,

    /// Column names of the input tables.
    pub columns: ColumnNames,
}

impl Default for ImputationConfig {
    fn default() -> Self {
        Self {
            trim_threshold: 10,
            lower_trim_percent: 15,
            upper_trim_percent: 15,
            expansion_threshold: 3,
            mor_min_pairs: 5,
            rounding_precision: 4,
            variables: default_variables(),
            composite_totals: default_composite_totals(),
            apportionment: Some(ApportionmentConfig::default()),
            backdata_prefix: "q".to_string(),
            back_infill: true,
            produce_qa: true,
            columns: ColumnNames::default(),
        }
    }
}

fn default_variables() -> Vec<VariableGroup> {
    vec![
        VariableGroup::new("211", &["202", "203", "204", "205", "206", "207"]),
        VariableGroup::new("305", &["302", "303", "304"]),
        VariableGroup::new("emp_total", &["emp_researcher", "emp_technician", "emp_other"]),
        VariableGroup::new(
            "headcount_total",
            &[
                "headcount_res_m",
                "headcount_res_f",
                "headcount_tec_m",
                "headcount_tec_f",
                "headcount_oth_m",
                "headcount_oth_f",
            ],
        ),
    ]
}

fn default_composite_totals() -> Vec<CompositeTotal> {
    vec![
        CompositeTotal::new(
            "headcount_tot_m",
            &["headcount_res_m", "headcount_tec_m", "headcount_oth_m"],
        ),
        CompositeTotal::new(
            "headcount_tot_f",
            &["headcount_res_f", "headcount_tec_f", "headcount_oth_f"],
        ),
    ]
}

impl ImputationConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ImputationConfigBuilder {
        ImputationConfigBuilder::default()
    }

    /// Validate the configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.lower_trim_percent + self.upper_trim_percent >= 100 {
            return Err(ConfigValidationError::InvalidTrimPercentiles {
                lower: self.lower_trim_percent,
                upper: self.upper_trim_percent,
            });
        }

        if self.mor_min_pairs == 0 {
            return Err(ConfigValidationError::InvalidThreshold {
                field: "mor_min_pairs".to_string(),
                value: self.mor_min_pairs,
            });
        }

        if self.rounding_precision > 12 {
            return Err(ConfigValidationError::InvalidThreshold {
                field: "rounding_precision".to_string(),
                value: self.rounding_precision as usize,
            });
        }

        if self.variables.is_empty() {
            return Err(ConfigValidationError::NoVariables);
        }

        let mut seen = HashSet::new();
        for name in self.imputed_variables() {
            if name.trim().is_empty() {
                return Err(ConfigValidationError::EmptyName("variable"));
            }
            if !seen.insert(name) {
                return Err(ConfigValidationError::DuplicateVariable(name.to_string()));
            }
        }

        for composite in &self.composite_totals {
            if composite.parts.is_empty() {
                return Err(ConfigValidationError::EmptyComposite(composite.total.clone()));
            }
        }

        if let Some(apportionment) = &self.apportionment
            && apportionment.measure.trim().is_empty()
        {
            return Err(ConfigValidationError::EmptyName("apportionment measure"));
        }

        for (role, name) in self.columns.schema() {
            if name.trim().is_empty() {
                return Err(ConfigValidationError::EmptyName(role));
            }
        }

        Ok(())
    }

    /// Master variables in configuration order.
    pub fn target_variables(&self) -> Vec<&str> {
        self.variables.iter().map(|g| g.master.as_str()).collect()
    }

    /// Breakdown variables in configuration order.
    pub fn breakdown_variables(&self) -> Vec<&str> {
        self.variables
            .iter()
            .flat_map(|g| g.breakdowns.iter().map(String::as_str))
            .collect()
    }

    /// Masters followed by their breakdowns, group by group.
    pub fn imputed_variables(&self) -> Vec<&str> {
        self.variables
            .iter()
            .flat_map(|g| {
                std::iter::once(g.master.as_str()).chain(g.breakdowns.iter().map(String::as_str))
            })
            .collect()
    }

    /// Whether `name` is configured as a breakdown variable.
    pub fn is_breakdown(&self, name: &str) -> bool {
        self.variables
            .iter()
            .any(|g| g.breakdowns.iter().any(|b| b == name))
    }

    /// Every numeric field carried by carry-forward: imputed variables plus
    /// composite totals, without duplicates.
    pub fn carried_variables(&self) -> Vec<&str> {
        let mut names = self.imputed_variables();
        for composite in &self.composite_totals {
            for name in std::iter::once(&composite.total).chain(composite.parts.iter()) {
                if !names.contains(&name.as_str()) {
                    names.push(name.as_str());
                }
            }
        }
        names
    }

    /// Every numeric field the input table must provide.
    pub fn required_numeric_fields(&self) -> Vec<&str> {
        let mut names = self.carried_variables();
        if let Some(apportionment) = &self.apportionment {
            for name in std::iter::once(&apportionment.measure)
                .chain(apportionment.fields.iter().map(|f| &f.name))
            {
                if !names.contains(&name.as_str()) {
                    names.push(name.as_str());
                }
            }
        }
        names
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid trim percentiles: lower {lower}% + upper {upper}% must be below 100%")]
    InvalidTrimPercentiles { lower: u32, upper: u32 },

    #[error("Invalid value for '{field}': {value}")]
    InvalidThreshold { field: String, value: usize },

    #[error("No target variables configured")]
    NoVariables,

    #[error("Variable '{0}' is configured more than once")]
    DuplicateVariable(String),

    #[error("Composite total '{0}' has no parts")]
    EmptyComposite(String),

    #[error("Empty name configured for {0}")]
    EmptyName(&'static str),
}

/// Builder for [`ImputationConfig`] with fluent API.
#[derive(Debug, Default)]
pub struct ImputationConfigBuilder {
    trim_threshold: Option<usize>,
    lower_trim_percent: Option<u32>,
    upper_trim_percent: Option<u32>,
    expansion_threshold: Option<usize>,
    mor_min_pairs: Option<usize>,
    rounding_precision: Option<u32>,
    variables: Option<Vec<VariableGroup>>,
    composite_totals: Option<Vec<CompositeTotal>>,
    apportionment: Option<Option<ApportionmentConfig>>,
    backdata_prefix: Option<String>,
    back_infill: Option<bool>,
    produce_qa: Option<bool>,
    columns: Option<ColumnNames>,
}

impl ImputationConfigBuilder {
    /// Set the number of non-zero values a class must exceed to be trimmed.
    pub fn trim_threshold(mut self, threshold: usize) -> Self {
        self.trim_threshold = Some(threshold);
        self
    }

    /// Set the lower and upper trim percentages.
    ///
    /// # Arguments
    /// * `lower` - Percentage of the lowest non-zero values to trim (e.g., 15)
    /// * `upper` - Percentage of the highest non-zero values to trim (e.g., 15)
    pub fn trim_percentiles(mut self, lower: u32, upper: u32) -> Self {
        self.lower_trim_percent = Some(lower);
        self.upper_trim_percent = Some(upper);
        self
    }

    /// Set the responder count a class must exceed for class-level expansion.
    pub fn expansion_threshold(mut self, threshold: usize) -> Self {
        self.expansion_threshold = Some(threshold);
        self
    }

    /// Set the minimum number of paired observations for a link factor.
    pub fn mor_min_pairs(mut self, pairs: usize) -> Self {
        self.mor_min_pairs = Some(pairs);
        self
    }

    /// Set the decimal places apportionment shares are rounded to.
    pub fn rounding_precision(mut self, places: u32) -> Self {
        self.rounding_precision = Some(places);
        self
    }

    /// Replace the configured variable groups.
    pub fn variables(mut self, groups: Vec<VariableGroup>) -> Self {
        self.variables = Some(groups);
        self
    }

    /// Replace the configured composite totals.
    pub fn composite_totals(mut self, composites: Vec<CompositeTotal>) -> Self {
        self.composite_totals = Some(composites);
        self
    }

    /// Set the apportionment settings.
    pub fn apportionment(mut self, apportionment: ApportionmentConfig) -> Self {
        self.apportionment = Some(Some(apportionment));
        self
    }

    /// Disable the apportionment stage.
    pub fn without_apportionment(mut self) -> Self {
        self.apportionment = Some(None);
        self
    }

    /// Set the legacy prefix stripped from backdata field names.
    pub fn backdata_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.backdata_prefix = Some(prefix.into());
        self
    }

    /// Enable or disable link-factor scaling of carried-forward values.
    pub fn back_infill(mut self, enable: bool) -> Self {
        self.back_infill = Some(enable);
        self
    }

    /// Enable or disable QA table output.
    pub fn produce_qa(mut self, produce: bool) -> Self {
        self.produce_qa = Some(produce);
        self
    }

    /// Set the column names of the input tables.
    pub fn columns(mut self, columns: ColumnNames) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Build the configuration.
    ///
    /// Returns a validated `ImputationConfig` or an error if validation fails.
    pub fn build(self) -> Result<ImputationConfig, ConfigValidationError> {
        let defaults = ImputationConfig::default();
        let config = ImputationConfig {
            trim_threshold: self.trim_threshold.unwrap_or(defaults.trim_threshold),
            lower_trim_percent: self.lower_trim_percent.unwrap_or(defaults.lower_trim_percent),
            upper_trim_percent: self.upper_trim_percent.unwrap_or(defaults.upper_trim_percent),
            expansion_threshold: self
                .expansion_threshold
                .unwrap_or(defaults.expansion_threshold),
            mor_min_pairs: self.mor_min_pairs.unwrap_or(defaults.mor_min_pairs),
            rounding_precision: self.rounding_precision.unwrap_or(defaults.rounding_precision),
            variables: self.variables.unwrap_or(defaults.variables),
            composite_totals: self.composite_totals.unwrap_or(defaults.composite_totals),
            apportionment: self.apportionment.unwrap_or(defaults.apportionment),
            backdata_prefix: self.backdata_prefix.unwrap_or(defaults.backdata_prefix),
            back_infill: self.back_infill.unwrap_or(defaults.back_infill),
            produce_qa: self.produce_qa.unwrap_or(defaults.produce_qa),
            columns: self.columns.unwrap_or(defaults.columns),
        };

        config.validate()?;
        Ok(config)
    }
}
