//! Imputation class derivation.
//!
//! A record's class is the pool of peers its statistics are drawn from. A
//! record missing either dimension gets [`ImputationClass::Undefined`], which
//! never pools with anything, including other undefined records.

use crate::types::{CivilDefence, SurveyRecord};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cell number reserved for businesses on the reference list.
pub const REFERENCE_LIST_CELL: i64 = 817;

/// Grouping key of a fully defined class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassKey {
    pub civil_or_defence: CivilDefence,
    pub product_group: String,
    pub reference_list: bool,
}

impl fmt::Display for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.civil_or_defence, self.product_group)?;
        if self.reference_list {
            write!(f, "_{REFERENCE_LIST_CELL}")?;
        }
        Ok(())
    }
}

/// Imputation class of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ImputationClass {
    Defined(ClassKey),
    #[default]
    Undefined,
}

impl ImputationClass {
    /// The grouping key, if the class is defined.
    pub fn key(&self) -> Option<&ClassKey> {
        match self {
            Self::Defined(key) => Some(key),
            Self::Undefined => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, Self::Defined(_))
    }

    /// Label used in output tables.
    pub fn label(&self) -> String {
        match self {
            Self::Defined(key) => key.to_string(),
            Self::Undefined => String::new(),
        }
    }
}

/// Derive the imputation class of a record.
pub fn classify(record: &SurveyRecord) -> ImputationClass {
    match (record.civil_or_defence, record.product_group.as_deref()) {
        (Some(civil_or_defence), Some(product_group)) if !product_group.trim().is_empty() => {
            ImputationClass::Defined(ClassKey {
                civil_or_defence,
                product_group: product_group.trim().to_string(),
                reference_list: record.cell_number == Some(REFERENCE_LIST_CELL),
            })
        }
        _ => ImputationClass::Undefined,
    }
}

/// Classify every record, replacing any previous class.
pub fn classify_all(mut records: Vec<SurveyRecord>) -> Vec<SurveyRecord> {
    for record in &mut records {
        record.class = classify(record);
    }
    records
}
