//! Core domain model for the ANS financial-statements ingest.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ans-core";

/// One decoded CSV data line keyed by its header (canonical or raw spelling).
pub type FinancialRow = BTreeMap<String, String>;

/// Registered operator as read from the registry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub operator_id: String,
    pub legal_name: String,
    pub trade_name: String,
    pub city: Option<String>,
    pub state: Option<String>,
}

/// Financial row that resolved against the registry index.
///
/// Name fields always come from the registry, never from the financial file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub operator_id: String,
    pub legal_name: String,
    pub trade_name: String,
    pub account_code: String,
    pub raw_value: String,
    pub period: String,
}

/// Summed expenses for one (operator, account code) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    pub operator_id: String,
    pub legal_name: String,
    pub account_code: String,
    pub total_value: Decimal,
}

/// Canonical operator identifier: every non-digit character removed.
///
/// `12.345.678/0001-99` and `12345678000199` map to the same key.
pub fn canonical_operator_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}
