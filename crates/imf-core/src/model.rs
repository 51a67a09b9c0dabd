//! Row, token and dataset types shared by every pipeline stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque key of one indicator time series (e.g. `NGDP_RPCH`).
pub type IndicatorCode = String;

/// Destination column names, in table order.
pub const COL_INDICATOR: &str = "INDICATOR";
pub const COL_COUNTRY_CODE: &str = "COUNTRY_CODE";
pub const COL_YEAR: &str = "YEAR";
pub const COL_VALUE: &str = "VALUE";
pub const COL_INGESTION_TIMESTAMP: &str = "INGESTION_TIMESTAMP";

pub const ROW_COLUMNS: [&str; 5] = [
    COL_INDICATOR,
    COL_COUNTRY_CODE,
    COL_YEAR,
    COL_VALUE,
    COL_INGESTION_TIMESTAMP,
];

/// One observation of an indicator for an entity in a period.
///
/// Rows are never deduplicated: two indicators reporting the same
/// entity/period both produce a row, keyed by the full
/// `(indicator_code, entity_code, period)` tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub indicator_code: IndicatorCode,
    pub entity_code: String,
    pub period: i32,
    pub value: Option<f64>,
    pub ingestion_timestamp: DateTime<Utc>,
}

impl Row {
    /// Ordering key used to make token assignment deterministic.
    pub fn sort_key(&self) -> (&str, &str, i32) {
        (&self.indicator_code, &self.entity_code, self.period)
    }
}

/// Per-run sequence number of an appended row.
///
/// Tokens start at 0 and are acknowledged by the sink strictly in order,
/// so the latest acknowledged token tells how many rows are durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppendToken(u64);

impl AppendToken {
    pub const FIRST: AppendToken = AppendToken(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Token of the last row in a run of `row_count` rows, `None` when empty.
    pub fn last_for(row_count: usize) -> Option<Self> {
        row_count.checked_sub(1).map(|last| Self(last as u64))
    }
}

impl fmt::Display for AppendToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw payload of one `GET {base}/{indicator_code}` response.
///
/// The payload is kept as JSON so that shape problems surface as
/// malformed-data errors in the reshape stage rather than fetch errors.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorDataset {
    pub code: IndicatorCode,
    pub payload: serde_json::Value,
}

impl IndicatorDataset {
    pub fn new(code: impl Into<IndicatorCode>, payload: serde_json::Value) -> Self {
        Self {
            code: code.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_token_for_empty_run_is_none() {
        assert_eq!(AppendToken::last_for(0), None);
        assert_eq!(AppendToken::last_for(1), Some(AppendToken::FIRST));
        assert_eq!(AppendToken::last_for(42), Some(AppendToken::new(41)));
    }

    #[test]
    fn tokens_order_numerically() {
        let nine = AppendToken::new(9);
        assert!(nine.next() > nine);
        assert_eq!(nine.next().to_string(), "10");
    }
}
