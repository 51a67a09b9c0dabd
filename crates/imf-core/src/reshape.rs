//! Row Source Adapter: flattens one indicator payload into rows.
//!
//! Payload shape, as served by `GET {base}/{code}`:
//!
//! ```json
//! {"values": {"NGDP_RPCH": {"USA": {"2020": null, "2021": 3.5}}}}
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::RefreshError;
use crate::model::{IndicatorDataset, Row};

/// Emit one row per `(entity, period)` present in the dataset.
///
/// A `null` value yields a row with `value: None`. A missing `values` object
/// or a missing entry for the dataset's own code yields no rows. A period that
/// is not an integer, or a value that is not a number, is a
/// [`RefreshError::MalformedData`].
pub fn reshape(
    dataset: &IndicatorDataset,
    ingestion_timestamp: DateTime<Utc>,
) -> Result<Vec<Row>, RefreshError> {
    let code = dataset.code.as_str();
    let series = match dataset.payload.get("values").and_then(|v| v.get(code)) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Object(series)) => series,
        Some(other) => {
            return Err(RefreshError::malformed(
                code,
                format!("values.{code} is not an object: {other}"),
            ))
        }
    };

    let mut rows = Vec::new();
    for (entity, periods) in series {
        let periods = match periods {
            Value::Object(periods) => periods,
            Value::Null => continue,
            other => {
                return Err(RefreshError::malformed(
                    code,
                    format!("entity {entity} is not an object: {other}"),
                ))
            }
        };
        for (period, value) in periods {
            rows.push(Row {
                indicator_code: code.to_string(),
                entity_code: entity.clone(),
                period: parse_period(code, period)?,
                value: parse_value(code, entity, period, value)?,
                ingestion_timestamp,
            });
        }
    }
    Ok(rows)
}

fn parse_period(code: &str, period: &str) -> Result<i32, RefreshError> {
    period
        .trim()
        .parse::<i32>()
        .map_err(|e| RefreshError::malformed(code, format!("period {period:?}: {e}")))
}

fn parse_value(
    code: &str,
    entity: &str,
    period: &str,
    value: &Value,
) -> Result<Option<f64>, RefreshError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| {
            RefreshError::malformed(code, format!("{entity}/{period}: {n} is not representable"))
        }),
        Value::String(s) => s.trim().parse::<f64>().map(Some).map_err(|e| {
            RefreshError::malformed(code, format!("{entity}/{period}: value {s:?}: {e}"))
        }),
        other => Err(RefreshError::malformed(
            code,
            format!("{entity}/{period}: unsupported value {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn null_values_are_kept() {
        let ds = IndicatorDataset::new(
            "NGDP_RPCH",
            json!({"values": {"NGDP_RPCH": {"USA": {"2020": null, "2021": 3.5}}}}),
        );
        let rows = reshape(&ds, ts()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            (rows[0].indicator_code.as_str(), rows[0].entity_code.as_str(), rows[0].period, rows[0].value),
            ("NGDP_RPCH", "USA", 2020, None)
        );
        assert_eq!(
            (rows[1].indicator_code.as_str(), rows[1].entity_code.as_str(), rows[1].period, rows[1].value),
            ("NGDP_RPCH", "USA", 2021, Some(3.5))
        );
        assert!(rows.iter().all(|r| r.ingestion_timestamp == ts()));
    }

    #[test]
    fn malformed_period_is_fatal() {
        let ds = IndicatorDataset::new("X", json!({"values": {"X": {"FRA": {"abc": 1.0}}}}));
        let err = reshape(&ds, ts()).unwrap_err();
        assert!(matches!(err, RefreshError::MalformedData { ref indicator, .. } if indicator == "X"));
    }

    #[test]
    fn numeric_strings_parse_and_garbage_does_not() {
        let ok = IndicatorDataset::new("X", json!({"values": {"X": {"DEU": {"1999": "1.25"}}}}));
        assert_eq!(reshape(&ok, ts()).unwrap()[0].value, Some(1.25));

        let bad = IndicatorDataset::new("X", json!({"values": {"X": {"DEU": {"1999": "n/a"}}}}));
        assert!(matches!(reshape(&bad, ts()), Err(RefreshError::MalformedData { .. })));

        let nested = IndicatorDataset::new("X", json!({"values": {"X": {"DEU": {"1999": [1]}}}}));
        assert!(matches!(reshape(&nested, ts()), Err(RefreshError::MalformedData { .. })));
    }

    #[test]
    fn missing_values_yield_no_rows() {
        let empty = IndicatorDataset::new("X", json!({}));
        assert!(reshape(&empty, ts()).unwrap().is_empty());

        let other_code = IndicatorDataset::new("X", json!({"values": {"Y": {"USA": {"2020": 1}}}}));
        assert!(reshape(&other_code, ts()).unwrap().is_empty());
    }

    #[test]
    fn absent_period_emits_nothing() {
        let ds = IndicatorDataset::new(
            "X",
            json!({"values": {"X": {"USA": {"2020": 1}, "CAN": {}}}}),
        );
        let rows = reshape(&ds, ts()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_code, "USA");
    }
}
