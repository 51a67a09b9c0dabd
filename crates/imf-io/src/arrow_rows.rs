//! Conversion between [`Row`]s and Arrow record batches in destination column layout.

use arrow_array::{
    Array, ArrayRef, Float64Array, Int32Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{ArrowError, DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, Utc};
use imf_core::model::{
    COL_COUNTRY_CODE, COL_INDICATOR, COL_INGESTION_TIMESTAMP, COL_VALUE, COL_YEAR,
};
use imf_core::{Row, StoreError};
use std::sync::Arc;

pub fn row_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(COL_INDICATOR, DataType::Utf8, false),
        Field::new(COL_COUNTRY_CODE, DataType::Utf8, false),
        Field::new(COL_YEAR, DataType::Int32, false),
        Field::new(COL_VALUE, DataType::Float64, true),
        Field::new(
            COL_INGESTION_TIMESTAMP,
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
    ]))
}

pub fn rows_to_batch(rows: &[Row]) -> Result<RecordBatch, ArrowError> {
    let indicator = StringArray::from_iter_values(rows.iter().map(|r| r.indicator_code.as_str()));
    let country = StringArray::from_iter_values(rows.iter().map(|r| r.entity_code.as_str()));
    let year = Int32Array::from_iter_values(rows.iter().map(|r| r.period));
    let value: Float64Array = rows.iter().map(|r| r.value).collect();
    let ingested = TimestampMicrosecondArray::from_iter_values(
        rows.iter().map(|r| r.ingestion_timestamp.timestamp_micros()),
    )
    .with_timezone("UTC");

    let columns: Vec<ArrayRef> = vec![
        Arc::new(indicator),
        Arc::new(country),
        Arc::new(year),
        Arc::new(value),
        Arc::new(ingested),
    ];
    RecordBatch::try_new(row_schema(), columns)
}

pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Row>, StoreError> {
    let indicator = column::<StringArray>(batch, COL_INDICATOR)?;
    let country = column::<StringArray>(batch, COL_COUNTRY_CODE)?;
    let year = column::<Int32Array>(batch, COL_YEAR)?;
    let value = column::<Float64Array>(batch, COL_VALUE)?;
    let ingested = column::<TimestampMicrosecondArray>(batch, COL_INGESTION_TIMESTAMP)?;

    (0..batch.num_rows())
        .map(|i| {
            let micros = ingested.value(i);
            let ingestion_timestamp = DateTime::<Utc>::from_timestamp_micros(micros)
                .ok_or_else(|| StoreError::Rejected(format!("timestamp {micros} out of range")))?;
            Ok(Row {
                indicator_code: indicator.value(i).to_string(),
                entity_code: country.value(i).to_string(),
                period: year.value(i),
                value: if value.is_null(i) { None } else { Some(value.value(i)) },
                ingestion_timestamp,
            })
        })
        .collect()
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, StoreError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| StoreError::Rejected(format!("column {name} missing or mistyped")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_keeps_nulls_and_timestamps() {
        let ts = DateTime::<Utc>::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap();
        let rows = vec![
            Row {
                indicator_code: "NGDP_RPCH".into(),
                entity_code: "USA".into(),
                period: 2020,
                value: None,
                ingestion_timestamp: ts,
            },
            Row {
                indicator_code: "NGDP_RPCH".into(),
                entity_code: "USA".into(),
                period: 2021,
                value: Some(3.5),
                ingestion_timestamp: ts,
            },
        ];
        let batch = rows_to_batch(&rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema(), row_schema());
        assert_eq!(batch.column(3).null_count(), 1);
        assert_eq!(batch_to_rows(&batch).unwrap(), rows);
    }

    #[test]
    fn empty_slice_gives_empty_batch() {
        let batch = rows_to_batch(&[]).unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert!(batch_to_rows(&batch).unwrap().is_empty());
    }
}
