use imf_core::model::ROW_COLUMNS;
use imf_core::Row;
use std::io::{self, Write};

/// Prints the head of a row set instead of loading it anywhere.
pub struct StdoutPreview {
    limit: usize,
}

impl StdoutPreview {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn print(&self, rows: &[Row]) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.render(rows, &mut out)
    }

    pub fn render<W: Write>(&self, rows: &[Row], out: &mut W) -> io::Result<()> {
        writeln!(out, "{}", ROW_COLUMNS.join("\t"))?;
        for row in rows.iter().take(self.limit) {
            let value = row
                .value
                .map(|v| v.to_string())
                .unwrap_or_else(|| "NULL".to_string());
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}",
                row.indicator_code,
                row.entity_code,
                row.period,
                value,
                row.ingestion_timestamp.to_rfc3339()
            )?;
        }
        if rows.len() > self.limit {
            writeln!(out, "... {} more rows", rows.len() - self.limit)?;
        }
        Ok(())
    }
}
