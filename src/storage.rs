//! Result table writer.
//!
//! Semicolon-delimited text, one header line and one line per stimulus
//! level. Numbers carry an explicit sign, eight fractional digits and a
//! decimal comma; missing values are empty fields.

use crate::aggregate::SampleRow;
use crate::error::{AppResult, CalError};
use async_trait::async_trait;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Destination for finished rows.
#[async_trait]
pub trait RowSink: Send {
    async fn write_row(&mut self, row: &SampleRow) -> AppResult<()>;

    async fn finish(&mut self) -> AppResult<()>;
}

/// `-0.00085` -> `-0,00085000`
pub fn format_decimal(value: f64) -> String {
    format!("{:+.8}", value).replace('.', ",")
}

pub fn format_optional(value: Option<f64>) -> String {
    value.map(format_decimal).unwrap_or_default()
}

/// Inverse of [`format_decimal`]; empty fields are `None`.
pub fn parse_decimal(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    field.replace(',', ".").parse().ok()
}

/// Column names for a channel list.
pub fn header(channels: &[u16]) -> Vec<String> {
    let per_channel = |prefix: &str| -> Vec<String> {
        channels
            .iter()
            .map(|ch| format!("{}{}", prefix, ch))
            .collect()
    };

    let mut columns = vec!["nr".to_string(), "set".to_string()];
    columns.extend(per_channel("actual"));
    columns.extend(per_channel("ch"));
    columns.push("avg_actual".to_string());
    columns.push("abs_actual".to_string());
    columns.extend(per_channel("m_ch"));
    columns.push("ch_range".to_string());
    columns.push("curr_range".to_string());
    columns
}

fn record(row: &SampleRow) -> Vec<String> {
    let mut fields = vec![row.index.to_string(), format_decimal(row.set)];
    fields.extend(row.channels.iter().map(|c| format_optional(c.actual)));
    fields.extend(row.channels.iter().map(|c| format_optional(c.reading)));
    fields.push(format_optional(row.avg_actual));
    fields.push(format_optional(row.abs_actual));
    fields.extend(row.channels.iter().map(|c| format_optional(c.factor)));
    fields.push(format_optional(row.target_range));
    fields.push(format_optional(row.reference_range));
    fields
}

/// Semicolon table over any writer; every row is flushed as it is written.
pub struct ResultTable<W: Write> {
    writer: csv::Writer<W>,
    rows: usize,
}

impl ResultTable<File> {
    /// Create (truncate) the file and write the header.
    pub fn create<P: AsRef<Path>>(path: P, channels: &[u16]) -> AppResult<Self> {
        let file = File::create(path.as_ref())?;
        info!("Logging results to '{}'", path.as_ref().display());
        Self::from_writer(file, channels)
    }
}

impl<W: Write> ResultTable<W> {
    pub fn from_writer(inner: W, channels: &[u16]) -> AppResult<Self> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_writer(inner);
        writer.write_record(header(channels))?;
        writer.flush()?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn append(&mut self, row: &SampleRow) -> AppResult<()> {
        self.writer.write_record(record(row))?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flush and hand back the underlying writer.
    pub fn into_inner(self) -> AppResult<W> {
        self.writer.into_inner().map_err(|e| {
            CalError::Io(std::io::Error::new(e.error().kind(), e.error().to_string()))
        })
    }
}

#[async_trait]
impl<W: Write + Send> RowSink for ResultTable<W> {
    async fn write_row(&mut self, row: &SampleRow) -> AppResult<()> {
        self.append(row)
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        info!("Result table closed after {} rows", self.rows);
        Ok(())
    }
}
