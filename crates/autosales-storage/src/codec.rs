//! Wide-table file encodings. CSV and Parquet carry the same information:
//! three key columns followed by one column per period, ascending.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use autosales_core::{Cadence, PeriodError, PeriodKey, SeriesKey, WideTable};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use thiserror::Error;

pub const KEY_COLUMNS: [&str; 3] = ["brand", "model", "price"];

/// Header names used by tables produced by the older collection scripts.
const LEGACY_KEY_COLUMNS: [&str; 3] = ["汽车品牌", "车型", "售价"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Parquet,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Result<Self, TableError> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("csv") => Ok(Self::Csv),
            Some("parquet") => Ok(Self::Parquet),
            _ => Err(TableError::UnsupportedFormat(path.display().to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
        }
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("unsupported table format for {0} (expected .csv or .parquet)")]
    UnsupportedFormat(String),
    #[error("missing key column `{0}`")]
    MissingKeyColumn(&'static str),
    #[error("bad period column: {0}")]
    BadPeriodLabel(#[from] PeriodError),
    #[error("row {row}, column {column}: `{value}` is not a number")]
    BadNumber {
        row: usize,
        column: String,
        value: String,
    },
    #[error("column `{column}` has unsupported type {data_type}")]
    BadColumnType { column: String, data_type: String },
}

struct ColumnLayout {
    keys: [usize; 3],
    periods: Vec<(usize, PeriodKey)>,
}

impl ColumnLayout {
    fn resolve<'a>(
        headers: impl IntoIterator<Item = &'a str>,
        cadence: Cadence,
    ) -> Result<Self, TableError> {
        let headers: Vec<&str> = headers
            .into_iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim())
            .collect();

        let mut keys = [0usize; 3];
        for (slot, (name, legacy)) in KEY_COLUMNS.iter().zip(LEGACY_KEY_COLUMNS).enumerate() {
            keys[slot] = headers
                .iter()
                .position(|h| h == name || *h == legacy)
                .ok_or(TableError::MissingKeyColumn(*name))?;
        }

        let mut periods = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            if keys.contains(&idx) {
                continue;
            }
            periods.push((idx, cadence.parse_label(header)?));
        }

        Ok(Self { keys, periods })
    }

    fn empty_table(&self, cadence: Cadence) -> Result<WideTable, TableError> {
        let mut table = WideTable::new(cadence);
        for (_, period) in &self.periods {
            table.add_period(*period)?;
        }
        Ok(table)
    }
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

pub fn encode(table: &WideTable, format: TableFormat) -> Result<Vec<u8>> {
    match format {
        TableFormat::Csv => encode_csv(table),
        TableFormat::Parquet => encode_parquet(table),
    }
}

pub fn read_table(path: &Path, cadence: Cadence) -> Result<WideTable> {
    match TableFormat::from_path(path)? {
        TableFormat::Csv => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            decode_csv(file, cadence).with_context(|| format!("decoding {}", path.display()))
        }
        TableFormat::Parquet => {
            decode_parquet(path, cadence).with_context(|| format!("decoding {}", path.display()))
        }
    }
}

pub fn encode_csv(table: &WideTable) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header: Vec<String> = KEY_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(table.periods().map(PeriodKey::label));
    writer.write_record(&header).context("writing csv header")?;

    for (key, cells) in table.rows() {
        let mut row = vec![key.brand.clone(), key.model.clone(), key.price.clone()];
        row.extend(
            table
                .periods()
                .map(|p| cells.get(p).copied().map(format_value).unwrap_or_default()),
        );
        writer.write_record(&row).context("writing csv row")?;
    }

    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv buffer: {err}"))
}

pub fn decode_csv<R: Read>(reader: R, cadence: Cadence) -> Result<WideTable> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader.headers().context("reading csv header")?.clone();
    let layout = ColumnLayout::resolve(headers.iter(), cadence)?;
    let mut table = layout.empty_table(cadence)?;

    for (row_idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading csv row {}", row_idx + 1))?;
        let field = |idx: usize| record.get(idx).unwrap_or_default().trim();
        let key = SeriesKey::new(
            field(layout.keys[0]),
            field(layout.keys[1]),
            field(layout.keys[2]),
        );
        table.insert_row(key.clone());

        for (col, period) in &layout.periods {
            let raw = field(*col);
            if raw.is_empty() {
                continue;
            }
            let value: f64 = raw.replace(',', "").parse().map_err(|_| TableError::BadNumber {
                row: row_idx + 1,
                column: period.label(),
                value: raw.to_string(),
            })?;
            table.add_value(key.clone(), *period, value)?;
        }
    }

    Ok(table)
}

pub fn encode_parquet(table: &WideTable) -> Result<Vec<u8>> {
    let mut fields: Vec<ArrowField> = KEY_COLUMNS
        .iter()
        .map(|name| ArrowField::new(*name, DataType::Utf8, false))
        .collect();
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            table.keys().map(|k| k.brand.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            table.keys().map(|k| k.model.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            table.keys().map(|k| k.price.as_str()).collect::<Vec<_>>(),
        )),
    ];

    for period in table.periods() {
        fields.push(ArrowField::new(period.label(), DataType::Float64, true));
        columns.push(Arc::new(Float64Array::from(
            table
                .rows()
                .map(|(_, cells)| cells.get(period).copied())
                .collect::<Vec<_>>(),
        )));
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building wide table record batch")?;

    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, batch.schema(), None).context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buf)
}

fn string_at(array: &ArrayRef, column: &str, row: usize) -> Result<String, TableError> {
    let strings = array
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| TableError::BadColumnType {
            column: column.to_string(),
            data_type: array.data_type().to_string(),
        })?;
    Ok(if strings.is_valid(row) {
        strings.value(row).trim().to_string()
    } else {
        String::new()
    })
}

fn number_at(array: &ArrayRef, column: &str, row: usize) -> Result<Option<f64>, TableError> {
    if !array.is_valid(row) {
        return Ok(None);
    }
    if let Some(floats) = array.as_any().downcast_ref::<Float64Array>() {
        return Ok(Some(floats.value(row)));
    }
    if let Some(ints) = array.as_any().downcast_ref::<Int64Array>() {
        return Ok(Some(ints.value(row) as f64));
    }
    Err(TableError::BadColumnType {
        column: column.to_string(),
        data_type: array.data_type().to_string(),
    })
}

pub fn decode_parquet(path: &Path, cadence: Cadence) -> Result<WideTable> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let names: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let layout = ColumnLayout::resolve(names.iter().map(String::as_str), cadence)?;
    let mut table = layout.empty_table(cadence)?;

    let reader = builder.build().context("building parquet reader")?;
    let mut row_base = 0usize;
    for batch in reader {
        let batch = batch.context("reading parquet record batch")?;
        for row in 0..batch.num_rows() {
            let key_at = |slot: usize| {
                let idx = layout.keys[slot];
                string_at(batch.column(idx), &names[idx], row)
            };
            let key = SeriesKey::new(key_at(0)?, key_at(1)?, key_at(2)?);
            table.insert_row(key.clone());

            for (col, period) in &layout.periods {
                if let Some(value) = number_at(batch.column(*col), &names[*col], row)? {
                    table.add_value(key.clone(), *period, value)?;
                }
            }
        }
        row_base += batch.num_rows();
    }
    tracing::debug!(rows = row_base, path = %path.display(), "decoded parquet table");

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn month(label: &str) -> PeriodKey {
        Cadence::Monthly.parse_label(label).unwrap()
    }

    fn sample() -> WideTable {
        let mut table = WideTable::new(Cadence::Monthly);
        let x = SeriesKey::new("BrandA", "ModelX", "100000");
        let y = SeriesKey::new("BrandA", "Model, Y", "12.98-15.98万");
        table.set_value(x.clone(), month("202402"), 60.0).unwrap();
        table.set_value(x, month("202401"), 50.0).unwrap();
        table.set_value(y, month("202402"), 7.5).unwrap();
        table
    }

    #[test]
    fn format_is_picked_from_extension() {
        assert_eq!(TableFormat::from_path(Path::new("a/b.CSV")).unwrap(), TableFormat::Csv);
        assert_eq!(
            TableFormat::from_path(Path::new("weekly.parquet")).unwrap(),
            TableFormat::Parquet
        );
        assert!(TableFormat::from_path(Path::new("weekly.xlsx")).is_err());
    }

    #[test]
    fn csv_writes_keys_then_sorted_periods() {
        let bytes = encode_csv(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("brand,model,price,202401,202402"));
        assert_eq!(lines.next(), Some("BrandA,\"Model, Y\",12.98-15.98万,,7.5"));
        assert_eq!(lines.next(), Some("BrandA,ModelX,100000,50,60"));
    }

    #[test]
    fn csv_decode_keeps_missing_cells_missing() {
        let bytes = encode_csv(&sample()).unwrap();
        let table = decode_csv(bytes.as_slice(), Cadence::Monthly).unwrap();
        assert_eq!(table, sample());
        let y = SeriesKey::new("BrandA", "Model, Y", "12.98-15.98万");
        assert_eq!(table.cell(&y, &month("202401")), None);
    }

    #[test]
    fn csv_decode_accepts_legacy_headers_and_bom() {
        let text = "\u{feff}汽车品牌,车型,售价,202402.0,202401\n小鹏,G6,20.99万,1200.0,\n";
        let table = decode_csv(text.as_bytes(), Cadence::Monthly).unwrap();
        let key = SeriesKey::new("小鹏", "G6", "20.99万");
        assert_eq!(table.cell(&key, &month("202402")), Some(1200.0));
        assert_eq!(table.cell(&key, &month("202401")), None);
        let labels: Vec<_> = table.periods().map(PeriodKey::label).collect();
        assert_eq!(labels, vec!["202401", "202402"]);
    }

    #[test]
    fn csv_decode_reports_schema_problems() {
        let missing = decode_csv("brand,model,202401\nA,B,1\n".as_bytes(), Cadence::Monthly)
            .unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<TableError>(),
            Some(TableError::MissingKeyColumn("price"))
        ));

        let bad_label = decode_csv("brand,model,price,2024-01-02\n".as_bytes(), Cadence::Monthly)
            .unwrap_err();
        assert!(matches!(
            bad_label.downcast_ref::<TableError>(),
            Some(TableError::BadPeriodLabel(_))
        ));

        let bad_number =
            decode_csv("brand,model,price,202401\nA,B,C,lots\n".as_bytes(), Cadence::Monthly)
                .unwrap_err();
        assert!(matches!(
            bad_number.downcast_ref::<TableError>(),
            Some(TableError::BadNumber { row: 1, .. })
        ));
    }

    #[test]
    fn parquet_file_decodes_to_same_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monthly.parquet");
        std::fs::write(&path, encode_parquet(&sample()).unwrap()).unwrap();
        let table = read_table(&path, Cadence::Monthly).unwrap();
        assert_eq!(table, sample());
    }
}
