//! Snapshot CSV parsing: header validation and row normalization into typed
//! listing rows.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord};
use thiserror::Error;
use vacancy_core::{
    column_spec, ColumnSpec, ColumnType, FieldValue, ListingRow, ARCHIVED_COLUMN, ID_COLUMN,
    WATERMARK_COLUMNS,
};

pub const CRATE_NAME: &str = "vacancy-snapshot";

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("snapshot header is missing required column `{0}`")]
    MissingColumn(&'static str),
    #[error("snapshot header has unknown column `{0}`")]
    UnknownColumn(String),
    #[error("snapshot header uses reserved column `{0}`")]
    ReservedColumn(String),
    #[error("snapshot header repeats column `{0}`")]
    DuplicateColumn(String),
    #[error("line {line}: invalid id {value:?}")]
    InvalidId { line: u64, value: String },
    #[error("line {line}: column `{column}` expects {expected}, got {value:?}")]
    InvalidValue {
        line: u64,
        column: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Id,
    Column(&'static ColumnSpec),
}

/// Maps raw snapshot cells onto the listing schema. Built once per header.
#[derive(Debug, Clone)]
pub struct RowNormalizer {
    slots: Vec<Slot>,
}

impl RowNormalizer {
    pub fn from_header<'h>(
        header: impl IntoIterator<Item = &'h str>,
    ) -> Result<Self, NormalizeError> {
        let mut slots = Vec::new();
        let mut seen = HashSet::new();

        for name in header {
            let name = name.trim();
            if !seen.insert(name.to_string()) {
                return Err(NormalizeError::DuplicateColumn(name.to_string()));
            }
            if name == ID_COLUMN {
                slots.push(Slot::Id);
                continue;
            }
            if WATERMARK_COLUMNS.contains(&name) {
                return Err(NormalizeError::ReservedColumn(name.to_string()));
            }
            let spec =
                column_spec(name).ok_or_else(|| NormalizeError::UnknownColumn(name.to_string()))?;
            slots.push(Slot::Column(spec));
        }

        if !slots.iter().any(|slot| matches!(slot, Slot::Id)) {
            return Err(NormalizeError::MissingColumn(ID_COLUMN));
        }
        if !slots
            .iter()
            .any(|slot| matches!(slot, Slot::Column(spec) if spec.name == ARCHIVED_COLUMN))
        {
            return Err(NormalizeError::MissingColumn(ARCHIVED_COLUMN));
        }

        Ok(Self { slots })
    }

    /// Types one row. `values` must follow header order; `line` is only used
    /// for error reporting.
    pub fn normalize<'v>(
        &self,
        values: impl IntoIterator<Item = &'v str>,
        line: u64,
    ) -> Result<ListingRow, NormalizeError> {
        let mut id = None;
        let mut archived = false;
        let mut fields = Vec::with_capacity(self.slots.len());

        for (slot, raw) in self.slots.iter().zip(values) {
            match slot {
                Slot::Id => id = Some(parse_id(raw, line)?),
                Slot::Column(spec) if spec.name == ARCHIVED_COLUMN => {
                    archived = parse_archived(raw, line)?;
                    fields.push((*spec, Some(FieldValue::Bool(archived))));
                }
                Slot::Column(spec) => fields.push((*spec, parse_value(spec, raw, line)?)),
            }
        }

        let id = id.ok_or(NormalizeError::InvalidId {
            line,
            value: String::new(),
        })?;
        Ok(ListingRow {
            id,
            archived,
            fields,
        })
    }
}

/// Normalizes a single `(column, raw value)` mapping.
pub fn normalize_record(raw: &[(&str, &str)], line: u64) -> Result<ListingRow, NormalizeError> {
    let normalizer = RowNormalizer::from_header(raw.iter().map(|(name, _)| *name))?;
    normalizer.normalize(raw.iter().map(|(_, value)| *value), line)
}

fn parse_id(raw: &str, line: u64) -> Result<i64, NormalizeError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| NormalizeError::InvalidId {
            line,
            value: raw.to_string(),
        })
}

fn parse_archived(raw: &str, line: u64) -> Result<bool, NormalizeError> {
    if raw.is_empty() {
        return Err(NormalizeError::InvalidValue {
            line,
            column: ARCHIVED_COLUMN,
            expected: ColumnType::Boolean.describe(),
            value: String::new(),
        });
    }
    Ok(raw.trim().eq_ignore_ascii_case("true"))
}

fn parse_value(
    spec: &'static ColumnSpec,
    raw: &str,
    line: u64,
) -> Result<Option<FieldValue>, NormalizeError> {
    if raw.is_empty() {
        return Ok(None);
    }

    let invalid = || NormalizeError::InvalidValue {
        line,
        column: spec.name,
        expected: spec.ty.describe(),
        value: raw.to_string(),
    };

    let value = match spec.ty {
        ColumnType::BigInt => FieldValue::Int(raw.trim().parse::<i64>().map_err(|_| invalid())?),
        ColumnType::Integer => {
            FieldValue::Int(raw.trim().parse::<i32>().map_err(|_| invalid())?.into())
        }
        ColumnType::Double => FieldValue::Float(raw.trim().parse::<f64>().map_err(|_| invalid())?),
        ColumnType::Boolean => FieldValue::Bool(parse_bool(raw).ok_or_else(invalid)?),
        ColumnType::Text => FieldValue::Text(raw.to_string()),
        ColumnType::Timestamp => FieldValue::Timestamp(parse_timestamp(raw).ok_or_else(invalid)?),
    };
    Ok(Some(value))
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "on" | "1" => Some(true),
        "false" | "f" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Drops a trailing `Z` or numeric UTC offset from an ISO-8601 timestamp.
pub fn strip_zone_suffix(raw: &str) -> &str {
    let raw = raw.trim();
    if let Some(stripped) = raw.strip_suffix(['Z', 'z']) {
        return stripped;
    }
    let Some(time_start) = raw.find(['T', ' ']) else {
        return raw;
    };
    match raw[time_start..].rfind(['+', '-']) {
        Some(offset) => &raw[..time_start + offset],
        None => raw,
    }
}

/// Parses a local date-time, discarding any zone offset.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let text = strip_zone_suffix(raw);
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Streams normalized rows out of a snapshot CSV. The header is validated
/// up-front; each item is one data row.
pub struct SnapshotReader<R> {
    reader: csv::Reader<R>,
    normalizer: RowNormalizer,
    record: StringRecord,
    done: bool,
}

impl SnapshotReader<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NormalizeError> {
        Self::from_csv(ReaderBuilder::new().has_headers(true).from_path(path)?)
    }
}

impl<R: Read> SnapshotReader<R> {
    pub fn from_reader(reader: R) -> Result<Self, NormalizeError> {
        Self::from_csv(ReaderBuilder::new().has_headers(true).from_reader(reader))
    }

    fn from_csv(mut reader: csv::Reader<R>) -> Result<Self, NormalizeError> {
        let headers = reader.headers()?.clone();
        let normalizer = RowNormalizer::from_header(headers.iter())?;
        Ok(Self {
            reader,
            normalizer,
            record: StringRecord::new(),
            done: false,
        })
    }
}

impl<R: Read> Iterator for SnapshotReader<R> {
    type Item = Result<ListingRow, NormalizeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.read_record(&mut self.record) {
            Ok(true) => {
                let line = self.record.position().map_or(0, |p| p.line());
                Some(self.normalizer.normalize(self.record.iter(), line))
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err.into()))
            }
        }
    }
}
