//! Core listing model shared by the snapshot reader, the stores and the feeder.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

pub const CRATE_NAME: &str = "vacancy-core";

/// Table holding one row per listing id.
pub const LISTING_TABLE: &str = "vacancy";

pub const ID_COLUMN: &str = "id";
pub const ARCHIVED_COLUMN: &str = "archived";
pub const ADDED_AT_COLUMN: &str = "added_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";
pub const REMOVED_AT_COLUMN: &str = "removed_at";

/// Watermark columns are owned by the feeder and may not appear in a snapshot.
pub const WATERMARK_COLUMNS: [&str; 3] = [ADDED_AT_COLUMN, UPDATED_AT_COLUMN, REMOVED_AT_COLUMN];

/// Columns indexed for downstream filtering.
pub const INDEXED_COLUMNS: [&str; 6] = [
    "area_id",
    "area_name",
    ADDED_AT_COLUMN,
    UPDATED_AT_COLUMN,
    REMOVED_AT_COLUMN,
    ARCHIVED_COLUMN,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    BigInt,
    Integer,
    Double,
    Boolean,
    Text,
    Timestamp,
}

impl ColumnType {
    pub fn describe(self) -> &'static str {
        match self {
            ColumnType::BigInt => "bigint",
            ColumnType::Integer => "integer",
            ColumnType::Double => "double",
            ColumnType::Boolean => "boolean",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
        }
    }
}

/// One business column of the listing table.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    pub sql_type: &'static str,
}

impl ColumnSpec {
    const fn new(name: &'static str, ty: ColumnType, sql_type: &'static str) -> Self {
        Self { name, ty, sql_type }
    }
}

const fn text(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name, ColumnType::Text, "TEXT")
}

const fn varchar(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name, ColumnType::Text, "VARCHAR(1024)")
}

const fn boolean(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name, ColumnType::Boolean, "BOOLEAN")
}

const fn bigint(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name, ColumnType::BigInt, "BIGINT")
}

const fn timestamp(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name, ColumnType::Timestamp, "TIMESTAMP")
}

const fn double(name: &'static str) -> ColumnSpec {
    ColumnSpec::new(name, ColumnType::Double, "DOUBLE PRECISION")
}

/// Business columns of the listing table, in table order. `id` and the
/// watermark columns are handled separately.
pub static LISTING_COLUMNS: &[ColumnSpec] = &[
    text("description"),
    text("key_skills"),
    varchar("schedule_id"),
    varchar("schedule_name"),
    boolean("accept_handicapped"),
    boolean("accept_kids"),
    varchar("experience_id"),
    varchar("experience_name"),
    text("specializations"),
    text("contacts"),
    varchar("billing_type_id"),
    varchar("billing_type_name"),
    boolean("allow_messages"),
    boolean("premium"),
    text("driver_license_types"),
    boolean("accept_incomplete_resumes"),
    bigint("employer_id"),
    text("employer_name"),
    text("employer_vacancies_url"),
    boolean("employer_trusted"),
    text("employer_alternate_url"),
    text("employer_industries"),
    boolean("response_letter_required"),
    varchar("type_id"),
    varchar("type_name"),
    boolean("has_test"),
    text("response_url"),
    boolean("test_required"),
    bigint("salary_from"),
    bigint("salary_to"),
    boolean("salary_gross"),
    ColumnSpec::new("salary_currency", ColumnType::Text, "VARCHAR(64)"),
    boolean(ARCHIVED_COLUMN),
    text("name"),
    text("insider_interview"),
    ColumnSpec::new("area_id", ColumnType::Integer, "INT"),
    varchar("area_name"),
    text("area_url"),
    timestamp("created_at"),
    timestamp("published_at"),
    varchar("address_city"),
    varchar("address_street"),
    varchar("address_building"),
    text("address_description"),
    double("address_lat"),
    double("address_lng"),
    text("alternate_url"),
    text("apply_alternate_url"),
    text("code"),
    varchar("department_id"),
    varchar("department_name"),
    varchar("employment_id"),
    varchar("employment_name"),
];

pub fn column_spec(name: &str) -> Option<&'static ColumnSpec> {
    LISTING_COLUMNS.iter().find(|spec| spec.name == name)
}

/// Watermark reported for an empty table.
pub fn empty_watermark() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// A typed, non-null column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            FieldValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

/// Textual rendering used for change detection. Null stays distinct from
/// every rendered value.
pub fn render(value: Option<&FieldValue>) -> Option<String> {
    value.map(ToString::to_string)
}

pub fn render_or_null(value: Option<&FieldValue>) -> String {
    render(value).unwrap_or_else(|| "NULL".to_string())
}

/// One normalized snapshot row.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRow {
    pub id: i64,
    pub archived: bool,
    /// Every business column present in the snapshot header, in header order.
    pub fields: Vec<(&'static ColumnSpec, Option<FieldValue>)>,
}

impl ListingRow {
    pub fn value(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(spec, _)| spec.name == name)
            .and_then(|(_, value)| value.as_ref())
    }

    pub fn populated(&self) -> impl Iterator<Item = (&'static ColumnSpec, &FieldValue)> + '_ {
        self.fields
            .iter()
            .filter_map(|(spec, value)| value.as_ref().map(|v| (*spec, v)))
    }
}

/// Persisted listing state. `fields` only holds non-null columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingRecord {
    pub id: i64,
    pub fields: BTreeMap<&'static str, FieldValue>,
    pub added_at: Option<NaiveDate>,
    pub updated_at: Option<NaiveDate>,
    pub removed_at: Option<NaiveDate>,
}

impl ListingRecord {
    /// Record for an id seen for the first time on `date`.
    pub fn first_seen(row: &ListingRow, date: NaiveDate) -> Self {
        Self {
            id: row.id,
            fields: row
                .populated()
                .map(|(spec, value)| (spec.name, value.clone()))
                .collect(),
            added_at: Some(date),
            updated_at: Some(date),
            removed_at: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Latest of the three watermarks.
    pub fn watermark(&self) -> Option<NaiveDate> {
        [self.added_at, self.updated_at, self.removed_at]
            .into_iter()
            .flatten()
            .max()
    }

    pub fn apply(&mut self, patch: &ListingPatch) {
        for (spec, value) in &patch.columns {
            match value {
                Some(value) => {
                    self.fields.insert(spec.name, value.clone());
                }
                None => {
                    self.fields.remove(spec.name);
                }
            }
        }
        if let Some(added_at) = patch.added_at {
            self.added_at = Some(added_at);
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = Some(updated_at);
        }
    }
}

/// Column changes for one listing, applied in a single statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPatch {
    pub columns: Vec<(&'static ColumnSpec, Option<FieldValue>)>,
    pub added_at: Option<NaiveDate>,
    pub updated_at: Option<NaiveDate>,
}

impl ListingPatch {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.added_at.is_none() && self.updated_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Destination for per-snapshot audit lines.
pub trait AuditSink: Send {
    fn record(&mut self, line: &str) -> std::io::Result<()>;
}

impl AuditSink for Vec<String> {
    fn record(&mut self, line: &str) -> std::io::Result<()> {
        self.push(line.to_string());
        Ok(())
    }
}

/// Truncates `text` to `limit` characters, marking the cut with `...`.
pub fn cut_text(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn schema_has_unique_names_and_no_reserved_columns() {
        let mut names: Vec<_> = LISTING_COLUMNS.iter().map(|c| c.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), LISTING_COLUMNS.len());
        assert!(column_spec(ID_COLUMN).is_none());
        for reserved in WATERMARK_COLUMNS {
            assert!(column_spec(reserved).is_none());
        }
        assert_eq!(column_spec("area_id").unwrap().ty, ColumnType::Integer);
    }

    #[test]
    fn render_keeps_null_distinct_from_text() {
        let null_text = FieldValue::Text("NULL".into());
        assert_ne!(render(None), render(Some(&null_text)));
        assert_eq!(render_or_null(None), "NULL");
        assert_eq!(render(Some(&FieldValue::Int(1000))).as_deref(), Some("1000"));
        assert_eq!(render(Some(&FieldValue::Bool(false))).as_deref(), Some("false"));
    }

    #[test]
    fn first_seen_skips_nulls_but_keeps_false_values() {
        let row = ListingRow {
            id: 7,
            archived: false,
            fields: vec![
                (column_spec("name").unwrap(), None),
                (column_spec("premium").unwrap(), Some(FieldValue::Bool(false))),
                (column_spec("salary_from").unwrap(), Some(FieldValue::Int(0))),
            ],
        };
        let record = ListingRecord::first_seen(&row, date(2024, 1, 1));
        assert_eq!(record.fields.len(), 2);
        assert!(record.field("name").is_none());
        assert_eq!(record.added_at, Some(date(2024, 1, 1)));
        assert_eq!(record.updated_at, Some(date(2024, 1, 1)));
        assert_eq!(record.removed_at, None);
    }

    #[test]
    fn patch_sets_and_clears_columns() {
        let name = column_spec("name").unwrap();
        let salary = column_spec("salary_from").unwrap();
        let mut record = ListingRecord {
            id: 1,
            fields: BTreeMap::from([("name", FieldValue::Text("dev".into()))]),
            added_at: Some(date(2024, 1, 1)),
            updated_at: Some(date(2024, 1, 1)),
            removed_at: None,
        };
        record.apply(&ListingPatch {
            columns: vec![(name, None), (salary, Some(FieldValue::Int(2000)))],
            added_at: None,
            updated_at: Some(date(2024, 1, 3)),
        });
        assert!(record.field("name").is_none());
        assert_eq!(record.field("salary_from"), Some(&FieldValue::Int(2000)));
        assert_eq!(record.updated_at, Some(date(2024, 1, 3)));
        assert_eq!(record.watermark(), Some(date(2024, 1, 3)));
    }

    #[test]
    fn cut_text_respects_char_boundaries() {
        assert_eq!(cut_text("short", 128), "short");
        assert_eq!(cut_text("привет мир", 6), "привет...");
        assert_eq!(cut_text("abc", 3), "abc");
    }
}
