use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use vacancy_core::{
    empty_watermark, ColumnSpec, ColumnType, FieldValue, ListingPatch, ListingRecord, ListingRow,
    ADDED_AT_COLUMN, ID_COLUMN, INDEXED_COLUMNS, LISTING_COLUMNS, LISTING_TABLE,
    REMOVED_AT_COLUMN, UPDATED_AT_COLUMN, WATERMARK_COLUMNS,
};

use crate::{DatabaseConfig, FeedError, ListingStore, ListingTransaction};

/// Listing table in Postgres. Holds the single connection pool of the
/// process; call [`PgListingStore::close`] on shutdown.
#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    /// Builds the pool without connecting, so an unreachable database shows
    /// up as a failed pass instead of a failed start.
    pub fn connect_lazy(config: &DatabaseConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy_with(config.connect_options());
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn create_table_sql() -> String {
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {LISTING_TABLE} (\n    {ID_COLUMN} BIGINT PRIMARY KEY NOT NULL");
    for spec in LISTING_COLUMNS {
        sql.push_str(&format!(",\n    {} {}", spec.name, spec.sql_type));
    }
    for column in WATERMARK_COLUMNS {
        sql.push_str(&format!(",\n    {column} DATE"));
    }
    sql.push_str("\n)");
    sql
}

pub(crate) fn create_index_sql(column: &str) -> String {
    format!("CREATE INDEX IF NOT EXISTS {LISTING_TABLE}_{column}_idx ON {LISTING_TABLE} ({column})")
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn ensure_schema(&self) -> Result<(), FeedError> {
        sqlx::query(&create_table_sql()).execute(&self.pool).await?;
        for column in INDEXED_COLUMNS {
            sqlx::query(&create_index_sql(column))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn current_watermark(&self) -> Result<NaiveDate, FeedError> {
        let sql = format!(
            "SELECT GREATEST(MAX({ADDED_AT_COLUMN}), MAX({UPDATED_AT_COLUMN}), MAX({REMOVED_AT_COLUMN})) FROM {LISTING_TABLE}"
        );
        let watermark = sqlx::query_scalar::<_, Option<NaiveDate>>(&sql)
            .fetch_one(&self.pool)
            .await?;
        Ok(watermark.unwrap_or_else(empty_watermark))
    }

    async fn begin(&self) -> Result<Box<dyn ListingTransaction>, FeedError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgListingTransaction { tx }))
    }
}

struct PgListingTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ListingTransaction for PgListingTransaction {
    async fn fetch(&mut self, id: i64) -> Result<Option<ListingRecord>, FeedError> {
        let sql = format!("SELECT * FROM {LISTING_TABLE} WHERE {ID_COLUMN} = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.as_ref().map(decode_record).transpose()?)
    }

    async fn insert(&mut self, row: &ListingRow, date: NaiveDate) -> Result<(), FeedError> {
        let populated: Vec<_> = row.populated().collect();

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {LISTING_TABLE} ({ID_COLUMN}, {ADDED_AT_COLUMN}, {UPDATED_AT_COLUMN}"
        ));
        for (spec, _) in &populated {
            qb.push(", ").push(spec.name);
        }
        qb.push(") VALUES (")
            .push_bind(row.id)
            .push(", ")
            .push_bind(date)
            .push(", ")
            .push_bind(date);
        for (spec, value) in populated {
            qb.push(", ");
            push_value(&mut qb, spec, Some(value));
        }
        qb.push(")");

        qb.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn apply(&mut self, id: i64, patch: &ListingPatch) -> Result<(), FeedError> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut qb = QueryBuilder::<Postgres>::new(format!("UPDATE {LISTING_TABLE} SET "));
        let mut assignments = 0usize;
        for (spec, value) in &patch.columns {
            if assignments > 0 {
                qb.push(", ");
            }
            qb.push(spec.name).push(" = ");
            push_value(&mut qb, spec, value.as_ref());
            assignments += 1;
        }
        for (column, date) in [
            (ADDED_AT_COLUMN, patch.added_at),
            (UPDATED_AT_COLUMN, patch.updated_at),
        ] {
            let Some(date) = date else {
                continue;
            };
            if assignments > 0 {
                qb.push(", ");
            }
            qb.push(column).push(" = ").push_bind(date);
            assignments += 1;
        }
        qb.push(format!(" WHERE {ID_COLUMN} = ")).push_bind(id);

        debug!(id, assignments, "updating listing");
        qb.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn removal_candidates(
        &mut self,
        before: NaiveDate,
    ) -> Result<Vec<(i64, Option<NaiveDate>)>, FeedError> {
        let sql = format!(
            "SELECT {ID_COLUMN}, {REMOVED_AT_COLUMN} FROM {LISTING_TABLE} WHERE {ADDED_AT_COLUMN} < $1"
        );
        let rows = sqlx::query_as::<_, (i64, Option<NaiveDate>)>(&sql)
            .bind(before)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn mark_removed(&mut self, ids: &[i64], date: NaiveDate) -> Result<(), FeedError> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {LISTING_TABLE} SET {REMOVED_AT_COLUMN} = $1 WHERE {ID_COLUMN} = ANY($2)"
        );
        sqlx::query(&sql)
            .bind(date)
            .bind(ids)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), FeedError> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, spec: &ColumnSpec, value: Option<&FieldValue>) {
    match spec.ty {
        ColumnType::BigInt => qb.push_bind(value.and_then(FieldValue::as_i64)),
        ColumnType::Integer => qb.push_bind(
            value
                .and_then(FieldValue::as_i64)
                .and_then(|v| i32::try_from(v).ok()),
        ),
        ColumnType::Double => qb.push_bind(value.and_then(FieldValue::as_f64)),
        ColumnType::Boolean => qb.push_bind(value.and_then(FieldValue::as_bool)),
        ColumnType::Text => qb.push_bind(value.and_then(FieldValue::as_text).map(str::to_owned)),
        ColumnType::Timestamp => qb.push_bind(value.and_then(FieldValue::as_timestamp)),
    };
}

fn decode_field(row: &PgRow, spec: &ColumnSpec) -> Result<Option<FieldValue>, sqlx::Error> {
    Ok(match spec.ty {
        ColumnType::BigInt => row.try_get::<Option<i64>, _>(spec.name)?.map(FieldValue::Int),
        ColumnType::Integer => row
            .try_get::<Option<i32>, _>(spec.name)?
            .map(|v| FieldValue::Int(v.into())),
        ColumnType::Double => row.try_get::<Option<f64>, _>(spec.name)?.map(FieldValue::Float),
        ColumnType::Boolean => row.try_get::<Option<bool>, _>(spec.name)?.map(FieldValue::Bool),
        ColumnType::Text => row.try_get::<Option<String>, _>(spec.name)?.map(FieldValue::Text),
        ColumnType::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(spec.name)?
            .map(FieldValue::Timestamp),
    })
}

fn decode_record(row: &PgRow) -> Result<ListingRecord, sqlx::Error> {
    let mut fields = BTreeMap::new();
    for spec in LISTING_COLUMNS {
        if let Some(value) = decode_field(row, spec)? {
            fields.insert(spec.name, value);
        }
    }
    Ok(ListingRecord {
        id: row.try_get(ID_COLUMN)?,
        fields,
        added_at: row.try_get(ADDED_AT_COLUMN)?,
        updated_at: row.try_get(UPDATED_AT_COLUMN)?,
        removed_at: row.try_get(REMOVED_AT_COLUMN)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_lists_every_column_once() {
        let sql = create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS vacancy ("));
        assert!(sql.contains("id BIGINT PRIMARY KEY NOT NULL"));
        assert!(sql.contains("salary_currency VARCHAR(64)"));
        assert!(sql.contains("area_id INT"));
        assert!(sql.contains("address_lat DOUBLE PRECISION"));
        assert!(sql.contains("removed_at DATE"));
        assert_eq!(sql.matches(",\n").count(), LISTING_COLUMNS.len() + WATERMARK_COLUMNS.len());
    }

    #[test]
    fn index_statements_are_idempotent() {
        assert_eq!(
            create_index_sql("area_id"),
            "CREATE INDEX IF NOT EXISTS vacancy_area_id_idx ON vacancy (area_id)"
        );
    }
}
