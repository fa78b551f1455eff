//! # PgStore
//!
//! A `LogStore` backed by a PostgreSQL table with a `(tenant_id, record_id)` primary key.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use crate::record::{Origin, PersistedLogEntry};
use crate::store::{InsertOutcome, LogStore, StoreError, StoreResult};

#[derive(sqlx::FromRow)]
struct EntryRow {
    tenant_id: String,
    record_id: String,
    origin: String,
    raw_text: String,
    sanitized_text: String,
    received_at: DateTime<Utc>,
    processed_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for PersistedLogEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let origin = row
            .origin
            .parse::<Origin>()
            .map_err(|error| StoreError::CorruptEntry(error.to_string()))?;

        Ok(PersistedLogEntry {
            tenant_id: row.tenant_id,
            record_id: row.record_id,
            origin,
            raw_text: row.raw_text,
            sanitized_text: row.sanitized_text,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Clone)]
pub struct PgStore {
    table: String,
    pool: PgPool,
}

impl PgStore {
    /// Initialize a PgStore writing to `table`.
    /// The table name is interpolated into queries, so only ASCII letters, digits and underscores
    /// are accepted.
    pub fn new_from_pool(table: &str, pool: PgPool) -> StoreResult<Self> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(StoreError::InvalidTableName(table.to_owned()));
        }

        Ok(Self {
            table: table.to_owned(),
            pool,
        })
    }
}

#[async_trait]
impl LogStore for PgStore {
    async fn insert_if_absent(&self, entry: &PersistedLogEntry) -> StoreResult<InsertOutcome> {
        // ON CONFLICT makes the existence check and the write a single statement on the server.
        let query = format!(
            r#"
INSERT INTO "{0}"
    (tenant_id, record_id, origin, raw_text, sanitized_text, received_at, processed_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (tenant_id, record_id) DO NOTHING
            "#,
            &self.table
        );

        let result = sqlx::query(&query)
            .bind(&entry.tenant_id)
            .bind(&entry.record_id)
            .bind(entry.origin.as_str())
            .bind(&entry.raw_text)
            .bind(&entry.sanitized_text)
            .bind(entry.received_at)
            .bind(entry.processed_at)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        match result.rows_affected() {
            0 => Ok(InsertOutcome::AlreadyExists),
            _ => Ok(InsertOutcome::Inserted),
        }
    }

    async fn get(
        &self,
        tenant_id: &str,
        record_id: &str,
    ) -> StoreResult<Option<PersistedLogEntry>> {
        let query = format!(
            r#"
SELECT
    tenant_id, record_id, origin, raw_text, sanitized_text, received_at, processed_at
FROM
    "{0}"
WHERE
    tenant_id = $1
    AND record_id = $2
            "#,
            &self.table
        );

        let row: Option<EntryRow> = sqlx::query_as(&query)
            .bind(tenant_id)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        row.map(PersistedLogEntry::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tenant_id: &str, record_id: &str) -> PersistedLogEntry {
        PersistedLogEntry {
            tenant_id: tenant_id.to_owned(),
            record_id: record_id.to_owned(),
            origin: Origin::TextSubmission,
            raw_text: "Server restarted at 555-1234".to_owned(),
            sanitized_text: "Server restarted at [REDACTED]".to_owned(),
            received_at: Utc::now(),
            processed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_rejects_unsafe_table_names() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();

        for table in ["", "log entries", "logs\"; DROP TABLE x; --", "tbl-1"] {
            assert!(matches!(
                PgStore::new_from_pool(table, pool.clone()),
                Err(StoreError::InvalidTableName(_))
            ));
        }
        assert!(PgStore::new_from_pool("log_entries", pool).is_ok());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL, set DATABASE_URL"]
    async fn test_insert_if_absent(db: PgPool) {
        let store = PgStore::new_from_pool("log_entries", db).unwrap();
        let entry = entry("beta", "1");

        assert_eq!(
            store.insert_if_absent(&entry).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent(&entry).await.unwrap(),
            InsertOutcome::AlreadyExists
        );

        let stored = store.get("beta", "1").await.unwrap().unwrap();
        assert_eq!(stored.raw_text, entry.raw_text);
        assert_eq!(stored.origin, Origin::TextSubmission);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL, set DATABASE_URL"]
    async fn test_tenants_do_not_share_keys(db: PgPool) {
        let store = PgStore::new_from_pool("log_entries", db).unwrap();

        for tenant_id in ["acme", "beta"] {
            assert_eq!(
                store.insert_if_absent(&entry(tenant_id, "shared")).await.unwrap(),
                InsertOutcome::Inserted
            );
        }
    }
}
