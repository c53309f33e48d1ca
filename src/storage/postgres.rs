//! PostgreSQL store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use super::{
    FeeSummary, InsertOutcome, StoreError, TransactionPage, TransactionQuery, TransactionStore,
};
use crate::types::TransactionRecord;

const SCHEMA: &str = include_str!("../../sql/schema.sql");

const INSERT_SQL: &str = r#"
    INSERT INTO transactions (
        hash, block_number, timestamp, gas_used, gas_price,
        eth_price_at_tx, eth_fee, usdt_fee, processed_at
    ) VALUES (
        $1, $2, $3, $4::NUMERIC, $5::NUMERIC, $6, $7, $8, $9
    )
    ON CONFLICT (hash) DO NOTHING
"#;

const SELECT_COLUMNS: &str = r#"
    SELECT hash, block_number, timestamp,
           gas_used::TEXT AS gas_used, gas_price::TEXT AS gas_price,
           eth_price_at_tx, eth_fee, usdt_fee, processed_at
    FROM transactions
    WHERE 1=1
"#;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and apply the schema
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .connect(url)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        info!("PostgreSQL connected successfully");

        Ok(Self { pool })
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &TransactionQuery) {
    if let Some(start) = query.start_timestamp {
        builder.push(" AND timestamp >= ").push_bind(start as i64);
    }
    if let Some(end) = query.end_timestamp {
        builder.push(" AND timestamp <= ").push_bind(end as i64);
    }
    if let Some(hash) = &query.hash {
        builder.push(" AND hash = ").push_bind(hash.clone());
    }
}

fn to_u64(column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::InvalidRow(format!("negative {}: {}", column, value)))
}

fn record_from_row(row: &PgRow) -> Result<TransactionRecord, StoreError> {
    Ok(TransactionRecord {
        hash: row.try_get("hash")?,
        block_number: to_u64("block_number", row.try_get("block_number")?)?,
        timestamp: to_u64("timestamp", row.try_get("timestamp")?)?,
        gas_used: row.try_get("gas_used")?,
        gas_price: row.try_get("gas_price")?,
        eth_price_at_tx: row.try_get::<Decimal, _>("eth_price_at_tx")?,
        eth_fee: row.try_get::<Option<Decimal>, _>("eth_fee")?,
        usdt_fee: row.try_get::<Option<Decimal>, _>("usdt_fee")?,
        processed_at: row.try_get::<DateTime<Utc>, _>("processed_at")?,
    })
}

#[async_trait]
impl TransactionStore for PostgresStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(INSERT_SQL)
            .bind(&record.hash)
            .bind(record.block_number as i64)
            .bind(record.timestamp as i64)
            .bind(&record.gas_used)
            .bind(&record.gas_price)
            .bind(record.eth_price_at_tx)
            .bind(record.eth_fee)
            .bind(record.usdt_fee)
            .bind(record.processed_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            debug!("Transaction {} already stored", record.hash);
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn transactions(&self, query: &TransactionQuery) -> Result<TransactionPage, StoreError> {
        let mut select = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        push_filters(&mut select, query);
        select
            .push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(query.page_size() as i64)
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);

        let rows = select.build().fetch_all(&self.pool).await?;
        let transactions = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM transactions WHERE 1=1");
        push_filters(&mut count, query);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get(0)?;

        Ok(TransactionPage {
            current_page: query.page(),
            page_size: query.page_size(),
            total_count: to_u64("count", total)?,
            transactions,
        })
    }

    async fn summary(&self) -> Result<FeeSummary, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(eth_fee), 0) AS total_eth_fee,
                COALESCE(SUM(usdt_fee), 0) AS total_usdt_fee
            FROM transactions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(FeeSummary {
            total_eth_fee: row.try_get("total_eth_fee")?,
            total_usdt_fee: row.try_get("total_usdt_fee")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;

    #[test]
    fn test_filters_render_in_order() {
        let query = TransactionQuery {
            start_timestamp: Some(10),
            end_timestamp: Some(20),
            hash: Some("0xabc".to_string()),
            ..Default::default()
        };
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 WHERE 1=1");
        push_filters(&mut builder, &query);
        assert_eq!(
            builder.sql(),
            "SELECT 1 WHERE 1=1 AND timestamp >= $1 AND timestamp <= $2 AND hash = $3"
        );
    }

    #[test]
    fn test_schema_has_unique_hash() {
        assert!(SCHEMA.contains("hash            TEXT NOT NULL UNIQUE"));
        assert!(INSERT_SQL.contains("ON CONFLICT (hash) DO NOTHING"));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL (DATABASE_URL)
    async fn test_postgres_insert_is_idempotent() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let store = PostgresStore::connect(&url).await.unwrap();
        let rec = record(&format!("0x{:x}", Utc::now().timestamp_nanos_opt().unwrap()));

        assert_eq!(store.insert(&rec).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&rec).await.unwrap(), InsertOutcome::Duplicate);

        let page = store
            .transactions(&TransactionQuery { hash: Some(rec.hash.clone()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.total_count, 1);
    }
}
