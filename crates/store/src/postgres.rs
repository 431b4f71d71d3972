use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, AggregateRow, DeadLetterEvent, NewOutboxEvent, OutboxEvent, OutboxQuery,
    OutboxStatus, ProcessedEvent, ProcessedKey, ProductId, Result, StockRow, StoreError, Version,
    store::{Store, Transaction},
};

const OUTBOX_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, topic, payload, status, retry_count, created_at, published_at";

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }
}

fn row_to_aggregate(row: PgRow) -> Result<AggregateRow> {
    Ok(AggregateRow {
        aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
        aggregate_type: row.try_get("aggregate_type")?,
        version: Version::new(row.try_get("version")?),
        updated_at: row.try_get("updated_at")?,
        state: row.try_get("state")?,
    })
}

fn row_to_outbox(row: PgRow) -> Result<OutboxEvent> {
    let status: String = row.try_get("status")?;
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        status: status.parse().map_err(|e: String| {
            StoreError::Database(sqlx::Error::Decode(e.into()))
        })?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
    })
}

fn row_to_stock(row: PgRow) -> Result<StockRow> {
    Ok(StockRow {
        product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
        quantity: row.try_get("quantity")?,
        version: Version::new(row.try_get("version")?),
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_dead_letter(row: PgRow) -> Result<DeadLetterEvent> {
    Ok(DeadLetterEvent {
        id: row.try_get("id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        resolved: row.try_get("resolved")?,
    })
}

/// A transaction against a [`PostgresStore`].
///
/// Rows read through `load_*` are locked with `SELECT ... FOR UPDATE` until
/// the transaction ends. Dropping an unfinished transaction rolls it back.
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn tx(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or(StoreError::NoActiveTransaction)
    }

    async fn current_aggregate_version(&mut self, aggregate_id: AggregateId) -> Result<Version> {
        let tx = self.tx()?;
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM aggregates WHERE aggregate_id = $1")
                .bind(aggregate_id.as_uuid())
                .fetch_optional(&mut **tx)
                .await?;
        Ok(Version::new(version.unwrap_or(0)))
    }

    async fn current_stock_version(&mut self, product_id: &ProductId) -> Result<Version> {
        let tx = self.tx()?;
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM stock WHERE product_id = $1")
                .bind(product_id.as_str())
                .fetch_optional(&mut **tx)
                .await?;
        Ok(Version::new(version.unwrap_or(0)))
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    async fn load_aggregate(&mut self, aggregate_id: AggregateId) -> Result<Option<AggregateRow>> {
        let tx = self.tx()?;
        let row = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, version, updated_at, state
            FROM aggregates
            WHERE aggregate_id = $1
            FOR UPDATE
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(row_to_aggregate).transpose()
    }

    async fn save_aggregate(&mut self, row: &AggregateRow) -> Result<Version> {
        let new_version = row.version.next();
        let tx = self.tx()?;

        let affected = if row.version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO aggregates (aggregate_id, aggregate_type, version, updated_at, state)
                VALUES ($1, $2, $3, NOW(), $4)
                ON CONFLICT (aggregate_id) DO NOTHING
                "#,
            )
            .bind(row.aggregate_id.as_uuid())
            .bind(&row.aggregate_type)
            .bind(new_version.as_i64())
            .bind(&row.state)
            .execute(&mut **tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE aggregates
                SET version = $3, updated_at = NOW(), state = $4
                WHERE aggregate_id = $1 AND version = $2
                "#,
            )
            .bind(row.aggregate_id.as_uuid())
            .bind(row.version.as_i64())
            .bind(new_version.as_i64())
            .bind(&row.state)
            .execute(&mut **tx)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            let actual = self.current_aggregate_version(row.aggregate_id).await?;
            return Err(StoreError::ConcurrencyConflict {
                key: row.aggregate_id.to_string(),
                expected: row.version,
                actual,
            });
        }
        Ok(new_version)
    }

    async fn insert_outbox(&mut self, event: NewOutboxEvent) -> Result<OutboxEvent> {
        let row = OutboxEvent::pending(event);
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO outbox_events
                (id, aggregate_type, aggregate_id, event_type, topic, payload, status, retry_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(row.id)
        .bind(&row.aggregate_type)
        .bind(&row.aggregate_id)
        .bind(&row.event_type)
        .bind(&row.topic)
        .bind(&row.payload)
        .bind(row.status.as_str())
        .bind(row.retry_count)
        .bind(row.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn is_processed(&mut self, key: &ProcessedKey) -> Result<bool> {
        let tx = self.tx()?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM processed_events WHERE id = $1)")
                .bind(key.id())
                .fetch_one(&mut **tx)
                .await?;
        Ok(exists)
    }

    async fn insert_processed(&mut self, entry: ProcessedEvent) -> Result<()> {
        let tx = self.tx()?;
        // ON CONFLICT keeps the transaction usable; a concurrent insert of the
        // same id blocks until the other transaction ends.
        let affected = sqlx::query(
            r#"
            INSERT INTO processed_events (id, aggregate_id, event_type, processed_at, processed_by)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.aggregate_id)
        .bind(&entry.event_type)
        .bind(entry.processed_at)
        .bind(&entry.processed_by)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::DuplicateKey(entry.id));
        }
        Ok(())
    }

    async fn insert_dead_letter(&mut self, event: DeadLetterEvent) -> Result<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO dead_letter_events
                (id, aggregate_type, aggregate_id, event_type, topic, payload, error_message, retry_count, created_at, resolved)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.topic)
        .bind(&event.payload)
        .bind(&event.error_message)
        .bind(event.retry_count)
        .bind(event.created_at)
        .bind(event.resolved)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn load_stock(&mut self, product_id: &ProductId) -> Result<Option<StockRow>> {
        let tx = self.tx()?;
        let row = sqlx::query(
            "SELECT product_id, quantity, version, updated_at FROM stock WHERE product_id = $1 FOR UPDATE",
        )
        .bind(product_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(row_to_stock).transpose()
    }

    async fn save_stock(&mut self, row: &StockRow) -> Result<Version> {
        let new_version = row.version.next();
        let tx = self.tx()?;

        let affected = if row.version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO stock (product_id, quantity, version, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (product_id) DO NOTHING
                "#,
            )
            .bind(row.product_id.as_str())
            .bind(row.quantity)
            .bind(new_version.as_i64())
            .execute(&mut **tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE stock
                SET quantity = $3, version = $4, updated_at = NOW()
                WHERE product_id = $1 AND version = $2
                "#,
            )
            .bind(row.product_id.as_str())
            .bind(row.version.as_i64())
            .bind(row.quantity)
            .bind(new_version.as_i64())
            .execute(&mut **tx)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            let actual = self.current_stock_version(&row.product_id).await?;
            return Err(StoreError::ConcurrencyConflict {
                key: row.product_id.to_string(),
                expected: row.version,
                actual,
            });
        }
        Ok(new_version)
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(StoreError::NoActiveTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(StoreError::NoActiveTransaction)?;
        tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }

    async fn get_aggregate(&self, aggregate_id: AggregateId) -> Result<Option<AggregateRow>> {
        let row = sqlx::query(
            "SELECT aggregate_id, aggregate_type, version, updated_at, state FROM aggregates WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_aggregate).transpose()
    }

    async fn fetch_pending_outbox(
        &self,
        max_retries: i32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE status = 'PENDING' AND retry_count < $1 ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(max_retries)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_outbox).collect()
    }

    async fn mark_outbox_published(&self, id: Uuid) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE outbox_events SET status = 'PUBLISHED', published_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::NotFound(format!("outbox event {id}")));
        }
        Ok(())
    }

    async fn record_outbox_failure(&self, id: Uuid, max_retries: i32) -> Result<OutboxEvent> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= $2 THEN 'FAILED' ELSE status END
            WHERE id = $1
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(max_retries)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("outbox event {id}")))?;

        row_to_outbox(row)
    }

    async fn purge_outbox(
        &self,
        status: OutboxStatus,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let sql = match status {
            OutboxStatus::Published => {
                "DELETE FROM outbox_events WHERE status = $1 AND COALESCE(published_at, created_at) < $2"
            }
            _ => "DELETE FROM outbox_events WHERE status = $1 AND created_at < $2",
        };
        let result = sqlx::query(sql)
            .bind(status.as_str())
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_outbox(&self, status: OutboxStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn list_outbox(&self, query: OutboxQuery) -> Result<Vec<OutboxEvent>> {
        let mut sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE 1=1");
        let mut param_count = 0;

        if query.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ${param_count}"));
        }
        if query.aggregate_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND aggregate_id = ${param_count}"));
        }
        if query.event_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);
        if let Some(status) = query.status {
            sqlx_query = sqlx_query.bind(status.as_str());
        }
        if let Some(aggregate_id) = query.aggregate_id {
            sqlx_query = sqlx_query.bind(aggregate_id);
        }
        if let Some(event_type) = query.event_type {
            sqlx_query = sqlx_query.bind(event_type);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_outbox).collect()
    }

    async fn is_processed(&self, key: &ProcessedKey) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM processed_events WHERE id = $1)")
                .bind(key.id())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, topic, payload,
                   error_message, retry_count, created_at, resolved
            FROM dead_letter_events
            WHERE resolved = FALSE
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_dead_letter).collect()
    }

    async fn get_stock(&self, product_id: &ProductId) -> Result<Option<StockRow>> {
        let row = sqlx::query(
            "SELECT product_id, quantity, version, updated_at FROM stock WHERE product_id = $1",
        )
        .bind(product_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_stock).transpose()
    }

    async fn upsert_stock(&self, product_id: &ProductId, quantity: i64) -> Result<StockRow> {
        let row = sqlx::query(
            r#"
            INSERT INTO stock (product_id, quantity, version, updated_at)
            VALUES ($1, $2, 1, NOW())
            ON CONFLICT (product_id)
            DO UPDATE SET quantity = EXCLUDED.quantity,
                          version = stock.version + 1,
                          updated_at = NOW()
            RETURNING product_id, quantity, version, updated_at
            "#,
        )
        .bind(product_id.as_str())
        .bind(quantity)
        .fetch_one(&self.pool)
        .await?;

        row_to_stock(row)
    }
}
