//! PostgreSQL item repository and announcement ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgPoolOptions, postgres::PgRow};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::domain::{
    AnnouncementLedger, AppError, BlobRef, DatabaseError, Item, ItemFilter, ItemId,
    ItemRepository, ItemStream, PendingAnnouncement,
};

const ITEM_COLUMNS: &str = "id, seller_id, title, brand, description, category_code, location, \
                            price, image_ref, created_at";

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// PostgreSQL client with connection pooling
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Create a new PostgreSQL client with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new PostgreSQL client with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    fn row_to_item(row: &PgRow) -> Result<Item, AppError> {
        let image: Option<Json<BlobRef>> = row.try_get("image_ref").map_err(DatabaseError::from)?;

        Ok(Item {
            id: row.try_get("id").map_err(DatabaseError::from)?,
            seller: row.try_get("seller_id").map_err(DatabaseError::from)?,
            title: row.try_get("title").map_err(DatabaseError::from)?,
            brand: row.try_get("brand").map_err(DatabaseError::from)?,
            description: row.try_get("description").map_err(DatabaseError::from)?,
            category_code: row.try_get("category_code").map_err(DatabaseError::from)?,
            location: row.try_get("location").map_err(DatabaseError::from)?,
            price: row.try_get("price").map_err(DatabaseError::from)?,
            created_at: row.try_get("created_at").map_err(DatabaseError::from)?,
            image: image.map(|Json(image)| image),
        })
    }

    fn row_to_pending(row: &PgRow) -> Result<PendingAnnouncement, AppError> {
        Ok(PendingAnnouncement {
            item_id: row.try_get("item_id").map_err(DatabaseError::from)?,
            attempts: row.try_get("attempts").map_err(DatabaseError::from)?,
            last_error: row.try_get("last_error").map_err(DatabaseError::from)?,
            recorded_at: row.try_get("recorded_at").map_err(DatabaseError::from)?,
            next_attempt_at: row.try_get("next_attempt_at").map_err(DatabaseError::from)?,
        })
    }
}

/// Builds the listing query; every present filter field adds one AND clause.
fn list_query(filter: &ItemFilter) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(format!("SELECT {ITEM_COLUMNS} FROM items WHERE TRUE"));

    if let Some(ref category) = filter.category {
        query.push(" AND category_code = ").push_bind(category.clone());
    }
    if let Some(ref location) = filter.location {
        query
            .push(" AND lower(location) = lower(")
            .push_bind(location.clone())
            .push(")");
    }
    if let Some(min) = filter.min_price {
        query.push(" AND price >= ").push_bind(min);
    }
    if let Some(max) = filter.max_price {
        query.push(" AND price <= ").push_bind(max);
    }
    if let Some(from) = filter.date_from {
        query.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.date_to {
        query.push(" AND created_at <= ").push_bind(to);
    }

    query.push(" ORDER BY created_at ASC, id ASC");
    query
}

#[async_trait]
impl ItemRepository for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, item), fields(item_id = %item.id))]
    async fn create_item(&self, item: &Item) -> Result<ItemId, AppError> {
        sqlx::query(
            r#"
            INSERT INTO items (id, seller_id, title, brand, description, category_code,
                               location, price, image_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(item.id)
        .bind(item.seller)
        .bind(&item.title)
        .bind(&item.brand)
        .bind(&item.description)
        .bind(&item.category_code)
        .bind(&item.location)
        .bind(item.price)
        .bind(item.image.clone().map(Json))
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        Ok(item.id)
    }

    #[instrument(skip(self))]
    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, AppError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        row.as_ref().map(Self::row_to_item).transpose()
    }

    fn list_items(&self, filter: ItemFilter) -> ItemStream {
        let pool = self.pool.clone();
        Box::pin(async_stream::stream! {
            debug!(?filter, "Streaming items");
            let mut query = list_query(&filter);
            let mut rows = query.build().fetch(&pool);
            while let Some(row) = rows.next().await {
                yield match row {
                    Ok(row) => Self::row_to_item(&row),
                    Err(e) => Err(DatabaseError::from(e).into()),
                };
            }
        })
    }

    #[instrument(skip(self, image), fields(blob_key = %image.key))]
    async fn set_image_reference(&self, id: ItemId, image: &BlobRef) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE items SET image_ref = $1 WHERE id = $2")
            .bind(Json(image.clone()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        if result.rows_affected() == 0 {
            return Err(AppError::ItemNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AnnouncementLedger for PostgresClient {
    #[instrument(skip(self, error))]
    async fn record_unannounced(&self, item_id: ItemId, error: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO item_announcements (item_id, attempts, last_error, recorded_at)
            VALUES ($1, 0, $2, NOW())
            ON CONFLICT (item_id) DO UPDATE SET last_error = EXCLUDED.last_error
            "#,
        )
        .bind(item_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pending_announcements(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<PendingAnnouncement>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, attempts, last_error, recorded_at, next_attempt_at
            FROM item_announcements
            WHERE attempts < $1
              AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
            ORDER BY next_attempt_at ASC NULLS FIRST, recorded_at ASC
            LIMIT $2
            "#,
        )
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        rows.iter().map(Self::row_to_pending).collect()
    }

    #[instrument(skip(self))]
    async fn get_pending(&self, item_id: ItemId) -> Result<Option<PendingAnnouncement>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT item_id, attempts, last_error, recorded_at, next_attempt_at
            FROM item_announcements
            WHERE item_id = $1
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        row.as_ref().map(Self::row_to_pending).transpose()
    }

    #[instrument(skip(self))]
    async fn mark_announced(&self, item_id: ItemId) -> Result<(), AppError> {
        sqlx::query("DELETE FROM item_announcements WHERE item_id = $1")
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from)?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn record_attempt_failure(
        &self,
        item_id: ItemId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<i32, AppError> {
        let row = sqlx::query(
            r#"
            UPDATE item_announcements
            SET attempts = attempts + 1,
                last_error = $2,
                next_attempt_at = $3
            WHERE item_id = $1
            RETURNING attempts
            "#,
        )
        .bind(item_id)
        .bind(error)
        .bind(next_attempt_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from)?;

        match row {
            Some(row) => Ok(row.try_get("attempts").map_err(DatabaseError::from)?),
            None => Err(AppError::AlreadyAnnounced(item_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_unfiltered_listing_is_full_scan() {
        let query = list_query(&ItemFilter::default());
        let sql = query.sql();
        assert!(sql.starts_with("SELECT id, seller_id"));
        assert!(sql.ends_with("FROM items WHERE TRUE ORDER BY created_at ASC, id ASC"));
    }

    #[test]
    fn test_filter_fields_become_and_clauses() {
        let filter = ItemFilter {
            category: Some("CH".to_string()),
            location: Some("Aarhus".to_string()),
            min_price: Some(Decimal::new(10, 0)),
            max_price: Some(Decimal::new(100, 0)),
            date_from: Some(Utc::now()),
            date_to: None,
        };
        let query = list_query(&filter);
        let sql = query.sql();

        assert!(sql.contains(" AND category_code = $1"));
        assert!(sql.contains(" AND lower(location) = lower($2)"));
        assert!(sql.contains(" AND price >= $3"));
        assert!(sql.contains(" AND price <= $4"));
        assert!(sql.contains(" AND created_at >= $5"));
        assert!(!sql.contains("created_at <="));
    }
}
