use anyhow::{Context, Result};
use async_trait::async_trait;
use dealsync_core::DealRow;
use sqlx::PgPool;

/// Idempotent destination for resolved deals, keyed by external id.
#[async_trait]
pub trait DealSink: Send + Sync {
    /// Writes every row inside one transaction: all of them commit or none do.
    async fn upsert_page(&self, rows: &[DealRow]) -> Result<u64>;

    async fn upsert_one(&self, row: &DealRow) -> Result<()> {
        self.upsert_page(std::slice::from_ref(row)).await.map(|_| ())
    }
}

const UPSERT_DEAL: &str = r#"
    INSERT INTO deals (id, title, stage, category, postal_code, contact, created_at, synced_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, now())
    ON CONFLICT (id) DO UPDATE SET
        title = EXCLUDED.title,
        stage = EXCLUDED.stage,
        category = EXCLUDED.category,
        postal_code = EXCLUDED.postal_code,
        contact = EXCLUDED.contact,
        created_at = EXCLUDED.created_at,
        synced_at = now()
"#;

#[derive(Debug, Clone)]
pub struct PgDealStore {
    pool: PgPool,
}

impl PgDealStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DealSink for PgDealStore {
    async fn upsert_page(&self, rows: &[DealRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("opening page transaction")?;
        for row in rows {
            sqlx::query(UPSERT_DEAL)
                .bind(row.id)
                .bind(&row.title)
                .bind(&row.stage)
                .bind(&row.category)
                .bind(&row.postal_code)
                .bind(&row.contact)
                .bind(row.created_at)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("upserting deal {}", row.id))?;
        }
        tx.commit().await.context("committing page transaction")?;
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use dealsync_core::DealColumn;
    use sqlx::Row;

    #[test]
    fn upsert_overwrites_every_mapped_column() {
        let (_, update) = UPSERT_DEAL
            .split_once("DO UPDATE SET")
            .expect("conflict clause");
        for column in DealColumn::ALL {
            let assignment = format!("{column} = EXCLUDED.{column}");
            assert!(update.contains(&assignment), "missing `{assignment}`");
        }
        assert!(update.contains("synced_at = now()"));
    }

    fn row(id: i64, title: &str, stage: &str) -> DealRow {
        DealRow {
            title: Some(title.to_string()),
            stage: Some(stage.to_string()),
            category: Some("Retail".to_string()),
            created_at: Utc.with_ymd_and_hms(2023, 11, 5, 7, 30, 0).single(),
            ..DealRow::new(id)
        }
    }

    async fn deal_count(pool: &PgPool) -> i64 {
        sqlx::query("SELECT count(*) AS n FROM deals")
            .fetch_one(pool)
            .await
            .unwrap()
            .get("n")
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    #[ignore = "Requires PostgreSQL database"]
    async fn same_id_twice_keeps_one_row_with_latest_values(pool: PgPool) {
        let store = PgDealStore::new(pool.clone());
        store.upsert_one(&row(1, "Warehouse lease", "New lead")).await.unwrap();
        store.upsert_one(&row(1, "Warehouse lease (renewal)", "Won")).await.unwrap();

        assert_eq!(deal_count(&pool).await, 1);
        let stored = sqlx::query("SELECT title, stage FROM deals WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stored.get::<String, _>("title"), "Warehouse lease (renewal)");
        assert_eq!(stored.get::<String, _>("stage"), "Won");
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    #[ignore = "Requires PostgreSQL database"]
    async fn failing_row_rolls_back_the_whole_page(pool: PgPool) {
        let store = PgDealStore::new(pool.clone());
        // PostgreSQL text cannot hold NUL bytes.
        let page = vec![row(1, "ok", "New lead"), row(2, "bad\0title", "New lead")];

        let err = store.upsert_page(&page).await.unwrap_err();
        assert!(format!("{err:#}").contains("deal 2"), "got {err:#}");
        assert_eq!(deal_count(&pool).await, 0);
    }
}
