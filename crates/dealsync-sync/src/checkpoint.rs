use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealsync_core::{Checkpoint, Cursor};
use dealsync_storage::CheckpointStore;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Checkpoints in the `sync_checkpoints` table, one row per stream.
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn checkpoint_from_row(row: &sqlx::postgres::PgRow) -> Result<Checkpoint> {
    let pages: i64 = row.try_get("pages_committed")?;
    let records: i64 = row.try_get("records_processed")?;
    let cursor: String = row.try_get("cursor")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    let run_id: Uuid = row.try_get("run_id")?;
    Ok(Checkpoint {
        run_id,
        cursor: Cursor::new(cursor),
        pages_committed: u64::try_from(pages).context("negative page count")?,
        records_processed: u64::try_from(records).context("negative record count")?,
        completed: row.try_get("completed")?,
        updated_at,
    })
}

const SELECT_CHECKPOINT: &str = r#"
    SELECT run_id, cursor, pages_committed, records_processed, completed, updated_at
      FROM sync_checkpoints
     WHERE stream = $1
"#;

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, stream: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(SELECT_CHECKPOINT)
            .bind(stream)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading checkpoint for {stream}"))?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn save(&self, stream: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut tx = self.pool.begin().await.context("opening checkpoint transaction")?;

        let existing = sqlx::query(&format!("{SELECT_CHECKPOINT} FOR UPDATE"))
            .bind(stream)
            .fetch_optional(&mut *tx)
            .await
            .with_context(|| format!("locking checkpoint for {stream}"))?;
        if let Some(row) = existing {
            checkpoint.ensure_follows(&checkpoint_from_row(&row)?)?;
        }

        let pages = i64::try_from(checkpoint.pages_committed).context("page count overflow")?;
        let records =
            i64::try_from(checkpoint.records_processed).context("record count overflow")?;
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints
                (stream, run_id, cursor, pages_committed, records_processed, completed, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stream) DO UPDATE SET
                run_id = EXCLUDED.run_id,
                cursor = EXCLUDED.cursor,
                pages_committed = EXCLUDED.pages_committed,
                records_processed = EXCLUDED.records_processed,
                completed = EXCLUDED.completed,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(stream)
        .bind(checkpoint.run_id)
        .bind(checkpoint.cursor.as_str())
        .bind(pages)
        .bind(records)
        .bind(checkpoint.completed)
        .bind(checkpoint.updated_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("saving checkpoint for {stream}"))?;

        tx.commit().await.context("committing checkpoint")?;
        Ok(())
    }

    async fn clear(&self, stream: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_checkpoints WHERE stream = $1")
            .bind(stream)
            .execute(&self.pool)
            .await
            .with_context(|| format!("clearing checkpoint for {stream}"))?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealsync_core::CheckpointError;

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    #[ignore = "Requires PostgreSQL database"]
    async fn regressing_save_is_rejected_and_leaves_the_row(pool: PgPool) {
        let store = PgCheckpointStore::new(pool);
        let begun = Checkpoint::begin(Uuid::new_v4(), Cursor::start());
        let advanced = begun.advance(Cursor::new("50"), 50).unwrap();
        store.save("deals", &begun).await.unwrap();
        store.save("deals", &advanced).await.unwrap();

        let err = store.save("deals", &begun).await.unwrap_err();
        assert!(
            matches!(err.downcast_ref::<CheckpointError>(), Some(CheckpointError::Regression { .. })),
            "got {err:#}"
        );

        let stored = store.load("deals").await.unwrap().expect("checkpoint");
        assert_eq!(stored.run_id, advanced.run_id);
        assert_eq!(stored.cursor.as_str(), "50");
        assert_eq!(stored.pages_committed, 1);
        assert_eq!(stored.records_processed, 50);
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    #[ignore = "Requires PostgreSQL database"]
    async fn new_run_replaces_a_completed_checkpoint_and_clear_removes_it(pool: PgPool) {
        let store = PgCheckpointStore::new(pool);
        let done = Checkpoint::begin(Uuid::new_v4(), Cursor::start())
            .advance(Cursor::new("50"), 50)
            .unwrap()
            .finish(3);
        store.save("deals", &done).await.unwrap();

        let fresh = Checkpoint::begin(Uuid::new_v4(), Cursor::start());
        store.save("deals", &fresh).await.unwrap();
        let stored = store.load("deals").await.unwrap().expect("checkpoint");
        assert_eq!(stored.run_id, fresh.run_id);
        assert!(!stored.completed);

        assert!(store.clear("deals").await.unwrap());
        assert!(!store.clear("deals").await.unwrap());
        assert!(store.load("deals").await.unwrap().is_none());
    }
}
