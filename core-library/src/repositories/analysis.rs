//! Analysis result repository

use crate::error::{LibraryError, Result};
use crate::models::{decode_embedding, AnalysisResult};
use async_trait::async_trait;
use bridge_traits::detection::BoundingBox;
use sqlx::{FromRow, SqlitePool};

#[async_trait]
pub trait AnalysisResultRepository: Send + Sync {
    /// All results for one item
    async fn find_by_item(&self, item_id: &str) -> Result<Vec<AnalysisResult>>;

    /// Number of results stored for one item
    async fn count_by_item(&self, item_id: &str) -> Result<i64>;

    /// Insert all results of one item in a single transaction
    async fn insert_batch(&self, results: &[AnalysisResult]) -> Result<()>;

    /// Number of results across a folder
    async fn count_by_folder(&self, folder_id: &str) -> Result<i64>;
}

/// SQLite implementation of [`AnalysisResultRepository`]
pub struct SqliteAnalysisResultRepository {
    pool: SqlitePool,
}

impl SqliteAnalysisResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct AnalysisResultRow {
    id: String,
    item_id: String,
    folder_id: String,
    bbox_x: f64,
    bbox_y: f64,
    bbox_width: f64,
    bbox_height: f64,
    confidence: f64,
    embedding: Vec<u8>,
    person_id: Option<String>,
    created_at: i64,
}

impl TryFrom<AnalysisResultRow> for AnalysisResult {
    type Error = LibraryError;

    fn try_from(row: AnalysisResultRow) -> Result<Self> {
        let embedding = decode_embedding(&row.embedding).map_err(LibraryError::Decode)?;
        Ok(AnalysisResult {
            id: row.id,
            item_id: row.item_id,
            folder_id: row.folder_id,
            bbox: BoundingBox {
                x: row.bbox_x,
                y: row.bbox_y,
                width: row.bbox_width,
                height: row.bbox_height,
            },
            confidence: row.confidence,
            embedding,
            person_id: row.person_id,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl AnalysisResultRepository for SqliteAnalysisResultRepository {
    async fn find_by_item(&self, item_id: &str) -> Result<Vec<AnalysisResult>> {
        let rows = sqlx::query_as::<_, AnalysisResultRow>(
            "SELECT * FROM analysis_results WHERE item_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AnalysisResult::try_from).collect()
    }

    async fn count_by_item(&self, item_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM analysis_results WHERE item_id = ?")
                .bind(item_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn insert_batch(&self, results: &[AnalysisResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for result in results {
            if !(0.0..=1.0).contains(&result.confidence) {
                return Err(LibraryError::InvalidInput {
                    field: "confidence".to_string(),
                    message: format!("{} is outside 0..=1", result.confidence),
                });
            }

            sqlx::query(
                r#"
                INSERT INTO analysis_results (
                    id, item_id, folder_id, bbox_x, bbox_y, bbox_width, bbox_height,
                    confidence, embedding, person_id, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&result.id)
            .bind(&result.item_id)
            .bind(&result.folder_id)
            .bind(result.bbox.x)
            .bind(result.bbox.y)
            .bind(result.bbox.width)
            .bind(result.bbox.height)
            .bind(result.confidence)
            .bind(result.embedding_bytes())
            .bind(&result.person_id)
            .bind(result.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count_by_folder(&self, folder_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM analysis_results WHERE folder_id = ?")
                .bind(folder_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
