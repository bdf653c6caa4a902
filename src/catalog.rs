//! Document catalog queries.
//!
//! The catalog is the authoritative record of uploads. Index slots are
//! tied back to catalog rows through the serialized span column, which is
//! what structural repair reads when the mapping artifacts are damaged.

use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{DocumentRecord, DocumentStatus, IndexSpan};

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentRecord> {
    let status_str: String = row.get("status");
    let span_json: Option<String> = row.get("index_span");
    let index_span = match span_json {
        Some(s) => Some(serde_json::from_str::<IndexSpan>(&s).map_err(|e| {
            Error::InconsistentState(format!("undecodable index span in catalog: {}", e))
        })?),
        None => None,
    };

    Ok(DocumentRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        stored_name: row.get("stored_name"),
        original_name: row.get("original_name"),
        display_name: row.get("display_name"),
        uploaded_at: row.get("uploaded_at"),
        status: DocumentStatus::parse(&status_str)?,
        chunk_count: row.get("chunk_count"),
        index_span,
    })
}

const SELECT_COLUMNS: &str = "id, user_id, stored_name, original_name, display_name, \
     uploaded_at, status, chunk_count, index_span";

pub async fn insert_processing(pool: &SqlitePool, record: &DocumentRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, user_id, stored_name, original_name, display_name, uploaded_at, status, chunk_count, index_span)
        VALUES (?, ?, ?, ?, ?, ?, 'processing', 0, NULL)
        "#,
    )
    .bind(&record.id)
    .bind(record.user_id)
    .bind(&record.stored_name)
    .bind(&record.original_name)
    .bind(&record.display_name)
    .bind(record.uploaded_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Marks a row processed and records its slot span.
pub async fn finalize(
    pool: &SqlitePool,
    id: &str,
    span: &IndexSpan,
    chunk_count: i64,
) -> Result<()> {
    let span_json = serde_json::to_string(span)?;
    sqlx::query(
        "UPDATE documents SET status = 'processed', chunk_count = ?, index_span = ? WHERE id = ?",
    )
    .bind(chunk_count)
    .bind(span_json)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET status = 'failed', index_span = NULL WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_display_name(pool: &SqlitePool, id: &str, name: &str) -> Result<()> {
    let result = sqlx::query("UPDATE documents SET display_name = ? WHERE id = ?")
        .bind(name)
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(id.to_string()));
    }
    Ok(())
}

pub async fn fetch(pool: &SqlitePool, id: &str) -> Result<Option<DocumentRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM documents WHERE id = ?",
        SELECT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(decode_row).transpose()
}

pub async fn list_for_user(pool: &SqlitePool, user_id: i64) -> Result<Vec<DocumentRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM documents WHERE user_id = ? ORDER BY uploaded_at DESC, id ASC",
        SELECT_COLUMNS
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_row).collect()
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<DocumentRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM documents ORDER BY uploaded_at DESC, id ASC",
        SELECT_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_row).collect()
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_all(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM documents").execute(pool).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        pool
    }

    fn record(id: &str, user_id: i64) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            user_id,
            stored_name: format!("{}.txt", id),
            original_name: "notes.txt".to_string(),
            display_name: None,
            uploaded_at: 1_700_000_000,
            status: DocumentStatus::Processing,
            chunk_count: 0,
            index_span: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trip() {
        let pool = test_pool().await;
        catalog_insert(&pool, "doc-a", 7).await;

        let fetched = fetch(&pool, "doc-a").await.unwrap().unwrap();
        assert_eq!(fetched.user_id, 7);
        assert_eq!(fetched.status, DocumentStatus::Processing);
        assert!(fetched.index_span.is_none());
    }

    async fn catalog_insert(pool: &SqlitePool, id: &str, user_id: i64) {
        insert_processing(pool, &record(id, user_id)).await.unwrap();
    }

    #[tokio::test]
    async fn finalize_records_span() {
        let pool = test_pool().await;
        catalog_insert(&pool, "doc-a", 1).await;

        let span = IndexSpan {
            start_slot: 0,
            end_slot: 4,
            file_path: "uploads/1/doc-a.txt".to_string(),
        };
        finalize(&pool, "doc-a", &span, 4).await.unwrap();

        let fetched = fetch(&pool, "doc-a").await.unwrap().unwrap();
        assert_eq!(fetched.status, DocumentStatus::Processed);
        assert_eq!(fetched.chunk_count, 4);
        assert_eq!(fetched.index_span.unwrap(), span);
    }

    #[tokio::test]
    async fn mark_failed_clears_span() {
        let pool = test_pool().await;
        catalog_insert(&pool, "doc-a", 1).await;
        let span = IndexSpan {
            start_slot: 0,
            end_slot: 2,
            file_path: String::new(),
        };
        finalize(&pool, "doc-a", &span, 2).await.unwrap();
        mark_failed(&pool, "doc-a").await.unwrap();

        let fetched = fetch(&pool, "doc-a").await.unwrap().unwrap();
        assert_eq!(fetched.status, DocumentStatus::Failed);
        assert!(fetched.index_span.is_none());
    }

    #[tokio::test]
    async fn list_scopes_to_owner() {
        let pool = test_pool().await;
        catalog_insert(&pool, "doc-a", 1).await;
        catalog_insert(&pool, "doc-b", 2).await;

        let mine = list_for_user(&pool, 1).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "doc-a");

        let all = list_all(&pool).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn rename_missing_row_is_not_found() {
        let pool = test_pool().await;
        let err = set_display_name(&pool, "ghost", "x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
