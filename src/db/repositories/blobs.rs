use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::{db::Database, models::StreamId};

impl Database {
    pub async fn get_blob(&self, stream_id: StreamId, blob_id: &str) -> Result<Option<Vec<u8>>> {
        let blob_id = blob_id.to_string();
        self.execute(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT bytes FROM blobs WHERE stream_id = ?1 AND blob_id = ?2",
                    params![stream_id, blob_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    /// Keep the first copy fetched; blobs are immutable once produced.
    pub async fn put_blob(&self, stream_id: StreamId, blob_id: &str, bytes: Vec<u8>) -> Result<()> {
        let blob_id = blob_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO blobs (stream_id, blob_id, bytes, fetched_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![stream_id, blob_id, bytes, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}
