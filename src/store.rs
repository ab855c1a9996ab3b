use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::error::StoreError;
use crate::models::{AdventureLevel, EnrichmentRecord, FetchedPost, MediaRef, Post, PostStatus};

const POST_COLUMNS: &str = "id, activity_id, user_id, user_name, media_refs, primary_image_url,
     declared_adventure_number, declared_level, text_content, observed_at, status";

const ENRICHMENT_COLUMNS: &str = "post_id, user_id, text_content, adventure_label, image_urls,
     technical_analysis, historical_analysis, synthesis, rating, completed_at";

/// Durable store for fetched posts, their enrichment history and the fetch watermark.
pub struct PostStore {
    conn: Mutex<Connection>,
}

// Fixed-width UTC timestamps so lexical ORDER BY matches chronological order.
fn db_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_db_timestamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_db_json<T: serde::de::DeserializeOwned>(raw: &str, column: usize) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        activity_id: row.get(1)?,
        user_id: row.get(2)?,
        user_name: row.get(3)?,
        media_refs: parse_db_json::<Vec<MediaRef>>(&row.get::<_, String>(4)?, 4)?,
        primary_image_url: row.get(5)?,
        declared_adventure_number: row.get::<_, Option<u32>>(6)?,
        declared_level: AdventureLevel::from_db(&row.get::<_, String>(7)?),
        text_content: row.get(8)?,
        observed_at: parse_db_timestamp(&row.get::<_, String>(9)?, 9)?,
        status: PostStatus::from_db(&row.get::<_, String>(10)?),
    })
}

fn enrichment_from_row(row: &Row<'_>) -> rusqlite::Result<EnrichmentRecord> {
    Ok(EnrichmentRecord {
        post_id: row.get(0)?,
        user_id: row.get(1)?,
        text_content: row.get(2)?,
        adventure_label: row.get(3)?,
        image_urls: parse_db_json::<Vec<String>>(&row.get::<_, String>(4)?, 4)?,
        technical_analysis: row.get(5)?,
        historical_analysis: row.get(6)?,
        synthesis: row.get(7)?,
        rating: row.get(8)?,
        completed_at: parse_db_timestamp(&row.get::<_, String>(9)?, 9)?,
    })
}

fn insert_enrichment(conn: &Connection, record: &EnrichmentRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO enrichments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            ENRICHMENT_COLUMNS
        ),
        params![
            record.post_id,
            record.user_id,
            record.text_content,
            record.adventure_label,
            serde_json::to_string(&record.image_urls)?,
            record.technical_analysis,
            record.historical_analysis,
            record.synthesis,
            record.rating,
            db_timestamp(&record.completed_at),
        ],
    )?;
    Ok(())
}

fn flip_processed(conn: &Connection, post_id: i64) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row("SELECT id FROM posts WHERE id = ?1", [post_id], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(StoreError::NotFound(post_id).into());
    }
    conn.execute(
        "UPDATE posts SET status = ?2 WHERE id = ?1",
        params![post_id, PostStatus::Processed.as_db_str()],
    )?;
    Ok(())
}

impl PostStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                activity_id INTEGER NOT NULL UNIQUE,
                user_id INTEGER NOT NULL,
                user_name TEXT NOT NULL,
                media_refs TEXT NOT NULL,
                primary_image_url TEXT,
                declared_adventure_number INTEGER,
                declared_level TEXT NOT NULL,
                text_content TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'unprocessed'
            );

            CREATE TABLE IF NOT EXISTS enrichments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id INTEGER NOT NULL REFERENCES posts(id),
                user_id INTEGER NOT NULL,
                text_content TEXT NOT NULL,
                adventure_label TEXT NOT NULL,
                image_urls TEXT NOT NULL,
                technical_analysis TEXT NOT NULL,
                historical_analysis TEXT NOT NULL,
                synthesis TEXT NOT NULL,
                rating INTEGER NOT NULL,
                completed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fetch_watermarks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                last_fetch TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_posts_status ON posts(status, id);
            CREATE INDEX IF NOT EXISTS idx_posts_observed_at ON posts(observed_at DESC);
            CREATE INDEX IF NOT EXISTS idx_enrichments_user ON enrichments(user_id, completed_at);
            "#,
        )
        .context("Failed to create post store schema")?;

        Ok(())
    }

    // ========================================================================
    // Posts
    // ========================================================================

    /// Insert a post unless its activity id is already known. Returns whether a row was written.
    pub fn insert(&self, post: &FetchedPost) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO posts ({})
                 VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                POST_COLUMNS
            ),
            params![
                post.activity_id,
                post.user_id,
                post.user_name,
                serde_json::to_string(&post.media_refs)?,
                post.primary_image_url,
                post.declared_adventure_number,
                post.declared_level.as_db_str(),
                post.text_content,
                db_timestamp(&post.observed_at),
                PostStatus::Unprocessed.as_db_str(),
            ],
        )?;

        if inserted == 0 {
            tracing::debug!("Skipping duplicate post with activity_id {}", post.activity_id);
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO fetch_watermarks (last_fetch) VALUES (?1)",
            [db_timestamp(&Utc::now())],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Oldest unprocessed post by insertion order.
    pub fn next_unprocessed(&self) -> Result<Option<Post>> {
        let conn = self.lock_conn()?;
        let post = conn
            .query_row(
                &format!(
                    "SELECT {} FROM posts WHERE status = ?1 ORDER BY id ASC LIMIT 1",
                    POST_COLUMNS
                ),
                [PostStatus::Unprocessed.as_db_str()],
                post_from_row,
            )
            .optional()?;
        Ok(post)
    }

    pub fn post(&self, post_id: i64) -> Result<Option<Post>> {
        let conn = self.lock_conn()?;
        let post = conn
            .query_row(
                &format!("SELECT {} FROM posts WHERE id = ?1", POST_COLUMNS),
                [post_id],
                post_from_row,
            )
            .optional()?;
        Ok(post)
    }

    pub fn unprocessed_count(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM posts WHERE status = ?1",
            [PostStatus::Unprocessed.as_db_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// One-way `unprocessed -> processed`. Unknown ids fail with [`StoreError::NotFound`].
    pub fn mark_processed(&self, post_id: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        flip_processed(&conn, post_id)
    }

    /// Source timestamp of the newest stored post, or the Unix epoch when empty.
    pub fn latest_timestamp(&self) -> Result<DateTime<Utc>> {
        let conn = self.lock_conn()?;
        let latest: Option<String> = conn
            .query_row(
                "SELECT observed_at FROM posts ORDER BY observed_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match latest {
            Some(raw) => Ok(parse_db_timestamp(&raw, 0)?),
            None => Ok(Utc.timestamp_opt(0, 0).single().unwrap_or_default()),
        }
    }

    /// Wall-clock time of the last insert that actually wrote a post.
    pub fn last_fetch_time(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_fetch FROM fetch_watermarks ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| parse_db_timestamp(&raw, 0).map_err(Into::into))
            .transpose()
    }

    // ========================================================================
    // Enrichments
    // ========================================================================

    /// Append-only; stored records are never updated.
    pub fn append_enrichment(&self, record: &EnrichmentRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        insert_enrichment(&conn, record)
    }

    /// Append the record and flip its post to processed in one transaction.
    pub fn commit_enrichment(&self, record: &EnrichmentRecord) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        flip_processed(&tx, record.post_id)?;
        insert_enrichment(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// All records for a user, oldest first.
    pub fn history_for(&self, user_id: i64) -> Result<Vec<EnrichmentRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM enrichments WHERE user_id = ?1 ORDER BY completed_at ASC, id ASC",
            ENRICHMENT_COLUMNS
        ))?;
        let records = stmt
            .query_map([user_id], enrichment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn latest_enrichment_for(&self, user_id: i64) -> Result<Option<EnrichmentRecord>> {
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM enrichments WHERE user_id = ?1
                     ORDER BY completed_at DESC, id DESC LIMIT 1",
                    ENRICHMENT_COLUMNS
                ),
                [user_id],
                enrichment_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn enrichment_count_for_post(&self, post_id: i64) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM enrichments WHERE post_id = ?1",
            [post_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fetched(activity_id: i64, user_id: i64, minutes: i64) -> FetchedPost {
        FetchedPost {
            activity_id,
            user_id,
            user_name: format!("User_{}", user_id),
            media_refs: vec![MediaRef {
                theatre_popup: Some("https://cdn.example/popup.jpg".to_string()),
                full: None,
                url: None,
            }],
            primary_image_url: Some("https://cdn.example/popup.jpg".to_string()),
            declared_adventure_number: Some(3),
            declared_level: AdventureLevel::Basic,
            text_content: "Abenteuer 3 Basic Cut".to_string(),
            observed_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
                + Duration::minutes(minutes),
        }
    }

    fn record(post_id: i64, user_id: i64, completed_minutes: i64) -> EnrichmentRecord {
        EnrichmentRecord {
            post_id,
            user_id,
            text_content: "Abenteuer 3 Basic Cut".to_string(),
            adventure_label: "3".to_string(),
            image_urls: vec!["https://cdn.example/popup.jpg".to_string()],
            technical_analysis: "clean lines".to_string(),
            historical_analysis: "first submission".to_string(),
            synthesis: "great start".to_string(),
            rating: 4,
            completed_at: Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap()
                + Duration::minutes(completed_minutes),
        }
    }

    #[test]
    fn insert_is_idempotent_per_activity_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PostStore::new(dir.path().join("posts.db")).expect("store");

        assert!(store.insert(&fetched(500, 311, 0)).unwrap());
        assert!(!store.insert(&fetched(500, 311, 5)).unwrap());
        assert_eq!(store.unprocessed_count().unwrap(), 1);
        assert!(store.last_fetch_time().unwrap().is_some());
    }

    #[test]
    fn next_unprocessed_follows_insertion_order() {
        let store = PostStore::in_memory().expect("store");
        // inserted out of timestamp order on purpose
        store.insert(&fetched(2, 1, 10)).unwrap();
        store.insert(&fetched(1, 1, 0)).unwrap();

        let first = store.next_unprocessed().unwrap().expect("post");
        assert_eq!(first.activity_id, 2);
        store.mark_processed(first.id).unwrap();

        let second = store.next_unprocessed().unwrap().expect("post");
        assert_eq!(second.activity_id, 1);
        assert_eq!(second.media_refs.len(), 1);
        assert_eq!(second.declared_level, AdventureLevel::Basic);
        store.mark_processed(second.id).unwrap();

        assert!(store.next_unprocessed().unwrap().is_none());
    }

    #[test]
    fn mark_processed_is_one_way_and_rejects_unknown_ids() {
        let store = PostStore::in_memory().expect("store");
        store.insert(&fetched(1, 1, 0)).unwrap();
        let post = store.next_unprocessed().unwrap().unwrap();

        store.mark_processed(post.id).unwrap();
        store.mark_processed(post.id).unwrap();
        // a re-fetch of the same activity must not resurrect it
        assert!(!store.insert(&fetched(1, 1, 0)).unwrap());
        assert_eq!(
            store.post(post.id).unwrap().unwrap().status,
            PostStatus::Processed
        );

        let err = store.mark_processed(9999).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound(9999))
        ));
    }

    #[test]
    fn latest_timestamp_defaults_to_epoch() {
        let store = PostStore::in_memory().expect("store");
        assert_eq!(store.latest_timestamp().unwrap().timestamp(), 0);

        store.insert(&fetched(1, 1, 0)).unwrap();
        store.insert(&fetched(2, 1, 30)).unwrap();
        assert_eq!(
            store.latest_timestamp().unwrap(),
            fetched(2, 1, 30).observed_at
        );
    }

    #[test]
    fn history_is_ordered_by_completion() {
        let store = PostStore::in_memory().expect("store");
        store.insert(&fetched(1, 7, 0)).unwrap();
        store.insert(&fetched(2, 7, 1)).unwrap();
        store.insert(&fetched(3, 8, 2)).unwrap();

        store.append_enrichment(&record(2, 7, 20)).unwrap();
        store.append_enrichment(&record(1, 7, 10)).unwrap();
        store.append_enrichment(&record(3, 8, 5)).unwrap();

        let history = store.history_for(7).unwrap();
        let post_ids: Vec<i64> = history.iter().map(|r| r.post_id).collect();
        assert_eq!(post_ids, vec![1, 2]);
        assert_eq!(
            store.latest_enrichment_for(7).unwrap().unwrap().post_id,
            2
        );
        assert!(store.history_for(99).unwrap().is_empty());
    }

    #[test]
    fn commit_enrichment_is_atomic() {
        let store = PostStore::in_memory().expect("store");
        store.insert(&fetched(1, 7, 0)).unwrap();
        let post = store.next_unprocessed().unwrap().unwrap();

        assert!(store.commit_enrichment(&record(4242, 7, 0)).is_err());
        assert!(store.history_for(7).unwrap().is_empty());

        store.commit_enrichment(&record(post.id, 7, 0)).unwrap();
        assert_eq!(store.enrichment_count_for_post(post.id).unwrap(), 1);
        assert_eq!(
            store.post(post.id).unwrap().unwrap().status,
            PostStatus::Processed
        );
    }
}
