//! Source registry operations.

use chrono::{DateTime, Utc};
use feedforge_shared::{FeedforgeError, NewSource, Result, Source, SourceId, SourceUpdate};
use libsql::{Row, params};

use crate::{Storage, db_err, parse_opt_ts, parse_ts, ts};

const SOURCE_COLUMNS: &str = "id, url, name, active, last_fetched_at, consecutive_failure_count, \
     min_fetch_interval_secs, quality_score, last_error, created_at, last_attempt_at";

impl Storage {
    /// Register a new source. The URL must not already be registered.
    pub async fn insert_source(&self, new: &NewSource) -> Result<Source> {
        self.check_writable()?;
        new.validate()?;

        if self.find_source_by_url(&new.url).await?.is_some() {
            return Err(FeedforgeError::validation(format!(
                "source with URL '{}' already registered",
                new.url
            )));
        }

        let source = Source {
            id: SourceId::new(),
            url: new.url.clone(),
            name: new.name.clone(),
            active: true,
            last_fetched_at: None,
            last_attempt_at: None,
            consecutive_failure_count: 0,
            min_fetch_interval_secs: new.min_fetch_interval_secs,
            quality_score: new.quality_score,
            last_error: None,
            created_at: Utc::now(),
        };

        self.conn
            .execute(
                "INSERT INTO sources (id, url, name, active, consecutive_failure_count,
                     min_fetch_interval_secs, quality_score, created_at)
                 VALUES (?1, ?2, ?3, 1, 0, ?4, ?5, ?6)",
                params![
                    source.id.to_string(),
                    source.url.as_str(),
                    source.name.as_str(),
                    source.min_fetch_interval_secs as i64,
                    source.quality_score,
                    ts(&source.created_at)
                ],
            )
            .await
            .map_err(db_err)?;

        tracing::debug!(source_id = %source.id, url = %source.url, "source registered");
        Ok(source)
    }

    /// Get a source by ID.
    pub async fn get_source(&self, id: &SourceId) -> Result<Option<Source>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_source(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_source_by_url(&self, url: &str) -> Result<Option<SourceId>> {
        let mut rows = self
            .conn
            .query("SELECT id FROM sources WHERE url = ?1", params![url])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let raw = row.get::<String>(0).map_err(db_err)?;
                Ok(Some(parse_source_id(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// List all sources, oldest first.
    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        self.query_sources(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY created_at"
        ))
        .await
    }

    /// List sources with `active = 1`, oldest first.
    pub async fn list_active_sources(&self) -> Result<Vec<Source>> {
        self.query_sources(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE active = 1 ORDER BY created_at"
        ))
        .await
    }

    async fn query_sources(&self, sql: &str) -> Result<Vec<Source>> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_source(&row)?);
        }
        Ok(results)
    }

    /// Apply a partial update and return the new state of the source.
    pub async fn update_source(&self, id: &SourceId, update: &SourceUpdate) -> Result<Source> {
        self.check_writable()?;
        update.validate()?;

        let mut source = self
            .get_source(id)
            .await?
            .ok_or_else(|| FeedforgeError::NotFound(format!("source {id}")))?;

        if let Some(url) = update.url.as_ref().filter(|u| **u != source.url) {
            if self.find_source_by_url(url).await?.is_some() {
                return Err(FeedforgeError::validation(format!(
                    "source with URL '{url}' already registered"
                )));
            }
            source.url = url.clone();
        }
        if let Some(name) = &update.name {
            source.name = name.clone();
        }
        if let Some(active) = update.active {
            source.active = active;
        }
        if let Some(interval) = update.min_fetch_interval_secs {
            source.min_fetch_interval_secs = interval;
        }
        if let Some(score) = update.quality_score {
            source.quality_score = score;
        }

        self.conn
            .execute(
                "UPDATE sources SET url = ?2, name = ?3, active = ?4,
                     min_fetch_interval_secs = ?5, quality_score = ?6
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    source.url.as_str(),
                    source.name.as_str(),
                    source.active as i64,
                    source.min_fetch_interval_secs as i64,
                    source.quality_score
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(source)
    }

    /// Clear the failure streak so the scheduler considers the source again.
    pub async fn reset_source_failures(&self, id: &SourceId) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE sources SET consecutive_failure_count = 0, last_error = NULL
                 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Err(FeedforgeError::NotFound(format!("source {id}")));
        }
        Ok(())
    }

    /// Record a successful fetch: stamp `last_fetched_at` and
    /// `last_attempt_at`, and reset the streak.
    pub async fn record_fetch_success(&self, id: &SourceId, at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE sources SET last_fetched_at = ?2, last_attempt_at = ?2,
                     consecutive_failure_count = 0, last_error = NULL
                 WHERE id = ?1",
                params![id.to_string(), ts(&at)],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a failed fetch. Returns the new consecutive failure count.
    /// `last_attempt_at` is stamped with now; `last_fetched_at` is left unchanged.
    pub async fn record_fetch_failure(&self, id: &SourceId, error: &str) -> Result<u32> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                "UPDATE sources SET consecutive_failure_count = consecutive_failure_count + 1,
                     last_error = ?2, last_attempt_at = ?3
                 WHERE id = ?1
                 RETURNING consecutive_failure_count",
                params![id.to_string(), error, ts(&Utc::now())],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)? as u32),
            None => Err(FeedforgeError::NotFound(format!("source {id}"))),
        }
    }

    /// Count active sources whose failure streak reached `threshold`.
    pub async fn count_excluded_sources(&self, threshold: u32) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sources
                 WHERE active = 1 AND consecutive_failure_count >= ?1",
                params![threshold as i64],
            )
            .await
            .map_err(db_err)?;
        count_row(&mut rows).await
    }
}

pub(crate) async fn count_row(rows: &mut libsql::Rows) -> Result<u64> {
    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
        None => Ok(0),
    }
}

fn parse_source_id(raw: &str) -> Result<SourceId> {
    raw.parse()
        .map_err(|e| FeedforgeError::Storage(format!("bad source id '{raw}': {e}")))
}

fn row_to_source(row: &Row) -> Result<Source> {
    Ok(Source {
        id: parse_source_id(&row.get::<String>(0).map_err(db_err)?)?,
        url: row.get::<String>(1).map_err(db_err)?,
        name: row.get::<String>(2).map_err(db_err)?,
        active: row.get::<i64>(3).map_err(db_err)? != 0,
        last_fetched_at: parse_opt_ts(row.get::<Option<String>>(4).map_err(db_err)?)?,
        consecutive_failure_count: row.get::<i64>(5).map_err(db_err)?.max(0) as u32,
        min_fetch_interval_secs: row.get::<i64>(6).map_err(db_err)?.max(0) as u64,
        quality_score: row.get::<f64>(7).map_err(db_err)?,
        last_error: row.get::<Option<String>>(8).map_err(db_err)?,
        created_at: parse_ts(&row.get::<String>(9).map_err(db_err)?)?,
        last_attempt_at: parse_opt_ts(row.get::<Option<String>>(10).map_err(db_err)?)?,
    })
}
