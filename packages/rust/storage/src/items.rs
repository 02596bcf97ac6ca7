//! Discovered item operations. Items are deduplicated by guid.

use chrono::Utc;
use feedforge_shared::{DiscoveredItem, FeedforgeError, Result};
use libsql::{Row, params};

use crate::sources::count_row;
use crate::{Storage, db_err, parse_opt_ts, ts};

impl Storage {
    /// Insert an item unless its guid is already known.
    /// Returns `true` when the item was new.
    pub async fn insert_item(&self, item: &DiscoveredItem) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "INSERT INTO items (guid, source_id, title, link, raw_content, published_at,
                     artifact_hash, discovered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(guid) DO NOTHING",
                params![
                    item.guid.as_str(),
                    item.source_id.to_string(),
                    item.title.as_str(),
                    item.link.as_str(),
                    item.raw_content.as_str(),
                    item.published_at.as_ref().map(ts),
                    item.artifact_hash.as_deref(),
                    ts(&Utc::now())
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Forget items by guid so a later fetch discovers them again.
    /// Returns how many rows were removed.
    pub async fn delete_items(&self, guids: &[String]) -> Result<u64> {
        self.check_writable()?;
        if guids.is_empty() {
            return Ok(0);
        }
        let conn = self.tx_connection().await?;
        let tx = conn.transaction().await.map_err(db_err)?;
        let mut removed = 0;
        for guid in guids {
            removed += tx
                .execute("DELETE FROM items WHERE guid = ?1", params![guid.as_str()])
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(removed)
    }

    /// Get an item by guid.
    pub async fn get_item(&self, guid: &str) -> Result<Option<DiscoveredItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT guid, source_id, title, link, raw_content, published_at, artifact_hash
                 FROM items WHERE guid = ?1",
                params![guid],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_item(&row)?)),
            None => Ok(None),
        }
    }

    /// Link a processed item to the artifact generated for it.
    pub async fn set_item_artifact(&self, guid: &str, content_hash: &str) -> Result<()> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE items SET artifact_hash = ?2 WHERE guid = ?1",
                params![guid, content_hash],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Err(FeedforgeError::NotFound(format!("item {guid}")));
        }
        Ok(())
    }

    /// Total number of known items.
    pub async fn count_items(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM items", params![])
            .await
            .map_err(db_err)?;
        count_row(&mut rows).await
    }
}

fn row_to_item(row: &Row) -> Result<DiscoveredItem> {
    let raw_source = row.get::<String>(1).map_err(db_err)?;
    Ok(DiscoveredItem {
        guid: row.get::<String>(0).map_err(db_err)?,
        source_id: raw_source
            .parse()
            .map_err(|e| FeedforgeError::Storage(format!("bad source id '{raw_source}': {e}")))?,
        title: row.get::<String>(2).map_err(db_err)?,
        link: row.get::<String>(3).map_err(db_err)?,
        raw_content: row.get::<String>(4).map_err(db_err)?,
        published_at: parse_opt_ts(row.get::<Option<String>>(5).map_err(db_err)?)?,
        artifact_hash: row.get::<Option<String>>(6).map_err(db_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_storage;
    use feedforge_shared::NewSource;

    #[tokio::test]
    async fn duplicate_guid_is_ignored() {
        let storage = test_storage().await;
        let source = storage
            .insert_source(&NewSource {
                url: "https://example.com/feed.xml".into(),
                name: "Example".into(),
                min_fetch_interval_secs: 60,
                quality_score: 0.5,
            })
            .await
            .expect("insert source");

        let item = DiscoveredItem {
            guid: "urn:item:a".into(),
            source_id: source.id.clone(),
            title: "First".into(),
            link: "https://example.com/a".into(),
            raw_content: "alpha".into(),
            published_at: Some(Utc::now()),
            artifact_hash: None,
        };
        assert!(storage.insert_item(&item).await.expect("insert"));

        let mut again = item.clone();
        again.title = "Changed".into();
        assert!(!storage.insert_item(&again).await.expect("insert dup"));

        let stored = storage.get_item("urn:item:a").await.unwrap().unwrap();
        assert_eq!(stored.title, "First");
        assert_eq!(storage.count_items().await.unwrap(), 1);

        storage.set_item_artifact("urn:item:a", "abc").await.unwrap();
        let linked = storage.get_item("urn:item:a").await.unwrap().unwrap();
        assert_eq!(linked.artifact_hash.as_deref(), Some("abc"));

        let removed = storage
            .delete_items(&["urn:item:a".to_string(), "urn:item:missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(storage.insert_item(&item).await.expect("rediscovered"));
    }
}
