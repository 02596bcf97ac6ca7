//! SQL migration definitions for the feedforge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: sources, items, jobs, dead_letters, artifacts, consumer_refs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Feed sources
CREATE TABLE IF NOT EXISTS sources (
    id                        TEXT PRIMARY KEY,
    url                       TEXT NOT NULL UNIQUE,
    name                      TEXT NOT NULL,
    active                    INTEGER NOT NULL DEFAULT 1,
    last_fetched_at           TEXT,
    consecutive_failure_count INTEGER NOT NULL DEFAULT 0,
    min_fetch_interval_secs   INTEGER NOT NULL,
    quality_score             REAL NOT NULL DEFAULT 0.5,
    last_error                TEXT,
    created_at                TEXT NOT NULL
);

-- Discovered feed items, identity is the guid
CREATE TABLE IF NOT EXISTS items (
    guid          TEXT PRIMARY KEY,
    source_id     TEXT NOT NULL REFERENCES sources(id),
    title         TEXT NOT NULL,
    link          TEXT NOT NULL,
    raw_content   TEXT NOT NULL,
    published_at  TEXT,
    artifact_hash TEXT,
    discovered_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_source_id ON items(source_id);

-- Queue jobs; a non-null lease hides the job until it expires
CREATE TABLE IF NOT EXISTS jobs (
    id               TEXT PRIMARY KEY,
    kind             TEXT NOT NULL,
    payload          TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    attempts         INTEGER NOT NULL DEFAULT 0,
    max_attempts     INTEGER NOT NULL,
    available_at     TEXT NOT NULL,
    lease_expires_at TEXT,
    last_error       TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_available ON jobs(available_at);

-- Jobs that exhausted their attempts or failed fatally
CREATE TABLE IF NOT EXISTS dead_letters (
    job_id   TEXT PRIMARY KEY,
    job_json TEXT NOT NULL,
    error    TEXT NOT NULL,
    dead_at  TEXT NOT NULL
);

-- Content-addressed artifacts
CREATE TABLE IF NOT EXISTS artifacts (
    content_hash    TEXT PRIMARY KEY,
    storage_locator TEXT NOT NULL,
    reference_count INTEGER NOT NULL DEFAULT 0 CHECK (reference_count >= 0),
    size_bytes      INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    orphaned_since  TEXT,
    metadata_json   TEXT
);

CREATE INDEX IF NOT EXISTS idx_artifacts_orphans ON artifacts(reference_count, orphaned_since);

-- Per-consumer copy-on-write references
CREATE TABLE IF NOT EXISTS consumer_refs (
    owner_id     TEXT NOT NULL,
    subject_id   TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    current_hash TEXT NOT NULL,
    is_modified  INTEGER NOT NULL DEFAULT 0,
    locator      TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (owner_id, subject_id)
);

CREATE INDEX IF NOT EXISTS idx_consumer_refs_hash ON consumer_refs(content_hash);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Track fetch attempts so failed fetches honour the interval",
            sql: r#"
ALTER TABLE sources ADD COLUMN last_attempt_at TEXT;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
