/// Schema for the durable tables. Timestamps are RFC 3339 UTC strings with
/// microsecond precision, so lexical order matches time order.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    checksum TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires
    ON cache_entries(expires_at);

CREATE TABLE IF NOT EXISTS sync_items (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT,
    local_modified_at TEXT NOT NULL,
    status TEXT NOT NULL,
    conflict_payload TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at TEXT,
    status_changed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_items_entity
    ON sync_items(entity_type, entity_id);

CREATE INDEX IF NOT EXISTS idx_sync_items_status
    ON sync_items(status, local_modified_at);
"#;
