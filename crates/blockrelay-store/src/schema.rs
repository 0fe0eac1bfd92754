/// SQL DDL for the blockrelay database.
/// WAL mode enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS chat_turns (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    query_id TEXT NOT NULL,
    actor TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_models (
    session_id TEXT PRIMARY KEY,
    model TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cancel_flags (
    session_id TEXT PRIMARY KEY,
    cause TEXT,
    set_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS streams (
    stream_id TEXT PRIMARY KEY,
    first_offset INTEGER NOT NULL DEFAULT 1,
    last_offset INTEGER NOT NULL,
    expires_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stream_entries (
    stream_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    payload TEXT NOT NULL,
    arrived_at TEXT NOT NULL,
    PRIMARY KEY (stream_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_turns_session ON chat_turns(session_id);
CREATE INDEX IF NOT EXISTS idx_turns_query ON chat_turns(session_id, query_id);
CREATE INDEX IF NOT EXISTS idx_streams_expiry ON streams(expires_at_ms);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
