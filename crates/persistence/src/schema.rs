//! Database schema definitions

/// SQL to create all tables
/// NOTE: multipliers and targets are stored as TEXT to preserve rust_decimal::Decimal precision,
/// timestamps as unix milliseconds.
pub const CREATE_TABLES: &str = r#"
-- Observed rounds (written by the ingestion side, read by the engine).
-- `id` carries INTEGER affinity but no rowid alias, so legacy text keys survive as text
-- and are filtered out with typeof(id) = 'integer'.
CREATE TABLE IF NOT EXISTS rounds (
    id INTEGER NOT NULL UNIQUE,
    multiplier TEXT NOT NULL,
    observed_at INTEGER NOT NULL
);

-- Signal lifecycle. open_slot is 1 while the signal is active/gale and NULL once resolved,
-- the UNIQUE constraint allows at most one open signal.
CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trigger_round_id INTEGER NOT NULL,
    target TEXT NOT NULL,
    status TEXT NOT NULL,
    gale_depth INTEGER NOT NULL DEFAULT 0,
    open_slot INTEGER UNIQUE CHECK (open_slot IS NULL OR open_slot = 1),
    result_round_id INTEGER,
    result_multiplier TEXT,
    created_at INTEGER NOT NULL,
    resolved_at INTEGER
);

-- One row per local calendar day
CREATE TABLE IF NOT EXISTS daily_stats (
    date TEXT PRIMARY KEY,
    wins INTEGER NOT NULL DEFAULT 0,
    losses INTEGER NOT NULL DEFAULT 0,
    signals_sent INTEGER NOT NULL DEFAULT 0,
    today_wins INTEGER NOT NULL DEFAULT 0,
    today_losses INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Single governance document, updated by compare-and-set on version
CREATE TABLE IF NOT EXISTS engine_state (
    id TEXT PRIMARY KEY,
    document TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_signals_created ON signals(created_at);
CREATE INDEX IF NOT EXISTS idx_signals_resolved ON signals(resolved_at DESC);
CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status)
"#;

/// Additive column migrations, tolerated when the column already exists
/// (notification_ref was added after the first deployments)
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE signals ADD COLUMN notification_ref TEXT",
];
