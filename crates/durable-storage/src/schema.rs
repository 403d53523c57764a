//! Embedded schema for the default SQLite backend.
//!
//! Indices here exist to support the §4.4 selection query directly:
//! sort order, future-pending, future-sleep, future-throttled,
//! future-timed-out, step sleep, step wait-for, and event-key ascending.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id         INTEGER REFERENCES tasks(id),
    queue             TEXT NOT NULL,
    job               TEXT NOT NULL,
    key               TEXT NOT NULL,
    input             TEXT NOT NULL,
    priority          INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL,
    loop_count        INTEGER NOT NULL DEFAULT 0,
    timeout_at        REAL,
    sleep_until       REAL,
    started_at        REAL,
    created_at        REAL NOT NULL,
    updated_at        REAL NOT NULL,
    data              TEXT,
    debounce_id       TEXT,
    throttle_id       TEXT,
    throttle_duration REAL,
    rate_limit_id     TEXT,
    UNIQUE (queue, job, key)
);

CREATE INDEX IF NOT EXISTS idx_tasks_sort ON tasks (priority DESC, created_at ASC);
CREATE INDEX IF NOT EXISTS idx_tasks_status_queue ON tasks (queue, status);
CREATE INDEX IF NOT EXISTS idx_tasks_timeout ON tasks (timeout_at) WHERE timeout_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_tasks_sleep ON tasks (sleep_until) WHERE sleep_until IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_tasks_throttle ON tasks (throttle_id) WHERE throttle_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_tasks_debounce ON tasks (debounce_id) WHERE debounce_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_tasks_rate_limit ON tasks (rate_limit_id, created_at) WHERE rate_limit_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS steps (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id        INTEGER NOT NULL REFERENCES tasks(id),
    step           TEXT NOT NULL,
    status         TEXT NOT NULL,
    next_status    TEXT,
    runs           INTEGER NOT NULL DEFAULT 0,
    sleep_until    REAL,
    timeout_at     REAL,
    wait_for       TEXT,
    wait_filter    TEXT,
    wait_from      REAL,
    data           TEXT,
    discovered_on  INTEGER NOT NULL DEFAULT 0,
    created_at     REAL NOT NULL,
    updated_at     REAL NOT NULL,
    UNIQUE (task_id, step)
);

CREATE INDEX IF NOT EXISTS idx_steps_task ON steps (task_id);
CREATE INDEX IF NOT EXISTS idx_steps_sleep ON steps (sleep_until) WHERE sleep_until IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_steps_wait_for ON steps (wait_for) WHERE wait_for IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_steps_timeout ON steps (timeout_at) WHERE timeout_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    queue       TEXT NOT NULL,
    key         TEXT NOT NULL,
    created_at  REAL NOT NULL,
    input       TEXT NOT NULL,
    data        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_key ON events (queue, key, created_at ASC);
"#;

/// Pragmas applied to every connection in the pool: WAL for concurrent
/// readers alongside the single writer, a busy timeout so lock
/// contention waits instead of failing immediately, and
/// `synchronous=NORMAL` (safe under WAL, much cheaper than FULL).
pub const STARTUP_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA busy_timeout = 5000",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA foreign_keys = ON",
];
