//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `users`, `favorites`, `messages`, `calls`
//! and `auth_tokens`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id                TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    display_name      TEXT NOT NULL,
    email             TEXT NOT NULL UNIQUE,
    role              TEXT NOT NULL,               -- 'user' | 'admin'
    verified          INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    profile_image_url TEXT,
    is_online         INTEGER NOT NULL DEFAULT 0,  -- durable presence flag
    created_at        TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Favorites (set semantics: membership only, no payload)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS favorites (
    user_id     TEXT NOT NULL,                    -- FK -> users(id)
    favorite_id TEXT NOT NULL,                    -- FK -> users(id)

    PRIMARY KEY (user_id, favorite_id),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (favorite_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,        -- UUID v4
    sender_id   TEXT NOT NULL,                    -- FK -> users(id)
    receiver_id TEXT NOT NULL,                    -- FK -> users(id)
    content     TEXT NOT NULL,                    -- text or attachment URL
    kind        TEXT NOT NULL,                    -- text|image|audio|document
    file_name   TEXT,
    file_size   INTEGER,
    file_type   TEXT,
    created_at  TEXT NOT NULL,                    -- server-assigned
    is_read     INTEGER NOT NULL DEFAULT 0,       -- boolean 0/1

    FOREIGN KEY (sender_id) REFERENCES users(id),
    FOREIGN KEY (receiver_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_pair_ts
    ON messages(sender_id, receiver_id, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(receiver_id, is_read);

-- ----------------------------------------------------------------
-- Calls (retained as history, never deleted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS calls (
    id            TEXT PRIMARY KEY NOT NULL,      -- UUID v4
    caller_id     TEXT NOT NULL,                  -- FK -> users(id)
    receiver_id   TEXT NOT NULL,                  -- FK -> users(id)
    offer         TEXT NOT NULL,                  -- opaque SDP blob
    status        TEXT NOT NULL,                  -- pending|accepted|rejected|ended|missed
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    started_at    TEXT,
    ended_at      TEXT,
    duration_secs INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (caller_id) REFERENCES users(id),
    FOREIGN KEY (receiver_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_calls_pair_ts
    ON calls(caller_id, receiver_id, created_at DESC);

-- ----------------------------------------------------------------
-- Bearer tokens (issued by the external identity system)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS auth_tokens (
    token      TEXT PRIMARY KEY NOT NULL,
    user_id    TEXT NOT NULL,                     -- FK -> users(id)
    created_at TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
