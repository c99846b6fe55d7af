use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id               TEXT PRIMARY KEY,
            phone_number     TEXT NOT NULL UNIQUE,
            identity_key     TEXT,
            registration_id  INTEGER,
            created_at       TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- One-time prekeys. consumed transitions 0 -> 1 exactly once and
        -- never reverses; a consumed key is never handed out again.
        CREATE TABLE IF NOT EXISTS prekeys (
            user_id     TEXT NOT NULL REFERENCES users(id),
            key_id      INTEGER NOT NULL,
            public_key  TEXT NOT NULL,
            signature   TEXT NOT NULL,
            consumed    INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, key_id)
        );

        CREATE INDEX IF NOT EXISTS idx_prekeys_unconsumed
            ON prekeys(user_id, consumed, key_id);

        -- Pairwise chats. user_a/user_b are stored in normalized order so a
        -- pair maps to exactly one chat. last_seq is the per-chat sequence
        -- counter; the sequencer is its only writer.
        CREATE TABLE IF NOT EXISTS chats (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL DEFAULT 'private',
            user_a      TEXT NOT NULL REFERENCES users(id),
            user_b      TEXT NOT NULL REFERENCES users(id),
            last_seq    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (user_a, user_b)
        );

        -- Undelivered ciphertext envelopes. Rows are deleted on delivery
        -- ack and never mutated otherwise.
        CREATE TABLE IF NOT EXISTS envelopes (
            chat_id       TEXT NOT NULL REFERENCES chats(id),
            id            INTEGER NOT NULL,
            sender_id     TEXT NOT NULL REFERENCES users(id),
            recipient_id  TEXT NOT NULL REFERENCES users(id),
            ciphertext    BLOB NOT NULL,
            created_at    TEXT NOT NULL,
            PRIMARY KEY (chat_id, id)
        );

        CREATE INDEX IF NOT EXISTS idx_envelopes_recipient
            ON envelopes(recipient_id, chat_id, id);

        -- Delivery receipts outlive the envelope (which is purged on ack).
        -- status is forward-only: 0 SENT, 1 DELIVERED, 2 READ.
        CREATE TABLE IF NOT EXISTS receipts (
            chat_id       TEXT NOT NULL,
            envelope_id   INTEGER NOT NULL,
            recipient_id  TEXT NOT NULL,
            status        INTEGER NOT NULL DEFAULT 0,
            updated_at    TEXT NOT NULL,
            PRIMARY KEY (chat_id, envelope_id, recipient_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
