use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rooms (
            id              TEXT PRIMARY KEY,
            encryption_salt BLOB,
            theme           TEXT NOT NULL DEFAULT 'default',
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS room_participants (
            room_id     TEXT NOT NULL REFERENCES rooms(id),
            user_id     TEXT NOT NULL,
            PRIMARY KEY (room_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON room_participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id                TEXT PRIMARY KEY,
            room_id           TEXT NOT NULL REFERENCES rooms(id),
            seq               INTEGER NOT NULL,
            sender_id         TEXT NOT NULL,
            client_message_id TEXT NOT NULL,
            body              BLOB NOT NULL,
            nonce             BLOB,
            sent_at           TEXT NOT NULL,
            is_pinned         INTEGER NOT NULL DEFAULT 0,
            pinned_at         TEXT,
            pinned_by         TEXT,
            UNIQUE (room_id, seq),
            UNIQUE (room_id, sender_id, client_message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room_seq
            ON messages(room_id, seq);

        CREATE TABLE IF NOT EXISTS delivery_state (
            message_id   TEXT NOT NULL REFERENCES messages(id),
            user_id      TEXT NOT NULL,
            delivered_at TEXT,
            read_at      TEXT,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_delivery_user
            ON delivery_state(user_id, read_at);

        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL,
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE (message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
