use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (rooms, messages, delivery status)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                username      TEXT NOT NULL UNIQUE,
                display_name  TEXT,
                created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE stickers (
                id      TEXT PRIMARY KEY,
                name    TEXT NOT NULL,
                image   TEXT NOT NULL
            );

            CREATE TABLE rooms (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                room_type   TEXT NOT NULL DEFAULT 'open',
                state       TEXT NOT NULL DEFAULT 'active',
                capacity    INTEGER,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE room_members (
                room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL,
                role        TEXT NOT NULL DEFAULT 'member',
                joined_at   TEXT NOT NULL,
                PRIMARY KEY (room_id, user_id)
            );

            CREATE TABLE room_restrictions (
                room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL,
                kind        TEXT NOT NULL,
                expires_at  TEXT,
                PRIMARY KEY (room_id, user_id, kind)
            );

            CREATE TABLE messages (
                id          TEXT PRIMARY KEY,
                room_id     TEXT NOT NULL,
                user_id     TEXT NOT NULL,
                body        TEXT NOT NULL,
                mentions    TEXT NOT NULL DEFAULT '[]',
                unsent      INTEGER NOT NULL DEFAULT 0,
                timestamp   TEXT NOT NULL
            );

            CREATE INDEX idx_messages_room ON messages(room_id, timestamp);

            CREATE TABLE reactions (
                message_id  TEXT NOT NULL,
                user_id     TEXT NOT NULL,
                room_id     TEXT NOT NULL,
                emoji       TEXT NOT NULL,
                timestamp   TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE TABLE read_receipts (
                message_id  TEXT NOT NULL,
                user_id     TEXT NOT NULL,
                room_id     TEXT NOT NULL,
                timestamp   TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE TABLE delivery_status (
                message_id      TEXT PRIMARY KEY,
                room_id         TEXT NOT NULL,
                broadcast_at    TEXT NOT NULL,
                saved_to_store  INTEGER NOT NULL DEFAULT 0,
                saved_to_cache  INTEGER NOT NULL DEFAULT 0,
                notified        INTEGER NOT NULL DEFAULT 0,
                status          TEXT NOT NULL DEFAULT 'pending',
                retry_count     INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT,
                payload         TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX idx_delivery_status_scan ON delivery_status(status, broadcast_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (reaction tombstones)");
        conn.execute_batch(
            "
            ALTER TABLE reactions ADD COLUMN removed INTEGER NOT NULL DEFAULT 0;

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_rerunnable() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }
}
