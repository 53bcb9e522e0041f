//! SQLite schema.

use rusqlite::Connection;

/// Create all tables if they do not exist yet.
pub fn create_all_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS hashdata (
            root TEXT NOT NULL PRIMARY KEY,
            size INTEGER NOT NULL,
            tthl BLOB
        );
        CREATE TABLE IF NOT EXISTS hashfiles (
            id INTEGER PRIMARY KEY,
            tth TEXT NOT NULL,
            lastmod INTEGER NOT NULL,
            filename TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS dl (
            tth TEXT NOT NULL PRIMARY KEY,
            size INTEGER NOT NULL,
            dest TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            error INTEGER NOT NULL DEFAULT 0,
            error_msg TEXT,
            tthl BLOB
        );
        CREATE TABLE IF NOT EXISTS dl_users (
            tth TEXT NOT NULL,
            uid INTEGER NOT NULL,
            error INTEGER NOT NULL DEFAULT 0,
            error_msg TEXT
        );",
    )
}
