//! Hash-data storage: one row per unique root digest (`hashdata`,
//! with the leaf blob) and one per shared file (`hashfiles`).

use rusqlite::{params, Connection, OptionalExtension};

use crate::tth::{self, TthRoot};

/// Row describing a hashed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedFile {
    pub id: i64,
    pub lastmod: i64,
    pub size: u64,
    pub tth: TthRoot,
}

/// Insert a file and, if new, its hash data. Returns the file row id.
pub fn add_hashed(
    conn: &mut Connection,
    path: &str,
    size: u64,
    lastmod: i64,
    root: &TthRoot,
    tthl: &[u8],
) -> rusqlite::Result<i64> {
    let encoded = tth::base32_encode(root);
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT OR IGNORE INTO hashdata (root, size, tthl) VALUES (?1, ?2, ?3)",
        params![encoded, size as i64, tthl],
    )?;
    // a REPLACE covers two share entries resolving to the same real
    // path (e.g. through a symlink)
    tx.execute(
        "INSERT OR REPLACE INTO hashfiles (tth, lastmod, filename) VALUES (?1, ?2, ?3)",
        params![encoded, lastmod, path],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok(id)
}

/// Fetch the hash-tree blob for a root digest.
pub fn get_tthl(conn: &Connection, root: &TthRoot) -> rusqlite::Result<Option<Vec<u8>>> {
    conn.query_row(
        "SELECT tthl FROM hashdata WHERE root = ?1",
        params![tth::base32_encode(root)],
        |row| row.get(0),
    )
    .optional()
}

/// Look a file up by its real path.
pub fn lookup(conn: &Connection, path: &str) -> rusqlite::Result<Option<HashedFile>> {
    conn.query_row(
        "SELECT f.id, f.lastmod, d.size, f.tth
         FROM hashfiles f JOIN hashdata d ON d.root = f.tth
         WHERE f.filename = ?1",
        params![path],
        |row| {
            let encoded: String = row.get(3)?;
            Ok(HashedFile {
                id: row.get(0)?,
                lastmod: row.get(1)?,
                size: row.get::<_, i64>(2)? as u64,
                tth: tth::base32_decode(&encoded).unwrap_or([0; 24]),
            })
        },
    )
    .optional()
}

/// All file row ids in ascending order.
pub fn all_ids(conn: &Connection) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM hashfiles ORDER BY id ASC")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

/// Drop hash data no file references any more.
pub fn purge_unreferenced(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM hashdata
         WHERE NOT EXISTS (SELECT 1 FROM hashfiles WHERE tth = root)",
        [],
    )
}
