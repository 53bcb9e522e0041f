//! Download queue storage (read side; the queue scheduler itself is a
//! separate component).

use rusqlite::{Connection, Row};

use crate::tth::{self, TthRoot};

/// One queued download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlEntry {
    pub tth: TthRoot,
    pub size: u64,
    pub dest: String,
    pub priority: i8,
    pub error: i8,
    pub error_msg: Option<String>,
    /// Length of the stored hash-tree blob, 0 when absent.
    pub tthl_len: usize,
}

/// A known source for a queued download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlUser {
    pub tth: TthRoot,
    pub uid: u64,
    pub error: i8,
    pub error_msg: Option<String>,
}

fn row_tth(row: &Row, idx: usize) -> rusqlite::Result<TthRoot> {
    let encoded: String = row.get(idx)?;
    Ok(tth::base32_decode(&encoded).unwrap_or([0; 24]))
}

/// Everything in the `dl` table, in no particular order.
pub fn list(conn: &Connection) -> rusqlite::Result<Vec<DlEntry>> {
    let mut stmt = conn.prepare(
        "SELECT tth, size, dest, priority, error, error_msg, length(tthl) FROM dl",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(DlEntry {
            tth: row_tth(row, 0)?,
            size: row.get::<_, i64>(1)? as u64,
            dest: row.get(2)?,
            priority: row.get(3)?,
            error: row.get(4)?,
            error_msg: row.get(5)?,
            tthl_len: row.get::<_, Option<i64>>(6)?.unwrap_or(0) as usize,
        })
    })?;
    rows.collect()
}

/// Everything in the `dl_users` table.
pub fn users(conn: &Connection) -> rusqlite::Result<Vec<DlUser>> {
    let mut stmt = conn.prepare("SELECT tth, uid, error, error_msg FROM dl_users")?;
    let rows = stmt.query_map([], |row| {
        Ok(DlUser {
            tth: row_tth(row, 0)?,
            uid: row.get::<_, i64>(1)? as u64,
            error: row.get(2)?,
            error_msg: row.get(3)?,
        })
    })?;
    rows.collect()
}
