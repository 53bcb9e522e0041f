//! SQLite persistence.
//!
//! Hash data for the local share, the download queue tables, and a
//! write-behind queue for deletes. After a clean [`Db::close`] every
//! queued write is on disk.

pub mod dl;
pub mod hash;
pub mod queue;
pub mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::tth::{self, TthRoot};

pub use dl::{DlEntry, DlUser};
pub use hash::HashedFile;
pub use queue::{QueueMsg, QueuedWrite, SqlValue};

/// Handle to the client database. Cheap to clone; all clones share
/// one connection and one write queue.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    queue_tx: mpsc::UnboundedSender<QueueMsg>,
}

impl Db {
    /// Open (or create) the database file and start the queue worker.
    /// Must be called from within the async runtime.
    pub fn open(path: &Path) -> rusqlite::Result<Db> {
        let conn = Connection::open(path)?;
        Db::start(conn)
    }

    /// In-memory database for tests.
    pub fn open_memory() -> rusqlite::Result<Db> {
        Db::start(Connection::open_in_memory()?)
    }

    fn start(conn: Connection) -> rusqlite::Result<Db> {
        conn.busy_timeout(Duration::from_millis(10))?;
        conn.pragma_update(None, "foreign_keys", false)?;
        schema::create_all_tables(&conn)?;
        let conn = Arc::new(Mutex::new(conn));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        queue::spawn_worker(conn.clone(), queue_rx);
        Ok(Db { conn, queue_tx })
    }

    fn push(&self, sql: &'static str, params: Vec<SqlValue>) {
        if self
            .queue_tx
            .send(QueueMsg::Write(QueuedWrite { sql, params }))
            .is_err()
        {
            warn!(sql, "database queue is gone, dropping write");
        }
    }

    /// Flush the write queue and wait for it to hit the disk.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.queue_tx.send(QueueMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    // -----------------------------------------------------------------
    // Hash data

    /// Record a hashed file with its hash-tree blob.
    pub fn hash_insert(
        &self,
        path: &str,
        size: u64,
        lastmod: i64,
        root: &TthRoot,
        tthl: &[u8],
    ) -> rusqlite::Result<i64> {
        hash::add_hashed(&mut self.conn.lock().unwrap(), path, size, lastmod, root, tthl)
    }

    pub fn hash_tthl(&self, root: &TthRoot) -> rusqlite::Result<Option<Vec<u8>>> {
        hash::get_tthl(&self.conn.lock().unwrap(), root)
    }

    pub fn hash_lookup(&self, path: &str) -> rusqlite::Result<Option<HashedFile>> {
        hash::lookup(&self.conn.lock().unwrap(), path)
    }

    /// Queue removal of file rows.
    pub fn hash_rm_many(&self, ids: &[i64]) {
        for &id in ids {
            self.push(
                "DELETE FROM hashfiles WHERE id = ?1",
                vec![SqlValue::Int(id)],
            );
        }
    }

    pub fn hash_ids(&self) -> rusqlite::Result<Vec<i64>> {
        hash::all_ids(&self.conn.lock().unwrap())
    }

    pub fn hash_purge_unreferenced(&self) -> rusqlite::Result<usize> {
        hash::purge_unreferenced(&self.conn.lock().unwrap())
    }

    // -----------------------------------------------------------------
    // Download queue

    pub fn dl_list(&self) -> rusqlite::Result<Vec<DlEntry>> {
        dl::list(&self.conn.lock().unwrap())
    }

    pub fn dl_users(&self) -> rusqlite::Result<Vec<DlUser>> {
        dl::users(&self.conn.lock().unwrap())
    }

    /// Queue removal of a download and its sources.
    pub fn dl_rm(&self, root: &TthRoot) {
        let encoded = tth::base32_encode(root);
        self.push(
            "DELETE FROM dl_users WHERE tth = ?1",
            vec![SqlValue::Text(encoded.clone())],
        );
        self.push(
            "DELETE FROM dl WHERE tth = ?1",
            vec![SqlValue::Text(encoded)],
        );
    }

    pub fn vacuum(&self) -> rusqlite::Result<()> {
        self.conn.lock().unwrap().execute_batch("VACUUM")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(seed: u8) -> TthRoot {
        [seed; 24]
    }

    #[tokio::test]
    async fn test_hash_roundtrip() {
        let db = Db::open_memory().unwrap();
        let blob = vec![7u8; 48];
        let id = db
            .hash_insert("/real/file.bin", 1234, 99, &root(1), &blob)
            .unwrap();
        assert!(id > 0);

        assert_eq!(db.hash_tthl(&root(1)).unwrap(), Some(blob));
        assert_eq!(db.hash_tthl(&root(2)).unwrap(), None);

        let file = db.hash_lookup("/real/file.bin").unwrap().unwrap();
        assert_eq!(file.id, id);
        assert_eq!(file.size, 1234);
        assert_eq!(file.lastmod, 99);
        assert_eq!(file.tth, root(1));
        assert!(db.hash_lookup("/other").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hash_replace_same_path() {
        let db = Db::open_memory().unwrap();
        db.hash_insert("/f", 10, 1, &root(1), &[0; 24]).unwrap();
        db.hash_insert("/f", 20, 2, &root(2), &[1; 24]).unwrap();
        let ids = db.hash_ids().unwrap();
        assert_eq!(ids.len(), 1);
        let file = db.hash_lookup("/f").unwrap().unwrap();
        assert_eq!(file.tth, root(2));
    }

    #[tokio::test]
    async fn test_queued_removal_visible_after_close() {
        let db = Db::open_memory().unwrap();
        let id = db.hash_insert("/f", 10, 1, &root(1), &[0; 24]).unwrap();
        db.hash_rm_many(&[id]);
        // the write is queued, not necessarily applied yet; close
        // guarantees it lands
        db.close().await;
        assert!(db.hash_ids().unwrap().is_empty());
        // the data row is now orphaned and purgeable
        assert_eq!(db.hash_purge_unreferenced().unwrap(), 1);
        assert_eq!(db.hash_tthl(&root(1)).unwrap(), None);
    }

    #[tokio::test]
    async fn test_dl_tables() {
        let db = Db::open_memory().unwrap();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO dl (tth, size, dest, priority, error, error_msg, tthl)
                 VALUES (?1, 100, '/dest', 2, 0, NULL, ?2)",
                rusqlite::params![tth::base32_encode(&root(5)), vec![0u8; 24]],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO dl_users (tth, uid, error, error_msg) VALUES (?1, 42, 1, 'slow')",
                rusqlite::params![tth::base32_encode(&root(5))],
            )
            .unwrap();
        }
        let dls = db.dl_list().unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].tth, root(5));
        assert_eq!(dls[0].dest, "/dest");
        assert_eq!(dls[0].priority, 2);
        assert_eq!(dls[0].tthl_len, 24);

        let users = db.dl_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].uid, 42);
        assert_eq!(users[0].error_msg.as_deref(), Some("slow"));

        db.dl_rm(&root(5));
        db.close().await;
        assert!(db.dl_list().unwrap().is_empty());
        assert!(db.dl_users().unwrap().is_empty());
        db.vacuum().unwrap();
    }
}
