//! Write-behind queue.
//!
//! Multi-producer, single-consumer: queued statements are batched into
//! one transaction by a background task after a short delay. Readers
//! that must observe queued writes call [`flush`] through
//! `Db::close`; otherwise no ordering with reads is promised, only
//! that queued writes execute in queue order and survive a clean
//! close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::{params_from_iter, Connection, ToSql};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Delay before a queued batch is written out.
const FLUSH_DELAY: Duration = Duration::from_millis(1000);

/// An owned SQL parameter.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(v.as_str().into()),
            SqlValue::Blob(v) => ToSqlOutput::Borrowed(v.as_slice().into()),
        })
    }
}

/// One queued statement.
#[derive(Debug)]
pub struct QueuedWrite {
    pub sql: &'static str,
    pub params: Vec<SqlValue>,
}

pub enum QueueMsg {
    Write(QueuedWrite),
    /// Flush everything queued so far, then acknowledge.
    Flush(oneshot::Sender<()>),
}

/// Spawn the queue consumer task.
pub fn spawn_worker(
    conn: Arc<Mutex<Connection>>,
    mut rx: mpsc::UnboundedReceiver<QueueMsg>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let mut batch = Vec::new();
            let mut acks = Vec::new();
            match msg {
                QueueMsg::Write(w) => batch.push(w),
                QueueMsg::Flush(ack) => acks.push(ack),
            }
            if acks.is_empty() {
                // give producers a moment to add to the batch
                tokio::time::sleep(FLUSH_DELAY).await;
            }
            while let Ok(msg) = rx.try_recv() {
                match msg {
                    QueueMsg::Write(w) => batch.push(w),
                    QueueMsg::Flush(ack) => acks.push(ack),
                }
            }
            if !batch.is_empty() {
                run_batch(&conn, batch);
            }
            for ack in acks {
                let _ = ack.send(());
            }
        }
        debug!("database queue stopped");
    })
}

fn run_batch(conn: &Mutex<Connection>, batch: Vec<QueuedWrite>) {
    let mut conn = conn.lock().unwrap();
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            error!(error = %e, "could not start queue transaction");
            return;
        }
    };
    let count = batch.len();
    for write in batch {
        if let Err(e) = tx.execute(write.sql, params_from_iter(write.params.iter())) {
            error!(error = %e, sql = write.sql, "queued write failed");
        }
    }
    if let Err(e) = tx.commit() {
        error!(error = %e, "queue commit failed");
    } else {
        debug!(count, "flushed queued writes");
    }
}
