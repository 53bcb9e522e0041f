//! Client-to-client connections.
//!
//! Direct peer links used for uploads. Sessions live in a process-wide
//! registry keyed by opaque id; the hub back-reference is just a hub
//! id in the registry entry, cleared when the hub session closes, so
//! nothing dangles. Slot admission re-scans the registry on each
//! query, counting every session whose transport still has file bytes
//! to push.

pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client::{HubId, Runtime};

pub use session::{CcAction, CcError, CcSession};

/// Opaque id of a direct connection.
pub type CcId = u64;

/// Seconds a closed session lingers so queued reply frames can drain.
pub const FREE_DELAY_SECS: u64 = 30;

/// Registry view of one session.
#[derive(Clone)]
pub struct CcEntry {
    pub hub: Option<HubId>,
    pub nick_raw: Option<Vec<u8>>,
    pub file_left: Arc<AtomicU64>,
    pub connected: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<CcId, CcEntry>,
    /// Peers we told to dial in, keyed by raw nick.
    expects: HashMap<Vec<u8>, HubId>,
}

/// Process-wide registry of direct connections.
pub struct CcRegistry {
    inner: Mutex<Inner>,
}

impl CcRegistry {
    pub fn new() -> Self {
        CcRegistry {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn insert(&self, id: CcId, entry: CcEntry) {
        self.inner.lock().unwrap().sessions.insert(id, entry);
    }

    pub fn remove(&self, id: CcId) {
        self.inner.lock().unwrap().sessions.remove(&id);
    }

    pub fn get(&self, id: CcId) -> Option<CcEntry> {
        self.inner.lock().unwrap().sessions.get(&id).cloned()
    }

    pub fn update(&self, id: CcId, f: impl FnOnce(&mut CcEntry)) {
        if let Some(entry) = self.inner.lock().unwrap().sessions.get_mut(&id) {
            f(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upload slots in use right now. Every session still streaming
    /// file bytes counts, including transfers that never needed a
    /// slot, so the result may exceed the configured slot count.
    pub fn slots_in_use(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|e| e.file_left.load(Ordering::SeqCst) > 0)
            .count()
    }

    /// Whether another connected session already belongs to this nick
    /// on this hub.
    pub fn has_conn(&self, hub: HubId, nick_raw: &[u8], excluding: CcId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .iter()
            .any(|(id, e)| {
                *id != excluding
                    && e.connected
                    && e.hub == Some(hub)
                    && e.nick_raw.as_deref() == Some(nick_raw)
            })
    }

    /// Remember that `nick_raw` was asked to dial in for `hub`.
    pub fn expect(&self, nick_raw: Vec<u8>, hub: HubId) {
        self.inner.lock().unwrap().expects.insert(nick_raw, hub);
    }

    pub fn take_expect(&self, nick_raw: &[u8]) -> Option<HubId> {
        self.inner.lock().unwrap().expects.remove(nick_raw)
    }

    /// A hub session went away: null every back-reference to it. Open
    /// connections stay up; the hub link only matters during the
    /// handshake.
    pub fn remove_hub(&self, hub: HubId) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.sessions.values_mut() {
            if entry.hub == Some(hub) {
                entry.hub = None;
            }
        }
        inner.expects.retain(|_, h| *h != hub);
    }
}

impl Default for CcRegistry {
    fn default() -> Self {
        CcRegistry::new()
    }
}

/// Dial out to a peer after a `$ConnectToMe`.
pub fn connect_out(rt: Arc<Runtime>, hub: HubId, addr: &str) {
    let (session, net_rx) = CcSession::new(rt, Some(hub));
    tokio::spawn(session.run(net_rx, Some(addr.to_string())));
}

/// Accept incoming peer connections on the configured port.
pub fn listen(rt: Arc<Runtime>, port: u16) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, port, "could not open peer listen port");
                return;
            }
        };
        info!(port, "listening for peer connections");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "incoming peer connection");
                    let (mut session, net_rx) = CcSession::new(rt.clone(), None);
                    session.attach(stream);
                    tokio::spawn(session.run(net_rx, None));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hub: Option<HubId>, nick: Option<&[u8]>, left: u64, connected: bool) -> CcEntry {
        CcEntry {
            hub,
            nick_raw: nick.map(|n| n.to_vec()),
            file_left: Arc::new(AtomicU64::new(left)),
            connected,
        }
    }

    #[test]
    fn test_slots_in_use_counts_streaming() {
        let reg = CcRegistry::new();
        reg.insert(1, entry(None, None, 0, true));
        reg.insert(2, entry(None, None, 100, true));
        reg.insert(3, entry(None, None, 5, true));
        assert_eq!(reg.slots_in_use(), 2);
        // finishing a stream frees the slot without touching the registry
        reg.get(2).unwrap().file_left.store(0, Ordering::SeqCst);
        assert_eq!(reg.slots_in_use(), 1);
    }

    #[test]
    fn test_has_conn_dup_check() {
        let reg = CcRegistry::new();
        reg.insert(1, entry(Some(7), Some(b"alice"), 0, true));
        assert!(reg.has_conn(7, b"alice", 2));
        // the session itself is excluded
        assert!(!reg.has_conn(7, b"alice", 1));
        // other hub or disconnected session does not count
        assert!(!reg.has_conn(8, b"alice", 2));
        reg.update(1, |e| e.connected = false);
        assert!(!reg.has_conn(7, b"alice", 2));
    }

    #[test]
    fn test_remove_hub_clears_references() {
        let reg = CcRegistry::new();
        reg.insert(1, entry(Some(7), Some(b"alice"), 0, true));
        reg.expect(b"bob".to_vec(), 7);
        reg.remove_hub(7);
        assert_eq!(reg.get(1).unwrap().hub, None);
        assert!(reg.take_expect(b"bob").is_none());
    }

    #[test]
    fn test_expect_is_one_shot() {
        let reg = CcRegistry::new();
        reg.expect(b"alice".to_vec(), 3);
        assert_eq!(reg.take_expect(b"alice"), Some(3));
        assert_eq!(reg.take_expect(b"alice"), None);
    }
}
