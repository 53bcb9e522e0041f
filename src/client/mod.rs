//! Client runtime: configuration, session registries, the shared file
//! tree and the event sink.
//!
//! The [`Runtime`] value is passed (inside an `Arc`) to every session
//! task; registries are keyed by opaque ids and cross-references only
//! ever store ids, so a closed hub simply stops resolving.

pub mod config;
pub mod error;
pub mod events;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cc;
use crate::data::Db;
use crate::hub::user::Roster;
use crate::hub::{HubCtl, HubSession};
use crate::share::{self, FileTree};

pub use config::{Config, HubConfig, TlsPolicy};
pub use error::ClientError;
pub use events::{Priority, UiEvent};

/// Opaque id of an open hub session.
pub type HubId = u64;

/// Hub state readable outside the session task.
#[derive(Debug, Default)]
pub struct HubShared {
    pub nick: String,
    pub nick_raw: Vec<u8>,
    pub nick_valid: bool,
    pub is_reg: bool,
    pub is_op: bool,
    pub encoding: String,
    pub hub_name: Option<String>,
}

/// Handle to a hub session held in the registry.
#[derive(Clone)]
pub struct HubHandle {
    pub id: HubId,
    /// Config key, doubles as the UI tab name.
    pub name: String,
    pub roster: Arc<RwLock<Roster>>,
    pub shared: Arc<RwLock<HubShared>>,
    pub grants: Arc<RwLock<std::collections::HashSet<Vec<u8>>>>,
    pub ctl: mpsc::UnboundedSender<HubCtl>,
}

/// Process-wide state shared by all sessions.
pub struct Runtime {
    pub config: RwLock<Config>,
    pub db: Option<Db>,
    pub share: RwLock<FileTree>,
    /// Our own serialized file list, served as `files.xml.bz2`.
    pub list_path: PathBuf,
    pub hubs: RwLock<HashMap<HubId, HubHandle>>,
    pub ccs: cc::CcRegistry,
    events: mpsc::UnboundedSender<UiEvent>,
    next_id: AtomicU64,
}

impl Runtime {
    pub fn new(
        config: Config,
        db: Option<Db>,
        events: mpsc::UnboundedSender<UiEvent>,
    ) -> Arc<Runtime> {
        let list_path = config.state_dir.join("files.xml.bz2");
        Arc::new(Runtime {
            config: RwLock::new(config),
            db,
            share: RwLock::new(FileTree::new()),
            list_path,
            hubs: RwLock::new(HashMap::new()),
            ccs: cc::CcRegistry::new(),
            events,
            next_id: AtomicU64::new(1),
        })
    }

    /// Runtime without a database, wired to a fresh event channel.
    pub fn for_testing(config: Config) -> (Arc<Runtime>, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Runtime::new(config, None, tx), rx)
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn notice(&self, hub: Option<&str>, priority: Priority, text: impl Into<String>) {
        let _ = self.events.send(UiEvent::Notice {
            hub: hub.map(str::to_string),
            priority,
            text: text.into(),
        });
    }

    pub fn chat(&self, hub: &str, from: &str, text: impl Into<String>, private: bool) {
        let _ = self.events.send(UiEvent::Chat {
            hub: hub.to_string(),
            from: from.to_string(),
            text: text.into(),
            private,
        });
    }

    pub fn hub_handle(&self, id: HubId) -> Option<HubHandle> {
        self.hubs.read().unwrap().get(&id).cloned()
    }

    /// Total size of the local share.
    pub fn share_size(&self) -> u64 {
        let share = self.share.read().unwrap();
        share.node(share.root()).size
    }

    pub fn slots(&self) -> u32 {
        self.config.read().unwrap().slots
    }

    /// Advertised direct address, when running in active mode.
    pub fn listen_addr(&self) -> Option<(String, u16)> {
        let config = self.config.read().unwrap();
        match (&config.active_ip, config.active_port) {
            (Some(ip), port) if port > 0 => Some((ip.clone(), port)),
            _ => None,
        }
    }

    /// Count open hub sessions as operator / registered / normal for
    /// the self-advertisement. The session `building`, when not yet
    /// validated, is counted as one extra normal hub.
    pub fn hub_counts(&self, building: HubId) -> (u32, u32, u32) {
        let mut normal = 0;
        let mut registered = 0;
        let mut op = 0;
        let mut building_valid = false;
        for (id, handle) in self.hubs.read().unwrap().iter() {
            let shared = handle.shared.read().unwrap();
            if shared.is_op {
                op += 1;
            } else if shared.is_reg {
                registered += 1;
            } else if shared.nick_valid {
                normal += 1;
            }
            if *id == building && shared.nick_valid {
                building_valid = true;
            }
        }
        if !building_valid {
            normal += 1;
        }
        (normal, registered, op)
    }
}

/// Public client API: owns the runtime and spawns sessions.
pub struct Client {
    rt: Arc<Runtime>,
}

impl Client {
    /// Open the database, load the saved file list if one exists, and
    /// start the direct-connection listener when configured active.
    pub fn start(config: Config) -> Result<(Client, mpsc::UnboundedReceiver<UiEvent>), ClientError> {
        std::fs::create_dir_all(&config.state_dir)?;
        let db = Db::open(&config.state_dir.join("db.sqlite3"))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let listen_port = config.active_port;
        let rt = Runtime::new(config, Some(db), tx);

        match share::load(&rt.list_path) {
            Ok(tree) => {
                let files = tree.len();
                *rt.share.write().unwrap() = tree;
                info!(files, "loaded own file list");
            }
            Err(e) => {
                if rt.list_path.exists() {
                    warn!(error = %e, "could not load own file list, starting empty");
                }
            }
        }

        if listen_port > 0 {
            cc::listen(rt.clone(), listen_port);
        }
        Ok((Client { rt }, rx))
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.rt.clone()
    }

    /// Open a configured hub and start connecting.
    pub fn hub_open(&self, name: &str) -> Result<HubId, ClientError> {
        {
            let config = self.rt.config.read().unwrap();
            if config.hub(name).is_none() {
                return Err(ClientError::UnknownHub(name.to_string()));
            }
        }
        Ok(HubSession::spawn(self.rt.clone(), name))
    }

    fn hub_ctl(&self, id: HubId, ctl: HubCtl) -> Result<(), ClientError> {
        let handle = self
            .rt
            .hub_handle(id)
            .ok_or_else(|| ClientError::UnknownHub(format!("#{}", id)))?;
        handle
            .ctl
            .send(ctl)
            .map_err(|_| ClientError::UnknownHub(handle.name.clone()))
    }

    pub fn hub_say(&self, id: HubId, text: impl Into<String>) -> Result<(), ClientError> {
        self.hub_ctl(id, HubCtl::Say(text.into()))
    }

    pub fn hub_msg(
        &self,
        id: HubId,
        to: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.hub_ctl(
            id,
            HubCtl::Msg {
                to: to.into(),
                text: text.into(),
            },
        )
    }

    pub fn hub_password(&self, id: HubId, password: impl Into<String>) -> Result<(), ClientError> {
        self.hub_ctl(id, HubCtl::Password(password.into()))
    }

    pub fn hub_grant(&self, id: HubId, nick: impl Into<String>) -> Result<(), ClientError> {
        self.hub_ctl(id, HubCtl::Grant(nick.into()))
    }

    pub fn hub_kick(&self, id: HubId, nick: impl Into<String>) -> Result<(), ClientError> {
        self.hub_ctl(id, HubCtl::Kick(nick.into()))
    }

    pub fn hub_disconnect(&self, id: HubId) -> Result<(), ClientError> {
        self.hub_ctl(id, HubCtl::Disconnect)
    }

    pub fn hub_close(&self, id: HubId) -> Result<(), ClientError> {
        self.hub_ctl(id, HubCtl::Close)
    }

    /// Replace the local share with a previously hashed file list and
    /// persist it as our served list.
    pub fn load_share_list(&self, path: &std::path::Path) -> Result<(), ClientError> {
        let tree = share::load(path).map_err(|e| ClientError::Config(e.to_string()))?;
        let cid = self.rt.config.read().unwrap().cid.clone();
        share::save(&tree, tree.root(), &cid, &self.rt.list_path)
            .map_err(|e| ClientError::Io(e.to_string()))?;
        *self.rt.share.write().unwrap() = tree;
        Ok(())
    }

    /// Close all hub sessions and flush the database.
    pub async fn shutdown(self) {
        let handles: Vec<HubHandle> = self.rt.hubs.read().unwrap().values().cloned().collect();
        for handle in handles {
            let _ = handle.ctl.send(HubCtl::Close);
        }
        if let Some(db) = &self.rt.db {
            db.close().await;
        }
    }
}
