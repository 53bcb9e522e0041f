//! Per-peer upload session.
//!
//! `connected → $MyNick → $Lock → $Supports → $ADCGET...`, one file
//! request authorized at a time. Protocol violations seal the session
//! with an error and schedule disconnection; policy failures on
//! `$ADCGET` are answered on the wire and the connection stays up.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::charset;
use crate::client::{HubId, Runtime};
use crate::hub::lock;
use crate::net::{Conn, NetError, NetEvent};
use crate::tth;
use super::{CcEntry, CcId, FREE_DELAY_SECS};

/// Files below this size are served without taking a slot.
const MINISLOT_SIZE: u64 = 16 * 1024;

/// Error that sealed a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CcError {
    Protocol(String),
    Policy(String),
    Io(String),
}

impl fmt::Display for CcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CcError::Protocol(e) | CcError::Policy(e) | CcError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CcError {}

/// Side effects emitted by the command handlers.
#[derive(Debug, PartialEq, Eq)]
pub enum CcAction {
    Send(Vec<u8>),
    SendRaw(Vec<u8>),
    SendFile { path: PathBuf, offset: u64, len: u64 },
    Disconnect,
}

/// Outcome of an `$ADCGET` dispatch, mapped to a wire reply.
enum AdcgetError {
    NotAvailable,
    InvalidArgs,
    Unsupported,
    MaxedOut,
}

/// One direct peer connection.
pub struct CcSession {
    pub(crate) id: CcId,
    rt: Arc<Runtime>,
    pub(crate) nick_raw: Option<Vec<u8>>,
    pub(crate) nick: Option<String>,
    pub(crate) last_virtual_path: Option<String>,
    pub(crate) last_file_size: u64,
    pub(crate) last_length: u64,
    pub(crate) last_offset: u64,
    pub(crate) last_error: Option<CcError>,
    last_action: Instant,
    conn: Conn,
}

impl CcSession {
    /// Create a session and its registry entry. `hub` is set when we
    /// are dialing out (or answering a known `$RevConnectToMe`).
    pub fn new(rt: Arc<Runtime>, hub: Option<HubId>) -> (CcSession, mpsc::UnboundedReceiver<NetEvent>) {
        let id = rt.next_id();
        let (conn, net_rx) = Conn::new(b'|');
        rt.ccs.insert(
            id,
            CcEntry {
                hub,
                nick_raw: None,
                file_left: conn.file_left(),
                connected: false,
            },
        );
        let session = CcSession {
            id,
            rt,
            nick_raw: None,
            nick: None,
            last_virtual_path: None,
            last_file_size: 0,
            last_length: 0,
            last_offset: 0,
            last_error: None,
            last_action: Instant::now(),
            conn,
        };
        (session, net_rx)
    }

    pub fn attach(&mut self, stream: TcpStream) {
        self.conn.attach(stream);
    }

    /// Drive the session. `dial` is the peer address when we initiate.
    pub async fn run(
        mut self,
        mut net_rx: mpsc::UnboundedReceiver<NetEvent>,
        dial: Option<String>,
    ) {
        if let Some(addr) = &dial {
            self.conn.connect(addr, 411);
        }
        let initiated = dial.is_some();
        while let Some(ev) = net_rx.recv().await {
            match ev {
                NetEvent::Connected { .. } => {
                    self.last_action = Instant::now();
                    self.rt.ccs.update(self.id, |e| e.connected = true);
                    if initiated && !self.greet() {
                        break;
                    }
                }
                NetEvent::Command(frame) => {
                    self.last_action = Instant::now();
                    let actions = self.handle_cmd(&frame);
                    if self.apply(actions) {
                        break;
                    }
                }
                NetEvent::Error {
                    error: NetError::Cancelled,
                    ..
                } => {}
                NetEvent::Error { phase, error } => {
                    debug!(id = self.id, %phase, %error, "peer connection error");
                    if self.last_error.is_none() {
                        self.last_error = Some(CcError::Io(error.to_string()));
                    }
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    /// Send our side of the handshake after dialing out. Fails when
    /// the hub went away in the meantime.
    fn greet(&mut self) -> bool {
        let Some(handle) = self
            .rt
            .ccs
            .get(self.id)
            .and_then(|e| e.hub)
            .and_then(|hub| self.rt.hub_handle(hub))
        else {
            return false;
        };
        let nick_raw = handle.shared.read().unwrap().nick_raw.clone();
        if nick_raw.is_empty() {
            return false;
        }
        let mut mynick = b"$MyNick ".to_vec();
        mynick.extend_from_slice(&nick_raw);
        self.conn.send(mynick);
        self.conn.send(
            format!(
                "$Lock EXTENDEDPROTOCOL/wut? Pk={}-{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )
            .into_bytes(),
        );
        true
    }

    /// Disconnect and linger before dropping the registry entry, so
    /// frames queued on the way out still drain.
    async fn shutdown(mut self) {
        self.conn.disconnect();
        self.rt.ccs.update(self.id, |e| e.connected = false);
        debug!(
            id = self.id,
            idle_secs = self.last_action.elapsed().as_secs(),
            "closing peer connection"
        );
        tokio::time::sleep(Duration::from_secs(FREE_DELAY_SECS)).await;
        self.rt.ccs.remove(self.id);
    }

    /// Returns whether the session should disconnect.
    fn apply(&mut self, actions: Vec<CcAction>) -> bool {
        for action in actions {
            match action {
                CcAction::Send(frame) => self.conn.send(frame),
                CcAction::SendRaw(bytes) => self.conn.send_raw(bytes),
                CcAction::SendFile { path, offset, len } => self.conn.send_file(path, offset, len),
                CcAction::Disconnect => return true,
            }
        }
        false
    }

    fn seal(&mut self, error: CcError) -> Vec<CcAction> {
        if self.last_error.is_none() {
            self.last_error = Some(error);
        }
        vec![CcAction::Disconnect]
    }

    pub(crate) fn handle_cmd(&mut self, frame: &[u8]) -> Vec<CcAction> {
        if frame.is_empty() {
            return Vec::new();
        }
        let (cmd, args) = match frame.iter().position(|&b| b == b' ') {
            Some(pos) => (&frame[..pos], &frame[pos + 1..]),
            None => (frame, &[][..]),
        };
        match cmd {
            b"$MyNick" => self.handle_mynick(args),
            b"$Lock" => self.handle_lock(args),
            b"$Supports" => self.handle_supports(args),
            b"$ADCGET" => self.handle_adcget(args),
            b"$Direction" | b"$Key" => Vec::new(),
            _ => {
                debug!(id = self.id, cmd = %String::from_utf8_lossy(cmd), "unknown command");
                Vec::new()
            }
        }
    }

    fn handle_mynick(&mut self, args: &[u8]) -> Vec<CcAction> {
        let nick = args;
        if nick.is_empty() {
            return Vec::new();
        }
        if let Some(prev) = &self.nick {
            warn!(id = self.id, nick = %prev, "duplicate $MyNick");
            return Vec::new();
        }
        // adopt the hub the peer was invited through, if any
        let mut hub = self.rt.ccs.get(self.id).and_then(|e| e.hub);
        if hub.is_none() {
            hub = self.rt.ccs.take_expect(nick);
            if let Some(found) = hub {
                self.rt.ccs.update(self.id, |e| e.hub = Some(found));
            }
        }
        let Some(hub) = hub else {
            return self.seal(CcError::Protocol(
                "connection without a hub reference".into(),
            ));
        };
        let Some(handle) = self.rt.hub_handle(hub) else {
            return self.seal(CcError::Protocol("hub session is gone".into()));
        };
        let name = handle
            .roster
            .read()
            .unwrap()
            .get(nick)
            .map(|u| u.name.clone());
        let Some(name) = name else {
            return self.seal(CcError::Protocol("user is not on the hub".into()));
        };
        self.nick_raw = Some(nick.to_vec());
        self.nick = Some(name);
        self.rt
            .ccs
            .update(self.id, |e| e.nick_raw = Some(nick.to_vec()));
        if self.rt.ccs.has_conn(hub, nick, self.id) {
            return self.seal(CcError::Protocol(
                "too many open connections with this user".into(),
            ));
        }
        Vec::new()
    }

    fn handle_lock(&mut self, args: &[u8]) -> Vec<CcAction> {
        let challenge = match args.iter().position(|&b| b == b' ') {
            Some(pos) => &args[..pos],
            None => args,
        };
        if !lock::is_extended(challenge) {
            warn!(id = self.id, "peer does not support the extended protocol");
            return self.seal(CcError::Protocol("client does not support ADCGet".into()));
        }
        let Some(key) = lock::lock_to_key(challenge) else {
            return self.seal(CcError::Protocol("malformed lock".into()));
        };
        let mut key_frame = b"$Key ".to_vec();
        key_frame.extend_from_slice(&key);
        vec![
            CcAction::Send(b"$Supports MiniSlots XmlBZList ADCGet TTHL TTHF".to_vec()),
            CcAction::Send(b"$Direction Upload 0".to_vec()),
            CcAction::Send(key_frame),
        ]
    }

    fn handle_supports(&mut self, args: &[u8]) -> Vec<CcAction> {
        let has_adcget = args
            .split(|&b| b == b' ')
            .any(|cap| cap == b"ADCGet");
        if !has_adcget {
            warn!(id = self.id, "peer does not support ADCGet");
            return self.seal(CcError::Protocol("client does not support ADCGet".into()));
        }
        Vec::new()
    }

    fn handle_adcget(&mut self, args: &[u8]) -> Vec<CcAction> {
        // <type> <identifier> <start> <bytes>
        let words: Vec<&[u8]> = args.split(|&b| b == b' ').collect();
        if words.len() != 4 {
            return self.seal(CcError::Protocol("malformed $ADCGET".into()));
        }
        if self.nick.is_none() {
            warn!(id = self.id, "received $ADCGET before $MyNick, disconnecting");
            return self.seal(CcError::Protocol("received $ADCGET before $MyNick".into()));
        }
        let Ok(ty) = std::str::from_utf8(words[0]) else {
            return self.seal(CcError::Protocol("malformed $ADCGET type".into()));
        };
        let id = match std::str::from_utf8(words[1])
            .ok()
            .and_then(|raw| charset::adc_unescape(raw).ok())
        {
            Some(id) => id,
            None => {
                return self.seal(CcError::Protocol("bad escape in $ADCGET identifier".into()))
            }
        };
        let Some(start) = std::str::from_utf8(words[2])
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        else {
            return self.seal(CcError::Protocol("malformed $ADCGET offset".into()));
        };
        let Some(bytes) = std::str::from_utf8(words[3])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
        else {
            return self.seal(CcError::Protocol("malformed $ADCGET length".into()));
        };

        let result = match ty {
            "tthl" => self.adcget_tthl(&id, start, bytes),
            "file" => self.adcget_file(&id, start, bytes),
            _ => Err(AdcgetError::Unsupported),
        };
        match result {
            Ok(actions) => actions,
            Err(e) => {
                let (reply, text): (&[u8], &str) = match e {
                    AdcgetError::NotAvailable => {
                        (b"$Error File Not Available", "File Not Available")
                    }
                    AdcgetError::InvalidArgs => {
                        (b"$Error Invalid ADCGET arguments", "Invalid ADCGET arguments")
                    }
                    AdcgetError::Unsupported => {
                        (b"$Error Unsupported ADCGET type", "Unsupported ADCGET type")
                    }
                    AdcgetError::MaxedOut => (b"$MaxedOut", "No Slots Available"),
                };
                if self.last_error.is_none() {
                    self.last_error = Some(CcError::Policy(text.to_string()));
                }
                vec![CcAction::Send(reply.to_vec())]
            }
        }
    }

    /// Serve a stored hash-tree blob.
    fn adcget_tthl(&mut self, id: &str, start: u64, bytes: i64) -> Result<Vec<CcAction>, AdcgetError> {
        let root = match id.strip_prefix("TTH/") {
            Some(b32) if b32.len() == 39 => tth::base32_decode(b32),
            _ => None,
        };
        let Some(root) = root else {
            return Err(AdcgetError::InvalidArgs);
        };
        if start != 0 || bytes != -1 {
            return Err(AdcgetError::InvalidArgs);
        }
        let blob = self
            .rt
            .db
            .as_ref()
            .and_then(|db| db.hash_tthl(&root).ok().flatten())
            .filter(|blob| tth::tthl_is_wellformed(blob))
            .ok_or(AdcgetError::NotAvailable)?;
        let reply = format!("$ADCSND tthl {} 0 {}", id, blob.len());
        Ok(vec![
            CcAction::Send(reply.into_bytes()),
            CcAction::SendRaw(blob),
        ])
    }

    /// Serve a file range: the own file list, a virtual path, or a
    /// TTH-addressed file.
    fn adcget_file(&mut self, id: &str, start: u64, bytes: i64) -> Result<Vec<CcAction>, AdcgetError> {
        let mut need_slot = true;
        let mut path: Option<PathBuf> = None;
        let mut vpath = String::new();

        if id == "files.xml.bz2" {
            path = Some(self.rt.list_path.clone());
            vpath = "files.xml.bz2".to_string();
            need_slot = false;
        } else if id.starts_with('/') {
            let share = self.rt.share.read().unwrap();
            if let Some(node) = share.resolve_path(share.root(), id) {
                if share.node(node).is_file() {
                    vpath = share.path(node);
                    path = self.rt.config.read().unwrap().local_path(&vpath);
                }
            }
        } else if let Some(b32) = id.strip_prefix("TTH/") {
            if b32.len() == 39 {
                if let Some(root) = tth::base32_decode(b32) {
                    let share = self.rt.share.read().unwrap();
                    if let Some(&node) = share.from_tth(&root).first() {
                        vpath = share.path(node);
                        path = self.rt.config.read().unwrap().local_path(&vpath);
                    }
                }
            }
        }

        let Some(path) = path else {
            return Err(AdcgetError::NotAvailable);
        };
        let meta = std::fs::metadata(&path).map_err(|_| AdcgetError::NotAvailable)?;
        if !meta.is_file() || start > meta.len() {
            return Err(AdcgetError::NotAvailable);
        }
        let mut bytes = bytes;
        if bytes < 0 || bytes as u64 > meta.len() - start {
            bytes = (meta.len() - start) as i64;
        }
        if meta.len() < MINISLOT_SIZE {
            need_slot = false;
        }

        if need_slot && !self.has_grant() {
            let slots = self.rt.slots() as usize;
            if self.rt.ccs.slots_in_use() >= slots {
                return Err(AdcgetError::MaxedOut);
            }
        }

        self.last_virtual_path = Some(vpath);
        self.last_file_size = meta.len();
        self.last_offset = start;
        self.last_length = bytes as u64;

        let reply = format!(
            "$ADCSND file {} {} {}",
            charset::adc_escape(id),
            start,
            bytes
        );
        Ok(vec![
            CcAction::Send(reply.into_bytes()),
            CcAction::SendFile {
                path,
                offset: start,
                len: bytes as u64,
            },
        ])
    }

    /// Whether the peer holds an explicit slot grant on its hub.
    fn has_grant(&self) -> bool {
        let Some(nick_raw) = &self.nick_raw else {
            return false;
        };
        let Some(handle) = self
            .rt
            .ccs
            .get(self.id)
            .and_then(|e| e.hub)
            .and_then(|hub| self.rt.hub_handle(hub))
        else {
            return false;
        };
        let granted = handle.grants.read().unwrap().contains(nick_raw);
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Config, HubConfig, HubHandle, HubShared};
    use crate::hub::user::{HubUser, Roster};
    use crate::share::{FileNode, FileTree};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU64;
    use std::sync::RwLock;

    struct Fixture {
        rt: Arc<Runtime>,
        session: CcSession,
        _net_rx: mpsc::UnboundedReceiver<NetEvent>,
        _events: mpsc::UnboundedReceiver<crate::client::UiEvent>,
        _ctl_rx: mpsc::UnboundedReceiver<crate::hub::HubCtl>,
        hub_id: HubId,
        dir: tempfile::TempDir,
    }

    const HUB_ID: HubId = 9000;

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.txt"), vec![b'x'; 100]).unwrap();
        let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("big.bin"), &big).unwrap();

        let config = Config::for_testing()
            .with_hub("testhub", HubConfig::new("dchub://hub.example:411/"))
            .with_share("files", dir.path().to_path_buf());
        let (rt, events) = Runtime::for_testing(config);

        // local share: /files/small.txt and /files/big.bin
        {
            let mut tree = FileTree::new();
            let files = tree.add(tree.root(), FileNode::dir("files")).unwrap();
            tree.add(files, FileNode::file("small.txt", 100, Some([1u8; 24]), 0))
                .unwrap();
            tree.add(files, FileNode::file("big.bin", 200_000, Some([2u8; 24]), 0))
                .unwrap();
            *rt.share.write().unwrap() = tree;
        }

        // a hub with alice on it
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let mut roster = Roster::new();
        roster.add(
            b"alice".to_vec(),
            HubUser {
                name: "alice".into(),
                name_raw: b"alice".to_vec(),
                ..Default::default()
            },
        );
        let handle = HubHandle {
            id: HUB_ID,
            name: "testhub".into(),
            roster: Arc::new(RwLock::new(roster)),
            shared: Arc::new(RwLock::new(HubShared {
                nick: "tester".into(),
                nick_raw: b"tester".to_vec(),
                nick_valid: true,
                ..Default::default()
            })),
            grants: Arc::new(RwLock::new(HashSet::new())),
            ctl: ctl_tx,
        };
        rt.hubs.write().unwrap().insert(HUB_ID, handle);

        let (session, net_rx) = CcSession::new(rt.clone(), Some(HUB_ID));
        Fixture {
            rt,
            session,
            _net_rx: net_rx,
            _events: events,
            _ctl_rx: ctl_rx,
            hub_id: HUB_ID,
            dir,
        }
    }

    fn handshake(f: &mut Fixture) {
        assert!(f.session.handle_cmd(b"$MyNick alice").is_empty());
        let actions = f
            .session
            .handle_cmd(b"$Lock EXTENDEDPROTOCOLABC Pk=dc++");
        assert_eq!(actions.len(), 3);
        assert!(f
            .session
            .handle_cmd(b"$Supports MiniSlots ADCGet TTHL")
            .is_empty());
    }

    fn fill_slots(rt: &Runtime, n: usize) {
        for i in 0..n {
            rt.ccs.insert(
                50_000 + i as u64,
                CcEntry {
                    hub: None,
                    nick_raw: None,
                    file_left: Arc::new(AtomicU64::new(1000)),
                    connected: true,
                },
            );
        }
    }

    #[test]
    fn test_handshake_order() {
        let mut f = fixture();
        assert!(f.session.handle_cmd(b"$MyNick alice").is_empty());
        let actions = f
            .session
            .handle_cmd(b"$Lock EXTENDEDPROTOCOLABC Pk=dc++");
        assert_eq!(
            actions[0],
            CcAction::Send(b"$Supports MiniSlots XmlBZList ADCGet TTHL TTHF".to_vec())
        );
        assert_eq!(actions[1], CcAction::Send(b"$Direction Upload 0".to_vec()));
        assert!(matches!(&actions[2], CcAction::Send(f) if f.starts_with(b"$Key ")));
    }

    #[test]
    fn test_mynick_unknown_user_disconnects() {
        let mut f = fixture();
        let actions = f.session.handle_cmd(b"$MyNick mallory");
        assert_eq!(actions, vec![CcAction::Disconnect]);
        assert_eq!(
            f.session.last_error,
            Some(CcError::Protocol("user is not on the hub".into()))
        );
    }

    #[test]
    fn test_mynick_without_hub_disconnects() {
        let mut f = fixture();
        f.rt.ccs.update(f.session.id, |e| e.hub = None);
        let actions = f.session.handle_cmd(b"$MyNick alice");
        assert_eq!(actions, vec![CcAction::Disconnect]);
    }

    #[test]
    fn test_mynick_expect_list_adopts_hub() {
        let mut f = fixture();
        f.rt.ccs.update(f.session.id, |e| e.hub = None);
        f.rt.ccs.expect(b"alice".to_vec(), f.hub_id);
        assert!(f.session.handle_cmd(b"$MyNick alice").is_empty());
        assert_eq!(f.rt.ccs.get(f.session.id).unwrap().hub, Some(f.hub_id));
        assert_eq!(f.session.nick.as_deref(), Some("alice"));
    }

    #[test]
    fn test_mynick_duplicate_connection_rejected() {
        let mut f = fixture();
        f.rt.ccs.insert(
            777,
            CcEntry {
                hub: Some(f.hub_id),
                nick_raw: Some(b"alice".to_vec()),
                file_left: Arc::new(AtomicU64::new(0)),
                connected: true,
            },
        );
        let actions = f.session.handle_cmd(b"$MyNick alice");
        assert_eq!(actions, vec![CcAction::Disconnect]);
        assert_eq!(
            f.session.last_error,
            Some(CcError::Protocol(
                "too many open connections with this user".into()
            ))
        );
    }

    #[test]
    fn test_lock_without_extension_disconnects() {
        let mut f = fixture();
        f.session.handle_cmd(b"$MyNick alice");
        let actions = f.session.handle_cmd(b"$Lock OLDSTYLE Pk=ancient");
        assert_eq!(actions, vec![CcAction::Disconnect]);
    }

    #[test]
    fn test_supports_requires_adcget() {
        let mut f = fixture();
        f.session.handle_cmd(b"$MyNick alice");
        let actions = f.session.handle_cmd(b"$Supports MiniSlots XmlBZList");
        assert_eq!(actions, vec![CcAction::Disconnect]);
        assert_eq!(
            f.session.last_error,
            Some(CcError::Protocol("client does not support ADCGet".into()))
        );
    }

    #[test]
    fn test_adcget_before_mynick_disconnects() {
        let mut f = fixture();
        let actions = f.session.handle_cmd(b"$ADCGET file /files/small.txt 0 -1");
        assert_eq!(actions, vec![CcAction::Disconnect]);
        assert_eq!(
            f.session.last_error,
            Some(CcError::Protocol("received $ADCGET before $MyNick".into()))
        );
    }

    #[test]
    fn test_adcget_absent_file() {
        let mut f = fixture();
        handshake(&mut f);
        let actions = f.session.handle_cmd(b"$ADCGET file /absent 0 -1");
        assert_eq!(
            actions,
            vec![CcAction::Send(b"$Error File Not Available".to_vec())]
        );
    }

    #[test]
    fn test_adcget_small_file_needs_no_slot() {
        let mut f = fixture();
        handshake(&mut f);
        fill_slots(&f.rt, 10); // way over the 2 configured slots
        let in_use = f.rt.ccs.slots_in_use();
        let actions = f.session.handle_cmd(b"$ADCGET file /files/small.txt 0 -1");
        assert_eq!(
            actions[0],
            CcAction::Send(b"$ADCSND file /files/small.txt 0 100".to_vec())
        );
        assert_eq!(
            actions[1],
            CcAction::SendFile {
                path: f.dir.path().join("small.txt"),
                offset: 0,
                len: 100,
            }
        );
        assert_eq!(f.rt.ccs.slots_in_use(), in_use);
    }

    #[test]
    fn test_adcget_range_with_free_slot() {
        let mut f = fixture();
        handshake(&mut f);
        let actions = f.session.handle_cmd(b"$ADCGET file /files/big.bin 100 50");
        assert_eq!(
            actions[0],
            CcAction::Send(b"$ADCSND file /files/big.bin 100 50".to_vec())
        );
        assert_eq!(
            actions[1],
            CcAction::SendFile {
                path: f.dir.path().join("big.bin"),
                offset: 100,
                len: 50,
            }
        );
        assert_eq!(f.session.last_virtual_path.as_deref(), Some("/files/big.bin"));
        assert_eq!(f.session.last_file_size, 200_000);
        assert_eq!(f.session.last_offset, 100);
        assert_eq!(f.session.last_length, 50);
    }

    #[test]
    fn test_adcget_big_file_maxed_out() {
        let mut f = fixture();
        handshake(&mut f);
        fill_slots(&f.rt, 2);
        let actions = f.session.handle_cmd(b"$ADCGET file /files/big.bin 0 -1");
        assert_eq!(actions, vec![CcAction::Send(b"$MaxedOut".to_vec())]);
        // the session is not sealed shut; a later retry may succeed
        assert!(f.session.handle_cmd(b"$Supports ADCGet").is_empty());
    }

    #[test]
    fn test_adcget_granted_peer_bypasses_slots() {
        let mut f = fixture();
        handshake(&mut f);
        fill_slots(&f.rt, 2);
        f.rt.hubs.read().unwrap()[&f.hub_id]
            .grants
            .write()
            .unwrap()
            .insert(b"alice".to_vec());
        let actions = f.session.handle_cmd(b"$ADCGET file /files/big.bin 0 -1");
        assert!(matches!(&actions[0], CcAction::Send(frame) if frame.starts_with(b"$ADCSND")));
    }

    #[test]
    fn test_adcget_clamps_length() {
        let mut f = fixture();
        handshake(&mut f);
        let actions = f
            .session
            .handle_cmd(b"$ADCGET file /files/small.txt 40 5000");
        assert_eq!(
            actions[0],
            CcAction::Send(b"$ADCSND file /files/small.txt 40 60".to_vec())
        );
    }

    #[test]
    fn test_adcget_start_past_end() {
        let mut f = fixture();
        handshake(&mut f);
        let actions = f.session.handle_cmd(b"$ADCGET file /files/small.txt 101 -1");
        assert_eq!(
            actions,
            vec![CcAction::Send(b"$Error File Not Available".to_vec())]
        );
    }

    #[test]
    fn test_adcget_tth_identifier() {
        let mut f = fixture();
        handshake(&mut f);
        let id = format!("TTH/{}", tth::base32_encode(&[2u8; 24]));
        let cmd = format!("$ADCGET file {} 0 4", id);
        let actions = f.session.handle_cmd(cmd.as_bytes());
        let expected = format!("$ADCSND file {} 0 4", id);
        assert_eq!(actions[0], CcAction::Send(expected.into_bytes()));
    }

    #[test]
    fn test_adcget_escaped_path() {
        let mut f = fixture();
        std::fs::write(f.dir.path().join("with space.txt"), b"hi").unwrap();
        {
            let mut share = f.rt.share.write().unwrap();
            let files = share.child_by_name(share.root(), "files").unwrap();
            share
                .add(files, FileNode::file("with space.txt", 2, Some([3u8; 24]), 0))
                .unwrap();
        }
        handshake(&mut f);
        let actions = f
            .session
            .handle_cmd(b"$ADCGET file /files/with\\sspace.txt 0 -1");
        assert_eq!(
            actions[0],
            CcAction::Send(b"$ADCSND file /files/with\\sspace.txt 0 2".to_vec())
        );
    }

    #[test]
    fn test_adcget_bad_escape_seals() {
        let mut f = fixture();
        handshake(&mut f);
        let actions = f.session.handle_cmd(b"$ADCGET file /files/bad\\q 0 -1");
        assert_eq!(actions, vec![CcAction::Disconnect]);
    }

    #[test]
    fn test_adcget_unsupported_type() {
        let mut f = fixture();
        handshake(&mut f);
        let actions = f.session.handle_cmd(b"$ADCGET list /files 0 -1");
        assert_eq!(
            actions,
            vec![CcAction::Send(b"$Error Unsupported ADCGET type".to_vec())]
        );
    }

    #[test]
    fn test_adcget_tthl_requires_full_range() {
        let mut f = fixture();
        handshake(&mut f);
        let id = format!("TTH/{}", tth::base32_encode(&[2u8; 24]));
        let cmd = format!("$ADCGET tthl {} 5 -1", id);
        assert_eq!(
            f.session.handle_cmd(cmd.as_bytes()),
            vec![CcAction::Send(b"$Error Invalid ADCGET arguments".to_vec())]
        );
        let cmd = format!("$ADCGET tthl {} 0 100", id);
        assert_eq!(
            f.session.handle_cmd(cmd.as_bytes()),
            vec![CcAction::Send(b"$Error Invalid ADCGET arguments".to_vec())]
        );
    }

    #[test]
    fn test_adcget_tthl_without_db() {
        let mut f = fixture();
        handshake(&mut f);
        let id = format!("TTH/{}", tth::base32_encode(&[2u8; 24]));
        let cmd = format!("$ADCGET tthl {} 0 -1", id);
        assert_eq!(
            f.session.handle_cmd(cmd.as_bytes()),
            vec![CcAction::Send(b"$Error File Not Available".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_adcget_tthl_served_from_db() {
        let db = crate::data::Db::open_memory().unwrap();
        let blob = vec![9u8; 72];
        db.hash_insert("/real/big.bin", 200_000, 1, &[2u8; 24], &blob)
            .unwrap();

        let config = Config::for_testing()
            .with_hub("testhub", HubConfig::new("dchub://hub.example:411/"));
        let (tx, _events) = mpsc::unbounded_channel();
        let rt = Runtime::new(config, Some(db), tx);

        let (ctl_tx, _ctl_rx) = mpsc::unbounded_channel();
        let mut roster = Roster::new();
        roster.add(
            b"alice".to_vec(),
            HubUser {
                name: "alice".into(),
                name_raw: b"alice".to_vec(),
                ..Default::default()
            },
        );
        rt.hubs.write().unwrap().insert(
            HUB_ID,
            HubHandle {
                id: HUB_ID,
                name: "testhub".into(),
                roster: Arc::new(RwLock::new(roster)),
                shared: Arc::new(RwLock::new(HubShared::default())),
                grants: Arc::new(RwLock::new(HashSet::new())),
                ctl: ctl_tx,
            },
        );
        let (mut session, _net_rx) = CcSession::new(rt.clone(), Some(HUB_ID));
        session.handle_cmd(b"$MyNick alice");

        let id = format!("TTH/{}", tth::base32_encode(&[2u8; 24]));
        let cmd = format!("$ADCGET tthl {} 0 -1", id);
        let actions = session.handle_cmd(cmd.as_bytes());
        let expected = format!("$ADCSND tthl {} 0 72", id);
        assert_eq!(actions[0], CcAction::Send(expected.into_bytes()));
        assert_eq!(actions[1], CcAction::SendRaw(blob));
    }

    #[test]
    fn test_filelist_needs_no_slot() {
        let mut f = fixture();
        // serve the own list from the state dir
        let list = f.dir.path().join("files.xml.bz2");
        std::fs::write(&list, b"placeholder").unwrap();
        // point the runtime's list path at it
        let rt = {
            let mut config = Config::for_testing()
                .with_hub("testhub", HubConfig::new("dchub://hub.example:411/"));
            config.state_dir = f.dir.path().to_path_buf();
            let (rt, events) = Runtime::for_testing(config);
            std::mem::drop(events);
            rt
        };
        // reuse the existing hub handle for the roster lookup
        let handle = f.rt.hubs.read().unwrap()[&f.hub_id].clone();
        rt.hubs.write().unwrap().insert(f.hub_id, handle);
        let (mut session, _net_rx) = CcSession::new(rt.clone(), Some(f.hub_id));
        session.handle_cmd(b"$MyNick alice");
        fill_slots(&rt, 5);
        let actions = session.handle_cmd(b"$ADCGET file files.xml.bz2 0 -1");
        assert_eq!(
            actions[0],
            CcAction::Send(b"$ADCSND file files.xml.bz2 0 11".to_vec())
        );
    }
}
