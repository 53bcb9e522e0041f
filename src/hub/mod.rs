//! Hub sessions.
//!
//! One session per hub connection, driving the framed transport with
//! either the legacy or the modern dialect. The session owns the
//! roster and the handshake state; frame handlers are synchronous and
//! return a list of actions the driver task applies, so the protocol
//! logic is testable without sockets.

pub mod adc;
pub mod lock;
pub mod nmdc;
pub mod user;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;

use crate::cc;
use crate::charset;
use crate::client::{HubHandle, HubId, HubShared, Priority, Runtime};
use crate::net::{Conn, NetError, NetEvent, Phase};
use user::Roster;

/// Seconds before a lost connection is retried.
pub const RECONNECT_SECS: u64 = 30;

/// Interval of the self-advertisement tick.
pub const NFO_INTERVAL_SECS: u64 = 5 * 60;

/// Commands from the owner of the session.
#[derive(Debug)]
pub enum HubCtl {
    Say(String),
    Msg { to: String, text: String },
    Password(String),
    Grant(String),
    Kick(String),
    Reconnect,
    Disconnect,
    Close,
}

/// Side effects emitted by frame handlers.
#[derive(Debug, PartialEq, Eq)]
pub enum HubAction {
    /// Send a command frame on the hub link.
    Send(Vec<u8>),
    /// Fire a UDP search reply.
    SendUdp { addr: String, frame: Vec<u8> },
    /// Dial out to a peer for a direct connection.
    OpenCc { addr: String },
    /// Remember that a peer is about to dial in.
    ExpectCc { nick_raw: Vec<u8> },
    Disconnect { reconnect: bool },
    Notice { priority: Priority, text: String },
    Chat { from: String, text: String, private: bool },
}

/// Protocol dialect and its per-variant state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialect {
    Legacy { supports_nogetinfo: bool },
    Modern { phase: AdcPhase, sid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcPhase {
    Protocol,
    Identify,
    Verify,
    Normal,
}

/// The advertisement fields last sent, for no-op suppression.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct NfoSnapshot {
    desc: String,
    conn: String,
    mail: String,
    slots: u32,
    h_norm: u32,
    h_reg: u32,
    h_op: u32,
    share: u64,
    active_port: u16,
}

/// State machine for one hub connection.
pub struct HubSession {
    pub(crate) id: HubId,
    pub(crate) name: String,
    pub(crate) rt: Arc<Runtime>,
    pub(crate) dialect: Dialect,
    pub(crate) nick: String,
    pub(crate) nick_raw: Vec<u8>,
    pub(crate) encoding: String,
    pub(crate) nick_valid: bool,
    pub(crate) is_reg: bool,
    pub(crate) is_op: bool,
    pub(crate) hub_name: Option<String>,
    pub(crate) hub_name_raw: Option<Vec<u8>>,
    pub(crate) roster: Arc<RwLock<Roster>>,
    pub(crate) grants: Arc<RwLock<HashSet<Vec<u8>>>>,
    pub(crate) shared: Arc<RwLock<HubShared>>,
    pub(crate) share_count: usize,
    pub(crate) share_size_total: u64,
    pub(crate) received_first: bool,
    pub(crate) join_complete: bool,
    pub(crate) remote: Option<SocketAddr>,
    nfo_last: Option<NfoSnapshot>,
    conn: Conn,
    reconnect_at: Option<Instant>,
}

impl HubSession {
    /// Create a session and register its handle. The caller drives it
    /// with [`HubSession::run`].
    pub(crate) fn new(
        rt: Arc<Runtime>,
        name: &str,
    ) -> (
        HubSession,
        mpsc::UnboundedReceiver<NetEvent>,
        mpsc::UnboundedReceiver<HubCtl>,
    ) {
        let id = rt.next_id();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (conn, net_rx) = Conn::new(b'|');
        let session = HubSession {
            id,
            name: name.to_string(),
            rt: rt.clone(),
            dialect: Dialect::Legacy {
                supports_nogetinfo: false,
            },
            nick: String::new(),
            nick_raw: Vec::new(),
            encoding: "utf-8".to_string(),
            nick_valid: false,
            is_reg: false,
            is_op: false,
            hub_name: None,
            hub_name_raw: None,
            roster: Arc::new(RwLock::new(Roster::new())),
            grants: Arc::new(RwLock::new(HashSet::new())),
            shared: Arc::new(RwLock::new(HubShared::default())),
            share_count: 0,
            share_size_total: 0,
            received_first: false,
            join_complete: false,
            remote: None,
            nfo_last: None,
            conn,
            reconnect_at: None,
        };
        let handle = HubHandle {
            id,
            name: session.name.clone(),
            roster: session.roster.clone(),
            shared: session.shared.clone(),
            grants: session.grants.clone(),
            ctl: ctl_tx,
        };
        rt.hubs.write().unwrap().insert(id, handle);
        (session, net_rx, ctl_rx)
    }

    /// Spawn the session task and start connecting.
    pub fn spawn(rt: Arc<Runtime>, name: &str) -> HubId {
        let (session, net_rx, ctl_rx) = HubSession::new(rt, name);
        let id = session.id;
        tokio::spawn(session.run(net_rx, ctl_rx));
        id
    }

    pub async fn run(
        mut self,
        mut net_rx: mpsc::UnboundedReceiver<NetEvent>,
        mut ctl_rx: mpsc::UnboundedReceiver<HubCtl>,
    ) {
        self.connect();
        let mut nfo_tick = tokio::time::interval(Duration::from_secs(NFO_INTERVAL_SECS));
        nfo_tick.tick().await; // skip the immediate tick
        loop {
            let deadline = self.reconnect_at;
            tokio::select! {
                ev = net_rx.recv() => match ev {
                    Some(ev) => self.on_net(ev),
                    None => break,
                },
                ctl = ctl_rx.recv() => match ctl {
                    Some(HubCtl::Close) | None => {
                        self.close();
                        break;
                    }
                    Some(ctl) => self.on_ctl(ctl),
                },
                _ = nfo_tick.tick() => {
                    if let Some(frame) = self.build_nfo(false) {
                        self.conn.send(frame);
                    }
                }
                _ = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.reconnect_at = None;
                    self.connect();
                }
            }
        }
    }

    /// Resolve the configured address and start connecting, resetting
    /// dialect state. `dchub://` (or no scheme) selects the legacy
    /// protocol, `adc://` the modern one.
    pub(crate) fn connect(&mut self) {
        let addr = {
            let config = self.rt.config.read().unwrap();
            match config.hub(&self.name) {
                Some(hub) => hub.addr.clone(),
                None => {
                    self.notice_now(Priority::High, "Hub is no longer configured.");
                    return;
                }
            }
        };
        let (rest, modern) = if let Some(rest) = addr.strip_prefix("dchub://") {
            (rest, false)
        } else if let Some(rest) = addr.strip_prefix("adc://") {
            (rest, true)
        } else {
            (addr.as_str(), false)
        };
        let rest = rest.trim_end_matches('/');

        self.dialect = if modern {
            Dialect::Modern {
                phase: AdcPhase::Protocol,
                sid: 0,
            }
        } else {
            Dialect::Legacy {
                supports_nogetinfo: false,
            }
        };
        self.encoding = if modern {
            "utf-8".to_string()
        } else {
            self.rt
                .config
                .read()
                .unwrap()
                .hub_encoding(&self.name)
                .to_string()
        };
        self.reconnect_at = None;
        self.sync_shared();

        self.notice_now(Priority::Low, format!("Connecting to {}...", rest));
        self.conn.set_delim(if modern { b'\n' } else { b'|' });
        self.conn.connect(rest, 411);
    }

    fn on_net(&mut self, ev: NetEvent) {
        match ev {
            NetEvent::Connected { remote } => {
                self.remote = remote;
                let addr = remote
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "hub".to_string());
                self.notice_now(Priority::Low, format!("Connected to {}.", addr));
                if matches!(self.dialect, Dialect::Modern { .. }) {
                    self.conn.send(b"HSUP ADBASE ADTIGR".to_vec());
                }
            }
            NetEvent::Command(frame) => {
                let actions = match self.dialect {
                    Dialect::Legacy { .. } => nmdc::handle(self, &frame),
                    Dialect::Modern { .. } => adc::handle(self, &frame),
                };
                self.apply(actions);
                self.sync_shared();
            }
            NetEvent::Error { error: NetError::Cancelled, .. } => {}
            NetEvent::Error { phase, error } => match phase {
                Phase::Connect => {
                    self.notice_now(
                        Priority::Medium,
                        format!(
                            "Could not connect to hub: {}. Waiting {} seconds before retrying.",
                            error, RECONNECT_SECS
                        ),
                    );
                    self.arm_reconnect();
                }
                Phase::Receive | Phase::Send => {
                    let what = if phase == Phase::Receive { "Read" } else { "Write" };
                    self.notice_now(Priority::Medium, format!("{} error: {}", what, error));
                    self.disconnect(true);
                }
            },
        }
    }

    fn on_ctl(&mut self, ctl: HubCtl) {
        let actions = match ctl {
            HubCtl::Say(text) => self.say(&text),
            HubCtl::Msg { to, text } => self.msg(&to, &text),
            HubCtl::Password(password) => self.password(Some(&password)),
            HubCtl::Grant(nick) => {
                self.grant(&nick);
                Vec::new()
            }
            HubCtl::Kick(nick) => self.kick(&nick),
            HubCtl::Reconnect => {
                self.disconnect(false);
                self.connect();
                Vec::new()
            }
            HubCtl::Disconnect => {
                self.disconnect(false);
                Vec::new()
            }
            HubCtl::Close => Vec::new(),
        };
        self.apply(actions);
        self.sync_shared();
    }

    pub(crate) fn apply(&mut self, actions: Vec<HubAction>) {
        for action in actions {
            match action {
                HubAction::Send(frame) => self.conn.send(frame),
                HubAction::SendUdp { addr, frame } => {
                    tokio::spawn(async move {
                        crate::net::udp_send(&addr, &frame).await;
                    });
                }
                HubAction::OpenCc { addr } => {
                    cc::connect_out(self.rt.clone(), self.id, &addr);
                }
                HubAction::ExpectCc { nick_raw } => {
                    self.rt.ccs.expect(nick_raw, self.id);
                }
                HubAction::Disconnect { reconnect } => self.disconnect(reconnect),
                HubAction::Notice { priority, text } => {
                    self.rt.notice(Some(&self.name), priority, text)
                }
                HubAction::Chat { from, text, private } => {
                    self.rt.chat(&self.name, &from, text, private)
                }
            }
        }
    }

    fn notice_now(&self, priority: Priority, text: impl Into<String>) {
        self.rt.notice(Some(&self.name), priority, text);
    }

    /// Mirror session state into the registry handle.
    pub(crate) fn sync_shared(&self) {
        let mut shared = self.shared.write().unwrap();
        shared.nick = self.nick.clone();
        shared.nick_raw = self.nick_raw.clone();
        shared.nick_valid = self.nick_valid;
        shared.is_reg = self.is_reg;
        shared.is_op = self.is_op;
        shared.encoding = self.encoding.clone();
        shared.hub_name = self.hub_name.clone();
    }

    /// Drop the link and reset session state. With `reconnect`, a
    /// fresh attempt is armed after [`RECONNECT_SECS`].
    pub(crate) fn disconnect(&mut self, reconnect: bool) {
        self.conn.disconnect();
        self.remote = None;
        self.roster.write().unwrap().clear();
        self.nick.clear();
        self.nick_raw.clear();
        self.hub_name = None;
        self.hub_name_raw = None;
        self.nick_valid = false;
        self.is_reg = false;
        self.is_op = false;
        self.received_first = false;
        self.join_complete = false;
        self.share_count = 0;
        self.share_size_total = 0;
        self.nfo_last = None;
        self.dialect = match self.dialect {
            Dialect::Legacy { .. } => Dialect::Legacy {
                supports_nogetinfo: false,
            },
            Dialect::Modern { .. } => Dialect::Modern {
                phase: AdcPhase::Protocol,
                sid: 0,
            },
        };
        self.sync_shared();
        if reconnect {
            self.notice_now(
                Priority::Medium,
                format!(
                    "Connection lost. Waiting {} seconds before reconnecting.",
                    RECONNECT_SECS
                ),
            );
            self.arm_reconnect();
        } else {
            self.notice_now(Priority::Low, "Disconnected.");
            self.reconnect_at = None;
        }
    }

    /// Arm the reconnect timer; a pending timer is left as-is so an
    /// error storm cannot stack retries.
    fn arm_reconnect(&mut self) {
        if self.reconnect_at.is_none() {
            self.reconnect_at = Some(Instant::now() + Duration::from_secs(RECONNECT_SECS));
        }
    }

    #[cfg(test)]
    pub(crate) fn reconnect_armed(&self) -> bool {
        self.reconnect_at.is_some()
    }

    /// Tear the session down for good.
    fn close(&mut self) {
        self.disconnect(false);
        self.rt.hubs.write().unwrap().remove(&self.id);
        self.rt.ccs.remove_hub(self.id);
        info!(hub = %self.name, "hub session closed");
    }

    // -----------------------------------------------------------------
    // Outbound operations

    /// Main-chat message.
    fn say(&mut self, text: &str) -> Vec<HubAction> {
        if !self.nick_valid {
            return Vec::new();
        }
        match self.dialect {
            Dialect::Legacy { .. } => {
                let mut frame = Vec::new();
                frame.push(b'<');
                frame.extend_from_slice(&self.nick_raw);
                frame.extend_from_slice(b"> ");
                frame.extend_from_slice(&charset::encode_and_escape(&self.encoding, text));
                vec![HubAction::Send(frame)]
            }
            Dialect::Modern { sid, .. } => {
                let frame = format!("BMSG {} {}", adc::sid_to_str(sid), charset::adc_escape(text));
                vec![HubAction::Send(frame.into_bytes())]
            }
        }
    }

    /// Private message, with a local echo.
    fn msg(&mut self, to: &str, text: &str) -> Vec<HubAction> {
        let raw = {
            let roster = self.roster.read().unwrap();
            let found = roster
                .iter()
                .find(|(_, u)| u.name == to)
                .map(|(key, _)| key.clone());
            found
        };
        let Some(raw) = raw else {
            return vec![HubAction::Notice {
                priority: Priority::Medium,
                text: format!("{} is not on this hub.", to),
            }];
        };
        match self.dialect {
            Dialect::Legacy { .. } => {
                let mut frame = Vec::new();
                frame.extend_from_slice(b"$To: ");
                frame.extend_from_slice(&raw);
                frame.extend_from_slice(b" From: ");
                frame.extend_from_slice(&self.nick_raw);
                frame.extend_from_slice(b" $<");
                frame.extend_from_slice(&self.nick_raw);
                frame.extend_from_slice(b"> ");
                frame.extend_from_slice(&charset::encode_and_escape(&self.encoding, text));
                vec![
                    HubAction::Send(frame),
                    // emulate the protocol echo
                    HubAction::Chat {
                        from: self.nick.clone(),
                        text: text.to_string(),
                        private: true,
                    },
                ]
            }
            Dialect::Modern { sid, .. } => {
                let roster = self.roster.read().unwrap();
                let Some(target) = roster.get(&raw).map(|u| u.sid) else {
                    return Vec::new();
                };
                let frame = format!(
                    "EMSG {} {} {} PM{}",
                    adc::sid_to_str(sid),
                    adc::sid_to_str(target),
                    charset::adc_escape(text),
                    adc::sid_to_str(sid)
                );
                vec![
                    HubAction::Send(frame.into_bytes()),
                    HubAction::Chat {
                        from: self.nick.clone(),
                        text: text.to_string(),
                        private: true,
                    },
                ]
            }
        }
    }

    /// Answer a password request, preferring an explicitly supplied
    /// password over the configured one.
    pub(crate) fn password(&mut self, password: Option<&str>) -> Vec<HubAction> {
        if self.nick_valid || !matches!(self.dialect, Dialect::Legacy { .. }) {
            return Vec::new();
        }
        let stored = self
            .rt
            .config
            .read()
            .unwrap()
            .hub_password(&self.name)
            .map(str::to_string);
        let Some(password) = password.map(str::to_string).or(stored) else {
            return vec![HubAction::Notice {
                priority: Priority::High,
                text: "Password required. Set one for this hub to log in.".to_string(),
            }];
        };
        self.is_reg = true;
        let mut frame = b"$MyPass ".to_vec();
        frame.extend_from_slice(password.as_bytes());
        vec![HubAction::Send(frame)]
    }

    fn grant(&mut self, nick: &str) {
        let raw = {
            let roster = self.roster.read().unwrap();
            let found = roster
                .iter()
                .find(|(_, u)| u.name == nick)
                .map(|(key, _)| key.clone());
            found
        };
        if let Some(raw) = raw {
            self.grants.write().unwrap().insert(raw);
        }
    }

    fn kick(&mut self, nick: &str) -> Vec<HubAction> {
        if !self.nick_valid || !matches!(self.dialect, Dialect::Legacy { .. }) {
            return Vec::new();
        }
        let roster = self.roster.read().unwrap();
        let Some((raw, _)) = roster.iter().find(|(_, u)| u.name == nick) else {
            return Vec::new();
        };
        let mut frame = b"$Kick ".to_vec();
        frame.extend_from_slice(raw);
        vec![HubAction::Send(frame)]
    }

    // -----------------------------------------------------------------
    // Self-advertisement

    /// Build the advertisement frame, or `None` when nothing changed
    /// since the last one (or the session is not yet validated, unless
    /// forced by the modern identify transition).
    pub(crate) fn build_nfo(&mut self, force: bool) -> Option<Vec<u8>> {
        if !force && !self.nick_valid {
            return None;
        }
        let (desc, conn, mail) = {
            let config = self.rt.config.read().unwrap();
            (
                config.hub_description(&self.name).to_string(),
                config.hub_connection(&self.name).to_string(),
                config.hub_email(&self.name).to_string(),
            )
        };
        let (h_norm, h_reg, h_op) = self.rt.hub_counts(self.id);
        let slots = self.rt.slots();
        let active_port = self.rt.listen_addr().map(|(_, p)| p).unwrap_or(0);
        let share = self.rt.share_size();

        let snapshot = NfoSnapshot {
            desc,
            conn,
            mail,
            slots,
            h_norm,
            h_reg,
            h_op,
            share,
            active_port,
        };
        if !force && self.nfo_last.as_ref() == Some(&snapshot) {
            return None;
        }

        let frame = match &self.dialect {
            Dialect::Legacy { .. } => self.build_nfo_nmdc(&snapshot),
            Dialect::Modern { phase, sid } => {
                let identify = force || *phase == AdcPhase::Identify;
                self.build_nfo_adc(&snapshot, identify, *sid)
            }
        };
        self.nfo_last = Some(snapshot);
        Some(frame)
    }

    fn build_nfo_nmdc(&self, nfo: &NfoSnapshot) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"$MyINFO $ALL ");
        frame.extend_from_slice(&self.nick_raw);
        frame.push(b' ');
        frame.extend_from_slice(&charset::encode_and_escape(&self.encoding, &nfo.desc));
        frame.extend_from_slice(
            format!(
                "<{} V:{},M:{},H:{}/{}/{},S:{}>$ $",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                if nfo.active_port > 0 { 'A' } else { 'P' },
                nfo.h_norm,
                nfo.h_reg,
                nfo.h_op,
                nfo.slots
            )
            .as_bytes(),
        );
        frame.extend_from_slice(&charset::encode_and_escape(&self.encoding, &nfo.conn));
        frame.push(0x01);
        frame.push(b'$');
        frame.extend_from_slice(&charset::encode_and_escape(&self.encoding, &nfo.mail));
        frame.push(b'$');
        frame.extend_from_slice(nfo.share.to_string().as_bytes());
        frame.push(b'$');
        frame
    }

    fn build_nfo_adc(&self, nfo: &NfoSnapshot, identify: bool, sid: u32) -> Vec<u8> {
        let last = self.nfo_last.clone().unwrap_or_default();
        let all = identify || self.nfo_last.is_none();
        let mut cmd = format!("BINF {}", adc::sid_to_str(sid));
        if identify {
            let config = self.rt.config.read().unwrap();
            cmd.push_str(&format!(
                " ID{} PD{} I40.0.0.0 VE{}",
                config.cid,
                config.pid,
                charset::adc_escape(&format!(
                    "{} {}",
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION")
                ))
            ));
            cmd.push_str(&format!(" NI{}", charset::adc_escape(&self.nick)));
        }
        if all || nfo.slots != last.slots {
            cmd.push_str(&format!(" SL{}", nfo.slots));
        }
        if all || nfo.h_norm != last.h_norm {
            cmd.push_str(&format!(" HN{}", nfo.h_norm));
        }
        if all || nfo.h_reg != last.h_reg {
            cmd.push_str(&format!(" HR{}", nfo.h_reg));
        }
        if all || nfo.h_op != last.h_op {
            cmd.push_str(&format!(" HO{}", nfo.h_op));
        }
        if all || nfo.share != last.share {
            cmd.push_str(&format!(" SS{}", nfo.share));
        }
        if all || nfo.desc != last.desc {
            cmd.push_str(&format!(" DE{}", charset::adc_escape(&nfo.desc)));
        }
        if all || nfo.mail != last.mail {
            cmd.push_str(&format!(" EM{}", charset::adc_escape(&nfo.mail)));
        }
        cmd.into_bytes()
    }

    /// Look a user up by UTF-8 name (legacy roster keys are raw).
    pub fn user_key_by_name(&self, name: &str) -> Option<Vec<u8>> {
        let roster = self.roster.read().unwrap();
        let found = roster
            .iter()
            .find(|(_, u)| u.name == name)
            .map(|(key, _)| key.clone());
        found
    }
}

impl Drop for HubSession {
    fn drop(&mut self) {
        self.rt.hubs.write().unwrap().remove(&self.id);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Config;

    fn test_config() -> Config {
        let mut config = Config::for_testing();
        config.hubs.insert(
            "testhub".into(),
            crate::client::HubConfig::new("dchub://hub.example:411/"),
        );
        config
    }

    #[test]
    fn test_nfo_suppressed_until_validated() {
        let mut hub = testutil::legacy_session(test_config());
        assert!(hub.session.build_nfo(false).is_none());
        hub.session.nick = "tester".into();
        hub.session.nick_raw = b"tester".to_vec();
        hub.session.nick_valid = true;
        assert!(hub.session.build_nfo(false).is_some());
    }

    #[test]
    fn test_nfo_noop_tick_suppressed() {
        let mut hub = testutil::legacy_session(test_config());
        hub.session.nick = "tester".into();
        hub.session.nick_raw = b"tester".to_vec();
        hub.session.nick_valid = true;
        let first = hub.session.build_nfo(false).unwrap();
        assert!(first.starts_with(b"$MyINFO $ALL tester "));
        // unchanged state: the tick re-send is suppressed
        assert!(hub.session.build_nfo(false).is_none());
        // a config change brings it back
        hub.rt.config.write().unwrap().slots = 9;
        let second = hub.session.build_nfo(false).unwrap();
        let text = String::from_utf8_lossy(&second).to_string();
        assert!(text.contains("S:9>"), "{}", text);
    }

    #[test]
    fn test_nfo_nmdc_format() {
        let mut hub = testutil::legacy_session(test_config());
        {
            let mut config = hub.rt.config.write().unwrap();
            config.description = "de$c".into();
            config.connection = "DSL".into();
            config.email = "a@b".into();
            config.slots = 3;
        }
        hub.session.nick = "tester".into();
        hub.session.nick_raw = b"tester".to_vec();
        hub.session.nick_valid = true;
        let frame = hub.session.build_nfo(false).unwrap();
        let text = String::from_utf8_lossy(&frame).to_string();
        // $ in the description is escaped, the flag byte follows the
        // connection string, share is 0
        assert!(text.starts_with("$MyINFO $ALL tester de&#36;c<"));
        assert!(text.contains(",S:3>$ $DSL\u{1}$a@b$0$"), "{}", text);
        assert!(text.contains("M:P"));
    }

    #[test]
    fn test_reconnect_timer_arming() {
        let mut hub = testutil::legacy_session(test_config());
        hub.session.on_net(NetEvent::Error {
            phase: Phase::Receive,
            error: NetError::Closed,
        });
        assert!(hub.session.reconnect_armed());
        // an error storm does not stack timers
        hub.session.on_net(NetEvent::Error {
            phase: Phase::Send,
            error: NetError::Closed,
        });
        assert!(hub.session.reconnect_armed());
        // a manual disconnect clears the pending retry
        hub.session.disconnect(false);
        assert!(!hub.session.reconnect_armed());
        // cancelled io is silent and arms nothing
        hub.session.on_net(NetEvent::Error {
            phase: Phase::Receive,
            error: NetError::Cancelled,
        });
        assert!(!hub.session.reconnect_armed());
    }

    #[test]
    fn test_nfo_adc_identify_and_delta() {
        let mut hub = testutil::modern_session(test_config());
        hub.session.dialect = Dialect::Modern {
            phase: AdcPhase::Identify,
            sid: 1091,
        };
        hub.session.nick = "tester".into();
        hub.session.nick_raw = b"tester".to_vec();
        let frame = hub.session.build_nfo(true).unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.starts_with("BINF ABCD "), "{}", text);
        assert!(text.contains(" ID"));
        assert!(text.contains(" PD"));
        assert!(text.contains(" NItester"));
        assert!(text.contains(" SL2"));

        // validated, only the changed field goes out on the next tick
        hub.session.dialect = Dialect::Modern {
            phase: AdcPhase::Normal,
            sid: 1091,
        };
        hub.session.nick_valid = true;
        assert!(hub.session.build_nfo(false).is_none());
        hub.rt.config.write().unwrap().slots = 5;
        let delta = String::from_utf8(hub.session.build_nfo(false).unwrap()).unwrap();
        assert_eq!(delta, "BINF ABCD SL5");
    }
}
