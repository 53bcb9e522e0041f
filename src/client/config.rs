//! Client configuration.
//!
//! A plain struct with builder methods; parsing a config file is the
//! front end's business. Per-hub entries override the global strings
//! and carry the hub address and encoding.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// TLS policy for peer connections. The TLS provider itself is an
/// external collaborator; this only records the operator's choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    Disabled,
    Allow,
    Force,
}

/// Per-hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// `dchub://host:port/`, `adc://host:port/`, or bare `host[:port]`.
    pub addr: String,
    pub nick: Option<String>,
    pub password: Option<String>,
    /// Encoding label for the legacy protocol, e.g. `windows-1252`.
    pub encoding: Option<String>,
    pub description: Option<String>,
    pub connection: Option<String>,
    pub email: Option<String>,
}

impl HubConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        HubConfig {
            addr: addr.into(),
            ..Default::default()
        }
    }
}

/// Global configuration.
#[derive(Clone)]
pub struct Config {
    pub nick: String,
    pub description: String,
    pub connection: String,
    pub email: String,
    /// Upload slots.
    pub slots: u32,
    pub download_dir: PathBuf,
    pub incoming_dir: PathBuf,
    /// Where the database and own file list live.
    pub state_dir: PathBuf,
    pub tls_policy: TlsPolicy,
    /// Long-term client identity, 39-char base32.
    pub cid: String,
    /// Private identity preimage, 39-char base32.
    pub pid: String,
    /// Address to advertise for direct connections; `None` when
    /// passive.
    pub active_ip: Option<String>,
    /// Listen port for direct connections; 0 when passive.
    pub active_port: u16,
    /// Shared directories: virtual top-level name to real path.
    pub shares: HashMap<String, PathBuf>,
    pub hubs: HashMap<String, HubConfig>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("nick", &self.nick)
            .field("slots", &self.slots)
            .field("state_dir", &self.state_dir)
            .field("tls_policy", &self.tls_policy)
            .field("cid", &self.cid)
            .field("pid", &"[REDACTED]")
            .field("active_ip", &self.active_ip)
            .field("active_port", &self.active_port)
            .field("hubs", &self.hubs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nick: String::new(),
            description: String::new(),
            connection: String::new(),
            email: String::new(),
            slots: 10,
            download_dir: PathBuf::from("dl"),
            incoming_dir: PathBuf::from("inc"),
            state_dir: PathBuf::from("."),
            tls_policy: TlsPolicy::Allow,
            cid: String::new(),
            pid: String::new(),
            active_ip: None,
            active_port: 0,
            shares: HashMap::new(),
            hubs: HashMap::new(),
        }
    }
}

impl Config {
    pub fn new(nick: impl Into<String>) -> Self {
        Config {
            nick: nick.into(),
            ..Default::default()
        }
    }

    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = dir;
        self
    }

    pub fn with_identity(mut self, cid: impl Into<String>, pid: impl Into<String>) -> Self {
        self.cid = cid.into();
        self.pid = pid.into();
        self
    }

    pub fn with_active(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.active_ip = Some(ip.into());
        self.active_port = port;
        self
    }

    pub fn with_hub(mut self, name: impl Into<String>, hub: HubConfig) -> Self {
        self.hubs.insert(name.into(), hub);
        self
    }

    pub fn with_share(mut self, name: impl Into<String>, dir: PathBuf) -> Self {
        self.shares.insert(name.into(), dir);
        self
    }

    /// Map a virtual path from the share tree onto the real
    /// filesystem via the configured share roots.
    pub fn local_path(&self, vpath: &str) -> Option<PathBuf> {
        let rel = vpath.trim_start_matches('/');
        let (top, rest) = rel.split_once('/').unwrap_or((rel, ""));
        let root = self.shares.get(top)?;
        if rest.is_empty() {
            Some(root.clone())
        } else {
            Some(root.join(rest))
        }
    }

    /// Small defaults for tests: two slots, identity filled in, no
    /// listen socket.
    pub fn for_testing() -> Self {
        Config {
            nick: "tester".into(),
            slots: 2,
            cid: "A".repeat(39),
            pid: "B".repeat(39),
            ..Default::default()
        }
    }

    pub fn hub(&self, name: &str) -> Option<&HubConfig> {
        self.hubs.get(name)
    }

    /// Per-hub nick, falling back to the global one.
    pub fn hub_nick(&self, name: &str) -> &str {
        self.hub(name)
            .and_then(|h| h.nick.as_deref())
            .unwrap_or(&self.nick)
    }

    pub fn hub_password(&self, name: &str) -> Option<&str> {
        self.hub(name).and_then(|h| h.password.as_deref())
    }

    /// Per-hub encoding label; UTF-8 when unset.
    pub fn hub_encoding(&self, name: &str) -> &str {
        self.hub(name)
            .and_then(|h| h.encoding.as_deref())
            .unwrap_or("utf-8")
    }

    pub fn hub_description(&self, name: &str) -> &str {
        self.hub(name)
            .and_then(|h| h.description.as_deref())
            .unwrap_or(&self.description)
    }

    pub fn hub_connection(&self, name: &str) -> &str {
        self.hub(name)
            .and_then(|h| h.connection.as_deref())
            .unwrap_or(&self.connection)
    }

    pub fn hub_email(&self, name: &str) -> &str {
        self.hub(name)
            .and_then(|h| h.email.as_deref())
            .unwrap_or(&self.email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_fallbacks() {
        let mut config = Config::new("me");
        config.description = "global desc".into();
        config.hubs.insert(
            "h1".into(),
            HubConfig {
                addr: "dchub://example:411/".into(),
                nick: Some("other".into()),
                encoding: Some("windows-1252".into()),
                ..Default::default()
            },
        );
        config.hubs.insert("h2".into(), HubConfig::new("adc://example:412/"));

        assert_eq!(config.hub_nick("h1"), "other");
        assert_eq!(config.hub_nick("h2"), "me");
        assert_eq!(config.hub_encoding("h1"), "windows-1252");
        assert_eq!(config.hub_encoding("h2"), "utf-8");
        assert_eq!(config.hub_description("h2"), "global desc");
        assert!(config.hub_password("h1").is_none());
    }

    #[test]
    fn test_local_path_mapping() {
        let config =
            Config::for_testing().with_share("music", PathBuf::from("/srv/media/music"));
        assert_eq!(
            config.local_path("/music/a/b.mp3"),
            Some(PathBuf::from("/srv/media/music/a/b.mp3"))
        );
        assert_eq!(
            config.local_path("music"),
            Some(PathBuf::from("/srv/media/music"))
        );
        assert_eq!(config.local_path("/video/x"), None);
    }

    #[test]
    fn test_debug_redacts_pid() {
        let config = Config::for_testing();
        let out = format!("{:?}", config);
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains(&"B".repeat(39)));
    }
}
