//! Hub roster and per-user records.
//!
//! Users are keyed by name bytes: the hub-encoded nick on the legacy
//! protocol, the UTF-8 nick on the modern one. Modern sessions keep a
//! secondary map from session id to name key.

use std::collections::HashMap;

/// Record carried for each peer visible on a hub.
#[derive(Debug, Clone, Default)]
pub struct HubUser {
    /// UTF-8 nick.
    pub name: String,
    /// Hub-encoded nick; identical to `name` on the modern protocol.
    pub name_raw: Vec<u8>,
    /// Session id (modern protocol only).
    pub sid: u32,
    /// Long-term client identity (modern protocol only).
    pub cid: Option<[u8; 24]>,
    /// Whether the advertisement record has been received yet.
    pub has_info: bool,
    pub is_op: bool,
    /// Reachable on a direct port.
    pub active: bool,
    pub hubs_normal: u32,
    pub hubs_registered: u32,
    pub hubs_op: u32,
    pub slots: u32,
    /// Auto-open an extra slot when the upload rate drops below this
    /// many bytes per second.
    pub auto_slot_bps: u32,
    pub description: Option<String>,
    pub connection: Option<String>,
    pub email: Option<String>,
    pub client: Option<String>,
    pub share_size: u64,
}

impl HubUser {
    /// Render the familiar `<client,M:x,H:n/r/o,S:n>` tag, or `None`
    /// when too little is known.
    pub fn tag(&self) -> Option<String> {
        let client = self.client.as_deref()?;
        if self.slots == 0 {
            return None;
        }
        let mut t = format!(
            "<{},M:{},H:{}/{}/{},S:{}",
            client,
            if self.active { 'A' } else { 'P' },
            self.hubs_normal,
            self.hubs_registered,
            self.hubs_op,
            self.slots
        );
        if self.auto_slot_bps > 0 {
            t.push_str(&format!(",O:{}", self.auto_slot_bps / 1024));
        }
        t.push('>');
        Some(t)
    }
}

/// The user list of one hub session.
#[derive(Debug, Default)]
pub struct Roster {
    users: HashMap<Vec<u8>, HubUser>,
    /// Modern protocol: session id to name key.
    sessions: HashMap<u32, Vec<u8>>,
}

impl Roster {
    pub fn new() -> Self {
        Roster::default()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&HubUser> {
        self.users.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut HubUser> {
        self.users.get_mut(key)
    }

    pub fn by_sid(&self, sid: u32) -> Option<&HubUser> {
        self.sessions.get(&sid).and_then(|key| self.users.get(key))
    }

    pub fn by_sid_mut(&mut self, sid: u32) -> Option<&mut HubUser> {
        let key = self.sessions.get(&sid)?.clone();
        self.users.get_mut(&key)
    }

    /// Insert a user if the key is new; returns whether it was added.
    pub fn add(&mut self, key: Vec<u8>, user: HubUser) -> bool {
        if self.users.contains_key(&key) {
            return false;
        }
        if user.sid != 0 {
            self.sessions.insert(user.sid, key.clone());
        }
        self.users.insert(key, user);
        true
    }

    /// Bind a session id to an existing user key.
    pub fn bind_sid(&mut self, sid: u32, key: Vec<u8>) {
        self.sessions.insert(sid, key);
    }

    /// Re-key a user after a modern-protocol nick change.
    pub fn rename(&mut self, old_key: &[u8], new_key: Vec<u8>) {
        if let Some(user) = self.users.remove(old_key) {
            if user.sid != 0 {
                self.sessions.insert(user.sid, new_key.clone());
            }
            self.users.insert(new_key, user);
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<HubUser> {
        let user = self.users.remove(key)?;
        if user.sid != 0 {
            self.sessions.remove(&user.sid);
        }
        Some(user)
    }

    pub fn remove_by_sid(&mut self, sid: u32) -> Option<HubUser> {
        let key = self.sessions.remove(&sid)?;
        self.users.remove(&key)
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.sessions.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &HubUser)> {
        self.users.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Vec<u8>, &mut HubUser)> {
        self.users.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut r = Roster::new();
        let u = HubUser {
            name: "alice".into(),
            name_raw: b"alice".to_vec(),
            ..Default::default()
        };
        assert!(r.add(b"alice".to_vec(), u.clone()));
        assert!(!r.add(b"alice".to_vec(), u));
        assert_eq!(r.len(), 1);
        assert_eq!(r.get(b"alice").unwrap().name, "alice");
    }

    #[test]
    fn test_sid_binding() {
        let mut r = Roster::new();
        let u = HubUser {
            name: "bob".into(),
            sid: 42,
            ..Default::default()
        };
        r.add(b"bob".to_vec(), u);
        assert_eq!(r.by_sid(42).unwrap().name, "bob");
        r.remove_by_sid(42);
        assert!(r.get(b"bob").is_none());
        assert!(r.by_sid(42).is_none());
    }

    #[test]
    fn test_rename_keeps_sid() {
        let mut r = Roster::new();
        let u = HubUser {
            name: "bob".into(),
            sid: 7,
            ..Default::default()
        };
        r.add(b"bob".to_vec(), u);
        r.rename(b"bob", b"robert".to_vec());
        assert!(r.get(b"bob").is_none());
        assert_eq!(r.by_sid(7).unwrap().name, "bob");
        assert!(r.get(b"robert").is_some());
    }

    #[test]
    fn test_tag_rendering() {
        let mut u = HubUser {
            client: Some("ncdc 1.0".into()),
            slots: 3,
            hubs_normal: 1,
            active: true,
            ..Default::default()
        };
        assert_eq!(u.tag().unwrap(), "<ncdc 1.0,M:A,H:1/0/0,S:3>");
        u.auto_slot_bps = 10 * 1024;
        assert_eq!(u.tag().unwrap(), "<ncdc 1.0,M:A,H:1/0/0,S:3,O:10>");
        u.client = None;
        assert!(u.tag().is_none());
    }
}
