//! Modern dialect handlers.
//!
//! Newline-terminated UTF-8 frames: an addressing tag, a three-letter
//! command and space-separated parameters with `\s`/`\n`/`\\` escapes.
//! Session ids are 4 base32 characters carrying a 20-bit value.

use std::fmt;

use tracing::{debug, warn};

use crate::charset;
use crate::client::Priority;
use crate::tth;
use super::user::HubUser;
use super::{AdcPhase, Dialect, HubAction, HubSession};

const SID_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Render a 20-bit session id as its 4-character wire form.
pub fn sid_to_str(sid: u32) -> String {
    let mut out = String::with_capacity(4);
    for shift in [15u32, 10, 5, 0] {
        out.push(SID_ALPHABET[((sid >> shift) & 0x1f) as usize] as char);
    }
    out
}

/// Parse a 4-character session id.
pub fn sid_from_str(s: &str) -> Option<u32> {
    if s.len() != 4 {
        return None;
    }
    let mut sid = 0u32;
    for c in s.bytes() {
        let v = match c {
            b'A'..=b'Z' => c - b'A',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        sid = (sid << 5) | v as u32;
    }
    Some(sid)
}

/// Frame parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdcParseError {
    NotUtf8,
    TooShort,
    BadType(char),
    BadSid,
    BadEscape,
}

impl fmt::Display for AdcParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdcParseError::NotUtf8 => write!(f, "frame is not valid UTF-8"),
            AdcParseError::TooShort => write!(f, "frame too short"),
            AdcParseError::BadType(t) => write!(f, "unknown message type {:?}", t),
            AdcParseError::BadSid => write!(f, "malformed session id"),
            AdcParseError::BadEscape => write!(f, "invalid escape in parameter"),
        }
    }
}

impl std::error::Error for AdcParseError {}

/// A parsed frame: addressing tag, command token, source/target
/// session ids where the tag carries them, unescaped parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcFrame {
    pub kind: char,
    pub cmd: String,
    pub source: Option<u32>,
    pub target: Option<u32>,
    pub params: Vec<String>,
}

impl AdcFrame {
    /// First parameter starting with a two-letter key.
    pub fn field<'a>(&'a self, key: &str) -> Option<&'a str> {
        self.params
            .iter()
            .find_map(|p| p.strip_prefix(key))
    }
}

/// Parse one frame. Pure; dispatch happens on the returned tag.
pub fn parse_frame(frame: &[u8]) -> Result<AdcFrame, AdcParseError> {
    let text = std::str::from_utf8(frame).map_err(|_| AdcParseError::NotUtf8)?;
    let mut tokens = text.split(' ');
    let head = tokens.next().unwrap_or("");
    if head.len() != 4 {
        return Err(AdcParseError::TooShort);
    }
    let kind = head.chars().next().unwrap_or('?');
    if !matches!(kind, 'B' | 'I' | 'H' | 'D' | 'E' | 'F' | 'U') {
        return Err(AdcParseError::BadType(kind));
    }
    let cmd = head[1..].to_string();

    let mut source = None;
    let mut target = None;
    match kind {
        'B' | 'F' => {
            let sid = tokens.next().ok_or(AdcParseError::TooShort)?;
            source = Some(sid_from_str(sid).ok_or(AdcParseError::BadSid)?);
        }
        'D' | 'E' => {
            let sid = tokens.next().ok_or(AdcParseError::TooShort)?;
            source = Some(sid_from_str(sid).ok_or(AdcParseError::BadSid)?);
            let sid = tokens.next().ok_or(AdcParseError::TooShort)?;
            target = Some(sid_from_str(sid).ok_or(AdcParseError::BadSid)?);
        }
        _ => {}
    }

    let mut params = Vec::new();
    for token in tokens {
        params.push(charset::adc_unescape(token).map_err(|_| AdcParseError::BadEscape)?);
    }
    Ok(AdcFrame {
        kind,
        cmd,
        source,
        target,
        params,
    })
}

pub(crate) fn handle(hub: &mut HubSession, frame: &[u8]) -> Vec<HubAction> {
    if frame.is_empty() {
        return Vec::new();
    }
    let parsed = match parse_frame(frame) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(hub = %hub.name, error = %e, frame = %String::from_utf8_lossy(frame),
                "dropping malformed frame");
            return Vec::new();
        }
    };
    match (parsed.kind, parsed.cmd.as_str()) {
        ('I', "SID") => handle_sid(hub, &parsed),
        ('I', "INF") => handle_hub_inf(hub, &parsed),
        ('B', "INF") => handle_user_inf(hub, &parsed),
        ('I', "QUI") => handle_qui(hub, &parsed),
        ('I', "STA") => handle_sta(hub, &parsed),
        ('B', "MSG") => handle_msg(hub, &parsed, false),
        ('E', "MSG") | ('D', "MSG") => handle_msg(hub, &parsed, true),
        ('I', "SUP") | ('I', "GPA") => Vec::new(),
        _ => {
            debug!(hub = %hub.name, kind = %parsed.kind, cmd = %parsed.cmd, "unhandled command");
            Vec::new()
        }
    }
}

fn handle_sid(hub: &mut HubSession, frame: &AdcFrame) -> Vec<HubAction> {
    let Dialect::Modern { phase, sid } = &mut hub.dialect else {
        return Vec::new();
    };
    if *phase != AdcPhase::Protocol || frame.params.len() != 1 {
        warn!(hub = %hub.name, "unexpected SID");
        return Vec::new();
    }
    let Some(new_sid) = sid_from_str(&frame.params[0]) else {
        warn!(hub = %hub.name, "malformed SID");
        return Vec::new();
    };
    *sid = new_sid;
    *phase = AdcPhase::Identify;
    hub.nick = hub
        .rt
        .config
        .read()
        .unwrap()
        .hub_nick(&hub.name)
        .to_string();
    hub.nick_raw = hub.nick.clone().into_bytes();
    // the identify-state advertisement is mandatory
    match hub.build_nfo(true) {
        Some(nfo) => vec![HubAction::Send(nfo)],
        None => Vec::new(),
    }
}

fn handle_hub_inf(hub: &mut HubSession, frame: &AdcFrame) -> Vec<HubAction> {
    // some hubs send two NI fields; the second one wins
    let names: Vec<&str> = frame
        .params
        .iter()
        .filter_map(|p| p.strip_prefix("NI"))
        .collect();
    let name = names.get(1).or_else(|| names.first());
    if let Some(name) = name {
        hub.hub_name = Some(name.to_string());
        hub.hub_name_raw = Some(name.as_bytes().to_vec());
    }
    if let Dialect::Modern { phase, .. } = &mut hub.dialect {
        if matches!(*phase, AdcPhase::Identify | AdcPhase::Verify) {
            *phase = AdcPhase::Normal;
            hub.nick_valid = true;
        }
    }
    Vec::new()
}

fn handle_user_inf(hub: &mut HubSession, frame: &AdcFrame) -> Vec<HubAction> {
    let Some(source) = frame.source else {
        return Vec::new();
    };
    let own_sid = match hub.dialect {
        Dialect::Modern { sid, .. } => sid,
        Dialect::Legacy { .. } => return Vec::new(),
    };

    let (had_info, old_share, new_share) = {
        let mut roster = hub.roster.write().unwrap();
        let key = match roster.by_sid(source) {
            Some(user) => user.name_raw.clone(),
            None => {
                let Some(nick) = frame.field("NI") else {
                    warn!(hub = %hub.name, sid = source, "INF for a user not on the hub");
                    return Vec::new();
                };
                let user = HubUser {
                    name: nick.to_string(),
                    name_raw: nick.as_bytes().to_vec(),
                    sid: source,
                    ..Default::default()
                };
                roster.add(nick.as_bytes().to_vec(), user);
                nick.as_bytes().to_vec()
            }
        };
        let Some(user) = roster.get_mut(&key) else {
            return Vec::new();
        };
        let had_info = user.has_info;
        let old_share = user.share_size;
        if user.sid == 0 {
            user.sid = source;
        }
        let rename = apply_inf_fields(user, frame);
        let new_share = user.share_size;
        if let Some(new_name) = rename {
            roster.bind_sid(source, new_name.as_bytes().to_vec());
            roster.rename(&key, new_name.into_bytes());
        } else {
            roster.bind_sid(source, key);
        }
        (had_info, old_share, new_share)
    };

    if had_info {
        hub.share_size_total = hub.share_size_total - old_share + new_share;
    } else {
        hub.share_count += 1;
        hub.share_size_total += new_share;
    }

    // our own INF closes the initial roster flush on its second pass
    if source == own_sid {
        hub.join_complete = hub.received_first;
        hub.received_first = true;
    }
    Vec::new()
}

/// Apply `BINF` fields to a user record. Returns the new nick when the
/// frame renames the user.
fn apply_inf_fields(user: &mut HubUser, frame: &AdcFrame) -> Option<String> {
    let mut rename = None;
    for param in &frame.params {
        if param.len() < 2 {
            continue;
        }
        let (key, value) = param.split_at(2);
        match key {
            "NI" => {
                if !value.is_empty() && value != user.name {
                    rename = Some(value.to_string());
                    user.name = value.to_string();
                    user.name_raw = value.as_bytes().to_vec();
                }
            }
            "DE" => user.description = (!value.is_empty()).then(|| value.to_string()),
            "VE" => user.client = (!value.is_empty()).then(|| value.to_string()),
            "EM" => user.email = (!value.is_empty()).then(|| value.to_string()),
            "ID" => {
                if value.len() == 39 {
                    user.cid = tth::base32_decode(value);
                }
            }
            "SS" => user.share_size = value.parse().unwrap_or(0),
            "HN" => user.hubs_normal = value.parse().unwrap_or(0),
            "HR" => user.hubs_registered = value.parse().unwrap_or(0),
            "HO" => user.hubs_op = value.parse().unwrap_or(0),
            "SL" => user.slots = value.parse().unwrap_or(0),
            "AS" => user.auto_slot_bps = value.parse().unwrap_or(0),
            "SU" => {
                user.active = value.split(',').any(|f| f == "TCP4" || f == "TCP6");
            }
            "CT" => user.is_op = value.parse::<u32>().unwrap_or(0) >= 4,
            _ => {}
        }
    }
    user.has_info = true;
    rename
}

fn handle_qui(hub: &mut HubSession, frame: &AdcFrame) -> Vec<HubAction> {
    let Some(sid) = frame.params.first().and_then(|p| sid_from_str(p)) else {
        warn!(hub = %hub.name, "malformed QUI");
        return Vec::new();
    };
    let own_sid = match hub.dialect {
        Dialect::Modern { sid, .. } => sid,
        Dialect::Legacy { .. } => return Vec::new(),
    };
    if sid == own_sid {
        return vec![HubAction::Disconnect { reconnect: true }];
    }
    let removed = hub.roster.write().unwrap().remove_by_sid(sid);
    match removed {
        Some(user) => {
            if user.has_info {
                hub.share_count -= 1;
                hub.share_size_total -= user.share_size;
            }
        }
        None => warn!(hub = %hub.name, sid, "QUI for a user not on the hub"),
    }
    Vec::new()
}

fn handle_sta(hub: &mut HubSession, frame: &AdcFrame) -> Vec<HubAction> {
    let (Some(code), Some(msg)) = (frame.params.first(), frame.params.get(1)) else {
        warn!(hub = %hub.name, "malformed STA");
        return Vec::new();
    };
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        warn!(hub = %hub.name, code = %code, "malformed STA code");
        return Vec::new();
    }
    match code.as_bytes()[0] {
        b'0' => vec![HubAction::Notice {
            priority: Priority::Low,
            text: msg.clone(),
        }],
        b'1' => vec![HubAction::Notice {
            priority: Priority::Medium,
            text: format!("Hub: {} ({})", msg, code),
        }],
        _ => vec![
            HubAction::Notice {
                priority: Priority::High,
                text: format!("Hub error: {} ({})", msg, code),
            },
            HubAction::Disconnect { reconnect: false },
        ],
    }
}

fn handle_msg(hub: &mut HubSession, frame: &AdcFrame, private: bool) -> Vec<HubAction> {
    let (Some(source), Some(text)) = (frame.source, frame.params.first()) else {
        return Vec::new();
    };
    let own_sid = match hub.dialect {
        Dialect::Modern { sid, .. } => sid,
        Dialect::Legacy { .. } => return Vec::new(),
    };
    if source == own_sid {
        // hubs echo broadcast chat back to the sender
        return Vec::new();
    }
    let name = match hub.roster.read().unwrap().by_sid(source) {
        Some(user) => user.name.clone(),
        None => {
            warn!(hub = %hub.name, sid = source, "MSG from a user not on the hub");
            return Vec::new();
        }
    };
    vec![HubAction::Chat {
        from: name,
        text: text.clone(),
        private,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Config, HubConfig};
    use crate::hub::testutil::{modern_session, TestHub};

    fn test_config() -> Config {
        Config::for_testing().with_hub("testhub", HubConfig::new("adc://hub.example:412/"))
    }

    fn identified(hub: &mut TestHub, sid: u32) {
        hub.session.dialect = Dialect::Modern {
            phase: AdcPhase::Normal,
            sid,
        };
        hub.session.nick = "tester".into();
        hub.session.nick_raw = b"tester".to_vec();
        hub.session.nick_valid = true;
    }

    #[test]
    fn test_sid_roundtrip() {
        assert_eq!(sid_from_str("AAAB"), Some(1));
        assert_eq!(sid_from_str("ABCD"), Some(1091));
        assert_eq!(sid_to_str(1091), "ABCD");
        for sid in [0u32, 1, 31, 32, 0xfffff] {
            assert_eq!(sid_from_str(&sid_to_str(sid)), Some(sid));
        }
        assert_eq!(sid_from_str("AB"), None);
        assert_eq!(sid_from_str("AB1D"), None);
    }

    #[test]
    fn test_parse_frame() {
        let frame = parse_frame(b"BINF ABCD NIalice VEncdc\\s1.0").unwrap();
        assert_eq!(frame.kind, 'B');
        assert_eq!(frame.cmd, "INF");
        assert_eq!(frame.source, Some(1091));
        assert_eq!(frame.params, vec!["NIalice", "VEncdc 1.0"]);

        let frame = parse_frame(b"ISTA 201 Too\\smany\\susers").unwrap();
        assert_eq!(frame.kind, 'I');
        assert!(frame.source.is_none());
        assert_eq!(frame.params[1], "Too many users");

        assert_eq!(parse_frame(b"XYZ"), Err(AdcParseError::TooShort));
        assert_eq!(parse_frame(b"ZINF ABCD"), Err(AdcParseError::BadType('Z')));
        assert_eq!(parse_frame(b"BINF A1CD"), Err(AdcParseError::BadSid));
        assert_eq!(
            parse_frame(b"BINF ABCD NIbad\\x"),
            Err(AdcParseError::BadEscape)
        );
        assert!(parse_frame(b"BINF \xff\xfe\xfd\xfc").is_err());
    }

    #[test]
    fn test_sid_adopts_and_sends_binf() {
        let mut hub = modern_session(test_config());
        let actions = handle(&mut hub.session, b"ISID ABCD");
        assert_eq!(
            hub.session.dialect,
            Dialect::Modern {
                phase: AdcPhase::Identify,
                sid: 1091
            }
        );
        assert_eq!(actions.len(), 1);
        let HubAction::Send(frame) = &actions[0] else {
            panic!("expected a BINF send");
        };
        let text = String::from_utf8(frame.clone()).unwrap();
        assert!(text.starts_with("BINF ABCD ID"), "{}", text);
        assert!(text.contains(" NItester"));
        // out-of-phase SID is ignored
        assert!(handle(&mut hub.session, b"ISID AAAB").is_empty());
    }

    #[test]
    fn test_hub_inf_validates_and_names() {
        let mut hub = modern_session(test_config());
        handle(&mut hub.session, b"ISID ABCD");
        handle(&mut hub.session, b"IINF CT32 NIFirst\\sName NISecond");
        // the second NI wins
        assert_eq!(hub.session.hub_name.as_deref(), Some("Second"));
        assert!(hub.session.nick_valid);
        assert_eq!(
            hub.session.dialect,
            Dialect::Modern {
                phase: AdcPhase::Normal,
                sid: 1091
            }
        );
    }

    #[test]
    fn test_binf_field_parsing() {
        let mut hub = modern_session(test_config());
        identified(&mut hub, 1);
        handle(
            &mut hub.session,
            b"BINF ABCD NIalice VEncdc\\s1.0 DEtest\\sdesc SS1234 SL2 HN1 HR0 HO0 SUTCP4,TCP6 CT4",
        );
        let roster = hub.session.roster.read().unwrap();
        let u = roster.by_sid(1091).unwrap();
        assert_eq!(u.name, "alice");
        assert_eq!(u.client.as_deref(), Some("ncdc 1.0"));
        assert_eq!(u.description.as_deref(), Some("test desc"));
        assert_eq!(u.share_size, 1234);
        assert_eq!(u.slots, 2);
        assert!(u.active);
        assert!(u.is_op);
    }

    #[test]
    fn test_binf_as_goes_to_auto_slot() {
        let mut hub = modern_session(test_config());
        identified(&mut hub, 1);
        handle(&mut hub.session, b"BINF ABCD NIalice SL3 AS65536");
        let roster = hub.session.roster.read().unwrap();
        let u = roster.by_sid(1091).unwrap();
        assert_eq!(u.slots, 3);
        assert_eq!(u.auto_slot_bps, 65536);
    }

    #[test]
    fn test_binf_aggregates_and_join_complete() {
        let mut hub = modern_session(test_config());
        identified(&mut hub, 1091);
        handle(&mut hub.session, b"BINF AAAB NIalice SS100");
        handle(&mut hub.session, b"BINF AAAC NIbob SS50");
        assert_eq!(hub.session.share_count, 2);
        assert_eq!(hub.session.share_size_total, 150);

        // first own INF ends the flush precondition, the second marks
        // the join complete
        handle(&mut hub.session, b"BINF ABCD NItester");
        assert!(hub.session.received_first);
        assert!(!hub.session.join_complete);
        handle(&mut hub.session, b"BINF ABCD NItester");
        assert!(hub.session.join_complete);
    }

    #[test]
    fn test_binf_cid_decoding() {
        let mut hub = modern_session(test_config());
        identified(&mut hub, 1);
        let cid = crate::tth::base32_encode(&[3u8; 24]);
        let frame = format!("BINF AAAB NIalice ID{}", cid);
        handle(&mut hub.session, frame.as_bytes());
        let roster = hub.session.roster.read().unwrap();
        assert_eq!(roster.by_sid(1).unwrap().cid, Some([3u8; 24]));
    }

    #[test]
    fn test_qui_removes_user() {
        let mut hub = modern_session(test_config());
        identified(&mut hub, 1091);
        handle(&mut hub.session, b"BINF AAAB NIalice SS100");
        handle(&mut hub.session, b"IQUI AAAB");
        assert_eq!(hub.session.share_count, 0);
        assert!(hub.session.roster.read().unwrap().by_sid(1).is_none());
    }

    #[test]
    fn test_qui_own_sid_disconnects() {
        let mut hub = modern_session(test_config());
        identified(&mut hub, 1091);
        let actions = handle(&mut hub.session, b"IQUI ABCD");
        assert_eq!(actions, vec![HubAction::Disconnect { reconnect: true }]);
    }

    #[test]
    fn test_sta_severities() {
        let mut hub = modern_session(test_config());
        identified(&mut hub, 1);
        let advisory = handle(&mut hub.session, b"ISTA 120 Slow\\sdown");
        assert_eq!(advisory.len(), 1);
        assert!(matches!(
            advisory[0],
            HubAction::Notice { priority: Priority::Medium, .. }
        ));

        let fatal = handle(&mut hub.session, b"ISTA 244 Banned");
        assert!(matches!(
            fatal.last(),
            Some(HubAction::Disconnect { reconnect: false })
        ));

        // malformed code is dropped quietly
        assert!(handle(&mut hub.session, b"ISTA 2x4 Banned").is_empty());
    }

    #[test]
    fn test_chat_messages() {
        let mut hub = modern_session(test_config());
        identified(&mut hub, 1091);
        handle(&mut hub.session, b"BINF AAAB NIalice");
        let actions = handle(&mut hub.session, b"BMSG AAAB hello\\sworld");
        assert_eq!(
            actions,
            vec![HubAction::Chat {
                from: "alice".into(),
                text: "hello world".into(),
                private: false,
            }]
        );
        let actions = handle(&mut hub.session, b"EMSG AAAB ABCD psst PMAAAB");
        assert!(matches!(
            &actions[0],
            HubAction::Chat { private: true, .. }
        ));
        // own echo is suppressed
        assert!(handle(&mut hub.session, b"BMSG ABCD echo").is_empty());
    }
}
