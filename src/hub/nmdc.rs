//! Legacy dialect handlers.
//!
//! `|`-terminated frames, `$Cmd arg...` commands, chat as any frame
//! not starting with `$`. Values are hub-encoded; the session decodes
//! them at the edges. A malformed frame is logged and dropped; the
//! connection stays up.

use tracing::{debug, warn};

use crate::charset;
use crate::client::Priority;
use crate::share::{self, SearchQuery, SizeCond};
use crate::tth;
use super::lock;
use super::user::HubUser;
use super::{Dialect, HubAction, HubSession};

/// Extension whitelists for the numeric search types 2-7.
const SEARCH_EXTS: [&[&str]; 6] = [
    &["mp3", "mp2", "wav", "au", "rm", "mid", "sm"],
    &["zip", "arj", "rar", "lzh", "gz", "z", "arc", "pak"],
    &["doc", "txt", "wri", "pdf", "ps", "tex"],
    &["pm", "exe", "bat", "com"],
    &["gif", "jpg", "jpeg", "bmp", "pcx", "png", "wmf", "psd"],
    &["mpg", "mpeg", "avi", "asf", "mov"],
];

pub(crate) fn handle(hub: &mut HubSession, frame: &[u8]) -> Vec<HubAction> {
    if frame.is_empty() {
        return Vec::new();
    }
    if frame[0] != b'$' {
        // main chat
        let text = charset::unescape_and_decode(&hub.encoding, frame);
        return vec![HubAction::Chat {
            from: String::new(),
            text,
            private: false,
        }];
    }
    let (cmd, args) = first_word(frame);
    match cmd {
        b"$Lock" => handle_lock(hub, args),
        b"$Supports" => handle_supports(hub, args),
        b"$Hello" => handle_hello(hub, args),
        b"$Quit" => handle_quit(hub, args),
        b"$NickList" => handle_nicklist(hub, args),
        b"$OpList" => handle_oplist(hub, args),
        b"$MyINFO" => handle_myinfo(hub, args),
        b"$HubName" => handle_hubname(hub, args),
        b"$To:" => handle_to(hub, args),
        b"$ForceMove" => handle_forcemove(hub, args),
        b"$ConnectToMe" => handle_connecttome(hub, args),
        b"$RevConnectToMe" => handle_revconnecttome(hub, args),
        b"$Search" => handle_search(hub, args),
        b"$GetPass" => hub.password(None),
        b"$BadPass" => vec![
            HubAction::Notice {
                priority: Priority::Medium,
                text: "Wrong password. Fix the configured password and reconnect.".into(),
            },
            HubAction::Disconnect { reconnect: false },
        ],
        b"$ValidateDenide" => vec![
            HubAction::Notice {
                priority: Priority::Medium,
                text: "Username invalid or already taken.".into(),
            },
            HubAction::Disconnect { reconnect: true },
        ],
        b"$HubIsFull" => vec![
            HubAction::Notice {
                priority: Priority::Medium,
                text: "Hub is full.".into(),
            },
            HubAction::Disconnect { reconnect: true },
        ],
        _ => {
            debug!(hub = %hub.name, cmd = %String::from_utf8_lossy(cmd), "unknown command");
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake

fn handle_lock(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    let (challenge, _) = first_word(args);
    if challenge.is_empty() {
        warn!(hub = %hub.name, "empty $Lock challenge");
        return Vec::new();
    }
    if !lock::is_extended(challenge) {
        return vec![
            HubAction::Notice {
                priority: Priority::Medium,
                text: "Hub does not support the extended protocol.".into(),
            },
            HubAction::Disconnect { reconnect: false },
        ];
    }
    let Some(key) = lock::lock_to_key(challenge) else {
        return Vec::new();
    };
    let nick = hub
        .rt
        .config
        .read()
        .unwrap()
        .hub_nick(&hub.name)
        .to_string();
    hub.nick_raw = charset::encode(&hub.encoding, &nick);
    hub.nick = nick;

    let mut key_frame = b"$Key ".to_vec();
    key_frame.extend_from_slice(&key);
    let mut nick_frame = b"$ValidateNick ".to_vec();
    nick_frame.extend_from_slice(&hub.nick_raw);
    vec![
        HubAction::Send(b"$Supports NoGetINFO NoHello".to_vec()),
        HubAction::Send(key_frame),
        HubAction::Send(nick_frame),
    ]
}

fn handle_supports(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    if let Dialect::Legacy { supports_nogetinfo } = &mut hub.dialect {
        if contains_subslice(args, b"NoGetINFO") {
            *supports_nogetinfo = true;
        }
    }
    Vec::new()
}

fn handle_hello(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    let (nick, _) = first_word(args);
    if nick.is_empty() {
        return Vec::new();
    }
    if nick == hub.nick_raw.as_slice() {
        // some hubs send our $Hello twice; ignore the second one
        if hub.nick_valid {
            return Vec::new();
        }
        hub.nick_valid = true;
        let mut actions = vec![
            HubAction::Notice {
                priority: Priority::Low,
                text: "Nick validated.".into(),
            },
            HubAction::Send(b"$Version 1,0091".to_vec()),
        ];
        if let Some(nfo) = hub.build_nfo(false) {
            actions.push(HubAction::Send(nfo));
        }
        actions.push(HubAction::Send(b"$GetNickList".to_vec()));
        return actions;
    }
    let known = user_add(hub, nick);
    if !known && !nogetinfo(hub) {
        vec![HubAction::Send(getinfo_frame(hub, nick))]
    } else {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Roster

/// Add a user by raw nick if missing. Returns whether the user was
/// already known with its info record received.
fn user_add(hub: &mut HubSession, raw: &[u8]) -> bool {
    let mut roster = hub.roster.write().unwrap();
    if let Some(user) = roster.get(raw) {
        return user.has_info;
    }
    let user = HubUser {
        name: charset::decode(&hub.encoding, raw),
        name_raw: raw.to_vec(),
        ..Default::default()
    };
    roster.add(raw.to_vec(), user);
    false
}

fn nogetinfo(hub: &HubSession) -> bool {
    matches!(
        hub.dialect,
        Dialect::Legacy {
            supports_nogetinfo: true
        }
    )
}

fn getinfo_frame(hub: &HubSession, nick: &[u8]) -> Vec<u8> {
    let mut frame = b"$GetINFO ".to_vec();
    frame.extend_from_slice(nick);
    frame.push(b' ');
    frame.extend_from_slice(&hub.nick_raw);
    frame
}

fn handle_quit(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    let (nick, _) = first_word(args);
    let removed = hub.roster.write().unwrap().remove(nick);
    if let Some(user) = removed {
        if user.has_info {
            hub.share_count -= 1;
            hub.share_size_total -= user.share_size;
        }
    }
    Vec::new()
}

fn handle_nicklist(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    let mut actions = Vec::new();
    for nick in split_list(args) {
        let known = user_add(hub, nick);
        if !known && !nogetinfo(hub) {
            actions.push(HubAction::Send(getinfo_frame(hub, nick)));
        }
    }
    hub.received_first = true;
    actions
}

fn handle_oplist(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    let listed: Vec<Vec<u8>> = split_list(args).into_iter().map(<[u8]>::to_vec).collect();
    for nick in &listed {
        user_add(hub, nick);
    }
    {
        let mut roster = hub.roster.write().unwrap();
        for (key, user) in roster.iter_mut() {
            user.is_op = listed.iter().any(|n| n == key);
        }
    }
    hub.is_op = listed.iter().any(|n| n == &hub.nick_raw);
    hub.received_first = true;
    Vec::new()
}

fn handle_myinfo(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    // $MyINFO $ALL <nick> <payload>
    let (all, rest) = first_word(args);
    if all != b"$ALL" {
        warn!(hub = %hub.name, "malformed $MyINFO");
        return Vec::new();
    }
    let (nick, payload) = first_word(rest);
    if nick.is_empty() {
        return Vec::new();
    }
    user_add(hub, nick);
    let encoding = hub.encoding.clone();
    let (had_info, old_share, parsed, new_share) = {
        let mut roster = hub.roster.write().unwrap();
        let Some(user) = roster.get_mut(nick) else {
            return Vec::new();
        };
        let had_info = user.has_info;
        let old_share = user.share_size;
        let parsed = parse_myinfo(&encoding, user, payload);
        (had_info, old_share, parsed, user.share_size)
    };
    if parsed {
        if had_info {
            hub.share_size_total = hub.share_size_total - old_share + new_share;
        } else {
            hub.share_count += 1;
            hub.share_size_total += new_share;
        }
    }
    let roster_len = hub.roster.read().unwrap().len();
    if hub.received_first && !hub.join_complete && hub.share_count == roster_len {
        hub.join_complete = true;
    }
    Vec::new()
}

/// Parse the fixed-position `$MyINFO` payload
/// `<desc>$ $<connection><flag>$<email>$<share>$` into the user
/// record. Returns false (leaving the record untouched) on a
/// malformed payload.
pub(crate) fn parse_myinfo(encoding: &str, user: &mut HubUser, payload: &[u8]) -> bool {
    let Some(d1) = payload.iter().position(|&b| b == b'$') else {
        return false;
    };
    if payload.len() < d1 + 3 || payload[d1 + 2] != b'$' {
        return false;
    }
    let desc_part = &payload[..d1];
    let rest = &payload[d1 + 3..];

    let Some(d2) = rest.iter().position(|&b| b == b'$') else {
        return false;
    };
    let conn_flag = &rest[..d2];
    let rest = &rest[d2 + 1..];

    let Some(d3) = rest.iter().position(|&b| b == b'$') else {
        return false;
    };
    let mail = &rest[..d3];
    let rest = &rest[d3 + 1..];

    let Some(d4) = rest.iter().position(|&b| b == b'$') else {
        return false;
    };
    let share = parse_u64(&rest[..d4]);

    // <client,M:x,H:n/r/o,S:n,O:n> tag at the end of the description
    let (desc, tag) = match desc_part.last() {
        Some(b'>') => match desc_part.iter().rposition(|&b| b == b'<') {
            Some(open) => (&desc_part[..open], Some(&desc_part[open + 1..desc_part.len() - 1])),
            None => (desc_part, None),
        },
        _ => (desc_part, None),
    };

    let mut client = None;
    let mut active = false;
    let mut h_norm = 0;
    let mut h_reg = 0;
    let mut h_op = 0;
    let mut slots = 0;
    let mut auto_kib = 0;
    if let Some(tag) = tag {
        for (i, field) in tag.split(|&b| b == b',').enumerate() {
            if i == 0 {
                if !field.is_empty() {
                    client = Some(charset::decode(encoding, field));
                }
            } else if field == b"M:A" {
                active = true;
            } else if let Some(v) = field.strip_prefix(b"H:") {
                let mut it = v.split(|&b| b == b'/');
                h_norm = it.next().map(parse_u64).unwrap_or(0) as u32;
                h_reg = it.next().map(parse_u64).unwrap_or(0) as u32;
                h_op = it.next().map(parse_u64).unwrap_or(0) as u32;
            } else if let Some(v) = field.strip_prefix(b"S:") {
                slots = parse_u64(v) as u32;
            } else if let Some(v) = field.strip_prefix(b"O:") {
                auto_kib = parse_u64(v) as u32;
            }
        }
    }

    let desc = trim_spaces(desc);
    let conn = trim_spaces(strip_flag(conn_flag));
    let mail = trim_spaces(mail);

    user.share_size = share;
    user.description =
        (!desc.is_empty()).then(|| charset::unescape_and_decode(encoding, desc));
    user.client = client;
    user.connection = (!conn.is_empty()).then(|| charset::unescape_and_decode(encoding, conn));
    user.email = (!mail.is_empty()).then(|| charset::unescape_and_decode(encoding, mail));
    user.hubs_normal = h_norm;
    user.hubs_registered = h_reg;
    user.hubs_op = h_op;
    user.slots = slots;
    user.auto_slot_bps = auto_kib * 1024;
    user.active = active;
    user.has_info = true;
    true
}

fn handle_hubname(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    hub.hub_name_raw = Some(args.to_vec());
    hub.hub_name = Some(charset::unescape_and_decode(&hub.encoding, args));
    Vec::new()
}

// ---------------------------------------------------------------------------
// Chat and peer connections

fn handle_to(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    // <me> From: <other> $<msg>
    let (_to, rest) = first_word(args);
    let (from_kw, rest) = first_word(rest);
    if from_kw != b"From:" {
        return Vec::new();
    }
    let (from, rest) = first_word(rest);
    let Some(msg) = rest.strip_prefix(b"$") else {
        return Vec::new();
    };
    let name = match hub.roster.read().unwrap().get(from) {
        Some(user) => user.name.clone(),
        None => {
            warn!(hub = %hub.name, from = %String::from_utf8_lossy(from),
                "private message from someone not on this hub");
            return Vec::new();
        }
    };
    vec![HubAction::Chat {
        from: name,
        text: charset::unescape_and_decode(&hub.encoding, msg),
        private: true,
    }]
}

fn handle_forcemove(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    let addr = charset::unescape_and_decode(&hub.encoding, args);
    vec![
        HubAction::Notice {
            priority: Priority::High,
            text: format!("The hub is requesting you to move to {}.", addr),
        },
        HubAction::Disconnect { reconnect: false },
    ]
}

fn handle_connecttome(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    let (me, rest) = first_word(args);
    let (addr, _) = first_word(rest);
    if me != hub.nick_raw.as_slice() {
        warn!(hub = %hub.name, "received a $ConnectToMe for someone else");
        return Vec::new();
    }
    let Ok(addr) = std::str::from_utf8(addr) else {
        return Vec::new();
    };
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            vec![HubAction::OpenCc {
                addr: addr.to_string(),
            }]
        }
        _ => {
            warn!(hub = %hub.name, addr, "malformed $ConnectToMe address");
            Vec::new()
        }
    }
}

fn handle_revconnecttome(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    let (other, rest) = first_word(args);
    let (me, _) = first_word(rest);
    if me != hub.nick_raw.as_slice() {
        warn!(hub = %hub.name, "received a $RevConnectToMe for someone else");
        return Vec::new();
    }
    let Some((ip, port)) = hub.rt.listen_addr() else {
        debug!(hub = %hub.name, "got a $RevConnectToMe, but we are not active");
        return Vec::new();
    };
    let mut frame = b"$ConnectToMe ".to_vec();
    frame.extend_from_slice(other);
    frame.extend_from_slice(format!(" {}:{}", ip, port).as_bytes());
    vec![
        HubAction::Send(frame),
        HubAction::ExpectCc {
            nick_raw: other.to_vec(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Search

fn handle_search(hub: &mut HubSession, args: &[u8]) -> Vec<HubAction> {
    let (from, rest) = first_word(args);
    if from.is_empty() || rest.is_empty() {
        return Vec::new();
    }
    let parts = splitn_byte(rest, b'?', 5);
    if parts.len() != 5 {
        warn!(hub = %hub.name, "malformed $Search");
        return Vec::new();
    }
    let (restrict, ismax, size, ty, query) =
        (parts[0], parts[1], parts[2], parts[3], parts[4]);
    if !matches!(restrict, b"T" | b"F")
        || !matches!(ismax, b"T" | b"F")
        || ty.len() != 1
        || !(b'1'..=b'9').contains(&ty[0])
    {
        warn!(hub = %hub.name, "malformed $Search");
        return Vec::new();
    }
    let ty = ty[0] - b'0';
    let from_hub = from.starts_with(b"Hub:");
    let max = if from_hub { 5 } else { 10 };

    let mut q = SearchQuery::new(Vec::new());
    q.size = if restrict == b"F" {
        SizeCond::Any
    } else if ismax == b"T" {
        SizeCond::Less(parse_u64(size))
    } else {
        SizeCond::Greater(parse_u64(size))
    };
    q.want_files = ty != 8;
    q.want_dirs = ty == 1 || ty == 8;
    if (2..=7).contains(&ty) {
        q.exts = SEARCH_EXTS[ty as usize - 2]
            .iter()
            .map(|s| s.to_string())
            .collect();
    }

    let share = hub.rt.share.read().unwrap();
    let results = if ty == 9 {
        // TTH lookup through the index
        let root = match query.strip_prefix(b"TTH:") {
            Some(b32) if b32.len() == 39 => {
                std::str::from_utf8(b32).ok().and_then(tth::base32_decode)
            }
            _ => None,
        };
        let Some(root) = root else {
            warn!(hub = %hub.name, "invalid TTH $Search");
            return Vec::new();
        };
        share
            .from_tth(&root)
            .iter()
            .copied()
            .filter(|&id| share::node_matches(&share, id, &q, &[]))
            .take(max)
            .collect()
    } else {
        let spaced: Vec<u8> = query
            .iter()
            .map(|&b| if b == b'$' { b' ' } else { b })
            .collect();
        let text = charset::unescape_and_decode(&hub.encoding, &spaced);
        q.terms = text.split_whitespace().map(str::to_string).collect();
        share::search(&share, share.root(), &q, max)
    };
    if results.is_empty() {
        return Vec::new();
    }

    let Some(remote) = hub.remote else {
        return Vec::new();
    };
    let hub_addr = remote.to_string();
    let slots = hub.rt.slots();
    let free = slots.saturating_sub(hub.rt.ccs.slots_in_use() as u32);
    let hub_name_raw = hub
        .hub_name_raw
        .clone()
        .unwrap_or_else(|| hub.name.clone().into_bytes());

    let mut actions = Vec::new();
    for id in results {
        let node = share.node(id);
        let path = share.path(id);
        let path = path.trim_start_matches('/').replace('/', "\\");

        let mut frame = b"$SR ".to_vec();
        frame.extend_from_slice(&hub.nick_raw);
        frame.push(b' ');
        frame.extend_from_slice(&charset::encode_and_escape(&hub.encoding, &path));
        if node.is_file() {
            frame.push(0x05);
            frame.extend_from_slice(node.size.to_string().as_bytes());
        }
        frame.extend_from_slice(format!(" {}/{}", free, slots).as_bytes());
        frame.push(0x05);
        match node.tth() {
            Some(root) if node.is_file() => {
                frame.extend_from_slice(b"TTH:");
                frame.extend_from_slice(tth::base32_encode(root).as_bytes());
            }
            _ => frame.extend_from_slice(&hub_name_raw),
        }
        frame.extend_from_slice(b" (");
        frame.extend_from_slice(hub_addr.as_bytes());
        frame.push(b')');

        if from_hub {
            frame.push(0x05);
            frame.extend_from_slice(&from[4..]);
            actions.push(HubAction::Send(frame));
        } else {
            frame.push(b'|');
            actions.push(HubAction::SendUdp {
                addr: String::from_utf8_lossy(from).into_owned(),
                frame,
            });
        }
    }
    actions
}

// ---------------------------------------------------------------------------
// Byte-slice helpers

/// Split at the first space; the rest has the space stripped.
fn first_word(bytes: &[u8]) -> (&[u8], &[u8]) {
    match bytes.iter().position(|&b| b == b' ') {
        Some(pos) => (&bytes[..pos], &bytes[pos + 1..]),
        None => (bytes, &[]),
    }
}

/// Split a `$$`-separated name list, skipping empty entries.
fn split_list(bytes: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'$' {
            if i > start {
                out.push(&bytes[start..i]);
            }
            start = i + 2;
            i += 2;
        } else {
            i += 1;
        }
    }
    if start < bytes.len() {
        out.push(&bytes[start..]);
    }
    out
}

fn splitn_byte(bytes: &[u8], sep: u8, n: usize) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut rest = bytes;
    while out.len() + 1 < n {
        match rest.iter().position(|&b| b == sep) {
            Some(pos) => {
                out.push(&rest[..pos]);
                rest = &rest[pos + 1..];
            }
            None => break,
        }
    }
    out.push(rest);
    out
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Parse leading ASCII digits, ignoring anything after them.
fn parse_u64(bytes: &[u8]) -> u64 {
    let end = bytes
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn trim_spaces(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != b' ').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&b| b != b' ').map_or(start, |e| e + 1);
    &bytes[start..end]
}

/// Drop the status-flag byte that trails the connection string.
fn strip_flag(conn_flag: &[u8]) -> &[u8] {
    match conn_flag.len() {
        0 => conn_flag,
        n => &conn_flag[..n - 1],
    }
}
