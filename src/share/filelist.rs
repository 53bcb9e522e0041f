//! XML file-list persistence.
//!
//! `<FileListing Version="1" Generator=... CID=... Base=...>` with
//! nested `<Directory Name=... [Incomplete="1"]>` elements and
//! self-closing `<File Name=... Size=... TTH=.../>` leaves. Lists are
//! written to a temporary file and renamed into place; `.bz2` lists
//! are bzip2-compressed and loading also tolerates gzip. A `<File>`
//! that is not self-closing, a malformed size or TTH, a missing name
//! or stray text all abort the load.

use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use rand::Rng;

use crate::tth;
use super::tree::{FileNode, FileTree, NodeId, NodeKind};

/// Error loading or saving a file list.
#[derive(Debug, Clone)]
pub enum FileListError {
    Io(String),
    Parse(String),
}

impl fmt::Display for FileListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileListError::Io(e) => write!(f, "io error: {}", e),
            FileListError::Parse(e) => write!(f, "file list parse error: {}", e),
        }
    }
}

impl std::error::Error for FileListError {}

impl From<std::io::Error> for FileListError {
    fn from(e: std::io::Error) -> Self {
        FileListError::Io(e.to_string())
    }
}

impl From<quick_xml::Error> for FileListError {
    fn from(e: quick_xml::Error) -> Self {
        FileListError::Parse(e.to_string())
    }
}

fn parse_err(msg: impl Into<String>) -> FileListError {
    FileListError::Parse(msg.into())
}

// ---------------------------------------------------------------------------
// Writing

/// Serialize the subtree under `base` as an uncompressed file list.
pub fn write_list(
    tree: &FileTree,
    base: NodeId,
    cid: &str,
    out: &mut Vec<u8>,
) -> Result<(), FileListError> {
    let mut w = Writer::new_with_indent(out, b'\t', 1);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))?;

    let mut fl = BytesStart::new("FileListing");
    fl.push_attribute(("Version", "1"));
    let generator = format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    fl.push_attribute(("Generator", generator.as_str()));
    fl.push_attribute(("CID", cid));
    let base_path = tree.path(base);
    fl.push_attribute(("Base", base_path.as_str()));
    w.write_event(Event::Start(fl))?;

    write_children(&mut w, tree, base)?;

    w.write_event(Event::End(BytesEnd::new("FileListing")))?;
    Ok(())
}

fn write_children(
    w: &mut Writer<&mut Vec<u8>>,
    tree: &FileTree,
    dir: NodeId,
) -> Result<(), FileListError> {
    for &id in tree.children(dir) {
        let node = tree.node(id);
        match &node.kind {
            NodeKind::File { tth: Some(root), .. } => {
                let mut el = BytesStart::new("File");
                el.push_attribute(("Name", node.name.as_str()));
                el.push_attribute(("Size", node.size.to_string().as_str()));
                el.push_attribute(("TTH", tth::base32_encode(root).as_str()));
                w.write_event(Event::Empty(el))?;
            }
            // unhashed files are not advertised
            NodeKind::File { tth: None, .. } => {}
            NodeKind::Dir { children, has_tth, incomplete } => {
                let mut el = BytesStart::new("Directory");
                el.push_attribute(("Name", node.name.as_str()));
                if *incomplete || *has_tth as usize != children.len() {
                    el.push_attribute(("Incomplete", "1"));
                }
                if children.is_empty() {
                    w.write_event(Event::Empty(el))?;
                } else {
                    w.write_event(Event::Start(el))?;
                    write_children(w, tree, id)?;
                    w.write_event(Event::End(BytesEnd::new("Directory")))?;
                }
            }
        }
    }
    Ok(())
}

/// Save the subtree under `base` to `path`, bzip2-compressed when the
/// file name ends in `.bz2`. The write goes to a temporary sibling
/// first and is renamed into place.
pub fn save(
    tree: &FileTree,
    base: NodeId,
    cid: &str,
    path: &Path,
) -> Result<(), FileListError> {
    let mut xml = Vec::new();
    write_list(tree, base, cid, &mut xml)?;

    let is_bz2 = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("bz2"))
        .unwrap_or(false);

    let tmp = path.with_file_name(format!(
        "{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("filelist"),
        rand::thread_rng().gen::<u32>()
    ));

    let result = (|| -> Result<(), FileListError> {
        let mut f = fs::File::create(&tmp)?;
        if is_bz2 {
            let mut enc = bzip2::write::BzEncoder::new(&mut f, bzip2::Compression::new(7));
            enc.write_all(&xml)?;
            enc.finish()?;
        } else {
            f.write_all(&xml)?;
        }
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

// ---------------------------------------------------------------------------
// Reading

/// Load a file list from disk, sniffing bzip2 and gzip compression.
pub fn load(path: &Path) -> Result<FileTree, FileListError> {
    let raw = fs::read(path)?;
    let xml = decompress(&raw)?;
    parse(&xml)
}

fn decompress(raw: &[u8]) -> Result<Vec<u8>, FileListError> {
    if raw.starts_with(b"BZh") {
        let mut out = Vec::new();
        bzip2::read::BzDecoder::new(raw).read_to_end(&mut out)?;
        Ok(out)
    } else if raw.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(raw).read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(raw.to_vec())
    }
}

/// Parse an uncompressed file list into a fresh tree.
pub fn parse(xml: &[u8]) -> Result<FileTree, FileListError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut tree = FileTree::new();
    let mut stack: Vec<NodeId> = vec![tree.root()];
    let mut have_listing = false;
    let mut closed = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Text(t) => {
                let text = t.unescape()?;
                if !text.trim().is_empty() {
                    return Err(parse_err("stray text content"));
                }
            }
            Event::CData(_) => return Err(parse_err("unexpected CDATA")),
            Event::Start(el) => match el.name().as_ref() {
                b"FileListing" => {
                    if have_listing {
                        return Err(parse_err("nested FileListing"));
                    }
                    have_listing = true;
                }
                b"Directory" => {
                    if !have_listing || closed {
                        return Err(parse_err("Directory outside FileListing"));
                    }
                    let id = open_directory(&mut tree, *stack.last().expect("stack"), &el)?;
                    stack.push(id);
                }
                b"File" => return Err(parse_err("File element is not self-closing")),
                other => {
                    return Err(parse_err(format!(
                        "unexpected element {}",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Empty(el) => match el.name().as_ref() {
                b"FileListing" => return Err(parse_err("empty FileListing")),
                b"Directory" => {
                    if !have_listing || closed {
                        return Err(parse_err("Directory outside FileListing"));
                    }
                    open_directory(&mut tree, *stack.last().expect("stack"), &el)?;
                }
                b"File" => {
                    if !have_listing || closed {
                        return Err(parse_err("File outside FileListing"));
                    }
                    add_file(&mut tree, *stack.last().expect("stack"), &el)?;
                }
                other => {
                    return Err(parse_err(format!(
                        "unexpected element {}",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::End(el) => match el.name().as_ref() {
                b"Directory" => {
                    if stack.len() <= 1 {
                        return Err(parse_err("unbalanced Directory close"));
                    }
                    stack.pop();
                }
                b"FileListing" => {
                    closed = true;
                }
                _ => {}
            },
            Event::Eof => break,
        }
        buf.clear();
    }

    if !have_listing || !closed {
        return Err(parse_err("truncated file list"));
    }
    Ok(tree)
}

fn attr_value(el: &BytesStart, key: &[u8]) -> Result<Option<String>, FileListError> {
    for attr in el.attributes() {
        let attr = attr.map_err(|e| parse_err(e.to_string()))?;
        if attr.key.as_ref() == key {
            let v = attr.unescape_value().map_err(|e| parse_err(e.to_string()))?;
            return Ok(Some(v.into_owned()));
        }
    }
    Ok(None)
}

fn open_directory(
    tree: &mut FileTree,
    parent: NodeId,
    el: &BytesStart,
) -> Result<NodeId, FileListError> {
    let name = attr_value(el, b"Name")?.ok_or_else(|| parse_err("Directory without Name"))?;
    let incomplete = match attr_value(el, b"Incomplete")?.as_deref() {
        None | Some("0") => false,
        Some("1") => true,
        Some(other) => return Err(parse_err(format!("bad Incomplete value {:?}", other))),
    };
    let mut node = FileNode::dir(name);
    if let NodeKind::Dir { incomplete: inc, .. } = &mut node.kind {
        *inc = incomplete;
    }
    tree.add(parent, node).map_err(|e| parse_err(e.to_string()))
}

fn add_file(tree: &mut FileTree, parent: NodeId, el: &BytesStart) -> Result<(), FileListError> {
    let name = attr_value(el, b"Name")?.ok_or_else(|| parse_err("File without Name"))?;
    let size_str = attr_value(el, b"Size")?.ok_or_else(|| parse_err("File without Size"))?;
    if size_str.is_empty() || !size_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(parse_err(format!("bad Size {:?}", size_str)));
    }
    let size: u64 = size_str
        .parse()
        .map_err(|_| parse_err(format!("bad Size {:?}", size_str)))?;
    let tth_str = attr_value(el, b"TTH")?.ok_or_else(|| parse_err("File without TTH"))?;
    let root = tth::base32_decode(&tth_str)
        .ok_or_else(|| parse_err(format!("bad TTH {:?}", tth_str)))?;
    tree.add(parent, FileNode::file(name, size, Some(root), 0))
        .map_err(|e| parse_err(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tth(seed: u8) -> [u8; 24] {
        [seed; 24]
    }

    fn sample() -> FileTree {
        let mut t = FileTree::new();
        let music = t.add(t.root(), FileNode::dir("music")).unwrap();
        t.add(music, FileNode::file("song.mp3", 1024, Some(tth(1)), 0))
            .unwrap();
        let sub = t.add(music, FileNode::dir("old & new")).unwrap();
        t.add(sub, FileNode::file("a \"quoted\" <file>", 7, Some(tth(2)), 0))
            .unwrap();
        t.add(t.root(), FileNode::dir("partial")).unwrap();
        t
    }

    fn structurally_equal(a: &FileTree, an: NodeId, b: &FileTree, bn: NodeId) -> bool {
        let na = a.node(an);
        let nb = b.node(bn);
        if na.name != nb.name || na.is_file() != nb.is_file() {
            return false;
        }
        if na.is_file() {
            return na.size == nb.size && na.tth() == nb.tth();
        }
        let ca = a.children(an);
        let cb = b.children(bn);
        ca.len() == cb.len()
            && ca
                .iter()
                .zip(cb.iter())
                .all(|(&x, &y)| structurally_equal(a, x, b, y))
    }

    #[test]
    fn test_roundtrip_in_memory() {
        let t = sample();
        let mut xml = Vec::new();
        write_list(&t, t.root(), &"A".repeat(39), &mut xml).unwrap();
        let loaded = parse(&xml).unwrap();
        assert!(structurally_equal(&t, t.root(), &loaded, loaded.root()));
    }

    #[test]
    fn test_roundtrip_bz2_file() {
        let t = sample();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files.xml.bz2");
        save(&t, t.root(), &"A".repeat(39), &path).unwrap();
        // compressed on disk
        let raw = std::fs::read(&path).unwrap();
        assert!(raw.starts_with(b"BZh"));
        let loaded = load(&path).unwrap();
        assert!(structurally_equal(&t, t.root(), &loaded, loaded.root()));
        // no leftover temp files
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_load_plain_and_gzip() {
        let t = sample();
        let mut xml = Vec::new();
        write_list(&t, t.root(), &"A".repeat(39), &mut xml).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("files.xml");
        std::fs::write(&plain, &xml).unwrap();
        assert!(load(&plain).is_ok());

        let gz_path = dir.path().join("files.xml.gz");
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&xml).unwrap();
        std::fs::write(&gz_path, enc.finish().unwrap()).unwrap();
        assert!(load(&gz_path).is_ok());
    }

    #[test]
    fn test_incomplete_attribute() {
        let xml = br#"<?xml version="1.0"?>
<FileListing Version="1" CID="X" Base="/">
  <Directory Name="a" Incomplete="1"/>
  <Directory Name="b" Incomplete="0"/>
</FileListing>"#;
        let t = parse(xml).unwrap();
        let a = t.child_by_name(t.root(), "a").unwrap();
        let b = t.child_by_name(t.root(), "b").unwrap();
        assert!(t.node(a).incomplete());
        assert!(!t.node(b).incomplete());

        let bad = br#"<FileListing><Directory Name="a" Incomplete="2"/></FileListing>"#;
        assert!(parse(bad).is_err());
    }

    #[test]
    fn test_rejects_malformed_lists() {
        // File not self-closing
        let bad = br#"<FileListing><File Name="x" Size="1" TTH="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"></File></FileListing>"#;
        assert!(parse(bad).is_err());
        // bad size
        let bad = br#"<FileListing><File Name="x" Size="1x" TTH="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"/></FileListing>"#;
        assert!(parse(bad).is_err());
        // bad TTH length
        let bad = br#"<FileListing><File Name="x" Size="1" TTH="AAAA"/></FileListing>"#;
        assert!(parse(bad).is_err());
        // missing name
        let bad = br#"<FileListing><File Size="1" TTH="AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"/></FileListing>"#;
        assert!(parse(bad).is_err());
        // stray text
        let bad = br#"<FileListing>hello</FileListing>"#;
        assert!(parse(bad).is_err());
        // truncated document
        let bad = br#"<FileListing><Directory Name="a">"#;
        assert!(parse(bad).is_err());
        // no FileListing at all
        assert!(parse(br#"<Other/>"#).is_err());
    }
}
