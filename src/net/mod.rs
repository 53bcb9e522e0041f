//! Delimiter-framed duplex transport.
//!
//! Reads delimiter-terminated command frames and writes either command
//! frames or raw file byte ranges streamed from disk. The read and
//! write sides run concurrently, so a long upload never blocks command
//! processing. Errors surface as events tagged with the phase they
//! occurred in; a deliberate disconnect is silent and lets queued
//! writes drain before the socket closes.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Hard cap on a single command frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Chunk size for streaming file ranges from disk.
const FILE_CHUNK: usize = 64 * 1024;

/// Which operation an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Receive,
    Send,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connect => write!(f, "connect"),
            Phase::Receive => write!(f, "receive"),
            Phase::Send => write!(f, "send"),
        }
    }
}

/// Transport error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// The operation was cancelled by a local disconnect. Never
    /// user-visible.
    Cancelled,
    /// The peer closed the connection.
    Closed,
    /// A command frame exceeded [`MAX_FRAME_LEN`].
    FrameTooLong,
    Io(String),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Cancelled => write!(f, "cancelled"),
            NetError::Closed => write!(f, "connection closed"),
            NetError::FrameTooLong => write!(f, "command exceeds {} bytes", MAX_FRAME_LEN),
            NetError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NetError {}

/// Events delivered to the owner of a [`Conn`].
#[derive(Debug)]
pub enum NetEvent {
    /// The socket is up (outbound connect completed, or an accepted
    /// socket was attached).
    Connected { remote: Option<SocketAddr> },
    /// One complete command frame, delimiter stripped.
    Command(Vec<u8>),
    Error { phase: Phase, error: NetError },
}

enum WriteReq {
    Cmd(Vec<u8>),
    Raw(Vec<u8>),
    File { path: PathBuf, offset: u64, len: u64 },
}

struct Active {
    write_tx: mpsc::UnboundedSender<WriteReq>,
    reader: JoinHandle<()>,
}

/// A framed connection. Dropping it cancels the reader and lets any
/// queued writes drain.
pub struct Conn {
    delim: u8,
    event_tx: mpsc::UnboundedSender<NetEvent>,
    file_left: Arc<AtomicU64>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    closed: Arc<AtomicBool>,
    active: Option<Active>,
}

impl Conn {
    /// Create an unconnected transport with the given frame delimiter
    /// (`|` for the legacy protocol, `\n` for the modern one).
    pub fn new(delim: u8) -> (Conn, mpsc::UnboundedReceiver<NetEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Conn {
                delim,
                event_tx,
                file_left: Arc::new(AtomicU64::new(0)),
                remote: Arc::new(Mutex::new(None)),
                closed: Arc::new(AtomicBool::new(false)),
                active: None,
            },
            event_rx,
        )
    }

    /// Change the frame delimiter. Takes effect on the next connect.
    pub fn set_delim(&mut self, delim: u8) {
        self.delim = delim;
    }

    /// Resolve `hostname[:port]` and connect. Completion or failure is
    /// reported through the event channel.
    pub fn connect(&mut self, addr: &str, default_port: u16) {
        self.disconnect();
        self.closed.store(false, Ordering::SeqCst);

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let addr = addr.to_string();
        let delim = self.delim;
        let tx = self.event_tx.clone();
        let file_left = self.file_left.clone();
        let remote = self.remote.clone();
        let closed = self.closed.clone();

        let reader = tokio::spawn(async move {
            let (host, port) = match split_addr(&addr, default_port) {
                Ok(hp) => hp,
                Err(e) => {
                    let _ = tx.send(NetEvent::Error {
                        phase: Phase::Connect,
                        error: NetError::Io(e),
                    });
                    return;
                }
            };
            let stream = match TcpStream::connect((host.as_str(), port)).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(NetEvent::Error {
                        phase: Phase::Connect,
                        error: NetError::Io(e.to_string()),
                    });
                    return;
                }
            };
            run_stream(stream, delim, tx, write_rx, file_left, remote, closed).await;
        });

        self.active = Some(Active { write_tx, reader });
    }

    /// Adopt an already-accepted socket (incoming peer connections).
    pub fn attach(&mut self, stream: TcpStream) {
        self.disconnect();
        self.closed.store(false, Ordering::SeqCst);

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let delim = self.delim;
        let tx = self.event_tx.clone();
        let file_left = self.file_left.clone();
        let remote = self.remote.clone();
        let closed = self.closed.clone();

        let reader = tokio::spawn(async move {
            run_stream(stream, delim, tx, write_rx, file_left, remote, closed).await;
        });
        self.active = Some(Active { write_tx, reader });
    }

    /// Enqueue a command frame; the delimiter is appended here.
    pub fn send(&self, cmd: impl Into<Vec<u8>>) {
        let cmd = cmd.into();
        trace!(len = cmd.len(), "send command");
        if let Some(active) = &self.active {
            let _ = active.write_tx.send(WriteReq::Cmd(cmd));
        }
    }

    /// Enqueue raw bytes without a delimiter.
    pub fn send_raw(&self, bytes: impl Into<Vec<u8>>) {
        if let Some(active) = &self.active {
            let _ = active.write_tx.send(WriteReq::Raw(bytes.into()));
        }
    }

    /// Stream `len` bytes of a file starting at `offset`, then return
    /// to command output. The remaining byte count is visible through
    /// [`Conn::file_left`] as soon as this returns.
    pub fn send_file(&self, path: PathBuf, offset: u64, len: u64) {
        if let Some(active) = &self.active {
            self.file_left.store(len, Ordering::SeqCst);
            let _ = active.write_tx.send(WriteReq::File { path, offset, len });
        }
    }

    /// Close the connection. Idempotent; queued writes drain in the
    /// background, the reader stops immediately and silently.
    pub fn disconnect(&mut self) {
        if let Some(active) = self.active.take() {
            self.closed.store(true, Ordering::SeqCst);
            active.reader.abort();
            // dropping write_tx lets the writer drain and exit
            drop(active.write_tx);
        }
        self.file_left.store(0, Ordering::SeqCst);
        *self.remote.lock().unwrap() = None;
    }

    /// Remaining bytes of the file range currently being streamed.
    /// Shared with the slot-admission policy.
    pub fn file_left(&self) -> Arc<AtomicU64> {
        self.file_left.clone()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some() && self.remote_addr().is_some()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Split `host[:port]`, falling back to the default port.
fn split_addr(addr: &str, default_port: u16) -> Result<(String, u16), String> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port
                .parse()
                .map_err(|_| format!("invalid port in address {:?}", addr))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((addr.to_string(), default_port)),
    }
}

/// Extract complete frames from the inbound buffer. Returns an error
/// when the unterminated tail exceeds the frame cap.
fn split_frames(buf: &mut Vec<u8>, delim: u8) -> Result<Vec<Vec<u8>>, NetError> {
    let mut frames = Vec::new();
    let mut start = 0;
    while let Some(pos) = buf[start..].iter().position(|&b| b == delim) {
        let frame = buf[start..start + pos].to_vec();
        start += pos + 1;
        if frame.len() > MAX_FRAME_LEN {
            buf.drain(..start);
            return Err(NetError::FrameTooLong);
        }
        frames.push(frame);
    }
    buf.drain(..start);
    if buf.len() > MAX_FRAME_LEN {
        buf.clear();
        return Err(NetError::FrameTooLong);
    }
    Ok(frames)
}

async fn run_stream(
    stream: TcpStream,
    delim: u8,
    tx: mpsc::UnboundedSender<NetEvent>,
    write_rx: mpsc::UnboundedReceiver<WriteReq>,
    file_left: Arc<AtomicU64>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    closed: Arc<AtomicBool>,
) {
    let peer = stream.peer_addr().ok();
    *remote.lock().unwrap() = peer;
    let _ = tx.send(NetEvent::Connected { remote: peer });

    let (rd, wr) = stream.into_split();
    // the writer survives a reader abort so queued replies can drain
    tokio::spawn(writer_loop(
        wr,
        delim,
        write_rx,
        file_left,
        tx.clone(),
        closed.clone(),
    ));
    reader_loop(rd, delim, tx, closed).await;
}

async fn reader_loop(
    mut rd: OwnedReadHalf,
    delim: u8,
    tx: mpsc::UnboundedSender<NetEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut buf: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    loop {
        let error = match rd.read(&mut chunk).await {
            Ok(0) => NetError::Closed,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                match split_frames(&mut buf, delim) {
                    Ok(frames) => {
                        for frame in frames {
                            let _ = tx.send(NetEvent::Command(frame));
                        }
                        continue;
                    }
                    Err(e) => e,
                }
            }
            Err(e) => NetError::Io(e.to_string()),
        };
        if !closed.load(Ordering::SeqCst) {
            let _ = tx.send(NetEvent::Error {
                phase: Phase::Receive,
                error,
            });
        }
        return;
    }
}

async fn writer_loop(
    mut wr: OwnedWriteHalf,
    delim: u8,
    mut rx: mpsc::UnboundedReceiver<WriteReq>,
    file_left: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<NetEvent>,
    closed: Arc<AtomicBool>,
) {
    while let Some(req) = rx.recv().await {
        let res = match req {
            WriteReq::Cmd(mut cmd) => {
                cmd.push(delim);
                wr.write_all(&cmd).await
            }
            WriteReq::Raw(bytes) => wr.write_all(&bytes).await,
            WriteReq::File { path, offset, len } => {
                stream_file(&mut wr, &path, offset, len, &file_left).await
            }
        };
        if let Err(e) = res {
            file_left.store(0, Ordering::SeqCst);
            if !closed.load(Ordering::SeqCst) {
                let _ = tx.send(NetEvent::Error {
                    phase: Phase::Send,
                    error: NetError::Io(e.to_string()),
                });
            }
            return;
        }
    }
    let _ = wr.shutdown().await;
}

async fn stream_file(
    wr: &mut OwnedWriteHalf,
    path: &PathBuf,
    offset: u64,
    len: u64,
    file_left: &AtomicU64,
) -> std::io::Result<()> {
    let result = async {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut left = len;
        let mut chunk = vec![0u8; FILE_CHUNK];
        while left > 0 {
            let want = left.min(FILE_CHUNK as u64) as usize;
            let n = file.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file shrank during upload",
                ));
            }
            wr.write_all(&chunk[..n]).await?;
            left -= n as u64;
            file_left.store(left, Ordering::SeqCst);
        }
        Ok(())
    }
    .await;
    file_left.store(0, Ordering::SeqCst);
    result
}

/// Fire one UDP datagram at `ip:port` (search replies).
pub async fn udp_send(addr: &str, data: &[u8]) {
    let sock = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "could not bind UDP socket");
            return;
        }
    };
    if let Err(e) = sock.send_to(data, addr).await {
        debug!(error = %e, addr, "UDP send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_split_frames() {
        let mut buf = b"$Hello a|$Quit b|partial".to_vec();
        let frames = split_frames(&mut buf, b'|').unwrap();
        assert_eq!(frames, vec![b"$Hello a".to_vec(), b"$Quit b".to_vec()]);
        assert_eq!(buf, b"partial".to_vec());
        buf.extend_from_slice(b" done|");
        let frames = split_frames(&mut buf, b'|').unwrap();
        assert_eq!(frames, vec![b"partial done".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_frames_empty_and_cap() {
        let mut buf = b"||x|".to_vec();
        let frames = split_frames(&mut buf, b'|').unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_empty());

        let mut big = vec![b'a'; MAX_FRAME_LEN + 1];
        big.push(b'|');
        assert_eq!(split_frames(&mut big, b'|'), Err(NetError::FrameTooLong));

        // unterminated oversized tail is also an error
        let mut tail = vec![b'a'; MAX_FRAME_LEN + 1];
        assert_eq!(split_frames(&mut tail, b'|'), Err(NetError::FrameTooLong));
    }

    #[test]
    fn test_split_addr() {
        assert_eq!(
            split_addr("hub.example.com", 411).unwrap(),
            ("hub.example.com".to_string(), 411)
        );
        assert_eq!(
            split_addr("hub.example.com:500", 411).unwrap(),
            ("hub.example.com".to_string(), 500)
        );
        assert!(split_addr("host:notaport", 411).is_err());
    }

    #[tokio::test]
    async fn test_connect_and_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (mut conn, mut events) = Conn::new(b'|');
        conn.connect(&addr.to_string(), 411);

        let (mut server, _) = listener.accept().await.unwrap();
        match events.recv().await.unwrap() {
            NetEvent::Connected { .. } => {}
            other => panic!("expected Connected, got {:?}", other),
        }

        server.write_all(b"$Lock abc Pk=x|$Hel").await.unwrap();
        match events.recv().await.unwrap() {
            NetEvent::Command(frame) => assert_eq!(frame, b"$Lock abc Pk=x".to_vec()),
            other => panic!("expected Command, got {:?}", other),
        }
        server.write_all(b"lo me|").await.unwrap();
        match events.recv().await.unwrap() {
            NetEvent::Command(frame) => assert_eq!(frame, b"$Hello me".to_vec()),
            other => panic!("expected Command, got {:?}", other),
        }

        // outbound command gets the delimiter appended
        conn.send(b"$Key xyz".to_vec());
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$Key xyz|");

        // peer close surfaces as a receive error
        drop(server);
        match events.recv().await.unwrap() {
            NetEvent::Error { phase: Phase::Receive, error } => {
                assert!(matches!(error, NetError::Closed | NetError::Io(_)));
            }
            other => panic!("expected receive error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_file_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut conn, mut events) = Conn::new(b'|');
        conn.connect(&addr.to_string(), 0);
        let (mut server, _) = listener.accept().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            NetEvent::Connected { .. }
        ));

        let file_left = conn.file_left();
        conn.send(b"$ADCSND file x 100 50".to_vec());
        conn.send_file(path.clone(), 100, 50);

        let mut got = Vec::new();
        let expected_len = b"$ADCSND file x 100 50|".len() + 50;
        let mut buf = [0u8; 1024];
        while got.len() < expected_len {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got[..22], b"$ADCSND file x 100 50|");
        assert_eq!(&got[22..], &data[100..150]);
        // stream finished, no slot held any more
        assert_eq!(file_left.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut conn, mut events) = Conn::new(b'|');
        conn.connect(&addr.to_string(), 0);
        let (_server, _) = listener.accept().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            NetEvent::Connected { .. }
        ));

        conn.disconnect();
        conn.disconnect(); // idempotent

        // no error events arrive after a local disconnect
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }
}
