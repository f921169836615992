//! Monitoring sessions.
//!
//! A session tails one debugfs file and rebroadcasts its lines to whoever
//! connects to the session's own listening port. It ends when its source
//! stops being readable, when its last subscriber leaves, or at shutdown.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use stream_codec::{Codec, StreamBuffer};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::control::{BufferArgs, validate_file_name};
use crate::hub::{Endpoint, HubEvent, Origin};
use crate::net;
use crate::subscriber::{Collection, Mode, Subscriber, SubscriberId, Transport};

pub type SessionId = u64;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid argument")]
    InvalidFile,

    #[error("{source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// What a newly started session is reachable as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub port: u16,
    pub compressed: bool,
}

struct Session {
    file: String,
    port: u16,
    subscribers: Collection,
    buffer: Option<StreamBuffer>,
    joined: bool,
    _tasks: DropGuard,
}

impl Session {
    fn abandoned(&self) -> bool {
        self.joined && self.subscribers.is_empty()
    }
}

pub struct SessionManager {
    bind: IpAddr,
    send_queue: usize,
    events: mpsc::Sender<HubEvent>,
    sessions: BTreeMap<SessionId, Session>,
    next_id: SessionId,
}

impl SessionManager {
    pub fn new(bind: IpAddr, send_queue: usize, events: mpsc::Sender<HubEvent>) -> Self {
        Self {
            bind,
            send_queue,
            events,
            sessions: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn subscriber_count(&self, id: SessionId) -> Option<usize> {
        self.sessions.get(&id).map(|s| s.subscribers.len())
    }

    /// Start tailing `file` below `device_dir` and listen on `port`
    /// (0 picks a free port).
    pub fn start(
        &mut self,
        device_dir: &Path,
        file: &str,
        port: u16,
        compression: Option<BufferArgs>,
    ) -> Result<SessionInfo, SessionError> {
        validate_file_name(file).map_err(|_| SessionError::InvalidFile)?;

        let path = device_dir.join(file);
        let source = net::open_nonblocking(&path).map_err(|source| SessionError::Open {
            path: path.clone(),
            source,
        })?;

        let listener = net::bind(SocketAddr::new(self.bind, port))
            .map_err(|source| SessionError::Bind { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| SessionError::Bind { port, source })?
            .port();

        let id = self.next_id;
        self.next_id += 1;

        let cancel = CancellationToken::new();
        net::spawn_line_reader(
            net::EventSource::new(source),
            Origin::Session(id),
            self.events.clone(),
            cancel.clone(),
        );
        net::spawn_listener(
            listener,
            Endpoint::Session(id),
            self.send_queue,
            self.events.clone(),
            cancel.clone(),
        );

        let mode = match compression {
            Some(_) => Mode::Compressed,
            None => Mode::Plain,
        };
        self.sessions.insert(
            id,
            Session {
                file: file.to_string(),
                port,
                subscribers: Collection::new(mode),
                buffer: compression.map(|c| StreamBuffer::new(c.size, c.timeout)),
                joined: false,
                _tasks: cancel.drop_guard(),
            },
        );

        info!(session = id, file, port, %mode, "monitoring session started");
        Ok(SessionInfo {
            id,
            port,
            compressed: compression.is_some(),
        })
    }

    /// Attach a connection accepted on the session's port.
    pub fn accept(&mut self, id: SessionId, conn: SubscriberId, transport: Box<dyn Transport>) {
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!(session = id, conn_id = conn, "session gone, dropping connection");
            return;
        };
        let mode = session.subscribers.mode();
        session
            .subscribers
            .insert(Subscriber::new(conn, mode, transport));
        session.joined = true;
        debug!(session = id, conn_id = conn, "session subscriber joined");
    }

    pub fn subscriber_closed(&mut self, id: SessionId, conn: SubscriberId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.subscribers.remove(conn);
        }
        self.reap(id);
    }

    /// Forward one line read from the session's source.
    pub fn source_line(&mut self, id: SessionId, line: &str, codec: &mut Codec) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.subscribers.is_empty() {
            return;
        }

        let text = format!("{line}\n");
        match &mut session.buffer {
            Some(buffer) => {
                let _ = buffer.append(text.as_bytes(), codec, &mut session.subscribers);
            }
            None => {
                session.subscribers.fan_out(&Bytes::from(text));
            }
        }
        self.reap(id);
    }

    fn reap(&mut self, id: SessionId) {
        if self.sessions.get(&id).is_some_and(Session::abandoned) {
            self.teardown(id, "no subscribers left");
        }
    }

    /// Release everything a session owns. Safe to call for unknown ids.
    pub fn teardown(&mut self, id: SessionId, reason: &str) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            return false;
        };
        if let Some(buffer) = &mut session.buffer {
            buffer.cancel();
        }
        session.subscribers.clear();
        info!(session = id, file = %session.file, port = session.port, reason, "monitoring session stopped");
        true
    }

    pub fn stop_all(&mut self) {
        let ids: Vec<_> = self.sessions.keys().copied().collect();
        for id in ids {
            self.teardown(id, "shutdown");
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|s| s.buffer.as_ref().and_then(StreamBuffer::deadline))
            .min()
    }

    pub fn poll_expired(&mut self, now: Instant, codec: &mut Codec) {
        for session in self.sessions.values_mut() {
            if let Some(buffer) = &mut session.buffer {
                buffer.poll_expired(now, codec, &mut session.subscribers);
            }
        }

        let abandoned: Vec<_> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.abandoned())
            .map(|(&id, _)| id)
            .collect();
        for id in abandoned {
            self.teardown(id, "no subscribers left");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeDevices, RecordingTransport, codec, decompress_all};
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn manager() -> (SessionManager, mpsc::Receiver<HubEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (SessionManager::new("127.0.0.1".parse().unwrap(), 16, tx), rx)
    }

    async fn wait_refused(port: u16) {
        for _ in 0..100 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("port {port} still accepting");
    }

    #[tokio::test]
    async fn rejects_traversal_without_io() {
        let (mut sessions, _rx) = manager();
        let err = sessions
            .start(Path::new("/nonexistent"), "../secret", 0, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidFile));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn missing_source_reports_io_error() {
        let tree = FakeDevices::new();
        tree.add("phy0", "");
        let (mut sessions, _rx) = manager();
        let err = sessions
            .start(&tree.paths().device_dir("phy0"), "missing", 0, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::Open { .. }));
    }

    #[tokio::test]
    async fn ephemeral_port_is_reported() {
        let tree = FakeDevices::new();
        tree.add("phy0", "");
        tree.write_debugfs("phy0", "rc_stats", "");
        let (mut sessions, _rx) = manager();

        let info = sessions
            .start(&tree.paths().device_dir("phy0"), "rc_stats", 0, None)
            .unwrap();
        assert_ne!(info.port, 0);
        assert!(!info.compressed);
        assert!(TcpStream::connect(("127.0.0.1", info.port)).await.is_ok());
    }

    #[tokio::test]
    async fn bind_conflict_reports_error() {
        let tree = FakeDevices::new();
        tree.add("phy0", "");
        tree.write_debugfs("phy0", "rc_stats", "");
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let (mut sessions, _rx) = manager();

        let err = sessions
            .start(&tree.paths().device_dir("phy0"), "rc_stats", port, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::Bind { .. }));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn plain_lines_reach_subscribers() {
        let tree = FakeDevices::new();
        tree.add("phy0", "");
        tree.write_debugfs("phy0", "rc_stats", "");
        let (mut sessions, _rx) = manager();
        let mut codec = codec();
        let info = sessions
            .start(&tree.paths().device_dir("phy0"), "rc_stats", 0, None)
            .unwrap();

        sessions.source_line(info.id, "dropped before anyone joined", &mut codec);
        let t = RecordingTransport::new();
        sessions.accept(info.id, 1, Box::new(t.clone()));
        sessions.source_line(info.id, "rate;54", &mut codec);

        assert_eq!(t.text(), "rate;54\n");
        assert!(sessions.contains(info.id));
    }

    #[tokio::test]
    async fn compressed_session_batches() {
        let tree = FakeDevices::new();
        tree.add("phy0", "");
        tree.write_debugfs("phy0", "rc_stats", "");
        let (mut sessions, _rx) = manager();
        let mut codec = codec();
        let args = BufferArgs {
            size: 256,
            timeout: Duration::from_millis(50),
        };
        let info = sessions
            .start(&tree.paths().device_dir("phy0"), "rc_stats", 0, Some(args))
            .unwrap();
        assert!(info.compressed);

        let t = RecordingTransport::new();
        sessions.accept(info.id, 1, Box::new(t.clone()));
        sessions.source_line(info.id, "a", &mut codec);
        sessions.source_line(info.id, "b", &mut codec);
        assert!(t.frames().is_empty());

        let deadline = sessions.deadline().unwrap();
        sessions.poll_expired(deadline, &mut codec);
        assert_eq!(t.frames().len(), 1);
        assert_eq!(decompress_all(&t.frames()), "a\nb\n");
    }

    #[tokio::test]
    async fn last_subscriber_leaving_tears_down() {
        let tree = FakeDevices::new();
        tree.add("phy0", "");
        tree.write_debugfs("phy0", "rc_stats", "");
        let (mut sessions, _rx) = manager();
        let info = sessions
            .start(&tree.paths().device_dir("phy0"), "rc_stats", 0, None)
            .unwrap();

        let a = RecordingTransport::new();
        let b = RecordingTransport::new();
        sessions.accept(info.id, 1, Box::new(a.clone()));
        sessions.accept(info.id, 2, Box::new(b.clone()));

        sessions.subscriber_closed(info.id, 1);
        assert_eq!(sessions.subscriber_count(info.id), Some(1));

        sessions.subscriber_closed(info.id, 2);
        assert!(!sessions.contains(info.id));
        assert!(a.is_dropped() && b.is_dropped());
        wait_refused(info.port).await;
    }

    #[tokio::test]
    async fn write_failure_of_last_subscriber_tears_down() {
        let tree = FakeDevices::new();
        tree.add("phy0", "");
        tree.write_debugfs("phy0", "rc_stats", "");
        let (mut sessions, _rx) = manager();
        let mut codec = codec();
        let info = sessions
            .start(&tree.paths().device_dir("phy0"), "rc_stats", 0, None)
            .unwrap();

        let t = RecordingTransport::new();
        t.fail();
        sessions.accept(info.id, 1, Box::new(t.clone()));
        sessions.source_line(info.id, "x", &mut codec);
        assert!(!sessions.contains(info.id));
    }

    #[tokio::test]
    async fn source_lines_and_eof_are_reported() {
        let tree = FakeDevices::new();
        tree.add("phy0", "");
        tree.write_debugfs("phy0", "rc_stats", "one\ntwo\n");
        let (mut sessions, mut rx) = manager();
        let info = sessions
            .start(&tree.paths().device_dir("phy0"), "rc_stats", 0, None)
            .unwrap();

        let mut lines = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                HubEvent::Line {
                    origin: Origin::Session(id),
                    line,
                } => {
                    assert_eq!(id, info.id);
                    lines.push(line);
                }
                HubEvent::Closed {
                    origin: Origin::Session(id),
                    ..
                } => {
                    assert_eq!(id, info.id);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_stop_all_clears() {
        let tree = FakeDevices::new();
        tree.add("phy0", "");
        tree.write_debugfs("phy0", "a", "");
        tree.write_debugfs("phy0", "b", "");
        let (mut sessions, _rx) = manager();
        let dir = tree.paths().device_dir("phy0");
        let first = sessions.start(&dir, "a", 0, None).unwrap();
        sessions.start(&dir, "b", 0, None).unwrap();

        assert!(sessions.teardown(first.id, "test"));
        assert!(!sessions.teardown(first.id, "test"));
        sessions.stop_all();
        assert!(sessions.is_empty());
    }
}
