//! Socket and file plumbing.
//!
//! Every descriptor gets its own small task. Tasks never touch hub state:
//! readers turn bytes into [`HubEvent::Line`]s, acceptors hand new
//! connections to the hub, writers drain a per-connection queue.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use nix::fcntl::OFlag;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::hub::{Endpoint, HubEvent, Origin};
use crate::lines::LineAssembler;
use crate::session::SessionId;
use crate::subscriber::{SubscriberId, Transport};

const READ_CHUNK: usize = 512;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> SubscriberId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Outbound half of a TCP subscriber.
///
/// Dropping it closes the write queue and stops the connection's reader.
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
    peer: String,
    _reader: DropGuard,
}

impl Transport for ChannelTransport {
    fn send(&mut self, data: Bytes) -> io::Result<()> {
        self.tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => io::Error::other("send queue full"),
            TrySendError::Closed(_) => io::Error::from(io::ErrorKind::BrokenPipe),
        })
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// Bind a listener without awaiting.
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// Open `path` read-only with `O_NONBLOCK`.
pub fn open_nonblocking(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
}

/// A kernel pseudo-file read through the reactor.
///
/// Files that support poll are driven by readiness and release their
/// descriptor as soon as the reader is dropped. Anything epoll refuses
/// (regular files, which never block) is read through `tokio::fs`.
#[derive(Debug)]
pub enum EventSource {
    Pollable(AsyncFd<File>),
    Regular(tokio::fs::File),
}

impl EventSource {
    /// Must be called within a runtime. `file` should come from [`open_nonblocking`].
    pub fn new(file: File) -> Self {
        match AsyncFd::try_new(file) {
            Ok(fd) => EventSource::Pollable(fd),
            Err(e) => {
                let (file, error) = e.into_parts();
                debug!(%error, "file not pollable, reading through blocking pool");
                EventSource::Regular(tokio::fs::File::from_std(file))
            }
        }
    }

    pub fn is_pollable(&self) -> bool {
        matches!(self, EventSource::Pollable(_))
    }
}

impl AsyncRead for EventSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EventSource::Pollable(fd) => loop {
                let mut guard = ready!(fd.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(e)) => return Poll::Ready(Err(e)),
                    Err(_would_block) => continue,
                }
            },
            EventSource::Regular(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

/// Split an accepted stream into a reader task and a writer task.
pub fn connect(
    stream: TcpStream,
    session: Option<SessionId>,
    queue: usize,
    events: mpsc::Sender<HubEvent>,
) -> (SubscriberId, ChannelTransport) {
    let id = next_conn_id();
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::channel(queue.max(1));
    tokio::spawn(write_loop(write_half, rx, id));

    let cancel = CancellationToken::new();
    spawn_line_reader(
        read_half,
        Origin::Client { session, id },
        events,
        cancel.clone(),
    );

    let transport = ChannelTransport {
        tx,
        peer,
        _reader: cancel.drop_guard(),
    };
    (id, transport)
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, id: SubscriberId) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!(conn_id = id, error = %e, "write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Read `reader` until EOF, error or cancellation, emitting one event per line.
pub fn spawn_line_reader<R>(
    reader: R,
    origin: Origin,
    events: mpsc::Sender<HubEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(read_lines(reader, origin, events, cancel))
}

async fn read_lines<R>(
    mut reader: R,
    origin: Origin,
    events: mpsc::Sender<HubEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut assembler = LineAssembler::new();
    let mut chunk = [0u8; READ_CHUNK];

    let reason = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            res = reader.read(&mut chunk) => match res {
                Ok(0) => break None,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Some(e.to_string()),
            },
        };

        for line in assembler.push(&chunk[..n]) {
            let event = HubEvent::Line {
                origin: origin.clone(),
                line,
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
    };

    if !cancel.is_cancelled() {
        let _ = events.send(HubEvent::Closed { origin, reason }).await;
    }
}

/// Accept connections until cancelled, announcing each one to the hub.
pub fn spawn_listener(
    listener: TcpListener,
    endpoint: Endpoint,
    queue: usize,
    events: mpsc::Sender<HubEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        let (id, transport) = connect(stream, endpoint.session(), queue, events.clone());
                        debug!(conn_id = id, %addr, ?endpoint, "accepted connection");
                        let event = HubEvent::Connected {
                            endpoint,
                            id,
                            transport: Box::new(transport),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(?endpoint, error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        debug!(?endpoint, "listener closed");
    })
}
