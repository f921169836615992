//! Subscriber connections and the collections that fan out to them.

use std::fmt;
use std::io;

use bytes::Bytes;
use stream_codec::{Codec, CodecError, FrameSink};
use tracing::{debug, warn};

pub type SubscriberId = u64;

/// Wire encoding chosen by the port a subscriber connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Plain,
    Compressed,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Plain => write!(f, "plain"),
            Mode::Compressed => write!(f, "compressed"),
        }
    }
}

/// Render `text` the way a subscriber in `mode` expects it on the wire.
///
/// Compressed output is a single self-contained frame.
pub fn render(mode: Mode, text: &str, codec: &mut Codec) -> Result<Bytes, CodecError> {
    match mode {
        Mode::Plain => Ok(Bytes::copy_from_slice(text.as_bytes())),
        Mode::Compressed => codec.compress(text.as_bytes()).map(Bytes::from),
    }
}

/// Write side of a subscriber connection.
pub trait Transport: Send {
    /// Queue `data` for delivery. An error means the connection is unusable.
    fn send(&mut self, data: Bytes) -> io::Result<()>;

    fn peer(&self) -> String;
}

pub struct Subscriber {
    id: SubscriberId,
    mode: Mode,
    synced: bool,
    seen_api_info: bool,
    transport: Box<dyn Transport>,
}

impl Subscriber {
    pub fn new(id: SubscriberId, mode: Mode, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            mode,
            synced: false,
            seen_api_info: false,
            transport,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether the initial device snapshot has been sent.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub(crate) fn mark_synced(&mut self) {
        self.synced = true;
    }

    pub(crate) fn seen_api_info(&self) -> bool {
        self.seen_api_info
    }

    pub(crate) fn mark_api_info_seen(&mut self) {
        self.seen_api_info = true;
    }

    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    pub fn send(&mut self, data: Bytes) -> io::Result<()> {
        self.transport.send(data)
    }

    /// Render `text` for this subscriber and send it.
    ///
    /// Compression failures drop the message and are not connection errors.
    pub fn send_text(&mut self, text: &str, codec: &mut Codec) -> io::Result<()> {
        match render(self.mode, text, codec) {
            Ok(data) => self.send(data),
            Err(e) => {
                warn!(conn_id = self.id, error = %e, "dropping message");
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("synced", &self.synced)
            .finish()
    }
}

/// Insertion-ordered subscribers sharing one mode.
#[derive(Debug)]
pub struct Collection {
    mode: Mode,
    members: Vec<Subscriber>,
}

impl Collection {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            members: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.members.iter().any(|s| s.id == id)
    }

    pub fn ids(&self) -> Vec<SubscriberId> {
        self.members.iter().map(|s| s.id).collect()
    }

    pub fn insert(&mut self, subscriber: Subscriber) {
        debug_assert_eq!(subscriber.mode, self.mode);
        self.members.push(subscriber);
    }

    pub fn remove(&mut self, id: SubscriberId) -> Option<Subscriber> {
        let pos = self.members.iter().position(|s| s.id == id)?;
        Some(self.members.remove(pos))
    }

    pub fn get_mut(&mut self, id: SubscriberId) -> Option<&mut Subscriber> {
        self.members.iter_mut().find(|s| s.id == id)
    }

    /// Drop every member, closing their transports.
    pub fn clear(&mut self) {
        self.members.clear();
    }

    /// Run `f` once for every member, then remove the members it failed for.
    ///
    /// Returns how many members were removed.
    pub fn sweep<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(&mut Subscriber) -> io::Result<()>,
    {
        let mut failed = Vec::new();
        for sub in &mut self.members {
            if let Err(e) = f(sub) {
                debug!(conn_id = sub.id, mode = %self.mode, error = %e, "subscriber write failed");
                failed.push(sub.id);
            }
        }

        if !failed.is_empty() {
            self.members.retain(|s| !failed.contains(&s.id));
        }
        failed.len()
    }

    pub fn fan_out(&mut self, data: &Bytes) -> usize {
        self.sweep(|sub| sub.send(data.clone()))
    }

    /// Render `text` once for this collection's mode and send it to everyone.
    pub fn broadcast_text(&mut self, text: &str, codec: &mut Codec) -> usize {
        if self.members.is_empty() {
            return 0;
        }
        match render(self.mode, text, codec) {
            Ok(data) => self.fan_out(&data),
            Err(e) => {
                warn!(mode = %self.mode, error = %e, "dropping broadcast");
                0
            }
        }
    }
}

impl FrameSink for Collection {
    fn deliver(&mut self, frame: &[u8]) {
        self.fan_out(&Bytes::copy_from_slice(frame));
    }
}
